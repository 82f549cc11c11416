//! Error types shared by every vmlet crate.

use thiserror::Error;

/// Result alias used by all vmlet APIs.
pub type VmletResult<T> = Result<T, VmletError>;

/// Errors produced by the descriptor protocol, the network resource
/// sources and the sandbox state machine.
///
/// Variants carry a human-readable message. The variant names the layer that
/// failed so callers can decide whether a retry makes sense.
#[derive(Debug, Error)]
pub enum VmletError {
    /// Unexpected internal failure.
    #[error("internal error: {0}")]
    Internal(String),

    /// Malformed traffic on the descriptor socket (bad magic, unknown command,
    /// short read). Fatal for the connection it occurred on.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Error text sent back by the descriptor server.
    #[error("{0}")]
    Remote(String),

    /// Link, address, route or tap manipulation failed.
    #[error("network error: {0}")]
    Network(String),

    /// Network namespace creation, entry or removal failed.
    #[error("netns error: {0}")]
    Netns(String),

    /// CNI plugin invocation or configuration failure.
    #[error("cni error: {0}")]
    Cni(String),

    /// DHCP responder failure.
    #[error("dhcp error: {0}")]
    Dhcp(String),

    /// Filesystem level failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Metadata database failure.
    #[error("database error: {0}")]
    Database(String),

    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(String),

    /// Caller supplied an invalid request.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation not allowed in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Referenced entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Entity already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Operation not supported on this platform or configuration.
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl VmletError {
    /// Returns true for errors describing a missing entity.
    pub fn is_not_found(&self) -> bool {
        matches!(self, VmletError::NotFound(_))
    }
}
