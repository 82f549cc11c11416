//! Resource source abstraction behind the descriptor server.

use std::os::fd::OwnedFd;

use vmlet_shared::errors::VmletResult;

/// Produces, describes and destroys the kernel resources registered under a key.
///
/// The descriptor server calls these methods from blocking worker threads, one
/// call at a time per key. Implementations must be safe to call concurrently
/// for different keys.
pub trait FdSource: Send + Sync {
    /// Create resources for `key` from the request payload.
    ///
    /// Returns the descriptors to register under `key` and an opaque response
    /// payload for the caller of `Add`.
    fn get_fds(&self, key: &str, data: &[u8]) -> VmletResult<(Vec<OwnedFd>, Vec<u8>)>;

    /// Destroy the resources registered under `key`.
    fn release(&self, key: &str) -> VmletResult<()>;

    /// Describe the live resources under `key` for a `Get` caller.
    fn get_info(&self, key: &str) -> VmletResult<Vec<u8>>;

    /// Stop background work owned by the source.
    fn stop(&self) -> VmletResult<()> {
        Ok(())
    }
}
