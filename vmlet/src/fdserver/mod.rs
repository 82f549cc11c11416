//! Descriptor protocol: a privileged server that owns kernel resources and
//! hands their file descriptors to clients over a Unix socket.
//!
//! ```text
//! RuntimeService ── FdClient ──(unix socket)── FdServer ── FdSource ── kernel
//! ```
//!
//! The wire header lives in [`vmlet_shared::wire`].

mod client;
mod passfd;
mod server;
mod source;

pub use client::FdClient;
pub use passfd::oob_space;
pub use server::FdServer;
pub use source::FdSource;
