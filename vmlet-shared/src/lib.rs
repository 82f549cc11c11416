//! vmlet shared - types used on both sides of the descriptor socket
//!
//! This crate contains the error taxonomy, constants and the wire header
//! codec shared by the privileged descriptor server (`vmlet-netd`) and the
//! processes that talk to it.

pub mod constants;
pub mod errors;
pub mod wire;

pub use errors::{VmletError, VmletResult};
pub use wire::{FdCommand, FdHeader};
