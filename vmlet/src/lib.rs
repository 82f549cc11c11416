//! vmlet - pod network lifecycle for VM-based container runtimes
//!
//! A privileged daemon (`vmlet-netd`) owns every pod's network namespace,
//! taps and DHCP responder and hands the tap descriptors to whoever starts
//! the VM. The orchestrator-facing [`RuntimeService`] drives it through the
//! descriptor protocol and keeps durable sandbox/container records.

pub mod fdserver;
pub mod metadata;
pub mod net;
pub mod runtime;
pub mod util;

pub use fdserver::{FdClient, FdServer, FdSource};
pub use metadata::{MetadataStore, SqliteMetadataStore};
pub use runtime::{NetdOptions, RuntimeOptions, RuntimeService};
pub use vmlet_shared::errors::{VmletError, VmletResult};
