//! Pod networking for VMs.
//!
//! [`TapFdSource`] is the resource source the descriptor server runs with in
//! production. For every pod it:
//!
//! 1. creates a named network namespace and runs the CNI plugin chain in it
//! 2. bridges each CNI veth to a persistent tap ([`csn`]), or hands SR-IOV
//!    VFs to vfio ([`sriov`])
//! 3. starts a DHCP responder that gives the VM the pod's address ([`dhcp`])
//!
//! Namespace-bound work always runs on a dedicated OS thread, see [`netns`].

pub mod calico;
pub mod cni;
pub mod csn;
pub mod dhcp;
pub mod link;
pub mod netns;
pub mod sriov;
pub mod tap;
mod tapsource;
pub mod types;

pub use cni::{CniClient, ExecCniClient, NetworkConfigList};
pub use tapsource::{TapFdSource, TapSourceOptions};
pub use types::{
    AddPayload, CniResult, ContainerSideNetwork, DnsConfig, InterfaceDescription, InterfaceInfo,
    InterfaceType, IpNet, MacAddr, PodNetworkDesc,
};
