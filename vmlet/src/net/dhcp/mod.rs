//! Minimal DHCPv4 responder that hands each VM the address CNI assigned to
//! its pod.

pub mod packet;
mod server;

pub use server::{DhcpEndpoint, DhcpServer, Lease, endpoints_from_csn, respond};
