//! Shared constants
//!
//! These values must agree between the descriptor server and its clients.

/// Descriptor protocol constants
pub mod protocol {
    /// Sentinel carried by every header.
    pub const FD_MAGIC: u32 = 0x4242_4242;

    /// Fixed width of the key field.
    pub const KEY_SIZE: usize = 64;

    /// Encoded header size: magic + command + data size + oob size + key.
    pub const HEADER_SIZE: usize = 4 + 1 + 4 + 4 + KEY_SIZE;

    /// Upper bound on descriptors carried by one response.
    pub const MAX_FDS: usize = 32;

    /// Upper bound on a request/response payload.
    pub const MAX_PAYLOAD: u32 = 16 * 1024 * 1024;
}

/// Network constants
pub mod network {
    /// Interface name handed to CNI plugins.
    pub const CNI_IFNAME: &str = "vmlet-eth0";

    /// Default directory holding bind-mounted network namespaces.
    pub const NETNS_DIR: &str = "/var/run/netns";

    /// Default CNI plugin binary directory.
    pub const CNI_PLUGINS_DIR: &str = "/opt/cni/bin";

    /// Default CNI configuration directory.
    pub const CNI_CONFIGS_DIR: &str = "/etc/cni/net.d";

    /// Gateway address Calico hands to every pod.
    pub const CALICO_GATEWAY: [u8; 4] = [169, 254, 1, 1];

    /// Default prefix length applied to Calico pod addresses.
    pub const CALICO_DEFAULT_SUBNET: u8 = 24;

    /// Delay after starting the DHCP responder before handing the taps out.
    pub const DHCP_SETTLE_MS: u64 = 500;
}

/// Environment variables
pub mod envs {
    /// Root of the vmlet state directory.
    pub const VMLET_HOME: &str = "VMLET_HOME";

    /// Prefix length for Calico pod subnets.
    pub const CALICO_SUBNET: &str = "VMLET_CALICO_SUBNET";
}
