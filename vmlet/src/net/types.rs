//! Network configuration types exchanged between the runtime and the
//! descriptor server, and persisted with each sandbox.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use vmlet_shared::errors::{VmletError, VmletResult};

// ============================================================================
// ADDRESS TYPES
// ============================================================================

/// An IP address with a prefix length, written `a.b.c.d/len`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IpNet {
    pub addr: IpAddr,
    pub prefix: u8,
}

impl IpNet {
    pub fn new(addr: IpAddr, prefix: u8) -> VmletResult<Self> {
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(VmletError::InvalidArgument(format!(
                "prefix /{} too long for {}",
                prefix, addr
            )));
        }
        Ok(Self { addr, prefix })
    }

    pub fn v4(addr: Ipv4Addr, prefix: u8) -> Self {
        Self {
            addr: IpAddr::V4(addr),
            prefix: prefix.min(32),
        }
    }

    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        match self.addr {
            IpAddr::V4(a) => Some(a),
            IpAddr::V6(_) => None,
        }
    }

    /// Netmask for IPv4 networks.
    pub fn netmask_v4(&self) -> Option<Ipv4Addr> {
        self.ipv4()?;
        let bits = if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(self.prefix))
        };
        Some(Ipv4Addr::from(bits))
    }

    /// Network address (host bits cleared) for IPv4 networks.
    pub fn network_v4(&self) -> Option<Ipv4Addr> {
        let addr = u32::from(self.ipv4()?);
        let mask = u32::from(self.netmask_v4()?);
        Some(Ipv4Addr::from(addr & mask))
    }

    /// Whether `other` falls inside this IPv4 network.
    pub fn contains_v4(&self, other: Ipv4Addr) -> bool {
        match (self.network_v4(), self.netmask_v4()) {
            (Some(net), Some(mask)) => u32::from(other) & u32::from(mask) == u32::from(net),
            _ => false,
        }
    }

    pub fn is_default_route(&self) -> bool {
        self.prefix == 0 && self.addr.is_unspecified()
    }
}

impl fmt::Display for IpNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for IpNet {
    type Err = VmletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| VmletError::InvalidArgument(format!("missing prefix in {:?}", s)))?;
        let addr: IpAddr = addr
            .parse()
            .map_err(|e| VmletError::InvalidArgument(format!("bad address {:?}: {}", s, e)))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|e| VmletError::InvalidArgument(format!("bad prefix {:?}: {}", s, e)))?;
        IpNet::new(addr, prefix)
    }
}

impl Serialize for IpNet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IpNet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Ethernet hardware address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// Random unicast, locally administered address.
    pub fn random_local() -> Self {
        let mut bytes = [0u8; 6];
        rand::rng().fill_bytes(&mut bytes);
        bytes[0] = (bytes[0] & 0xfe) | 0x02;
        Self(bytes)
    }

    pub fn from_slice(raw: &[u8]) -> Option<Self> {
        let bytes: [u8; 6] = raw.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = VmletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 6];
        let mut parts = s.split([':', '-']);
        for byte in out.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| VmletError::InvalidArgument(format!("bad MAC address {:?}", s)))?;
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| VmletError::InvalidArgument(format!("bad MAC address {:?}", s)))?;
        }
        if parts.next().is_some() {
            return Err(VmletError::InvalidArgument(format!("bad MAC address {:?}", s)));
        }
        Ok(Self(out))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// CNI RESULT
// ============================================================================

/// Interface entry of a CNI result.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CniInterface {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mac: String,
    /// Namespace path for interfaces living in the pod namespace.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sandbox: String,
}

impl CniInterface {
    pub fn mac(&self) -> Option<MacAddr> {
        self.mac.parse().ok()
    }

    pub fn in_sandbox(&self) -> bool {
        !self.sandbox.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CniIpConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub address: IpNet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<IpAddr>,
    /// Index into [`CniResult::interfaces`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CniRoute {
    pub dst: IpNet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gw: Option<IpAddr>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CniDns {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nameservers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

/// Result returned by a CNI `ADD` (result versions 0.3.x and later).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CniResult {
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    #[serde(default)]
    pub interfaces: Vec<CniInterface>,
    #[serde(default)]
    pub ips: Vec<CniIpConfig>,
    #[serde(default)]
    pub routes: Vec<CniRoute>,
    #[serde(default)]
    pub dns: CniDns,
}

impl CniResult {
    /// First IPv4 address assigned to the pod.
    pub fn pod_ip(&self) -> Option<Ipv4Addr> {
        self.ips.iter().find_map(|ip| ip.address.ipv4())
    }

    /// IP configs bound to the interface at `index`.
    pub fn ips_for(&self, index: usize) -> impl Iterator<Item = &CniIpConfig> {
        self.ips
            .iter()
            .filter(move |ip| ip.interface == Some(index))
    }

    pub fn interface_index(&self, name: &str) -> Option<usize> {
        self.interfaces.iter().position(|i| i.name == name)
    }
}

/// DNS settings requested by the orchestrator for a pod.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsConfig {
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default)]
    pub searches: Vec<String>,
    #[serde(default)]
    pub options: Vec<String>,
}

impl From<DnsConfig> for CniDns {
    fn from(dns: DnsConfig) -> Self {
        CniDns {
            nameservers: dns.servers,
            domain: None,
            search: dns.searches,
            options: dns.options,
        }
    }
}

// ============================================================================
// CONTAINER SIDE NETWORK
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceType {
    /// Tap device bridged to the pod's veth.
    Tap,
    /// SR-IOV virtual function passed through with vfio.
    Vf,
}

/// One VM-facing network interface.
///
/// The open descriptor for the interface travels separately, at the same
/// position in the descriptor list as this entry in
/// [`ContainerSideNetwork::interfaces`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceDescription {
    #[serde(rename = "type")]
    pub kind: InterfaceType,
    /// Name of the pod-side link (veth or VF netdev).
    pub name: String,
    pub hardware_addr: MacAddr,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pci_address: String,
    pub mtu: u16,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub vlan_id: u16,
}

fn is_zero(v: &u16) -> bool {
    *v == 0
}

/// Network state of a pod as seen from the VM side.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSideNetwork {
    pub result: CniResult,
    pub ns_path: PathBuf,
    pub interfaces: Vec<InterfaceDescription>,
}

/// Interface description returned by `Get`; `fd_index` points into the
/// descriptor list of the same response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceInfo {
    #[serde(rename = "type")]
    pub kind: InterfaceType,
    pub hardware_addr: MacAddr,
    pub fd_index: usize,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pci_address: String,
    pub mtu: u16,
}

// ============================================================================
// ADD PAYLOAD
// ============================================================================

/// Pod identity handed to the resource source.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodNetworkDesc {
    pub pod_id: String,
    pub pod_ns: String,
    pub pod_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<DnsConfig>,
}

/// Body of an `Add` request for the tap source.
///
/// With `cni_config` set the source rebuilds the resources for an existing
/// namespace instead of creating a new one.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddPayload {
    pub description: PodNetworkDesc,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cni_config: Option<CniResult>,
    /// Interfaces of the previous incarnation, used to rebuild VF entries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<InterfaceDescription>,
}

impl AddPayload {
    pub fn new(description: PodNetworkDesc) -> Self {
        Self {
            description,
            cni_config: None,
            interfaces: Vec::new(),
        }
    }

    pub fn recovery(description: PodNetworkDesc, csn: &ContainerSideNetwork) -> Self {
        Self {
            description,
            cni_config: Some(csn.result.clone()),
            interfaces: csn.interfaces.clone(),
        }
    }

    pub fn is_recovery(&self) -> bool {
        self.cni_config.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipnet_parse_and_mask() {
        let net: IpNet = "10.1.2.3/24".parse().unwrap();
        assert_eq!(net.netmask_v4(), Some(Ipv4Addr::new(255, 255, 255, 0)));
        assert_eq!(net.network_v4(), Some(Ipv4Addr::new(10, 1, 2, 0)));
        assert!(net.contains_v4(Ipv4Addr::new(10, 1, 2, 200)));
        assert!(!net.contains_v4(Ipv4Addr::new(10, 1, 3, 1)));
        assert_eq!(net.to_string(), "10.1.2.3/24");

        let default: IpNet = "0.0.0.0/0".parse().unwrap();
        assert!(default.is_default_route());
        assert_eq!(default.netmask_v4(), Some(Ipv4Addr::UNSPECIFIED));

        assert!("10.0.0.1".parse::<IpNet>().is_err());
        assert!("10.0.0.1/33".parse::<IpNet>().is_err());
    }

    #[test]
    fn test_mac_parse_display() {
        let mac: MacAddr = "AA:bb:0c:1d:2e:3F".parse().unwrap();
        assert_eq!(mac.to_string(), "aa:bb:0c:1d:2e:3f");
        assert!("aa:bb:cc".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:dd:ee:ff:00".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_random_mac_is_local_unicast() {
        for _ in 0..32 {
            let mac = MacAddr::random_local();
            assert_eq!(mac.0[0] & 0x01, 0);
            assert_eq!(mac.0[0] & 0x02, 0x02);
        }
    }

    #[test]
    fn test_cni_result_from_plugin_output() {
        let json = r#"{
            "cniVersion": "0.4.0",
            "interfaces": [
                {"name": "cni0", "mac": "0a:58:0a:f4:00:01"},
                {"name": "vmlet-eth0", "mac": "0a:58:0a:f4:00:05", "sandbox": "/var/run/netns/pod"}
            ],
            "ips": [{"version": "4", "address": "10.244.0.5/24", "gateway": "10.244.0.1", "interface": 1}],
            "routes": [{"dst": "0.0.0.0/0"}],
            "dns": {}
        }"#;
        let result: CniResult = serde_json::from_str(json).unwrap();

        assert_eq!(result.pod_ip(), Some(Ipv4Addr::new(10, 244, 0, 5)));
        assert_eq!(result.interface_index("vmlet-eth0"), Some(1));
        assert!(result.interfaces[1].in_sandbox());
        assert_eq!(result.ips_for(1).count(), 1);
        assert!(result.routes[0].gw.is_none());
    }

    #[test]
    fn test_payload_recovery_flag() {
        let desc = PodNetworkDesc {
            pod_id: "uid".into(),
            pod_ns: "default".into(),
            pod_name: "vm".into(),
            dns: None,
        };
        let fresh = AddPayload::new(desc.clone());
        assert!(!fresh.is_recovery());
        let json = serde_json::to_string(&fresh).unwrap();
        assert!(!json.contains("cniConfig"));

        let csn = ContainerSideNetwork {
            result: CniResult::default(),
            ns_path: "/var/run/netns/uid".into(),
            interfaces: vec![],
        };
        let recovery = AddPayload::recovery(desc, &csn);
        assert!(recovery.is_recovery());
        let back: AddPayload = serde_json::from_slice(&serde_json::to_vec(&recovery).unwrap()).unwrap();
        assert_eq!(back, recovery);
    }
}
