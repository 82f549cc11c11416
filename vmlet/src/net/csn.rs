//! Container-side network: the bridge and tap plumbing between a pod's CNI
//! interfaces and the VM.
//!
//! For each veth the CNI plugins left in the pod namespace:
//!
//! ```text
//!   VM ── vmlet-tapN ──┐
//!                      vmlet-brN (169.254.x.2/24, DHCP responder)
//!   CNI veth ──────────┘
//! ```
//!
//! The veth keeps its link but loses its addresses and MAC; the VM takes
//! over the original MAC and learns the addresses over DHCP. Everything in
//! this module runs inside the pod namespace.

use std::fs::File;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use vmlet_shared::errors::{VmletError, VmletResult};

use super::link::{Link, LinkKind, Netlink};
use super::sriov;
use super::tap;
use super::types::{
    CniInterface, CniIpConfig, CniResult, CniRoute, ContainerSideNetwork, InterfaceDescription,
    InterfaceType, IpNet, MacAddr,
};

const DEV_NULL: &str = "/dev/null";

pub fn tap_name(n: usize) -> String {
    format!("vmlet-tap{}", n)
}

pub fn bridge_name(n: usize) -> String {
    format!("vmlet-br{}", n)
}

/// Link-local address given to bridge `n` so the DHCP responder can bind.
pub fn bridge_addr(n: usize) -> IpNet {
    let third = 254u8.saturating_sub(n.min(253) as u8);
    IpNet::v4(Ipv4Addr::new(169, 254, third, 2), 24)
}

/// Tap interfaces of `csn` paired with their tap number.
pub fn taps(csn: &ContainerSideNetwork) -> impl Iterator<Item = (usize, &InterfaceDescription)> {
    csn.interfaces
        .iter()
        .filter(|i| i.kind == InterfaceType::Tap)
        .enumerate()
}

fn is_candidate(link: &Link) -> bool {
    link.name != "lo"
        && !link.name.starts_with("vmlet-tap")
        && !link.name.starts_with("vmlet-br")
        && !matches!(link.kind, LinkKind::Bridge | LinkKind::Tun)
}

fn open_dev_null() -> VmletResult<File> {
    File::open(DEV_NULL).map_err(|e| VmletError::Network(format!("can't open {}: {}", DEV_NULL, e)))
}

// ============================================================================
// VALIDATION
// ============================================================================

/// Fill in whatever the CNI result left out from the live namespace.
///
/// Some plugins return no interfaces or no IPs; the DHCP responder needs
/// both, so they are read back from the links in the namespace.
pub fn validate_and_fix(nl: &Netlink, mut result: CniResult, ns_path: &Path) -> VmletResult<CniResult> {
    let sandbox = ns_path.display().to_string();
    let links: Vec<Link> = nl.links()?.into_iter().filter(is_candidate).collect();

    if !result.interfaces.iter().any(CniInterface::in_sandbox) {
        for link in &links {
            result.interfaces.push(CniInterface {
                name: link.name.clone(),
                mac: link.mac.map(|m| m.to_string()).unwrap_or_default(),
                sandbox: sandbox.clone(),
            });
        }
    }

    for iface in result.interfaces.iter_mut().filter(|i| i.in_sandbox()) {
        if iface.mac.is_empty() {
            if let Some(mac) = links.iter().find(|l| l.name == iface.name).and_then(|l| l.mac) {
                iface.mac = mac.to_string();
            }
        }
    }

    let sandboxed: Vec<usize> = (0..result.interfaces.len())
        .filter(|&i| result.interfaces[i].in_sandbox())
        .collect();

    if sandboxed.len() == 1 {
        for ip in result.ips.iter_mut().filter(|ip| ip.interface.is_none()) {
            ip.interface = Some(sandboxed[0]);
        }
    }

    if result.ips.is_empty() {
        for &idx in &sandboxed {
            let name = result.interfaces[idx].name.clone();
            let Some(link) = links.iter().find(|l| l.name == name) else {
                continue;
            };
            let routes = nl.ipv4_routes(Some(link.index))?;
            let gateway = routes
                .iter()
                .find(|r| r.dst.prefix == 0)
                .and_then(|r| r.gateway)
                .map(IpAddr::V4);
            for addr in nl.ipv4_addrs(link.index)? {
                result.ips.push(CniIpConfig {
                    version: Some("4".into()),
                    address: addr,
                    gateway,
                    interface: Some(idx),
                });
            }
            if result.routes.is_empty() {
                for route in routes.iter().filter(|r| r.gateway.is_some()) {
                    result.routes.push(CniRoute {
                        dst: route.dst,
                        gw: route.gateway.map(IpAddr::V4),
                    });
                }
            }
        }
    }

    if result.ips.is_empty() {
        return Err(VmletError::Network(format!(
            "no IP configuration found for namespace {}",
            ns_path.display()
        )));
    }
    Ok(result)
}

// ============================================================================
// SETUP / RECREATE / TEARDOWN
// ============================================================================

/// Build the container-side network for a freshly configured namespace.
///
/// Returns the description and one open file per interface, in the same
/// order. VFs get `/dev/null`; their vfio binding happens from the host.
pub fn setup(
    nl: &Netlink,
    result: &CniResult,
    ns_path: &Path,
    sriov_enabled: bool,
) -> VmletResult<(ContainerSideNetwork, Vec<File>)> {
    let mut interfaces = Vec::new();
    let mut files = Vec::new();
    let mut tap_no = 0;

    for iface in result.interfaces.iter().filter(|i| i.in_sandbox()) {
        let link = nl.require_link(&iface.name)?;
        let mac = link
            .mac
            .ok_or_else(|| VmletError::Network(format!("link {} has no MAC address", link.name)))?;
        let mtu = u16::try_from(link.mtu).unwrap_or(u16::MAX);

        if sriov_enabled && sriov::is_vf(&link.name) {
            interfaces.push(InterfaceDescription {
                kind: InterfaceType::Vf,
                name: link.name.clone(),
                hardware_addr: mac,
                pci_address: sriov::pci_address(&link.name)?,
                mtu,
                vlan_id: 0,
            });
            files.push(open_dev_null()?);
            continue;
        }

        let tap_file = bridge_veth(nl, &link, tap_no)?;
        tracing::debug!(veth = %link.name, tap = %tap_name(tap_no), mac = %mac, "Bridged veth to tap");
        interfaces.push(InterfaceDescription {
            kind: InterfaceType::Tap,
            name: link.name.clone(),
            hardware_addr: mac,
            pci_address: String::new(),
            mtu,
            vlan_id: 0,
        });
        files.push(tap_file);
        tap_no += 1;
    }

    if interfaces.is_empty() {
        return Err(VmletError::Network(format!(
            "no pod interfaces found in {}",
            ns_path.display()
        )));
    }

    Ok((
        ContainerSideNetwork {
            result: result.clone(),
            ns_path: ns_path.to_path_buf(),
            interfaces,
        },
        files,
    ))
}

fn bridge_veth(nl: &Netlink, veth: &Link, n: usize) -> VmletResult<File> {
    nl.flush_ipv4(veth.index)?;
    nl.set_down(veth.index)?;
    nl.set_mac(veth.index, MacAddr::random_local())?;

    let tap_file = tap::create_persistent(&tap_name(n))?;
    let tap_link = nl.require_link(&tap_name(n))?;
    nl.set_mtu(tap_link.index, veth.mtu)?;

    let bridge = nl.add_bridge(&bridge_name(n))?;
    nl.set_master(veth.index, bridge.index)?;
    nl.set_master(tap_link.index, bridge.index)?;
    nl.add_addr(bridge.index, bridge_addr(n))?;

    nl.set_up(bridge.index)?;
    nl.set_up(tap_link.index)?;
    nl.set_up(veth.index)?;
    Ok(tap_file)
}

/// Reopen the interfaces of an already configured namespace.
///
/// `previous` holds the interface descriptions saved with the sandbox; they
/// carry the VM-facing MACs the veths no longer have.
pub fn recreate(
    nl: &Netlink,
    result: &CniResult,
    ns_path: &Path,
    previous: &[InterfaceDescription],
) -> VmletResult<(ContainerSideNetwork, Vec<File>)> {
    let mut interfaces = Vec::new();
    let mut files = Vec::new();
    let mut tap_no = 0;

    for iface in result.interfaces.iter().filter(|i| i.in_sandbox()) {
        let saved = previous.iter().find(|d| d.name == iface.name);
        if let Some(desc) = saved.filter(|d| d.kind == InterfaceType::Vf) {
            interfaces.push(desc.clone());
            files.push(open_dev_null()?);
            continue;
        }

        let mac = saved
            .map(|d| d.hardware_addr)
            .or_else(|| iface.mac())
            .ok_or_else(|| {
                VmletError::InvalidArgument(format!("no hardware address stored for {}", iface.name))
            })?;
        let veth = nl.require_link(&iface.name)?;
        nl.require_link(&bridge_name(tap_no))?;
        let tap_file = tap::open_tap(&tap_name(tap_no))?;

        interfaces.push(InterfaceDescription {
            kind: InterfaceType::Tap,
            name: iface.name.clone(),
            hardware_addr: mac,
            pci_address: String::new(),
            mtu: u16::try_from(veth.mtu).unwrap_or(u16::MAX),
            vlan_id: 0,
        });
        files.push(tap_file);
        tap_no += 1;
    }

    Ok((
        ContainerSideNetwork {
            result: result.clone(),
            ns_path: ns_path.to_path_buf(),
            interfaces,
        },
        files,
    ))
}

/// Remove bridges and taps and give the veths back their MAC, addresses
/// and routes.
pub fn teardown(nl: &Netlink, csn: &ContainerSideNetwork) -> VmletResult<()> {
    for (n, desc) in taps(csn) {
        nl.delete_by_name(&bridge_name(n))?;
        nl.delete_by_name(&tap_name(n))?;

        let Some(veth) = nl.link_by_name(&desc.name)? else {
            tracing::warn!(veth = %desc.name, "Veth gone before teardown");
            continue;
        };
        nl.set_down(veth.index)?;
        nl.set_mac(veth.index, desc.hardware_addr)?;
        nl.set_up(veth.index)?;

        let Some(idx) = csn.result.interface_index(&desc.name) else {
            continue;
        };
        for ip in csn.result.ips_for(idx) {
            nl.add_addr(veth.index, ip.address)?;
        }
        for route in &csn.result.routes {
            let gw = match route.gw {
                Some(IpAddr::V4(gw)) => Some(gw),
                Some(IpAddr::V6(_)) => continue,
                None => None,
            };
            if route.dst.ipv4().is_none() {
                continue;
            }
            if let Err(e) = nl.add_route(route.dst, gw, veth.index) {
                tracing::warn!(veth = %desc.name, dst = %route.dst, error = %e, "Failed to restore route");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_and_bridge_addresses() {
        assert_eq!(tap_name(0), "vmlet-tap0");
        assert_eq!(bridge_name(3), "vmlet-br3");
        assert_eq!(bridge_addr(0).to_string(), "169.254.254.2/24");
        assert_eq!(bridge_addr(1).to_string(), "169.254.253.2/24");
        assert!(bridge_name(99).len() < 16);
    }

    #[test]
    fn test_taps_skip_vfs() {
        let desc = |kind, name: &str| InterfaceDescription {
            kind,
            name: name.into(),
            hardware_addr: MacAddr::default(),
            pci_address: String::new(),
            mtu: 1500,
            vlan_id: 0,
        };
        let csn = ContainerSideNetwork {
            result: CniResult::default(),
            ns_path: "/var/run/netns/pod".into(),
            interfaces: vec![
                desc(InterfaceType::Tap, "eth0"),
                desc(InterfaceType::Vf, "eth1"),
                desc(InterfaceType::Tap, "eth2"),
            ],
        };
        let got: Vec<(usize, &str)> = taps(&csn).map(|(n, d)| (n, d.name.as_str())).collect();
        assert_eq!(got, vec![(0, "eth0"), (1, "eth2")]);
    }

    #[test]
    fn test_candidate_links() {
        let link = |name: &str, kind| Link {
            index: 1,
            name: name.into(),
            mac: None,
            mtu: 1500,
            kind,
        };
        assert!(is_candidate(&link("vmlet-eth0", LinkKind::Veth)));
        assert!(is_candidate(&link("ens1f0v3", LinkKind::Unknown)));
        assert!(!is_candidate(&link("lo", LinkKind::Unknown)));
        assert!(!is_candidate(&link("vmlet-tap0", LinkKind::Tun)));
        assert!(!is_candidate(&link("vmlet-br0", LinkKind::Bridge)));
    }
}
