//! Calico compatibility.
//!
//! Calico gives each pod a /32 address and a fake `169.254.1.1` gateway that is
//! only reachable through proxy ARP on the host veth. A VM configured over
//! DHCP cannot use that layout, so the pod address is widened to a regular
//! subnet and the gateway is replaced with another address from that subnet.
//! Every step here is a heuristic; callers log failures and carry on.

use std::net::{IpAddr, Ipv4Addr};

use vmlet_shared::constants::envs;
use vmlet_shared::constants::network::{CALICO_DEFAULT_SUBNET, CALICO_GATEWAY};
use vmlet_shared::errors::{VmletError, VmletResult};

use super::link::{Netlink, Route};
use super::types::{CniResult, CniRoute, IpNet};

/// Subnet size taken from `VMLET_CALICO_SUBNET`, falling back to /24.
pub fn subnet_size_from_env() -> u8 {
    subnet_size(std::env::var(envs::CALICO_SUBNET).ok().as_deref())
}

fn subnet_size(raw: Option<&str>) -> u8 {
    let Some(raw) = raw.filter(|s| !s.is_empty()) else {
        return CALICO_DEFAULT_SUBNET;
    };
    match raw.parse::<u8>() {
        Ok(n) if (1..=30).contains(&n) => n,
        _ => {
            tracing::warn!(value = %raw, default = CALICO_DEFAULT_SUBNET, "Bad Calico subnet size");
            CALICO_DEFAULT_SUBNET
        }
    }
}

/// What Calico set up on one link.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CalicoLink {
    /// A device route to the fake gateway exists.
    pub calico: bool,
    /// The default route goes through the fake gateway.
    pub gateway: bool,
}

/// Inspect the IPv4 routes of one link.
pub fn detect(routes: &[Route], link_index: u32) -> CalicoLink {
    let gw = Ipv4Addr::from(CALICO_GATEWAY);
    let mut found = CalicoLink::default();
    for route in routes {
        let dst = route.dst.ipv4();
        if route.oif == Some(link_index) && route.gateway.is_none() && dst == Some(gw) {
            found.calico = true;
        } else if route.dst.prefix == 0 && route.gateway == Some(gw) {
            found.gateway = true;
        }
    }
    found.gateway &= found.calico;
    found
}

/// Pick an address inside `net` that differs from the pod address itself.
pub fn dummy_gateway(net: IpNet) -> Option<Ipv4Addr> {
    let pod = net.ipv4()?;
    let base = u32::from(net.network_v4()?);
    let host_bits = 32 - u32::from(net.prefix);
    if host_bits < 2 {
        return None;
    }
    let broadcast = base | ((1u32 << host_bits) - 1);
    (base + 1..broadcast)
        .map(Ipv4Addr::from)
        .find(|candidate| *candidate != pod)
}

/// Rewrite the IP config at `ip_index` for a Calico link.
pub fn apply(result: &mut CniResult, ip_index: usize, subnet: u8, link: CalicoLink) -> VmletResult<()> {
    if !link.calico {
        return Ok(());
    }
    let ip = result.ips.get_mut(ip_index).ok_or_else(|| {
        VmletError::InvalidArgument(format!("ip config index out of range: {}", ip_index))
    })?;
    let addr = ip
        .address
        .ipv4()
        .ok_or_else(|| VmletError::InvalidArgument("skipping non-IPv4 config".into()))?;
    ip.address = IpNet::v4(addr, subnet);

    if !link.gateway {
        return Ok(());
    }

    let gateway = dummy_gateway(ip.address).ok_or_else(|| {
        VmletError::Network(format!("no room for a gateway in {}", ip.address))
    })?;
    ip.gateway = Some(IpAddr::V4(gateway));

    result.routes.retain(|r| r.dst.prefix != 0);
    result.routes.push(CniRoute {
        dst: IpNet::v4(Ipv4Addr::UNSPECIFIED, 0),
        gw: Some(IpAddr::V4(gateway)),
    });
    Ok(())
}

/// Adjust `result` for every Calico-managed link. Must run inside the pod
/// namespace.
pub fn fix(result: &mut CniResult, nl: &Netlink, subnet: u8) -> VmletResult<()> {
    for n in 0..result.ips.len() {
        let ip = &result.ips[n];
        let Some(iface) = ip.interface.and_then(|i| result.interfaces.get(i)) else {
            tracing::warn!(ip_config = n, "Calico fix: IP config has no interface");
            continue;
        };
        if !iface.in_sandbox() || ip.address.ipv4().is_none() {
            continue;
        }
        let Some(link) = nl.link_by_name(&iface.name)? else {
            tracing::warn!(link = %iface.name, "Calico fix: link not found");
            continue;
        };
        let routes = nl.ipv4_routes(Some(link.index))?;
        let found = detect(&routes, link.index);
        if found.calico {
            tracing::info!(link = %iface.name, subnet, gateway = found.gateway, "Applying Calico fix");
        }
        apply(result, n, subnet, found)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::types::{CniInterface, CniIpConfig};

    fn calico_result() -> CniResult {
        CniResult {
            cni_version: "0.3.1".into(),
            interfaces: vec![CniInterface {
                name: "vmlet-eth0".into(),
                mac: String::new(),
                sandbox: "/var/run/netns/pod".into(),
            }],
            ips: vec![CniIpConfig {
                version: Some("4".into()),
                address: "192.168.135.7/32".parse().unwrap(),
                gateway: None,
                interface: Some(0),
            }],
            routes: vec![CniRoute {
                dst: "0.0.0.0/0".parse().unwrap(),
                gw: Some("169.254.1.1".parse().unwrap()),
            }],
            dns: Default::default(),
        }
    }

    fn calico_routes() -> Vec<Route> {
        vec![
            Route {
                dst: "169.254.1.1/32".parse().unwrap(),
                gateway: None,
                oif: Some(3),
                link_scope: true,
            },
            Route {
                dst: "0.0.0.0/0".parse().unwrap(),
                gateway: Some(Ipv4Addr::new(169, 254, 1, 1)),
                oif: Some(3),
                link_scope: false,
            },
        ]
    }

    #[test]
    fn test_subnet_size() {
        assert_eq!(subnet_size(None), 24);
        assert_eq!(subnet_size(Some("")), 24);
        assert_eq!(subnet_size(Some("26")), 26);
        assert_eq!(subnet_size(Some("0")), 24);
        assert_eq!(subnet_size(Some("31")), 24);
        assert_eq!(subnet_size(Some("abc")), 24);
    }

    #[test]
    fn test_detect() {
        let found = detect(&calico_routes(), 3);
        assert!(found.calico && found.gateway);

        let found = detect(&calico_routes(), 4);
        assert_eq!(found, CalicoLink::default());

        let plain = vec![Route {
            dst: "0.0.0.0/0".parse().unwrap(),
            gateway: Some(Ipv4Addr::new(10, 0, 0, 1)),
            oif: Some(3),
            link_scope: false,
        }];
        assert_eq!(detect(&plain, 3), CalicoLink::default());
    }

    #[test]
    fn test_dummy_gateway_skips_pod_address() {
        let gw = dummy_gateway("10.1.0.1/24".parse().unwrap()).unwrap();
        assert_eq!(gw, Ipv4Addr::new(10, 1, 0, 2));
        let gw = dummy_gateway("10.1.0.9/24".parse().unwrap()).unwrap();
        assert_eq!(gw, Ipv4Addr::new(10, 1, 0, 1));
        assert!(dummy_gateway("10.1.0.9/31".parse().unwrap()).is_none());
    }

    #[test]
    fn test_apply_widens_and_replaces_gateway() {
        let mut result = calico_result();
        apply(&mut result, 0, 24, CalicoLink { calico: true, gateway: true }).unwrap();

        let ip = &result.ips[0];
        assert_eq!(ip.address.to_string(), "192.168.135.7/24");
        let gw = ip.gateway.unwrap();
        assert_eq!(gw, IpAddr::V4(Ipv4Addr::new(192, 168, 135, 1)));
        assert_eq!(result.routes.len(), 1);
        assert_eq!(result.routes[0].gw, Some(gw));
    }

    #[test]
    fn test_apply_without_gateway_only_widens() {
        let mut result = calico_result();
        apply(&mut result, 0, 26, CalicoLink { calico: true, gateway: false }).unwrap();
        assert_eq!(result.ips[0].address.prefix, 26);
        assert!(result.ips[0].gateway.is_none());
        assert_eq!(result.routes[0].gw, Some("169.254.1.1".parse().unwrap()));
    }

    #[test]
    fn test_apply_non_calico_is_noop() {
        let mut result = calico_result();
        let before = result.clone();
        apply(&mut result, 0, 24, CalicoLink::default()).unwrap();
        assert_eq!(result, before);
    }
}
