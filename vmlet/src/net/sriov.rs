//! SR-IOV virtual functions handed to VMs through vfio.
//!
//! sysfs lookups by interface name must see the namespace that owns the
//! interface, so [`is_vf`] and [`pci_address`] run under
//! [`netns::run_in_with_sysfs`](super::netns::run_in_with_sysfs). Driver
//! binding and PF configuration happen from the host namespace.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use vmlet_shared::errors::{VmletError, VmletResult};

use super::link::Netlink;
use super::netns;
use super::types::{ContainerSideNetwork, InterfaceDescription, InterfaceType, MacAddr};

const SYS_CLASS_NET: &str = "/sys/class/net";
const SYS_PCI_DEVICES: &str = "/sys/bus/pci/devices";
const PCI_DRIVERS_PROBE: &str = "/sys/bus/pci/drivers_probe";
const VFIO_NEW_ID: &str = "/sys/bus/pci/drivers/vfio-pci/new_id";

fn sys_err(what: &str, path: &Path, e: std::io::Error) -> VmletError {
    VmletError::Network(format!("{} {}: {}", what, path.display(), e))
}

fn write_sysfs(path: &Path, value: &str) -> VmletResult<()> {
    fs::write(path, value).map_err(|e| sys_err("can't write", path, e))
}

fn readlink(path: &Path) -> VmletResult<PathBuf> {
    fs::read_link(path).map_err(|e| sys_err("can't read link", path, e))
}

fn device_dir(pci: &str) -> PathBuf {
    Path::new(SYS_PCI_DEVICES).join(pci)
}

/// Whether `name` is a PCI virtual function.
pub fn is_vf(name: &str) -> bool {
    Path::new(SYS_CLASS_NET)
        .join(name)
        .join("device/physfn")
        .exists()
}

/// PCI address of the device behind the netdev `name`.
pub fn pci_address(name: &str) -> VmletResult<String> {
    let dest = readlink(&Path::new(SYS_CLASS_NET).join(name).join("device"))?;
    pci_from_link(&dest).ok_or_else(|| {
        VmletError::Network(format!(
            "unknown address as device symlink: {:?}",
            dest.display().to_string()
        ))
    })
}

/// Last path component of a sysfs device link when it looks like a PCI address.
fn pci_from_link(dest: &Path) -> Option<String> {
    let last = dest.file_name()?.to_str()?;
    (last.len() == 12 && last.as_bytes()[4] == b':').then(|| last.to_string())
}

/// Netdev name currently backed by the device at `pci`.
pub fn netdev_by_pci(pci: &str) -> VmletResult<String> {
    let net_dir = device_dir(pci).join("net");
    let mut entries = fs::read_dir(&net_dir).map_err(|e| sys_err("can't list", &net_dir, e))?;
    match entries.next() {
        Some(Ok(entry)) => Ok(entry.file_name().to_string_lossy().into_owned()),
        Some(Err(e)) => Err(sys_err("can't list", &net_dir, e)),
        None => Err(VmletError::NotFound(format!(
            "can't find network device with pci address {:?}",
            pci
        ))),
    }
}

fn unbind_driver(pci: &str) -> VmletResult<()> {
    write_sysfs(&device_dir(pci).join("driver/unbind"), pci)
}

fn rebind_driver(pci: &str) -> VmletResult<()> {
    write_sysfs(Path::new(PCI_DRIVERS_PROBE), pci)
}

/// `"<vendor> <device>"` as accepted by a driver's `new_id`.
fn device_identifier(pci: &str) -> VmletResult<String> {
    let dir = device_dir(pci);
    let read = |attr: &str| {
        let path = dir.join(attr);
        fs::read_to_string(&path)
            .map(|s| s.trim().to_string())
            .map_err(|e| sys_err("can't read", &path, e))
    };
    Ok(format!("{} {}", read("vendor")?, read("device")?))
}

/// Index of the VF among its PF's `virtfnN` links.
fn vf_index(pci: &str) -> VmletResult<u32> {
    let physfn = device_dir(pci).join("physfn");
    let mut i = 0;
    loop {
        let dest = readlink(&physfn.join(format!("virtfn{}", i)))?;
        if pci_from_link(&dest).as_deref() == Some(pci) {
            return Ok(i);
        }
        i += 1;
    }
}

fn pf_name(pci: &str) -> VmletResult<String> {
    let physfn = readlink(&device_dir(pci).join("physfn"))?;
    let pf_pci = pci_from_link(&physfn).ok_or_else(|| {
        VmletError::Network(format!("bad physfn link for {}: {}", pci, physfn.display()))
    })?;
    netdev_by_pci(&pf_pci)
}

fn run_ip(args: &[&str]) -> VmletResult<String> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .map_err(|e| VmletError::Network(format!("can't run ip: {}", e)))?;
    if !output.status.success() {
        return Err(VmletError::Network(format!(
            "ip {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// VLAN id of VF `vf` from `ip link show <pf>` output. `0` means untagged.
pub fn parse_vf_vlan(output: &str, vf: u32) -> Option<u16> {
    output.lines().find_map(|line| {
        let mut words = line.split_whitespace();
        if words.next() != Some("vf") {
            return None;
        }
        let id: u32 = words.next()?.trim_end_matches(',').parse().ok()?;
        if id != vf {
            return None;
        }
        let rest: Vec<&str> = words.collect();
        let vlan = rest
            .windows(2)
            .find(|w| w[0] == "vlan")
            .and_then(|w| w[1].trim_end_matches(',').parse().ok())
            .unwrap_or(0);
        Some(vlan)
    })
}

fn vf_vlan(pci: &str) -> VmletResult<u16> {
    let vf = vf_index(pci)?;
    let pf = pf_name(pci)?;
    let output = run_ip(&["link", "show", &pf])?;
    parse_vf_vlan(&output, vf)
        .ok_or_else(|| VmletError::Network(format!("vlan info for vf {} on {} not found", vf, pf)))
}

fn set_mac_and_vlan(pci: &str, mac: MacAddr, vlan: u16) -> VmletResult<()> {
    let vf = vf_index(pci)?.to_string();
    let pf = pf_name(pci)?;
    let mac = mac.to_string();
    let vlan = vlan.to_string();
    run_ip(&["link", "set", &pf, "vf", &vf, "mac", &mac, "vlan", &vlan])?;
    Ok(())
}

/// Hand a VF over to vfio-pci, keeping its MAC and VLAN on the PF.
///
/// Fills in the VLAN id of `desc`. Runs in the host namespace.
pub fn bind_to_vfio(desc: &mut InterfaceDescription) -> VmletResult<()> {
    let pci = desc.pci_address.clone();
    desc.vlan_id = vf_vlan(&pci)?;
    unbind_driver(&pci)?;
    write_sysfs(Path::new(VFIO_NEW_ID), &device_identifier(&pci)?)?;
    set_mac_and_vlan(&pci, desc.hardware_addr, desc.vlan_id)?;
    tracing::info!(name = %desc.name, pci = %pci, vlan = desc.vlan_id, "Bound VF to vfio-pci");
    Ok(())
}

/// Give every VF of `csn` back to its host driver and move the netdev into
/// the pod namespace under its original name and MAC.
pub fn reconstruct_vfs(csn: &ContainerSideNetwork, ignore_unbind: bool) -> VmletResult<()> {
    for iface in csn.interfaces.iter().filter(|i| i.kind == InterfaceType::Vf) {
        let pci = iface.pci_address.as_str();
        if let Err(e) = unbind_driver(pci) {
            if !ignore_unbind {
                return Err(e);
            }
            tracing::debug!(pci = %pci, error = %e, "Ignoring unbind failure");
        }
        rebind_driver(pci)?;
        let dev = netdev_by_pci(pci)?;
        set_mac_and_vlan(pci, iface.hardware_addr, iface.vlan_id)?;

        let ns = netns::open(&csn.ns_path)?;
        let tmp_name = format!("vmlet-vf{:04x}", rand::random::<u16>());
        netns::on_fresh_thread("vmlet-vf-move", || {
            let nl = Netlink::new()?;
            let link = nl.require_link(&dev)?;
            nl.rename(link.index, &tmp_name)?;
            nl.move_to_netns(link.index, std::os::fd::AsRawFd::as_raw_fd(&ns))
        })?;
        netns::run_in(&csn.ns_path, || {
            let nl = Netlink::new()?;
            let link = nl.require_link(&tmp_name)?;
            nl.rename(link.index, &iface.name)
        })?;
        tracing::info!(name = %iface.name, pci = %pci, "Returned VF to pod namespace");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const IP_LINK_OUTPUT: &str = "\
4: enp3s0f0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc mq state UP mode DEFAULT group default qlen 1000
    link/ether 3c:fd:fe:9c:f4:40 brd ff:ff:ff:ff:ff:ff
    vf 0     link/ether 00:00:00:00:00:00 brd ff:ff:ff:ff:ff:ff, spoof checking on, link-state auto, trust off
    vf 1     link/ether 0a:58:0a:f4:00:05 brd ff:ff:ff:ff:ff:ff, vlan 100, spoof checking on, link-state auto, trust off
    vf 2     MAC 0a:58:0a:f4:00:06, vlan 42, spoof checking on, link-state auto
";

    #[test]
    fn test_parse_vf_vlan() {
        assert_eq!(parse_vf_vlan(IP_LINK_OUTPUT, 0), Some(0));
        assert_eq!(parse_vf_vlan(IP_LINK_OUTPUT, 1), Some(100));
        assert_eq!(parse_vf_vlan(IP_LINK_OUTPUT, 2), Some(42));
        assert_eq!(parse_vf_vlan(IP_LINK_OUTPUT, 3), None);
    }

    #[test]
    fn test_pci_from_link() {
        assert_eq!(
            pci_from_link(Path::new("../../../0000:03:10.1")).as_deref(),
            Some("0000:03:10.1")
        );
        assert_eq!(
            pci_from_link(Path::new("../0000:03:00.0")).as_deref(),
            Some("0000:03:00.0")
        );
        assert!(pci_from_link(Path::new("../../devices/virtual/net/lo")).is_none());
    }
}
