//! Persistent tap devices opened through `/dev/net/tun`.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;

use vmlet_shared::errors::{VmletError, VmletResult};

const TUN_DEVICE: &str = "/dev/net/tun";

const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const TUNSETPERSIST: libc::c_ulong = 0x4004_54cb;

const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;
const IFF_ONE_QUEUE: libc::c_short = 0x2000;

/// Mirrors the kernel's `struct ifreq` for the tun ioctls (40 bytes).
#[repr(C)]
struct IfReq {
    name: [libc::c_char; libc::IFNAMSIZ],
    flags: libc::c_short,
    pad: [u8; 22],
}

impl IfReq {
    fn new(name: &str, flags: libc::c_short) -> VmletResult<Self> {
        if name.is_empty() || name.len() >= libc::IFNAMSIZ {
            return Err(VmletError::InvalidArgument(format!(
                "bad tap device name {:?}",
                name
            )));
        }
        let mut req = IfReq {
            name: [0; libc::IFNAMSIZ],
            flags,
            pad: [0; 22],
        };
        for (dst, src) in req.name.iter_mut().zip(name.bytes()) {
            *dst = src as libc::c_char;
        }
        Ok(req)
    }
}

/// Open (creating if needed) the tap device `name` in the current namespace.
///
/// Frames carry no packet-info header.
pub fn open_tap(name: &str) -> VmletResult<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(TUN_DEVICE)
        .map_err(|e| VmletError::Network(format!("can't open {}: {}", TUN_DEVICE, e)))?;

    let mut req = IfReq::new(name, IFF_TAP | IFF_NO_PI | IFF_ONE_QUEUE)?;
    // SAFETY: req is a properly sized ifreq that outlives the call.
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut req as *mut IfReq) };
    if rc < 0 {
        return Err(VmletError::Network(format!(
            "TUNSETIFF on {:?} failed: {}",
            name,
            io::Error::last_os_error()
        )));
    }
    Ok(file)
}

/// Keep the tap device around after its last descriptor is closed.
pub fn set_persist(tap: &File, persist: bool) -> VmletResult<()> {
    let value: libc::c_ulong = persist.into();
    // SAFETY: TUNSETPERSIST takes its argument by value.
    let rc = unsafe { libc::ioctl(tap.as_raw_fd(), TUNSETPERSIST as _, value) };
    if rc < 0 {
        return Err(VmletError::Network(format!(
            "TUNSETPERSIST failed: {}",
            io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Create a persistent tap device and return an open descriptor for it.
pub fn create_persistent(name: &str) -> VmletResult<File> {
    let tap = open_tap(name)?;
    set_persist(&tap, true)?;
    tracing::debug!(tap = %name, "Created persistent tap");
    Ok(tap)
}
