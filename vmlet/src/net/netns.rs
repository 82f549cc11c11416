//! Network namespace handling.
//!
//! A thread's network namespace is a per-thread property. Work that has to
//! happen inside a pod namespace therefore runs on a freshly spawned OS thread
//! that enters the namespace, runs the closure to completion and exits. The
//! thread is never handed back to a pool, so no later task can inherit the
//! wrong namespace.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::sched::{CloneFlags, setns, unshare};
use vmlet_shared::errors::{VmletError, VmletResult};

/// Namespace file of the calling thread.
const THREAD_NETNS: &str = "/proc/thread-self/ns/net";

/// Path of the namespace bind mount for a pod.
pub fn ns_path(netns_dir: &Path, pod_id: &str) -> PathBuf {
    netns_dir.join(pod_id)
}

/// Create a named network namespace at `path`.
///
/// # Errors
/// `AlreadyExists` if `path` is already present; `Netns` on any kernel error.
/// A half-created namespace file is removed before returning an error.
pub fn create(path: &Path) -> VmletResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            VmletError::Netns(format!("can't create {}: {}", parent.display(), e))
        })?;
    }

    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            return Err(VmletError::AlreadyExists(format!(
                "network namespace {} already exists",
                path.display()
            )));
        }
        Err(e) => {
            return Err(VmletError::Netns(format!(
                "can't create {}: {}",
                path.display(),
                e
            )));
        }
    }

    let target = path.to_path_buf();
    let created = on_fresh_thread("vmlet-netns-new", move || {
        unshare(CloneFlags::CLONE_NEWNET)
            .map_err(|e| VmletError::Netns(format!("unshare(CLONE_NEWNET): {}", e)))?;
        mount(
            Some(THREAD_NETNS),
            target.as_path(),
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| VmletError::Netns(format!("bind mount {}: {}", target.display(), e)))
    });

    if let Err(e) = created {
        let _ = std::fs::remove_file(path);
        return Err(e);
    }

    tracing::debug!(path = %path.display(), "Created network namespace");
    Ok(())
}

/// Unmount and remove a named network namespace. A missing path is not an error.
pub fn destroy(path: &Path) -> VmletResult<()> {
    if !path.exists() {
        return Ok(());
    }

    match umount2(path, MntFlags::MNT_DETACH) {
        Ok(()) | Err(nix::errno::Errno::EINVAL) => {}
        Err(e) => {
            return Err(VmletError::Netns(format!(
                "can't unmount {}: {}",
                path.display(),
                e
            )));
        }
    }

    std::fs::remove_file(path)
        .map_err(|e| VmletError::Netns(format!("can't remove {}: {}", path.display(), e)))?;

    tracing::debug!(path = %path.display(), "Destroyed network namespace");
    Ok(())
}

/// Open the namespace file at `path`.
pub fn open(path: &Path) -> VmletResult<File> {
    File::open(path).map_err(|e| {
        VmletError::Netns(format!("can't open namespace {}: {}", path.display(), e))
    })
}

/// Run `f` inside the network namespace at `path`.
pub fn run_in<T, F>(path: &Path, f: F) -> VmletResult<T>
where
    T: Send,
    F: FnOnce() -> VmletResult<T> + Send,
{
    let ns = open(path)?;
    on_fresh_thread("vmlet-netns", move || {
        enter(&ns)?;
        f()
    })
}

/// Run `f` inside the network namespace at `path` with `/sys` remounted, so
/// `/sys/class/net` lists the namespace's own links.
pub fn run_in_with_sysfs<T, F>(path: &Path, f: F) -> VmletResult<T>
where
    T: Send,
    F: FnOnce() -> VmletResult<T> + Send,
{
    let ns = open(path)?;
    on_fresh_thread("vmlet-netns-sys", move || {
        enter(&ns)?;
        remount_sysfs()?;
        f()
    })
}

/// Run `f` on a new OS thread and wait for it.
///
/// Used for namespace work and for netlink sessions that need their own
/// single-threaded runtime.
pub fn on_fresh_thread<T, F>(name: &str, f: F) -> VmletResult<T>
where
    T: Send,
    F: FnOnce() -> VmletResult<T> + Send,
{
    std::thread::scope(|s| {
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn_scoped(s, f)
            .map_err(|e| VmletError::Internal(format!("can't spawn thread: {}", e)))?;
        handle
            .join()
            .map_err(|_| VmletError::Internal(format!("thread {} panicked", name)))?
    })
}

fn enter(ns: &File) -> VmletResult<()> {
    setns(ns, CloneFlags::CLONE_NEWNET).map_err(|e| VmletError::Netns(format!("setns: {}", e)))
}

fn remount_sysfs() -> VmletResult<()> {
    unshare(CloneFlags::CLONE_NEWNS)
        .map_err(|e| VmletError::Netns(format!("unshare(CLONE_NEWNS): {}", e)))?;
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_SLAVE,
        None::<&str>,
    )
    .map_err(|e| VmletError::Netns(format!("make / rslave: {}", e)))?;
    umount2("/sys", MntFlags::MNT_DETACH)
        .map_err(|e| VmletError::Netns(format!("unmount /sys: {}", e)))?;
    mount(
        Some("sysfs"),
        "/sys",
        Some("sysfs"),
        MsFlags::empty(),
        None::<&str>,
    )
    .map_err(|e| VmletError::Netns(format!("mount sysfs: {}", e)))
}
