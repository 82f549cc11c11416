//! Resource sources that need no privileges.

use std::collections::{HashMap, HashSet};
use std::io::{Seek, SeekFrom, Write};
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::Deserialize;
use vmlet::fdserver::FdSource;
use vmlet::net::types::{
    AddPayload, CniIpConfig, CniResult, ContainerSideNetwork, InterfaceDescription, InterfaceType,
    IpNet, MacAddr,
};
use vmlet_shared::errors::{VmletError, VmletResult};

fn bad_key(key: &str) -> VmletError {
    VmletError::NotFound(format!("bad fd key: {:?}", key))
}

#[derive(Deserialize)]
struct ContentPayload {
    content: String,
}

/// Hands out one unlinked temp file per key, holding the `content` of the
/// `{"content": "..."}` payload.
///
/// The Add response is `abcdef`; the info for a key is `info_<key>`.
#[derive(Default)]
pub struct MemFileSource {
    keys: Mutex<HashSet<String>>,
    stopped: AtomicBool,
}

impl MemFileSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.keys.lock().contains(key)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl FdSource for MemFileSource {
    fn get_fds(&self, key: &str, data: &[u8]) -> VmletResult<(Vec<OwnedFd>, Vec<u8>)> {
        let payload: ContentPayload = serde_json::from_slice(data)?;
        if !self.keys.lock().insert(key.to_string()) {
            return Err(VmletError::AlreadyExists(format!("key {:?}", key)));
        }

        let mut file = tempfile::tempfile()?;
        file.write_all(payload.content.as_bytes())?;
        file.seek(SeekFrom::Start(0))?;
        Ok((vec![OwnedFd::from(file)], b"abcdef".to_vec()))
    }

    fn release(&self, key: &str) -> VmletResult<()> {
        if !self.keys.lock().remove(key) {
            return Err(bad_key(key));
        }
        Ok(())
    }

    fn get_info(&self, key: &str) -> VmletResult<Vec<u8>> {
        if !self.has_key(key) {
            return Err(bad_key(key));
        }
        Ok(format!("info_{}", key).into_bytes())
    }

    fn stop(&self) -> VmletResult<()> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Pretends to build pod networks: accepts an [`AddPayload`] and answers
/// with a [`ContainerSideNetwork`] holding one tap and address
/// `10.1.90.<n>/24`.
#[derive(Default)]
pub struct FakeNetworkSource {
    pods: Mutex<HashMap<String, AddPayload>>,
    adds: AtomicUsize,
    recoveries: AtomicUsize,
    releases: AtomicUsize,
    fail_add: AtomicBool,
    fail_release: AtomicBool,
}

impl FakeNetworkSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh (non-recovery) Adds seen.
    pub fn add_count(&self) -> usize {
        self.adds.load(Ordering::SeqCst)
    }

    pub fn recovery_count(&self) -> usize {
        self.recoveries.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn has_pod(&self, key: &str) -> bool {
        self.pods.lock().contains_key(key)
    }

    pub fn payload(&self, key: &str) -> Option<AddPayload> {
        self.pods.lock().get(key).cloned()
    }

    pub fn set_fail_add(&self, fail: bool) {
        self.fail_add.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_release(&self, fail: bool) {
        self.fail_release.store(fail, Ordering::SeqCst);
    }

    fn network(&self, payload: &AddPayload) -> VmletResult<ContainerSideNetwork> {
        let n = self.pods.lock().len() as u8 + 2;
        let result = match &payload.cni_config {
            Some(result) => result.clone(),
            None => CniResult {
                cni_version: "0.3.1".into(),
                ips: vec![CniIpConfig {
                    version: Some("4".into()),
                    address: format!("10.1.90.{}/24", n).parse::<IpNet>()?,
                    gateway: Some("10.1.90.1".parse().map_err(|e| {
                        VmletError::Internal(format!("bad gateway: {}", e))
                    })?),
                    interface: Some(0),
                }],
                ..Default::default()
            },
        };
        let interfaces = if payload.interfaces.is_empty() {
            vec![InterfaceDescription {
                kind: InterfaceType::Tap,
                name: "vmlet-eth0".into(),
                hardware_addr: MacAddr::random_local(),
                pci_address: String::new(),
                mtu: 1500,
                vlan_id: 0,
            }]
        } else {
            payload.interfaces.clone()
        };
        Ok(ContainerSideNetwork {
            result,
            ns_path: PathBuf::from("/var/run/netns").join(&payload.description.pod_id),
            interfaces,
        })
    }
}

impl FdSource for FakeNetworkSource {
    fn get_fds(&self, key: &str, data: &[u8]) -> VmletResult<(Vec<OwnedFd>, Vec<u8>)> {
        let payload: AddPayload = serde_json::from_slice(data).map_err(|e| {
            VmletError::InvalidArgument(format!("error unmarshalling add payload: {}", e))
        })?;
        if payload.is_recovery() {
            self.recoveries.fetch_add(1, Ordering::SeqCst);
        } else {
            self.adds.fetch_add(1, Ordering::SeqCst);
        }
        if self.fail_add.load(Ordering::SeqCst) {
            return Err(VmletError::Cni("fake CNI failure".into()));
        }

        let csn = self.network(&payload)?;
        let file = tempfile::tempfile()?;
        self.pods.lock().insert(key.to_string(), payload);
        Ok((vec![OwnedFd::from(file)], serde_json::to_vec(&csn)?))
    }

    fn release(&self, key: &str) -> VmletResult<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        if self.fail_release.load(Ordering::SeqCst) {
            return Err(VmletError::Network("fake teardown failure".into()));
        }
        self.pods.lock().remove(key).ok_or_else(|| bad_key(key))?;
        Ok(())
    }

    fn get_info(&self, key: &str) -> VmletResult<Vec<u8>> {
        let pods = self.pods.lock();
        let payload = pods.get(key).ok_or_else(|| bad_key(key))?;
        Ok(serde_json::to_vec(&payload.description)?)
    }
}
