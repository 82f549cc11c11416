//! Resource source that gives each pod a network namespace, CNI
//! configuration, bridged taps (or vfio VFs) and a DHCP responder.

use std::collections::HashMap;
use std::fs::File;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use vmlet_shared::constants::network::{CALICO_DEFAULT_SUBNET, DHCP_SETTLE_MS, NETNS_DIR};
use vmlet_shared::errors::{VmletError, VmletResult};

use super::cni::CniClient;
use super::dhcp::{self, DhcpServer};
use super::link::Netlink;
use super::types::{
    AddPayload, CniResult, ContainerSideNetwork, InterfaceInfo, InterfaceType, PodNetworkDesc,
};
use super::{calico, csn, netns, sriov};
use crate::fdserver::FdSource;

#[derive(Debug, Clone)]
pub struct TapSourceOptions {
    pub netns_dir: PathBuf,
    pub sriov_enabled: bool,
    pub calico_subnet: u8,
}

impl Default for TapSourceOptions {
    fn default() -> Self {
        Self {
            netns_dir: PathBuf::from(NETNS_DIR),
            sriov_enabled: false,
            calico_subnet: CALICO_DEFAULT_SUBNET,
        }
    }
}

struct PodNetwork {
    desc: PodNetworkDesc,
    csn: ContainerSideNetwork,
    dhcp: Option<DhcpServer>,
}

/// Production [`FdSource`]: one network namespace per key.
pub struct TapFdSource {
    cni: Arc<dyn CniClient>,
    options: TapSourceOptions,
    pods: Mutex<HashMap<String, PodNetwork>>,
}

impl TapFdSource {
    pub fn new(cni: Arc<dyn CniClient>, options: TapSourceOptions) -> Self {
        tracing::info!(
            plugin = %cni.plugin_type(),
            netns_dir = %options.netns_dir.display(),
            sriov = options.sriov_enabled,
            "Tap source ready"
        );
        Self {
            cni,
            options,
            pods: Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` in the pod namespace, with sysfs remounted when VFs may be
    /// looked up by name.
    fn in_pod_ns<T, F>(&self, ns_path: &Path, f: F) -> VmletResult<T>
    where
        T: Send,
        F: FnOnce() -> VmletResult<T> + Send,
    {
        if self.options.sriov_enabled {
            netns::run_in_with_sysfs(ns_path, f)
        } else {
            netns::run_in(ns_path, f)
        }
    }

    /// Namespace plus CNI ADD for a new pod.
    fn attach(&self, desc: &PodNetworkDesc, ns_path: &Path) -> VmletResult<CniResult> {
        netns::create(ns_path).map_err(|e| {
            VmletError::Netns(format!(
                "error creating netns for pod {} ({}): {}",
                desc.pod_name, desc.pod_id, e
            ))
        })?;

        match self
            .cni
            .add_sandbox_to_network(&desc.pod_id, &desc.pod_name, &desc.pod_ns)
        {
            Ok(mut result) => {
                if let Some(dns) = &desc.dns {
                    result.dns.nameservers = dns.servers.clone();
                    result.dns.search = dns.searches.clone();
                    result.dns.options = dns.options.clone();
                }
                Ok(result)
            }
            Err(e) => {
                if let Err(err) = netns::destroy(ns_path) {
                    tracing::warn!(pod_id = %desc.pod_id, error = %err, "Failed to remove netns after CNI failure");
                }
                Err(VmletError::Cni(format!(
                    "error adding pod {} ({}) to CNI network: {}",
                    desc.pod_name, desc.pod_id, e
                )))
            }
        }
    }

    /// Undo [`attach`](Self::attach) after a later step failed.
    fn detach(&self, desc: &PodNetworkDesc, ns_path: &Path) {
        if let Err(e) = self
            .cni
            .remove_sandbox_from_network(&desc.pod_id, &desc.pod_name, &desc.pod_ns)
        {
            tracing::warn!(pod_id = %desc.pod_id, error = %e, "Rollback: CNI DEL failed");
        }
        if let Err(e) = netns::destroy(ns_path) {
            tracing::warn!(pod_id = %desc.pod_id, error = %e, "Rollback: netns removal failed");
        }
    }

    fn build(
        &self,
        payload: &AddPayload,
        ns_path: &Path,
        result: CniResult,
    ) -> VmletResult<(PodNetwork, Vec<File>)> {
        let recovering = payload.is_recovery();
        let sriov_enabled = self.options.sriov_enabled;
        let subnet = self.options.calico_subnet;

        let (mut csn, files) = self.in_pod_ns(ns_path, || {
            let nl = Netlink::new()?;
            let mut result = csn::validate_and_fix(&nl, result, ns_path)?;
            if recovering {
                return csn::recreate(&nl, &result, ns_path, &payload.interfaces);
            }
            if let Err(e) = calico::fix(&mut result, &nl, subnet) {
                tracing::warn!(pod_id = %payload.description.pod_id, error = %e, "Calico fix failed");
            }
            csn::setup(&nl, &result, ns_path, sriov_enabled)
        })?;

        if !recovering {
            for desc in csn
                .interfaces
                .iter_mut()
                .filter(|d| d.kind == InterfaceType::Vf)
            {
                sriov::bind_to_vfio(desc)?;
            }
        }

        let endpoints = dhcp::endpoints_from_csn(&csn)?;
        let dhcp = if endpoints.is_empty() {
            None
        } else {
            let server = netns::run_in(ns_path, || DhcpServer::start(endpoints))?;
            // The VM may ask for a lease before the responder threads are
            // reading; the delay makes that unlikely, it does not rule it out.
            std::thread::sleep(Duration::from_millis(DHCP_SETTLE_MS));
            Some(server)
        };

        Ok((
            PodNetwork {
                desc: payload.description.clone(),
                csn,
                dhcp,
            },
            files,
        ))
    }

    fn destroy(&self, pod: &mut PodNetwork) -> VmletResult<()> {
        let ns_path = pod.csn.ns_path.clone();

        // Taken first so a retried release doesn't wait on it again.
        if let Some(server) = pod.dhcp.take() {
            server.stop().map_err(|e| {
                VmletError::Dhcp(format!(
                    "DHCP responder for pod {:?} exited with error: {}",
                    pod.desc.pod_id, e
                ))
            })?;
        }

        if pod.csn.interfaces.iter().any(|d| d.kind == InterfaceType::Vf) {
            sriov::reconstruct_vfs(&pod.csn, false)?;
        }

        if ns_path.exists() {
            let csn = &pod.csn;
            netns::run_in(&ns_path, || {
                let nl = Netlink::new()?;
                csn::teardown(&nl, csn)
            })?;
        } else {
            tracing::warn!(path = %ns_path.display(), "Network namespace already gone");
        }

        let desc = &pod.desc;
        self.cni
            .remove_sandbox_from_network(&desc.pod_id, &desc.pod_name, &desc.pod_ns)
            .map_err(|e| {
                VmletError::Cni(format!(
                    "error removing pod sandbox {:?} from CNI network: {}",
                    desc.pod_id, e
                ))
            })?;

        netns::destroy(&ns_path)
    }
}

fn bad_key(key: &str) -> VmletError {
    VmletError::NotFound(format!("bad fd key: {:?}", key))
}

impl FdSource for TapFdSource {
    fn get_fds(&self, key: &str, data: &[u8]) -> VmletResult<(Vec<OwnedFd>, Vec<u8>)> {
        let payload: AddPayload = serde_json::from_slice(data).map_err(|e| {
            VmletError::InvalidArgument(format!("error unmarshalling add payload: {}", e))
        })?;
        let desc = &payload.description;
        let ns_path = netns::ns_path(&self.options.netns_dir, &desc.pod_id);
        let recovering = payload.is_recovery();

        tracing::info!(key = %key, pod_id = %desc.pod_id, pod = %desc.pod_name, recovering, "Setting up pod network");

        let result = match &payload.cni_config {
            Some(result) => result.clone(),
            None => self.attach(desc, &ns_path)?,
        };

        let (pod, files) = match self.build(&payload, &ns_path, result) {
            Ok(built) => built,
            Err(e) => {
                if !recovering {
                    self.detach(desc, &ns_path);
                }
                return Err(e);
            }
        };

        let response = serde_json::to_vec(&pod.csn)?;
        tracing::info!(
            key = %key,
            ip = ?pod.csn.result.pod_ip(),
            interfaces = pod.csn.interfaces.len(),
            "Pod network ready"
        );
        self.pods.lock().insert(key.to_string(), pod);

        Ok((files.into_iter().map(OwnedFd::from).collect(), response))
    }

    fn release(&self, key: &str) -> VmletResult<()> {
        let mut pod = self.pods.lock().remove(key).ok_or_else(|| bad_key(key))?;

        if let Err(e) = self.destroy(&mut pod) {
            self.pods.lock().insert(key.to_string(), pod);
            return Err(e);
        }
        tracing::info!(key = %key, "Pod network released");
        Ok(())
    }

    fn get_info(&self, key: &str) -> VmletResult<Vec<u8>> {
        let pods = self.pods.lock();
        let pod = pods.get(key).ok_or_else(|| bad_key(key))?;
        let infos: Vec<InterfaceInfo> = pod
            .csn
            .interfaces
            .iter()
            .enumerate()
            .map(|(i, d)| InterfaceInfo {
                kind: d.kind,
                hardware_addr: d.hardware_addr,
                fd_index: i,
                pci_address: d.pci_address.clone(),
                mtu: d.mtu,
            })
            .collect();
        Ok(serde_json::to_vec(&infos)?)
    }

    /// Stop the DHCP responders; namespaces and links stay for recovery.
    fn stop(&self) -> VmletResult<()> {
        let servers: Vec<(String, DhcpServer)> = self
            .pods
            .lock()
            .iter_mut()
            .filter_map(|(k, p)| p.dhcp.take().map(|s| (k.clone(), s)))
            .collect();
        for (key, server) in servers {
            if let Err(e) = server.stop() {
                tracing::warn!(key = %key, error = %e, "DHCP responder exited with error");
            }
        }
        Ok(())
    }
}
