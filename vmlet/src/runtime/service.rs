//! Sandbox and container state machine.
//!
//! The service holds no state of its own. Durable records live in the
//! [`MetadataStore`]; live network resources live in the descriptor server
//! reached through [`FdClient`]. Every call re-reads both, so the service can
//! be restarted at any time and [`RuntimeService::recover`] brings the
//! descriptor server back in line with the records.

use std::sync::Arc;
use std::time::Duration;

use vmlet_shared::errors::{VmletError, VmletResult};

use crate::fdserver::FdClient;
use crate::metadata::{
    ContainerFilter, ContainerRecord, ContainerState, MetadataStore, PodSandboxConfig,
    PodSandboxRecord, SandboxFilter, SandboxState, now_nanos,
};
use crate::net::types::{AddPayload, ContainerSideNetwork, PodNetworkDesc};
use crate::runtime::image::{IdentityTranslator, ImageStore, ImageTranslator};
use crate::runtime::options::RuntimeOptions;
use crate::runtime::recovery::recover_networks;
use crate::runtime::types::{
    Container, ContainerConfig, ContainerStatus, PodSandbox, PodSandboxStatus, RecoveryReport,
    RuntimeCondition, RuntimeStatus, VersionInfo, VmConfig, conditions,
};
use crate::runtime::vmtool::VmTool;

pub struct RuntimeService {
    fd_client: FdClient,
    store: Arc<dyn MetadataStore>,
    vm_tool: Arc<dyn VmTool>,
    images: Arc<dyn ImageStore>,
    translator: Arc<dyn ImageTranslator>,
    stop_timeout: Duration,
}

impl RuntimeService {
    pub fn new(
        fd_client: FdClient,
        store: Arc<dyn MetadataStore>,
        vm_tool: Arc<dyn VmTool>,
        images: Arc<dyn ImageStore>,
    ) -> Self {
        Self {
            fd_client,
            store,
            vm_tool,
            images,
            translator: Arc::new(IdentityTranslator),
            stop_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_translator(mut self, translator: Arc<dyn ImageTranslator>) -> Self {
        self.translator = translator;
        self
    }

    /// Wait for the descriptor server named in `options`, then build the
    /// service around it.
    pub async fn connect(
        options: &RuntimeOptions,
        store: Arc<dyn MetadataStore>,
        vm_tool: Arc<dyn VmTool>,
        images: Arc<dyn ImageStore>,
    ) -> VmletResult<Self> {
        let fd_client = FdClient::new(&options.netd_socket_path);
        fd_client
            .wait_until_running(options.connect_retries, options.connect_delay())
            .await?;

        let mut service = Self::new(fd_client, store, vm_tool, images);
        service.stop_timeout = Duration::from_secs(options.stop_timeout_secs);
        Ok(service)
    }

    pub fn version(&self) -> VersionInfo {
        VersionInfo::current()
    }

    pub fn status(&self) -> RuntimeStatus {
        RuntimeStatus {
            conditions: vec![
                RuntimeCondition::new(conditions::RUNTIME_READY, true),
                RuntimeCondition::new(conditions::NETWORK_READY, true),
            ],
        }
    }

    // ========================================================================
    // SANDBOXES
    // ========================================================================

    /// Create the pod network and persist a READY record. Returns the sandbox
    /// id, which is the pod UID.
    ///
    /// Calling this again for a READY sandbox is a no-op.
    pub async fn run_pod_sandbox(&self, config: PodSandboxConfig) -> VmletResult<String> {
        let metadata = config.metadata.clone().ok_or_else(|| {
            VmletError::InvalidArgument("sandbox config is missing metadata".into())
        })?;
        let pod_id = metadata.uid.clone();
        if pod_id.is_empty() {
            return Err(VmletError::InvalidArgument(
                "sandbox metadata is missing uid".into(),
            ));
        }

        if let Some(existing) = self.store.sandbox(&pod_id)?
            && existing.state.is_ready()
        {
            tracing::debug!(sandbox_id = %pod_id, "Sandbox already ready");
            return Ok(pod_id);
        }

        let payload = AddPayload::new(PodNetworkDesc {
            pod_id: pod_id.clone(),
            pod_ns: metadata.namespace.clone(),
            pod_name: metadata.name.clone(),
            dns: config.dns_config.clone(),
        });

        match self.create_sandbox(&pod_id, &payload, config).await {
            Ok(()) => {
                tracing::info!(sandbox_id = %pod_id, pod = %metadata.name, namespace = %metadata.namespace, "Sandbox ready");
                Ok(pod_id)
            }
            Err(e) => {
                if let Err(err) = self.fd_client.release_fds(&pod_id).await {
                    tracing::error!(
                        sandbox_id = %pod_id,
                        pod = %metadata.name,
                        error = %err,
                        "Error removing pod from CNI network"
                    );
                }
                Err(e)
            }
        }
    }

    async fn create_sandbox(
        &self,
        pod_id: &str,
        payload: &AddPayload,
        config: PodSandboxConfig,
    ) -> VmletResult<()> {
        let response = self.fd_client.add_fds(pod_id, payload).await.map_err(|e| {
            VmletError::Network(format!(
                "error adding pod {} ({}) to CNI network: {}",
                payload.description.pod_name, pod_id, e
            ))
        })?;
        let csn: ContainerSideNetwork = serde_json::from_slice(&response)?;

        let record = PodSandboxRecord::new(pod_id, config, SandboxState::Ready, Some(csn));
        self.store
            .update_sandbox(pod_id, Box::new(move |_| Ok(Some(record))))?;
        Ok(())
    }

    /// Mark the sandbox NOT_READY, then release its network. Release failures
    /// are only logged; the stored network is dropped only after a release
    /// succeeds, and a later stop retries the release until then.
    pub async fn stop_pod_sandbox(&self, id: &str) -> VmletResult<()> {
        let record = self
            .store
            .sandbox(id)?
            .ok_or_else(|| VmletError::NotFound(format!("sandbox {:?}", id)))?;
        if record.state == SandboxState::NotReady {
            if record.container_side_network.is_none() {
                tracing::debug!(sandbox_id = %id, "Sandbox already stopped");
                return Ok(());
            }
            tracing::info!(sandbox_id = %id, "Retrying release of pod network");
        } else {
            self.store.update_sandbox(
                id,
                Box::new(|current| {
                    Ok(current.map(|mut r| {
                        r.state = SandboxState::NotReady;
                        r
                    }))
                }),
            )?;
        }

        if let Err(e) = self.fd_client.release_fds(id).await {
            tracing::error!(sandbox_id = %id, error = %e, "Error releasing pod network");
            return Ok(());
        }

        // Kept until release succeeds so recovery can re-register the network.
        self.store.update_sandbox(
            id,
            Box::new(|current| {
                Ok(current.map(|mut r| {
                    r.container_side_network = None;
                    r
                }))
            }),
        )?;
        tracing::info!(sandbox_id = %id, "Sandbox stopped");
        Ok(())
    }

    /// Delete the sandbox record. Absent sandboxes are fine.
    pub fn remove_pod_sandbox(&self, id: &str) -> VmletResult<()> {
        self.store.update_sandbox(id, Box::new(|_| Ok(None)))?;
        tracing::info!(sandbox_id = %id, "Sandbox removed");
        Ok(())
    }

    pub fn pod_sandbox_status(&self, id: &str) -> VmletResult<PodSandboxStatus> {
        let record = self
            .store
            .sandbox(id)?
            .ok_or_else(|| VmletError::NotFound(format!("sandbox {:?}", id)))?;
        Ok(PodSandboxStatus::from(&record))
    }

    pub fn list_pod_sandboxes(&self, filter: &SandboxFilter) -> VmletResult<Vec<PodSandbox>> {
        Ok(self
            .store
            .list_sandboxes(filter)?
            .iter()
            .map(PodSandbox::from)
            .collect())
    }

    /// Rebuild the descriptor server's view of every sandbox that still
    /// carries a network.
    pub async fn recover(&self) -> VmletResult<RecoveryReport> {
        recover_networks(self.store.as_ref(), &self.fd_client).await
    }

    // ========================================================================
    // CONTAINERS
    // ========================================================================

    /// Define the sandbox's VM. A sandbox holds at most one container; asking
    /// for another returns the existing one.
    pub async fn create_container(
        &self,
        sandbox_id: &str,
        config: ContainerConfig,
    ) -> VmletResult<String> {
        if let Some(existing) = self
            .store
            .list_containers(&ContainerFilter::for_sandbox(sandbox_id))?
            .into_iter()
            .next()
        {
            tracing::debug!(sandbox_id = %sandbox_id, container_id = %existing.id, "Sandbox already has a container");
            return Ok(existing.id);
        }

        let metadata = config.metadata.clone().ok_or_else(|| {
            VmletError::InvalidArgument("container config is missing metadata".into())
        })?;
        if config.image.is_empty() {
            return Err(VmletError::InvalidArgument(
                "container config is missing image".into(),
            ));
        }

        let sandbox = self
            .store
            .sandbox(sandbox_id)?
            .ok_or_else(|| VmletError::NotFound(format!("sandbox {:?}", sandbox_id)))?;

        let pod = sandbox.metadata();
        let vm_config = VmConfig {
            pod_sandbox_id: sandbox_id.to_string(),
            pod_name: pod.name,
            pod_namespace: pod.namespace,
            name: metadata.name.clone(),
            image: config.image.clone(),
            attempt: metadata.attempt,
            pod_annotations: sandbox.config.annotations.clone(),
            container_annotations: config.annotations.clone(),
            container_labels: config.labels.clone(),
            environment: config.envs.clone(),
            command: config.command.iter().chain(&config.args).cloned().collect(),
            log_path: config.log_path.clone(),
            container_side_network: sandbox.container_side_network.clone(),
        };
        let fd_key = sandbox.container_side_network.as_ref().map(|_| sandbox_id);

        let id = self
            .vm_tool
            .create_container(&vm_config, fd_key)
            .await
            .inspect_err(|e| {
                tracing::error!(sandbox_id = %sandbox_id, name = %metadata.name, error = %e, "Error creating container");
            })?;

        let record = ContainerRecord {
            id: id.clone(),
            sandbox_id: sandbox_id.to_string(),
            name: metadata.name,
            attempt: metadata.attempt,
            image: config.image,
            state: ContainerState::Created,
            created_at: now_nanos(),
            started_at: 0,
            finished_at: 0,
            exit_code: 0,
            labels: config.labels,
            annotations: config.annotations,
        };
        self.store
            .update_container(&id, Box::new(move |_| Ok(Some(record))))?;

        tracing::info!(sandbox_id = %sandbox_id, container_id = %id, "Container created");
        Ok(id)
    }

    /// Start the VM. A running container is left alone.
    pub async fn start_container(&self, id: &str) -> VmletResult<()> {
        let record = self.require_container(id)?;
        if record.state == ContainerState::Running {
            tracing::debug!(container_id = %id, "Container already running");
            return Ok(());
        }
        if !record.state.can_transition_to(ContainerState::Running) {
            return Err(VmletError::InvalidState(format!(
                "container {:?} is {}, can't start it",
                id, record.state
            )));
        }

        self.vm_tool.start_container(id).await?;
        self.set_container_state(id, ContainerState::Running)?;
        tracing::info!(container_id = %id, "Container started");
        Ok(())
    }

    /// Stop the VM, waiting at most `timeout` (the configured default when
    /// `None`). An exited container is left alone.
    pub async fn stop_container(&self, id: &str, timeout: Option<Duration>) -> VmletResult<()> {
        let record = self.require_container(id)?;
        if record.state == ContainerState::Exited {
            tracing::debug!(container_id = %id, "Container already stopped");
            return Ok(());
        }

        self.vm_tool
            .stop_container(id, timeout.unwrap_or(self.stop_timeout))
            .await?;
        self.set_container_state(id, ContainerState::Exited)?;
        tracing::info!(container_id = %id, "Container stopped");
        Ok(())
    }

    /// Remove the VM and its record, then collect garbage in the VM tool and
    /// image store.
    pub async fn remove_container(&self, id: &str) -> VmletResult<()> {
        if self.store.container(id)?.is_some() {
            self.vm_tool.remove_container(id).await?;
            self.store.update_container(id, Box::new(|_| Ok(None)))?;
            tracing::info!(container_id = %id, "Container removed");
        }
        self.gc().await
    }

    async fn gc(&self) -> VmletResult<()> {
        self.vm_tool
            .gc()
            .await
            .map_err(|e| VmletError::Internal(format!("GC error: {}", e)))?;
        let in_use = self.store.images_in_use()?;
        self.images
            .gc(&in_use)
            .await
            .map_err(|e| VmletError::Internal(format!("GC error: {}", e)))
    }

    /// Report the container, updating the record when the VM tool saw a
    /// state change the record missed.
    pub async fn container_status(&self, id: &str) -> VmletResult<ContainerStatus> {
        let mut record = self.require_container(id)?;

        if let Some(observed) = self.vm_tool.container_status(id).await?
            && observed != record.state
            && record.state.can_transition_to(observed)
        {
            tracing::debug!(container_id = %id, from = %record.state, to = %observed, "Container state changed");
            if let Some(updated) = self.set_container_state(id, observed)? {
                record = updated;
            }
        }
        Ok(ContainerStatus::from(&record))
    }

    pub fn list_containers(&self, filter: &ContainerFilter) -> VmletResult<Vec<Container>> {
        Ok(self
            .store
            .list_containers(filter)?
            .iter()
            .map(Container::from)
            .collect())
    }

    fn require_container(&self, id: &str) -> VmletResult<ContainerRecord> {
        self.store
            .container(id)?
            .ok_or_else(|| VmletError::NotFound(format!("container {:?}", id)))
    }

    fn set_container_state(
        &self,
        id: &str,
        state: ContainerState,
    ) -> VmletResult<Option<ContainerRecord>> {
        let now = now_nanos();
        self.store.update_container(
            id,
            Box::new(move |current| {
                Ok(current.map(|mut r| {
                    match state {
                        ContainerState::Running => r.started_at = now,
                        ContainerState::Exited => r.finished_at = now,
                        _ => {}
                    }
                    r.state = state;
                    r
                }))
            }),
        )
    }

    // ========================================================================
    // IMAGES
    // ========================================================================

    pub async fn pull_image(&self, name: &str) -> VmletResult<String> {
        let reference = self.images.pull(name, self.translator.as_ref()).await?;
        tracing::info!(image = %name, reference = %reference, "Image pulled");
        Ok(reference)
    }

    pub async fn remove_image(&self, name: &str) -> VmletResult<()> {
        self.images.remove(name).await
    }
}
