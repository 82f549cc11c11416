use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use vmlet::metadata::ContainerState;
use vmlet::runtime::VmTool;
use vmlet::runtime::types::VmConfig;
use vmlet_shared::errors::{VmletError, VmletResult};

/// A VM the fake tool "defined".
#[derive(Debug, Clone)]
pub struct FakeVm {
    pub config: VmConfig,
    pub fd_key: Option<String>,
    pub state: ContainerState,
}

/// In-memory [`VmTool`]; ids are `vm-<n>`.
#[derive(Default)]
pub struct FakeVmTool {
    vms: Mutex<HashMap<String, FakeVm>>,
    next_id: AtomicUsize,
    gc_runs: AtomicUsize,
}

impl FakeVmTool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn vm(&self, id: &str) -> Option<FakeVm> {
        self.vms.lock().get(id).cloned()
    }

    pub fn vm_count(&self) -> usize {
        self.vms.lock().len()
    }

    pub fn gc_runs(&self) -> usize {
        self.gc_runs.load(Ordering::SeqCst)
    }

    /// Simulate the VM going away behind the runtime's back.
    pub fn crash(&self, id: &str) {
        if let Some(vm) = self.vms.lock().get_mut(id) {
            vm.state = ContainerState::Exited;
        }
    }

    fn set_state(&self, id: &str, state: ContainerState) -> VmletResult<()> {
        let mut vms = self.vms.lock();
        let vm = vms
            .get_mut(id)
            .ok_or_else(|| VmletError::NotFound(format!("vm {:?}", id)))?;
        vm.state = state;
        Ok(())
    }
}

#[async_trait::async_trait]
impl VmTool for FakeVmTool {
    async fn create_container(
        &self,
        config: &VmConfig,
        fd_key: Option<&str>,
    ) -> VmletResult<String> {
        let id = format!("vm-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.vms.lock().insert(
            id.clone(),
            FakeVm {
                config: config.clone(),
                fd_key: fd_key.map(str::to_string),
                state: ContainerState::Created,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> VmletResult<()> {
        self.set_state(id, ContainerState::Running)
    }

    async fn stop_container(&self, id: &str, _timeout: Duration) -> VmletResult<()> {
        self.set_state(id, ContainerState::Exited)
    }

    async fn remove_container(&self, id: &str) -> VmletResult<()> {
        self.vms.lock().remove(id);
        Ok(())
    }

    async fn container_status(&self, id: &str) -> VmletResult<Option<ContainerState>> {
        Ok(self.vms.lock().get(id).map(|vm| vm.state))
    }

    async fn gc(&self) -> VmletResult<()> {
        self.gc_runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
