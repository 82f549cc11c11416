//! Seam to the VM lifecycle engine.

use std::time::Duration;

use vmlet_shared::errors::VmletResult;

use crate::metadata::ContainerState;
use crate::runtime::types::VmConfig;

/// Defines, starts and stops VMs.
///
/// Implementations obtain the pod's tap descriptors themselves by calling
/// `get_fds` on the descriptor server with the key they are given.
#[async_trait::async_trait]
pub trait VmTool: Send + Sync {
    /// Define a VM and return its container id.
    ///
    /// `fd_key` is `None` when the sandbox has no network.
    async fn create_container(&self, config: &VmConfig, fd_key: Option<&str>)
    -> VmletResult<String>;

    async fn start_container(&self, id: &str) -> VmletResult<()>;

    async fn stop_container(&self, id: &str, timeout: Duration) -> VmletResult<()>;

    async fn remove_container(&self, id: &str) -> VmletResult<()>;

    /// Observed VM state, `None` if the tool doesn't know the VM.
    async fn container_status(&self, id: &str) -> VmletResult<Option<ContainerState>>;

    /// Drop leftovers of VMs that no longer have a container.
    async fn gc(&self) -> VmletResult<()>;
}
