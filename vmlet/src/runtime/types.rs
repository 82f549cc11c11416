//! Request and response types of the runtime service.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::metadata::{
    ContainerRecord, ContainerState, PodSandboxMetadata, PodSandboxRecord, SandboxState,
};
use crate::net::types::ContainerSideNetwork;

/// Runtime name reported by `version`.
pub const RUNTIME_NAME: &str = "vmlet";

/// Version of the orchestrator API this runtime speaks.
pub const RUNTIME_API_VERSION: &str = "0.1.0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub runtime_name: String,
    pub runtime_version: String,
    pub runtime_api_version: String,
}

impl VersionInfo {
    pub fn current() -> Self {
        Self {
            version: RUNTIME_API_VERSION.to_string(),
            runtime_name: RUNTIME_NAME.to_string(),
            runtime_version: env!("CARGO_PKG_VERSION").to_string(),
            runtime_api_version: RUNTIME_API_VERSION.to_string(),
        }
    }
}

/// Condition names reported by `status`.
pub mod conditions {
    pub const RUNTIME_READY: &str = "RuntimeReady";
    pub const NETWORK_READY: &str = "NetworkReady";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeCondition {
    pub kind: String,
    pub status: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

impl RuntimeCondition {
    pub fn new(kind: &str, status: bool) -> Self {
        Self {
            kind: kind.to_string(),
            status,
            reason: String::new(),
            message: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeStatus {
    pub conditions: Vec<RuntimeCondition>,
}

// ============================================================================
// SANDBOXES
// ============================================================================

/// Summary entry of `list_pod_sandboxes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSandbox {
    pub id: String,
    pub metadata: PodSandboxMetadata,
    pub state: SandboxState,
    pub created_at: i64,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
}

impl From<&PodSandboxRecord> for PodSandbox {
    fn from(record: &PodSandboxRecord) -> Self {
        Self {
            id: record.id.clone(),
            metadata: record.metadata(),
            state: record.state,
            created_at: record.created_at,
            labels: record.config.labels.clone(),
            annotations: record.config.annotations.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSandboxStatus {
    pub id: String,
    pub metadata: PodSandboxMetadata,
    pub state: SandboxState,
    pub created_at: i64,
    /// First IPv4 address of the pod.
    pub ip: Option<String>,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
}

impl From<&PodSandboxRecord> for PodSandboxStatus {
    fn from(record: &PodSandboxRecord) -> Self {
        Self {
            id: record.id.clone(),
            metadata: record.metadata(),
            state: record.state,
            created_at: record.created_at,
            ip: record.pod_ip(),
            labels: record.config.labels.clone(),
            annotations: record.config.annotations.clone(),
        }
    }
}

// ============================================================================
// CONTAINERS
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerMetadata {
    pub name: String,
    #[serde(default)]
    pub attempt: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub metadata: Option<ContainerMetadata>,
    /// Image reference; must be set.
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub envs: Vec<(String, String)>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    #[serde(default)]
    pub log_path: String,
}

/// Everything the VM tool needs to define a VM for one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfig {
    pub pod_sandbox_id: String,
    pub pod_name: String,
    pub pod_namespace: String,
    pub name: String,
    pub image: String,
    pub attempt: u32,
    pub pod_annotations: HashMap<String, String>,
    pub container_annotations: HashMap<String, String>,
    pub container_labels: HashMap<String, String>,
    pub environment: Vec<(String, String)>,
    pub command: Vec<String>,
    pub log_path: String,
    pub container_side_network: Option<ContainerSideNetwork>,
}

/// Entry of `list_containers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub id: String,
    pub pod_sandbox_id: String,
    pub metadata: ContainerMetadata,
    pub image: String,
    pub state: ContainerState,
    pub created_at: i64,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
}

impl From<&ContainerRecord> for Container {
    fn from(record: &ContainerRecord) -> Self {
        Self {
            id: record.id.clone(),
            pod_sandbox_id: record.sandbox_id.clone(),
            metadata: ContainerMetadata {
                name: record.name.clone(),
                attempt: record.attempt,
            },
            image: record.image.clone(),
            state: record.state,
            created_at: record.created_at,
            labels: record.labels.clone(),
            annotations: record.annotations.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub id: String,
    pub metadata: ContainerMetadata,
    pub state: ContainerState,
    pub created_at: i64,
    pub started_at: i64,
    pub finished_at: i64,
    pub exit_code: i32,
    pub image: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
}

impl From<&ContainerRecord> for ContainerStatus {
    fn from(record: &ContainerRecord) -> Self {
        Self {
            id: record.id.clone(),
            metadata: ContainerMetadata {
                name: record.name.clone(),
                attempt: record.attempt,
            },
            state: record.state,
            created_at: record.created_at,
            started_at: record.started_at,
            finished_at: record.finished_at,
            exit_code: record.exit_code,
            image: record.image.clone(),
            labels: record.labels.clone(),
            annotations: record.annotations.clone(),
        }
    }
}

/// Outcome of a recovery pass.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Sandboxes whose network was rebuilt.
    pub recovered: Vec<String>,
    /// Sandbox id and error for each failure.
    pub errors: Vec<(String, String)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::PodSandboxConfig;

    #[test]
    fn test_version_info() {
        let v = VersionInfo::current();
        assert_eq!(v.runtime_name, "vmlet");
        assert_eq!(v.runtime_api_version, "0.1.0");
        assert!(!v.runtime_version.is_empty());
    }

    #[test]
    fn test_status_from_record() {
        let mut config = PodSandboxConfig {
            metadata: Some(PodSandboxMetadata {
                name: "web".into(),
                uid: "u1".into(),
                namespace: "default".into(),
                attempt: 0,
            }),
            ..Default::default()
        };
        config.labels.insert("app".into(), "web".into());
        let record = PodSandboxRecord::new("u1", config, SandboxState::Ready, None);

        let status = PodSandboxStatus::from(&record);
        assert_eq!(status.metadata.name, "web");
        assert_eq!(status.ip, None);
        assert_eq!(status.labels.get("app").map(String::as_str), Some("web"));
    }
}
