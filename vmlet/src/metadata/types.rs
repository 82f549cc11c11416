//! Durable sandbox and container records.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use rusqlite::ToSql;
use rusqlite::types::{ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use vmlet_shared::errors::VmletError;

use crate::net::types::{ContainerSideNetwork, DnsConfig};

/// Current time in nanoseconds since the epoch.
pub fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

fn labels_match(labels: &HashMap<String, String>, selector: &HashMap<String, String>) -> bool {
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

// ============================================================================
// STATES
// ============================================================================

/// Lifecycle state of a pod sandbox.
///
/// ```text
/// run  → Ready
/// stop → NotReady
/// remove → (record deleted)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Ready,
    NotReady,
}

impl SandboxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxState::Ready => "ready",
            SandboxState::NotReady => "not_ready",
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, SandboxState::Ready)
    }
}

impl FromStr for SandboxState {
    type Err = VmletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(SandboxState::Ready),
            "not_ready" => Ok(SandboxState::NotReady),
            _ => Err(VmletError::InvalidArgument(format!("unknown sandbox state {:?}", s))),
        }
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for SandboxState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Borrowed(ValueRef::Text(self.as_str().as_bytes())))
    }
}

/// Lifecycle state of a container (one VM per sandbox).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Exited,
    Unknown,
}

impl ContainerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Exited => "exited",
            ContainerState::Unknown => "unknown",
        }
    }

    pub fn can_transition_to(&self, target: ContainerState) -> bool {
        use ContainerState::*;
        matches!(
            (self, target),
            (Unknown, _)
                | (Created, Running)
                | (Created, Exited)
                | (Running, Exited)
                | (_, Unknown)
        )
    }
}

impl FromStr for ContainerState {
    type Err = VmletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(ContainerState::Created),
            "running" => Ok(ContainerState::Running),
            "exited" => Ok(ContainerState::Exited),
            "unknown" => Ok(ContainerState::Unknown),
            _ => Err(VmletError::InvalidArgument(format!(
                "unknown container state {:?}",
                s
            ))),
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for ContainerState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Borrowed(ValueRef::Text(self.as_str().as_bytes())))
    }
}

// ============================================================================
// SANDBOX
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSandboxMetadata {
    pub name: String,
    pub uid: String,
    pub namespace: String,
    #[serde(default)]
    pub attempt: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Sctp,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    #[serde(default)]
    pub protocol: Protocol,
    pub container_port: u16,
    #[serde(default)]
    pub host_port: u16,
    #[serde(default)]
    pub host_ip: String,
}

/// Sandbox configuration as received from the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSandboxConfig {
    pub metadata: Option<PodSandboxMetadata>,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub log_directory: String,
    #[serde(default)]
    pub dns_config: Option<DnsConfig>,
    #[serde(default)]
    pub port_mappings: Vec<PortMapping>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    #[serde(default)]
    pub cgroup_parent: String,
}

/// Persisted sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSandboxRecord {
    pub id: String,
    pub config: PodSandboxConfig,
    pub state: SandboxState,
    /// Creation time, nanoseconds since the epoch.
    pub created_at: i64,
    /// Network handed out by the descriptor server, absent when the sandbox
    /// has no network.
    #[serde(default)]
    pub container_side_network: Option<ContainerSideNetwork>,
}

impl PodSandboxRecord {
    pub fn new(
        id: impl Into<String>,
        config: PodSandboxConfig,
        state: SandboxState,
        container_side_network: Option<ContainerSideNetwork>,
    ) -> Self {
        Self {
            id: id.into(),
            config,
            state,
            created_at: now_nanos(),
            container_side_network,
        }
    }

    pub fn metadata(&self) -> PodSandboxMetadata {
        self.config.metadata.clone().unwrap_or_default()
    }

    /// First IPv4 address of the pod, if it has a network.
    pub fn pod_ip(&self) -> Option<String> {
        self.container_side_network
            .as_ref()
            .and_then(|csn| csn.result.pod_ip())
            .map(|ip| ip.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxFilter {
    pub id: Option<String>,
    pub state: Option<SandboxState>,
    pub label_selector: HashMap<String, String>,
}

impl SandboxFilter {
    pub fn matches(&self, record: &PodSandboxRecord) -> bool {
        self.id.as_ref().is_none_or(|id| *id == record.id)
            && self.state.is_none_or(|s| s == record.state)
            && labels_match(&record.config.labels, &self.label_selector)
    }
}

// ============================================================================
// CONTAINER
// ============================================================================

/// Persisted container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: String,
    pub sandbox_id: String,
    pub name: String,
    #[serde(default)]
    pub attempt: u32,
    pub image: String,
    pub state: ContainerState,
    pub created_at: i64,
    #[serde(default)]
    pub started_at: i64,
    #[serde(default)]
    pub finished_at: i64,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerFilter {
    pub id: Option<String>,
    pub sandbox_id: Option<String>,
    pub state: Option<ContainerState>,
    pub label_selector: HashMap<String, String>,
}

impl ContainerFilter {
    pub fn for_sandbox(sandbox_id: impl Into<String>) -> Self {
        Self {
            sandbox_id: Some(sandbox_id.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, record: &ContainerRecord) -> bool {
        self.id.as_ref().is_none_or(|id| *id == record.id)
            && self
                .sandbox_id
                .as_ref()
                .is_none_or(|id| *id == record.sandbox_id)
            && self.state.is_none_or(|s| s == record.state)
            && labels_match(&record.labels, &self.label_selector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox(id: &str, state: SandboxState, app: &str) -> PodSandboxRecord {
        let mut config = PodSandboxConfig::default();
        config.labels.insert("app".into(), app.into());
        PodSandboxRecord::new(id, config, state, None)
    }

    #[test]
    fn test_state_strings() {
        for s in [SandboxState::Ready, SandboxState::NotReady] {
            assert_eq!(s.as_str().parse::<SandboxState>().unwrap(), s);
        }
        for s in [
            ContainerState::Created,
            ContainerState::Running,
            ContainerState::Exited,
            ContainerState::Unknown,
        ] {
            assert_eq!(s.to_string().parse::<ContainerState>().unwrap(), s);
        }
        assert!("bogus".parse::<SandboxState>().is_err());
    }

    #[test]
    fn test_container_transitions() {
        use ContainerState::*;
        assert!(Created.can_transition_to(Running));
        assert!(Running.can_transition_to(Exited));
        assert!(Created.can_transition_to(Exited));
        assert!(!Exited.can_transition_to(Running));
        assert!(!Running.can_transition_to(Created));
        assert!(Unknown.can_transition_to(Running));
        assert!(Exited.can_transition_to(Unknown));
    }

    #[test]
    fn test_sandbox_filter() {
        let a = sandbox("a", SandboxState::Ready, "web");
        let b = sandbox("b", SandboxState::NotReady, "db");

        assert!(SandboxFilter::default().matches(&a));

        let by_state = SandboxFilter {
            state: Some(SandboxState::Ready),
            ..Default::default()
        };
        assert!(by_state.matches(&a));
        assert!(!by_state.matches(&b));

        let mut by_label = SandboxFilter::default();
        by_label.label_selector.insert("app".into(), "db".into());
        assert!(!by_label.matches(&a));
        assert!(by_label.matches(&b));

        let by_id = SandboxFilter {
            id: Some("b".into()),
            ..Default::default()
        };
        assert!(by_id.matches(&b));
        assert!(!by_id.matches(&a));
    }

    #[test]
    fn test_record_json_has_no_network_when_absent() {
        let rec = sandbox("a", SandboxState::Ready, "web");
        assert!(rec.pod_ip().is_none());
        let back: PodSandboxRecord =
            serde_json::from_str(&serde_json::to_string(&rec).unwrap()).unwrap();
        assert_eq!(back, rec);
        assert!(rec.created_at > 0);
    }
}
