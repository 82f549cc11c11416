//! Configuration for the descriptor daemon and the runtime service.

use std::path::{Path, PathBuf};
use std::time::Duration;

use dirs::home_dir;
use serde::{Deserialize, Serialize};
use vmlet_shared::constants::envs as const_envs;
use vmlet_shared::constants::network::{CNI_CONFIGS_DIR, CNI_PLUGINS_DIR, NETNS_DIR};
use vmlet_shared::errors::{VmletError, VmletResult};

use crate::net::TapSourceOptions;
use crate::net::calico;
use crate::runtime::layout::{FilesystemLayout, dirs as const_dirs};

/// `$VMLET_HOME`, or `~/.vmlet`.
pub fn default_home_dir() -> PathBuf {
    std::env::var(const_envs::VMLET_HOME)
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let mut path = home_dir().unwrap_or_else(|| PathBuf::from("."));
            path.push(const_dirs::VMLET_DIR);
            path
        })
}

fn default_socket_path() -> PathBuf {
    FilesystemLayout::new(default_home_dir()).netd_socket_path()
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> VmletResult<T> {
    let raw = std::fs::read(path)
        .map_err(|e| VmletError::Config(format!("can't read {}: {}", path.display(), e)))?;
    serde_json::from_slice(&raw)
        .map_err(|e| VmletError::Config(format!("bad config file {}: {}", path.display(), e)))
}

// ============================================================================
// Daemon Options
// ============================================================================

/// Options of the `vmlet-netd` descriptor server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetdOptions {
    /// Unix socket the descriptor server listens on.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Where pod network namespaces are bind-mounted.
    #[serde(default = "default_netns_dir")]
    pub netns_dir: PathBuf,

    #[serde(default = "default_cni_plugins_dir")]
    pub cni_plugins_dir: PathBuf,

    #[serde(default = "default_cni_configs_dir")]
    pub cni_configs_dir: PathBuf,

    /// Hand SR-IOV virtual functions to VMs through vfio.
    #[serde(default)]
    pub sriov_enabled: bool,

    /// Prefix length given to Calico pod addresses.
    ///
    /// Default: `VMLET_CALICO_SUBNET`, else 24
    #[serde(default = "calico::subnet_size_from_env")]
    pub calico_subnet: u8,

    /// Directory for daily-rotated log files.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

fn default_netns_dir() -> PathBuf {
    PathBuf::from(NETNS_DIR)
}

fn default_cni_plugins_dir() -> PathBuf {
    PathBuf::from(CNI_PLUGINS_DIR)
}

fn default_cni_configs_dir() -> PathBuf {
    PathBuf::from(CNI_CONFIGS_DIR)
}

fn default_log_dir() -> PathBuf {
    FilesystemLayout::new(default_home_dir()).logs_dir()
}

impl Default for NetdOptions {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            netns_dir: default_netns_dir(),
            cni_plugins_dir: default_cni_plugins_dir(),
            cni_configs_dir: default_cni_configs_dir(),
            sriov_enabled: false,
            calico_subnet: calico::subnet_size_from_env(),
            log_dir: default_log_dir(),
        }
    }
}

impl NetdOptions {
    /// Load from a JSON file; missing fields take their defaults.
    pub fn from_file(path: &Path) -> VmletResult<Self> {
        let options: Self = read_json(path)?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> VmletResult<()> {
        if !(1..=30).contains(&self.calico_subnet) {
            return Err(VmletError::Config(format!(
                "calico_subnet must be within 1..=30, got {}",
                self.calico_subnet
            )));
        }
        Ok(())
    }

    pub fn tap_source_options(&self) -> TapSourceOptions {
        TapSourceOptions {
            netns_dir: self.netns_dir.clone(),
            sriov_enabled: self.sriov_enabled,
            calico_subnet: self.calico_subnet,
        }
    }
}

// ============================================================================
// Runtime Options
// ============================================================================

/// Options of the orchestrator-facing runtime service.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuntimeOptions {
    #[serde(default = "default_home_dir")]
    pub home_dir: PathBuf,

    /// Descriptor server socket.
    #[serde(default = "default_socket_path")]
    pub netd_socket_path: PathBuf,

    /// Attempts made to reach the descriptor server at startup.
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,

    /// Delay between those attempts, in milliseconds.
    #[serde(default = "default_connect_delay_ms")]
    pub connect_delay_ms: u64,

    /// Metadata database. Default: `<home>/db/vmlet.db`
    #[serde(default)]
    pub db_path: Option<PathBuf>,

    /// Grace period handed to the VM tool when stopping a container.
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
}

fn default_connect_retries() -> u32 {
    30
}

fn default_connect_delay_ms() -> u64 {
    1000
}

fn default_stop_timeout_secs() -> u64 {
    30
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            home_dir: default_home_dir(),
            netd_socket_path: default_socket_path(),
            connect_retries: default_connect_retries(),
            connect_delay_ms: default_connect_delay_ms(),
            db_path: None,
            stop_timeout_secs: default_stop_timeout_secs(),
        }
    }
}

impl RuntimeOptions {
    pub fn from_file(path: &Path) -> VmletResult<Self> {
        read_json(path)
    }

    pub fn layout(&self) -> FilesystemLayout {
        FilesystemLayout::new(self.home_dir.clone())
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.layout().db_path())
    }

    pub fn connect_delay(&self) -> Duration {
        Duration::from_millis(self.connect_delay_ms)
    }
}
