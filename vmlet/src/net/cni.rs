//! CNI plugin invocation.
//!
//! Plugins are executables that take the network configuration on stdin and
//! their parameters in `CNI_*` environment variables, and print a result
//! (or an error object) on stdout.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use vmlet_shared::constants::network::CNI_IFNAME;
use vmlet_shared::errors::{VmletError, VmletResult};

use super::netns;
use super::types::{CniDns, CniIpConfig, CniResult, CniRoute};

const CONFIG_EXTENSIONS: &[&str] = &["conf", "conflist", "json"];

/// Attaches pod namespaces to the cluster network.
pub trait CniClient: Send + Sync {
    /// Run `ADD` for the pod's namespace and return the final result.
    fn add_sandbox_to_network(
        &self,
        pod_id: &str,
        pod_name: &str,
        pod_ns: &str,
    ) -> VmletResult<CniResult>;

    /// Run `DEL` for the pod's namespace.
    fn remove_sandbox_from_network(&self, pod_id: &str, pod_name: &str, pod_ns: &str)
    -> VmletResult<()>;

    /// `type` of the first plugin in the chain, e.g. `"calico"`.
    fn plugin_type(&self) -> String;
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// A network configuration list (`.conflist`), or a single `.conf` wrapped
/// as a one-plugin list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfigList {
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    pub name: String,
    #[serde(default)]
    pub plugins: Vec<Value>,
}

impl NetworkConfigList {
    fn from_file(path: &Path) -> VmletResult<Self> {
        let raw = std::fs::read(path)?;
        let is_list = path.extension().and_then(|e| e.to_str()) == Some("conflist");
        if is_list {
            let list: NetworkConfigList = serde_json::from_slice(&raw)?;
            return Ok(list);
        }

        let conf: Value = serde_json::from_slice(&raw)?;
        let field = |name: &str| conf.get(name).and_then(Value::as_str).unwrap_or("").to_string();
        if field("type").is_empty() {
            return Err(VmletError::Cni(format!(
                "{}: no 'type'; perhaps this is a .conflist?",
                path.display()
            )));
        }
        Ok(NetworkConfigList {
            cni_version: field("cniVersion"),
            name: field("name"),
            plugins: vec![conf],
        })
    }

    /// First valid configuration in `dir`, in file name order.
    pub fn load(dir: &Path) -> VmletResult<Self> {
        let entries = std::fs::read_dir(dir).map_err(|e| {
            VmletError::Config(format!("can't read CNI config dir {}: {}", dir.display(), e))
        })?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| CONFIG_EXTENSIONS.contains(&e))
            })
            .collect();
        if files.is_empty() {
            return Err(VmletError::Config(format!(
                "no networks found in {}",
                dir.display()
            )));
        }
        files.sort();

        for file in files {
            match Self::from_file(&file) {
                Ok(list) if list.plugins.is_empty() => {
                    tracing::warn!(file = %file.display(), "CNI config list has no plugins, skipping");
                }
                Ok(list) => {
                    tracing::info!(file = %file.display(), network = %list.name, "Using CNI configuration");
                    return Ok(list);
                }
                Err(e) => {
                    tracing::warn!(file = %file.display(), error = %e, "Skipping CNI config file");
                }
            }
        }
        Err(VmletError::Config(format!(
            "no valid networks found in {}",
            dir.display()
        )))
    }

    pub fn plugin_type(&self) -> String {
        self.plugins
            .first()
            .and_then(|p| p.get("type"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string()
    }

    /// Config sent to one plugin: its own section plus the list's name,
    /// version and the previous plugin's result.
    fn plugin_config(&self, plugin: &Value, prev: Option<&Value>) -> VmletResult<Vec<u8>> {
        let mut conf: Map<String, Value> = plugin
            .as_object()
            .cloned()
            .ok_or_else(|| VmletError::Cni(format!("plugin config is not an object: {}", plugin)))?;
        conf.insert("name".into(), Value::String(self.name.clone()));
        conf.insert("cniVersion".into(), Value::String(self.cni_version.clone()));
        if let Some(prev) = prev {
            conf.insert("prevResult".into(), prev.clone());
        }
        Ok(serde_json::to_vec(&Value::Object(conf))?)
    }
}

// ============================================================================
// EXEC CLIENT
// ============================================================================

#[derive(Deserialize)]
struct PluginError {
    #[serde(default)]
    code: u32,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    details: String,
}

/// Runs the plugin chain of the first configuration in a directory.
#[derive(Debug, Clone)]
pub struct ExecCniClient {
    plugins_dir: PathBuf,
    netns_dir: PathBuf,
    config: NetworkConfigList,
}

impl ExecCniClient {
    pub fn new(plugins_dir: &Path, configs_dir: &Path, netns_dir: &Path) -> VmletResult<Self> {
        Ok(Self {
            plugins_dir: plugins_dir.to_path_buf(),
            netns_dir: netns_dir.to_path_buf(),
            config: NetworkConfigList::load(configs_dir)?,
        })
    }

    pub fn config(&self) -> &NetworkConfigList {
        &self.config
    }

    fn cni_args(pod_id: &str, pod_name: &str, pod_ns: &str) -> String {
        format!(
            "IgnoreUnknown=1;K8S_POD_NAMESPACE={};K8S_POD_NAME={};K8S_POD_INFRA_CONTAINER_ID={}",
            pod_ns, pod_name, pod_id
        )
    }

    fn exec(
        &self,
        command: &str,
        plugin: &Value,
        stdin: &[u8],
        pod: (&str, &str, &str),
    ) -> VmletResult<Vec<u8>> {
        let (pod_id, pod_name, pod_ns) = pod;
        let kind = plugin
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| VmletError::Cni("plugin config without 'type'".into()))?;
        let binary = self.plugins_dir.join(kind);
        let netns = netns::ns_path(&self.netns_dir, pod_id);

        tracing::debug!(command, plugin = %kind, pod_id = %pod_id, "Running CNI plugin");
        let mut child = Command::new(&binary)
            .env("CNI_COMMAND", command)
            .env("CNI_CONTAINERID", pod_id)
            .env("CNI_NETNS", &netns)
            .env("CNI_IFNAME", CNI_IFNAME)
            .env("CNI_PATH", &self.plugins_dir)
            .env("CNI_ARGS", Self::cni_args(pod_id, pod_name, pod_ns))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| VmletError::Cni(format!("can't run {}: {}", binary.display(), e)))?;

        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(stdin)
                .map_err(|e| VmletError::Cni(format!("can't write config to {}: {}", kind, e)))?;
        }
        let output = child
            .wait_with_output()
            .map_err(|e| VmletError::Cni(format!("{} {} failed: {}", kind, command, e)))?;

        if !output.status.success() {
            let reason = match serde_json::from_slice::<PluginError>(&output.stdout) {
                Ok(err) => format!("code {}: {} {}", err.code, err.msg, err.details),
                Err(_) => String::from_utf8_lossy(&output.stderr).into_owned(),
            };
            return Err(VmletError::Cni(format!(
                "{} {} failed: {}",
                kind,
                command,
                reason.trim()
            )));
        }
        Ok(output.stdout)
    }
}

impl CniClient for ExecCniClient {
    fn add_sandbox_to_network(
        &self,
        pod_id: &str,
        pod_name: &str,
        pod_ns: &str,
    ) -> VmletResult<CniResult> {
        let mut prev: Option<Value> = None;
        for plugin in &self.config.plugins {
            let stdin = self.config.plugin_config(plugin, prev.as_ref())?;
            let out = self.exec("ADD", plugin, &stdin, (pod_id, pod_name, pod_ns))?;
            prev = Some(serde_json::from_slice(&out).map_err(|e| {
                VmletError::Cni(format!("bad result from CNI plugin: {}", e))
            })?);
        }
        let raw = prev.ok_or_else(|| VmletError::Cni("empty plugin chain".into()))?;
        let result = parse_result(raw)?;
        tracing::info!(
            pod_id = %pod_id,
            ip = ?result.pod_ip(),
            interfaces = result.interfaces.len(),
            "Pod added to CNI network"
        );
        Ok(result)
    }

    fn remove_sandbox_from_network(
        &self,
        pod_id: &str,
        pod_name: &str,
        pod_ns: &str,
    ) -> VmletResult<()> {
        for plugin in self.config.plugins.iter().rev() {
            let stdin = self.config.plugin_config(plugin, None)?;
            self.exec("DEL", plugin, &stdin, (pod_id, pod_name, pod_ns))?;
        }
        tracing::info!(pod_id = %pod_id, "Pod removed from CNI network");
        Ok(())
    }

    fn plugin_type(&self) -> String {
        self.config.plugin_type()
    }
}

// ============================================================================
// RESULT CONVERSION
// ============================================================================

#[derive(Deserialize)]
struct LegacyIpConfig {
    ip: super::types::IpNet,
    #[serde(default)]
    gateway: Option<std::net::IpAddr>,
    #[serde(default)]
    routes: Vec<CniRoute>,
}

#[derive(Deserialize)]
struct LegacyResult {
    #[serde(rename = "cniVersion", default)]
    cni_version: String,
    ip4: LegacyIpConfig,
    #[serde(default)]
    dns: CniDns,
}

/// Parse a plugin result, upgrading pre-0.3 results (`ip4` form).
pub fn parse_result(raw: Value) -> VmletResult<CniResult> {
    if raw.get("ip4").is_none() {
        return Ok(serde_json::from_value(raw)?);
    }
    let legacy: LegacyResult = serde_json::from_value(raw)?;
    Ok(CniResult {
        cni_version: legacy.cni_version,
        interfaces: Vec::new(),
        ips: vec![CniIpConfig {
            version: Some("4".into()),
            address: legacy.ip4.ip,
            gateway: legacy.ip4.gateway,
            interface: None,
        }],
        routes: legacy.ip4.routes,
        dns: legacy.dns,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    const RESULT: &str = r#"{"cniVersion":"0.3.1","interfaces":[{"name":"vmlet-eth0","sandbox":"/ns"}],"ips":[{"version":"4","address":"10.1.0.7/24","gateway":"10.1.0.1","interface":0}]}"#;

    fn write(dir: &Path, name: &str, content: &str) {
        std::fs::write(dir.join(name), content).unwrap();
    }

    fn fake_plugin(dir: &Path, name: &str, body: &str) {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_load_picks_first_valid_sorted() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "00-broken.conf", "{not json");
        write(dir.path(), "05-notype.conf", r#"{"name":"x","cniVersion":"0.3.1"}"#);
        write(dir.path(), "10-empty.conflist", r#"{"name":"e","cniVersion":"0.3.1","plugins":[]}"#);
        write(
            dir.path(),
            "20-calico.conflist",
            r#"{"name":"k8s-pod-network","cniVersion":"0.3.1","plugins":[{"type":"calico"},{"type":"portmap"}]}"#,
        );
        write(dir.path(), "99-bridge.conf", r#"{"name":"b","type":"bridge"}"#);
        write(dir.path(), "README", "ignored");

        let list = NetworkConfigList::load(dir.path()).unwrap();
        assert_eq!(list.name, "k8s-pod-network");
        assert_eq!(list.plugins.len(), 2);
        assert_eq!(list.plugin_type(), "calico");
    }

    #[test]
    fn test_load_single_conf() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "10-bridge.conf", r#"{"name":"b","cniVersion":"0.4.0","type":"bridge","bridge":"cni0"}"#);
        let list = NetworkConfigList::load(dir.path()).unwrap();
        assert_eq!(list.cni_version, "0.4.0");
        assert_eq!(list.plugin_type(), "bridge");
    }

    #[test]
    fn test_load_empty_dir_fails() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            NetworkConfigList::load(dir.path()),
            Err(VmletError::Config(_))
        ));
    }

    #[test]
    fn test_plugin_config_carries_prev_result() {
        let list = NetworkConfigList {
            cni_version: "0.3.1".into(),
            name: "net".into(),
            plugins: vec![serde_json::json!({"type": "portmap", "capabilities": {"portMappings": true}})],
        };
        let prev = serde_json::json!({"ips": []});
        let raw = list.plugin_config(&list.plugins[0], Some(&prev)).unwrap();
        let conf: Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(conf["name"], "net");
        assert_eq!(conf["cniVersion"], "0.3.1");
        assert_eq!(conf["type"], "portmap");
        assert_eq!(conf["prevResult"], prev);
    }

    #[test]
    fn test_exec_plugin_chain() {
        let conf_dir = TempDir::new().unwrap();
        let bin_dir = TempDir::new().unwrap();
        let log = bin_dir.path().join("calls.log");

        write(
            conf_dir.path(),
            "10-net.conflist",
            r#"{"name":"net","cniVersion":"0.3.1","plugins":[{"type":"first"},{"type":"second"}]}"#,
        );
        for name in ["first", "second"] {
            fake_plugin(
                bin_dir.path(),
                name,
                &format!(
                    "cat > /dev/null\necho \"$CNI_COMMAND {} $CNI_CONTAINERID $CNI_IFNAME $CNI_ARGS\" >> {}\necho '{}'",
                    name,
                    log.display(),
                    RESULT
                ),
            );
        }

        let client =
            ExecCniClient::new(bin_dir.path(), conf_dir.path(), Path::new("/var/run/netns")).unwrap();
        assert_eq!(client.plugin_type(), "first");

        let result = client.add_sandbox_to_network("pod-uid", "vm", "default").unwrap();
        assert_eq!(result.pod_ip(), Some("10.1.0.7".parse().unwrap()));
        client.remove_sandbox_from_network("pod-uid", "vm", "default").unwrap();

        let calls = std::fs::read_to_string(&log).unwrap();
        let lines: Vec<&str> = calls.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("ADD first pod-uid vmlet-eth0 IgnoreUnknown=1;K8S_POD_NAMESPACE=default;K8S_POD_NAME=vm"));
        assert!(lines[1].starts_with("ADD second"));
        assert!(lines[2].starts_with("DEL second"));
        assert!(lines[3].starts_with("DEL first"));

        let fail_dir = TempDir::new().unwrap();
        write(fail_dir.path(), "10-net.conf", r#"{"name":"net","type":"failing"}"#);
        fake_plugin(
            bin_dir.path(),
            "failing",
            "cat > /dev/null\necho '{\"code\": 11, \"msg\": \"no IPs left\"}'\nexit 1",
        );
        let client =
            ExecCniClient::new(bin_dir.path(), fail_dir.path(), Path::new("/var/run/netns")).unwrap();
        let err = client.add_sandbox_to_network("p", "n", "ns").unwrap_err();
        assert!(err.to_string().contains("no IPs left"), "{}", err);
    }

    #[test]
    fn test_parse_legacy_result() {
        let raw = serde_json::json!({
            "cniVersion": "0.2.0",
            "ip4": {"ip": "10.2.0.4/16", "gateway": "10.2.0.1", "routes": [{"dst": "0.0.0.0/0"}]},
            "dns": {"nameservers": ["10.96.0.10"]}
        });
        let result = parse_result(raw).unwrap();
        assert_eq!(result.pod_ip(), Some("10.2.0.4".parse().unwrap()));
        assert_eq!(result.routes.len(), 1);
        assert_eq!(result.dns.nameservers, vec!["10.96.0.10".to_string()]);
    }
}
