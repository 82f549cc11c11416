use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use vmlet::net::CniClient;
use vmlet::net::types::CniResult;
use vmlet_shared::errors::{VmletError, VmletResult};

/// Recorded CNI call: command, pod id, pod name, pod namespace.
pub type CniCall = (&'static str, String, String, String);

/// [`CniClient`] returning a canned result.
#[derive(Default)]
pub struct FakeCniClient {
    result: CniResult,
    fail_add: AtomicBool,
    calls: Mutex<Vec<CniCall>>,
}

impl FakeCniClient {
    pub fn new(result: CniResult) -> Self {
        Self {
            result,
            ..Default::default()
        }
    }

    pub fn set_fail_add(&self, fail: bool) {
        self.fail_add.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<CniCall> {
        self.calls.lock().clone()
    }

    fn record(&self, cmd: &'static str, pod_id: &str, pod_name: &str, pod_ns: &str) {
        self.calls
            .lock()
            .push((cmd, pod_id.into(), pod_name.into(), pod_ns.into()));
    }
}

impl CniClient for FakeCniClient {
    fn add_sandbox_to_network(
        &self,
        pod_id: &str,
        pod_name: &str,
        pod_ns: &str,
    ) -> VmletResult<CniResult> {
        self.record("ADD", pod_id, pod_name, pod_ns);
        if self.fail_add.load(Ordering::SeqCst) {
            return Err(VmletError::Cni("fake plugin failed".into()));
        }
        Ok(self.result.clone())
    }

    fn remove_sandbox_from_network(
        &self,
        pod_id: &str,
        pod_name: &str,
        pod_ns: &str,
    ) -> VmletResult<()> {
        self.record("DEL", pod_id, pod_name, pod_ns);
        Ok(())
    }

    fn plugin_type(&self) -> String {
        "fake".into()
    }
}
