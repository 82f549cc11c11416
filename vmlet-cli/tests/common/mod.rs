#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use assert_cmd::Command;
use tempfile::TempDir;
use vmlet::fdserver::FdSource;
use vmlet_test_utils::{TestServer, short_tempdir};

/// A descriptor server running on its own runtime while `vmletctl` is
/// exercised from the test thread.
pub struct TestContext {
    pub server: TestServer,
    pub home: TempDir,
    pub rt: tokio::runtime::Runtime,
}

impl TestContext {
    pub fn new(source: Arc<dyn FdSource>) -> Self {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("build runtime");
        let server = rt.block_on(TestServer::start(source));
        Self {
            server,
            home: short_tempdir(),
            rt,
        }
    }

    pub fn socket(&self) -> &PathBuf {
        &self.server.socket_path
    }

    /// `vmletctl` with `--home` and `--socket` pointed at this context.
    pub fn new_cmd(&self) -> Command {
        let mut cmd = bare_cmd();
        cmd.arg("--home").arg(self.home.path());
        cmd.arg("--socket").arg(self.socket());
        cmd
    }
}

pub fn bare_cmd() -> Command {
    let bin_path = env!("CARGO_BIN_EXE_vmletctl");
    let mut cmd = Command::new(bin_path);
    cmd.timeout(Duration::from_secs(30));
    cmd.env_remove("VMLET_HOME");
    cmd
}
