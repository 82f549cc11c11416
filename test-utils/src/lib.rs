//! Test doubles and helpers shared by the vmlet integration tests.

pub mod cni;
pub mod image;
pub mod source;
pub mod vmtool;

use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;
use vmlet::fdserver::{FdClient, FdServer, FdSource};

pub use cni::FakeCniClient;
pub use image::FakeImageStore;
pub use source::{FakeNetworkSource, MemFileSource};
pub use vmtool::FakeVmTool;

/// Temp dir under `/tmp` so socket paths stay well below `SUN_LEN`.
pub fn short_tempdir() -> TempDir {
    tempfile::Builder::new()
        .prefix("vl")
        .tempdir_in("/tmp")
        .expect("create temp dir")
}

/// A descriptor server serving `source`, plus a client pointed at it.
pub struct TestServer {
    pub server: FdServer,
    pub client: FdClient,
    pub socket_path: PathBuf,
    _dir: TempDir,
}

impl TestServer {
    pub async fn start(source: Arc<dyn FdSource>) -> Self {
        let dir = short_tempdir();
        let socket_path = dir.path().join("fd.sock");
        let server = FdServer::new(&socket_path, source);
        server.serve().await.expect("serve");
        let client = FdClient::new(&socket_path);
        Self {
            server,
            client,
            socket_path,
            _dir: dir,
        }
    }

    /// Keys currently registered with the server.
    pub fn key_count(&self) -> usize {
        self.server.key_count()
    }
}
