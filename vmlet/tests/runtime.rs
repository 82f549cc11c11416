//! Integration tests for the sandbox/container state machine.

use std::sync::Arc;

use vmlet::fdserver::FdClient;
use vmlet::metadata::{
    ContainerFilter, ContainerState, MetadataStore, PodSandboxConfig, PodSandboxMetadata,
    SandboxFilter, SandboxState, SqliteMetadataStore,
};
use vmlet::net::types::DnsConfig;
use vmlet::runtime::types::{ContainerConfig, ContainerMetadata};
use vmlet::runtime::{ImageTranslator, RuntimeOptions, RuntimeService};
use vmlet_shared::errors::VmletError;
use vmlet_test_utils::{FakeImageStore, FakeNetworkSource, FakeVmTool, TestServer};

struct Harness {
    ts: TestServer,
    network: Arc<FakeNetworkSource>,
    store: Arc<SqliteMetadataStore>,
    vm_tool: Arc<FakeVmTool>,
    images: Arc<FakeImageStore>,
    service: RuntimeService,
}

impl Harness {
    async fn new() -> Self {
        let network = Arc::new(FakeNetworkSource::new());
        let ts = TestServer::start(network.clone()).await;
        let store = Arc::new(SqliteMetadataStore::open_in_memory().unwrap());
        let vm_tool = Arc::new(FakeVmTool::new());
        let images = Arc::new(FakeImageStore::new());
        let service = RuntimeService::new(
            FdClient::new(&ts.socket_path),
            store.clone(),
            vm_tool.clone(),
            images.clone(),
        );
        Self {
            ts,
            network,
            store,
            vm_tool,
            images,
            service,
        }
    }

    /// A second service over the same server and store, as after a restart.
    fn restarted(&self) -> RuntimeService {
        RuntimeService::new(
            FdClient::new(&self.ts.socket_path),
            self.store.clone(),
            self.vm_tool.clone(),
            self.images.clone(),
        )
    }
}

fn sandbox_config(uid: &str) -> PodSandboxConfig {
    let mut config = PodSandboxConfig {
        metadata: Some(PodSandboxMetadata {
            name: format!("pod-{}", uid),
            uid: uid.to_string(),
            namespace: "default".into(),
            attempt: 0,
        }),
        dns_config: Some(DnsConfig {
            servers: vec!["10.96.0.10".into()],
            searches: vec!["default.svc.cluster.local".into()],
            options: vec![],
        }),
        ..Default::default()
    };
    config.labels.insert("app".into(), uid.into());
    config
}

fn container_config(name: &str) -> ContainerConfig {
    ContainerConfig {
        metadata: Some(ContainerMetadata {
            name: name.into(),
            attempt: 0,
        }),
        image: "cirros".into(),
        ..Default::default()
    }
}

// ============================================================================
// SANDBOXES
// ============================================================================

#[tokio::test]
async fn test_run_sandbox_twice_adds_once() {
    let h = Harness::new().await;

    let id = h.service.run_pod_sandbox(sandbox_config("p1")).await.unwrap();
    assert_eq!(id, "p1");
    let again = h.service.run_pod_sandbox(sandbox_config("p1")).await.unwrap();
    assert_eq!(again, "p1");

    assert_eq!(h.network.add_count(), 1);
    let record = h.store.sandbox("p1").unwrap().unwrap();
    assert_eq!(record.state, SandboxState::Ready);
    assert!(record.container_side_network.is_some());

    let payload = h.network.payload("p1").unwrap();
    assert_eq!(payload.description.pod_name, "pod-p1");
    assert_eq!(
        payload.description.dns.unwrap().servers,
        vec!["10.96.0.10".to_string()]
    );
}

#[tokio::test]
async fn test_run_sandbox_requires_metadata() {
    let h = Harness::new().await;
    let err = h
        .service
        .run_pod_sandbox(PodSandboxConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, VmletError::InvalidArgument(_)));
    assert_eq!(h.network.add_count(), 0);
}

#[tokio::test]
async fn test_run_sandbox_failure_leaves_nothing() {
    let h = Harness::new().await;
    h.network.set_fail_add(true);

    assert!(h.service.run_pod_sandbox(sandbox_config("p1")).await.is_err());
    assert!(h.store.sandbox("p1").unwrap().is_none());
    assert_eq!(h.ts.server.key_count(), 0);

    h.network.set_fail_add(false);
    h.service.run_pod_sandbox(sandbox_config("p1")).await.unwrap();
    assert!(h.network.has_pod("p1"));
}

#[tokio::test]
async fn test_stop_sandbox_twice() {
    let h = Harness::new().await;
    h.service.run_pod_sandbox(sandbox_config("p1")).await.unwrap();

    h.service.stop_pod_sandbox("p1").await.unwrap();
    h.service.stop_pod_sandbox("p1").await.unwrap();

    assert_eq!(h.network.release_count(), 1);
    assert!(!h.network.has_pod("p1"));
    assert_eq!(
        h.store.sandbox("p1").unwrap().unwrap().state,
        SandboxState::NotReady
    );
}

#[tokio::test]
async fn test_stop_sandbox_release_failure_is_retried() {
    let h = Harness::new().await;
    h.service.run_pod_sandbox(sandbox_config("p1")).await.unwrap();
    h.network.set_fail_release(true);

    h.service.stop_pod_sandbox("p1").await.unwrap();
    let record = h.store.sandbox("p1").unwrap().unwrap();
    assert_eq!(record.state, SandboxState::NotReady);
    assert!(record.container_side_network.is_some());
    assert_eq!(h.ts.server.key_count(), 1);

    h.network.set_fail_release(false);
    h.service.stop_pod_sandbox("p1").await.unwrap();
    assert_eq!(h.network.release_count(), 2);
    assert!(
        h.store
            .sandbox("p1")
            .unwrap()
            .unwrap()
            .container_side_network
            .is_none()
    );
    assert_eq!(h.ts.server.key_count(), 0);

    h.service.stop_pod_sandbox("p1").await.unwrap();
    assert_eq!(h.network.release_count(), 2);
}

#[tokio::test]
async fn test_stop_unknown_sandbox() {
    let h = Harness::new().await;
    let err = h.service.stop_pod_sandbox("nope").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_remove_sandbox() {
    let h = Harness::new().await;
    h.service.remove_pod_sandbox("absent").unwrap();

    h.service.run_pod_sandbox(sandbox_config("p1")).await.unwrap();
    h.service.stop_pod_sandbox("p1").await.unwrap();
    h.service.remove_pod_sandbox("p1").unwrap();
    assert!(h.store.sandbox("p1").unwrap().is_none());
    h.service.remove_pod_sandbox("p1").unwrap();
}

#[tokio::test]
async fn test_sandbox_status_and_list() {
    let h = Harness::new().await;
    h.service.run_pod_sandbox(sandbox_config("p1")).await.unwrap();
    h.service.run_pod_sandbox(sandbox_config("p2")).await.unwrap();
    h.service.stop_pod_sandbox("p2").await.unwrap();

    let status = h.service.pod_sandbox_status("p1").unwrap();
    assert_eq!(status.state, SandboxState::Ready);
    assert!(status.ip.unwrap().starts_with("10.1.90."));
    assert!(h.service.pod_sandbox_status("nope").unwrap_err().is_not_found());

    assert_eq!(
        h.service
            .list_pod_sandboxes(&SandboxFilter::default())
            .unwrap()
            .len(),
        2
    );
    let ready = h
        .service
        .list_pod_sandboxes(&SandboxFilter {
            state: Some(SandboxState::Ready),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].id, "p1");

    let mut by_label = SandboxFilter::default();
    by_label.label_selector.insert("app".into(), "p2".into());
    let found = h.service.list_pod_sandboxes(&by_label).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, "p2");
}

#[tokio::test]
async fn test_recover_rebuilds_sandboxes_with_network() {
    let h = Harness::new().await;
    h.service.run_pod_sandbox(sandbox_config("p1")).await.unwrap();
    h.service.run_pod_sandbox(sandbox_config("p2")).await.unwrap();
    h.service.run_pod_sandbox(sandbox_config("p3")).await.unwrap();
    h.service.stop_pod_sandbox("p2").await.unwrap();
    // p3 is stopped but its network could not be released
    h.network.set_fail_release(true);
    h.service.stop_pod_sandbox("p3").await.unwrap();
    h.network.set_fail_release(false);

    // a fresh descriptor server knows nothing about the pods
    let network = Arc::new(FakeNetworkSource::new());
    let ts = TestServer::start(network.clone()).await;
    let service = RuntimeService::new(
        FdClient::new(&ts.socket_path),
        h.store.clone(),
        h.vm_tool.clone(),
        h.images.clone(),
    );

    let report = service.recover().await.unwrap();
    let mut recovered = report.recovered.clone();
    recovered.sort();
    assert_eq!(recovered, vec!["p1".to_string(), "p3".to_string()]);
    assert!(report.errors.is_empty());
    assert_eq!(network.recovery_count(), 2);
    assert_eq!(network.add_count(), 0);
    assert!(!network.has_pod("p2"));

    let stored = h.store.sandbox("p1").unwrap().unwrap();
    let payload = network.payload("p1").unwrap();
    assert_eq!(
        payload.cni_config.as_ref(),
        stored.container_side_network.as_ref().map(|c| &c.result)
    );
    assert!(ts.client.get_fds("p1").await.is_ok());

    // the recovered NOT_READY sandbox can now be torn down
    service.stop_pod_sandbox("p3").await.unwrap();
    assert!(!network.has_pod("p3"));
    assert_eq!(ts.server.key_count(), 1);
}

#[tokio::test]
async fn test_recover_collects_errors() {
    let h = Harness::new().await;
    h.service.run_pod_sandbox(sandbox_config("p1")).await.unwrap();

    // the original server still holds p1, so the recovery Add is a duplicate
    let report = h.restarted().recover().await.unwrap();
    assert!(report.recovered.is_empty());
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].0, "p1");
}

// ============================================================================
// CONTAINERS
// ============================================================================

#[tokio::test]
async fn test_single_container_per_sandbox() {
    let h = Harness::new().await;
    h.service.run_pod_sandbox(sandbox_config("p1")).await.unwrap();

    let first = h
        .service
        .create_container("p1", container_config("vm"))
        .await
        .unwrap();
    let second = h
        .service
        .create_container("p1", container_config("other"))
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(h.vm_tool.vm_count(), 1);

    let vm = h.vm_tool.vm(&first).unwrap();
    assert_eq!(vm.fd_key.as_deref(), Some("p1"));
    assert_eq!(vm.config.pod_name, "pod-p1");
    assert!(vm.config.container_side_network.is_some());
}

#[tokio::test]
async fn test_create_container_validation() {
    let h = Harness::new().await;

    let err = h
        .service
        .create_container("nope", container_config("vm"))
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    h.service.run_pod_sandbox(sandbox_config("p1")).await.unwrap();
    let mut no_image = container_config("vm");
    no_image.image.clear();
    let err = h
        .service
        .create_container("p1", no_image)
        .await
        .unwrap_err();
    assert!(matches!(err, VmletError::InvalidArgument(_)));
}

#[tokio::test]
async fn test_container_lifecycle() {
    let h = Harness::new().await;
    h.service.run_pod_sandbox(sandbox_config("p1")).await.unwrap();
    h.service.pull_image("cirros").await.unwrap();
    h.service.pull_image("unused").await.unwrap();

    let id = h
        .service
        .create_container("p1", container_config("vm"))
        .await
        .unwrap();
    assert_eq!(
        h.service.container_status(&id).await.unwrap().state,
        ContainerState::Created
    );

    h.service.start_container(&id).await.unwrap();
    h.service.start_container(&id).await.unwrap();
    let status = h.service.container_status(&id).await.unwrap();
    assert_eq!(status.state, ContainerState::Running);
    assert!(status.started_at > 0);

    h.service.stop_container(&id, None).await.unwrap();
    h.service.stop_container(&id, None).await.unwrap();
    assert!(
        h.service
            .start_container(&id)
            .await
            .unwrap_err()
            .to_string()
            .contains("can't start")
    );

    let listed = h
        .service
        .list_containers(&ContainerFilter::for_sandbox("p1"))
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].state, ContainerState::Exited);

    h.service.remove_container(&id).await.unwrap();
    assert!(h.store.container(&id).unwrap().is_none());
    assert_eq!(h.vm_tool.vm_count(), 0);
    assert_eq!(h.vm_tool.gc_runs(), 1);
    assert!(!h.images.contains("cirros"));
    assert!(!h.images.contains("unused"));

    h.service.remove_container(&id).await.unwrap();
    assert_eq!(h.vm_tool.gc_runs(), 2);
}

#[tokio::test]
async fn test_gc_keeps_images_in_use() {
    let h = Harness::new().await;
    h.service.run_pod_sandbox(sandbox_config("p1")).await.unwrap();
    h.service.run_pod_sandbox(sandbox_config("p2")).await.unwrap();
    h.service.pull_image("cirros").await.unwrap();

    let a = h
        .service
        .create_container("p1", container_config("a"))
        .await
        .unwrap();
    h.service
        .create_container("p2", container_config("b"))
        .await
        .unwrap();

    h.service.remove_container(&a).await.unwrap();
    assert!(h.images.contains("cirros"));
    assert!(h.images.last_gc_in_use().unwrap().contains("cirros"));
}

#[tokio::test]
async fn test_container_status_follows_vm() {
    let h = Harness::new().await;
    h.service.run_pod_sandbox(sandbox_config("p1")).await.unwrap();
    let id = h
        .service
        .create_container("p1", container_config("vm"))
        .await
        .unwrap();
    h.service.start_container(&id).await.unwrap();

    h.vm_tool.crash(&id);
    let status = h.service.container_status(&id).await.unwrap();
    assert_eq!(status.state, ContainerState::Exited);
    assert!(status.finished_at > 0);
    assert_eq!(
        h.store.container(&id).unwrap().unwrap().state,
        ContainerState::Exited
    );
}

// ============================================================================
// SERVICE
// ============================================================================

struct PrefixTranslator;

impl ImageTranslator for PrefixTranslator {
    fn translate(&self, name: &str) -> String {
        format!("mirror.local/{}", name)
    }
}

#[tokio::test]
async fn test_pull_image_uses_translator() {
    let h = Harness::new().await;
    let service = h.restarted().with_translator(Arc::new(PrefixTranslator));

    let reference = service.pull_image("cirros").await.unwrap();
    assert_eq!(reference, "mirror.local/cirros");
    assert!(h.images.contains("mirror.local/cirros"));

    service.remove_image("mirror.local/cirros").await.unwrap();
    assert!(service.remove_image("mirror.local/cirros").await.is_err());
}

#[tokio::test]
async fn test_connect_waits_for_server() {
    let h = Harness::new().await;
    let options = RuntimeOptions {
        netd_socket_path: h.ts.socket_path.clone(),
        connect_retries: 3,
        connect_delay_ms: 10,
        ..Default::default()
    };
    let service = RuntimeService::connect(&options, h.store.clone(), h.vm_tool.clone(), h.images.clone())
        .await
        .unwrap();
    assert_eq!(service.version().runtime_name, "vmlet");
    assert!(service.status().conditions.iter().all(|c| c.status));

    let dir = vmlet_test_utils::short_tempdir();
    let missing = RuntimeOptions {
        netd_socket_path: dir.path().join("none.sock"),
        connect_retries: 2,
        connect_delay_ms: 10,
        ..Default::default()
    };
    assert!(
        RuntimeService::connect(&missing, h.store.clone(), h.vm_tool.clone(), h.images.clone())
            .await
            .is_err()
    );
}
