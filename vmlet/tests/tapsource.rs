//! Tap source behind a real descriptor server.
//!
//! Tests that create network namespaces need root and are ignored by default:
//! `sudo -E cargo test -p vmlet --test tapsource -- --ignored`

use std::sync::Arc;

use serde_json::json;
use vmlet::net::types::{AddPayload, CniResult, PodNetworkDesc};
use vmlet::net::{TapFdSource, TapSourceOptions};
use vmlet_test_utils::{FakeCniClient, TestServer, short_tempdir};

fn payload(pod_id: &str) -> AddPayload {
    AddPayload::new(PodNetworkDesc {
        pod_id: pod_id.into(),
        pod_ns: "default".into(),
        pod_name: format!("pod-{}", pod_id),
        dns: None,
    })
}

#[tokio::test]
async fn test_bad_payload_skips_cni() {
    let netns_dir = short_tempdir();
    let cni = Arc::new(FakeCniClient::new(CniResult::default()));
    let source = TapFdSource::new(
        cni.clone(),
        TapSourceOptions {
            netns_dir: netns_dir.path().to_path_buf(),
            ..Default::default()
        },
    );
    let ts = TestServer::start(Arc::new(source)).await;

    let err = ts
        .client
        .add_fds("p1", &json!({"description": 42}))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unmarshalling"), "{}", err);
    assert!(cni.calls().is_empty());
    assert_eq!(ts.server.key_count(), 0);
}

#[tokio::test]
#[ignore = "requires root"]
async fn test_cni_failure_removes_netns() {
    let netns_dir = short_tempdir();
    let cni = Arc::new(FakeCniClient::new(CniResult::default()));
    cni.set_fail_add(true);
    let source = TapFdSource::new(
        cni.clone(),
        TapSourceOptions {
            netns_dir: netns_dir.path().to_path_buf(),
            ..Default::default()
        },
    );
    let ts = TestServer::start(Arc::new(source)).await;

    let err = ts.client.add_fds("p1", &payload("p1")).await.unwrap_err();
    assert!(err.to_string().contains("CNI network"), "{}", err);
    assert!(!netns_dir.path().join("p1").exists());

    let calls = cni.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "ADD");
    assert_eq!(calls[0].2, "pod-p1");
    assert_eq!(ts.server.key_count(), 0);
}
