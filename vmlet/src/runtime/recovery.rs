//! Rebuilding pod networks after the descriptor server restarts.

use vmlet_shared::errors::VmletResult;

use crate::fdserver::FdClient;
use crate::metadata::{MetadataStore, SandboxFilter};
use crate::net::types::{AddPayload, PodNetworkDesc};
use crate::runtime::types::RecoveryReport;

/// Re-add the network of every sandbox that still carries one, using the
/// stored configuration instead of running CNI again.
///
/// This includes NOT_READY sandboxes whose release failed, so that a later
/// stop can still tear them down.
///
/// Per-sandbox failures are collected and logged; only a store error aborts.
pub async fn recover_networks(
    store: &dyn MetadataStore,
    client: &FdClient,
) -> VmletResult<RecoveryReport> {
    let sandboxes = store.list_sandboxes(&SandboxFilter::default())?;

    let mut report = RecoveryReport::default();
    for sandbox in sandboxes {
        let Some(csn) = &sandbox.container_side_network else {
            tracing::debug!(sandbox_id = %sandbox.id, "Sandbox has no network, skipping");
            continue;
        };
        let metadata = sandbox.metadata();
        let payload = AddPayload::recovery(
            PodNetworkDesc {
                pod_id: sandbox.id.clone(),
                pod_ns: metadata.namespace,
                pod_name: metadata.name,
                dns: sandbox.config.dns_config.clone(),
            },
            csn,
        );

        match client.add_fds(&sandbox.id, &payload).await {
            Ok(_) => report.recovered.push(sandbox.id.clone()),
            Err(e) => {
                tracing::error!(sandbox_id = %sandbox.id, error = %e, "Error recovering pod network");
                report.errors.push((sandbox.id.clone(), e.to_string()));
            }
        }
    }

    tracing::info!(
        recovered = report.recovered.len(),
        failed = report.errors.len(),
        "Network recovery finished"
    );
    Ok(report)
}
