//! Preflight stage.
//!
//! Gates the requested version transition before anything is mutated, then
//! labels the Cluster with the target release.

use anyhow::Result;
use serde_json::json;
use tracing::{info, warn};

use crate::capi::topology::ClusterTopology;
use crate::capi::version::{self, Decision};
use crate::error::CuoError;
use crate::k8s::{ObjectStore, ResourceKind};

/// Label carrying the release a cluster runs.
pub const RELEASE_LABEL: &str = "tanzuKubernetesRelease";

/// Check that the control plane may move to `target_version`.
///
/// A same-version request passes; the rest of the upgrade re-applies idempotently.
pub fn check_version(topology: &ClusterTopology, target_version: &str) -> Result<Decision> {
    let group = &topology.control_plane;
    let current = group.version.as_deref().ok_or_else(|| {
        CuoError::not_found("spec.version of KubeadmControlPlane", &group.namespace, &group.name)
    })?;

    let decision = version::verify_upgrade(current, target_version)?;
    match decision {
        Decision::NoOpSameVersion => warn!(
            "Cluster {} is already at {}, re-applying",
            topology.cluster_name, target_version
        ),
        _ => info!(
            "Upgrading cluster {} from {} to {}",
            topology.cluster_name, current, target_version
        ),
    }
    Ok(decision)
}

/// Label the Cluster with the release name of `tkr_version`. Empty versions are skipped.
pub async fn label_release(
    store: &dyn ObjectStore,
    cluster_name: &str,
    namespace: &str,
    tkr_version: &str,
) -> Result<()> {
    if tkr_version.is_empty() {
        return Ok(());
    }
    let release = version::release_name(tkr_version);
    let patch = json!({ "metadata": { "labels": { RELEASE_LABEL: release } } });
    store
        .patch(ResourceKind::Cluster, namespace, cluster_name, &patch)
        .await
        .map_err(|e| CuoError::patch_failed("Cluster", namespace, cluster_name, &e))?;
    info!("Labelled cluster {} with release {}", cluster_name, release);
    Ok(())
}
