//! Infrastructure template stage and the post-rollout OS annotation.

use anyhow::Result;
use serde_json::json;
use tracing::info;

use crate::capi::topology::ClusterTopology;
use crate::catalog::{OsInfo, VersionCatalog};
use crate::error::CuoError;
use crate::infra::{self, TemplatePlan, VmTemplateVerifier};
use crate::k8s::{ObjectStore, ResourceKind};
use crate::request::UpgradeRequest;

/// Annotation recording the OS of the cluster's machine image.
pub const OS_INFO_ANNOTATION: &str = "osInfo";

/// Resolve the target image and make sure every node group has a template for it.
pub async fn execute(
    store: &dyn ObjectStore,
    verifier: &dyn VmTemplateVerifier,
    catalog: &VersionCatalog,
    request: &UpgradeRequest,
    topology: &ClusterTopology,
) -> Result<TemplatePlan> {
    let provider = infra::resolve(store, verifier, catalog, request, topology).await?;
    info!(
        "Preparing {} templates for cluster {}",
        provider.template_kind(),
        topology.cluster_name
    );
    infra::prepare_templates(store, &provider, topology, &request.kubernetes_version).await
}

/// Record `os_info` on the Cluster. Empty OS info is skipped.
pub async fn annotate_os_info(
    store: &dyn ObjectStore,
    cluster_name: &str,
    namespace: &str,
    os_info: &OsInfo,
) -> Result<()> {
    if os_info.is_empty() {
        return Ok(());
    }
    let patch = json!({ "metadata": { "annotations": { OS_INFO_ANNOTATION: os_info.annotation() } } });
    store
        .patch(ResourceKind::Cluster, namespace, cluster_name, &patch)
        .await
        .map_err(|e| CuoError::patch_failed("Cluster", namespace, cluster_name, &e))?;
    info!("Annotated cluster {} with osInfo {}", cluster_name, os_info.annotation());
    Ok(())
}
