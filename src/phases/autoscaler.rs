//! Cluster autoscaler image update for workload clusters.
//!
//! A workload cluster's autoscaler runs on the management cluster as
//! `<cluster>-cluster-autoscaler` in the cluster's namespace. Clusters
//! without one are left alone.

use anyhow::{Context, Result, anyhow};
use kube::api::DynamicObject;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::{WaitOptions, readiness};
use crate::catalog::VersionCatalog;
use crate::error::CuoError;
use crate::k8s::{ObjectStore, ResourceKind};

pub fn deployment_name(cluster_name: &str) -> String {
    format!("{cluster_name}-cluster-autoscaler")
}

/// Merge patch pointing the first container at `image`, or `None` if it already does.
///
/// Merge patches replace lists whole, so every container is carried over.
pub fn image_patch(deployment: &DynamicObject, image: &str) -> Result<Option<Value>> {
    let mut containers = deployment.data["spec"]["template"]["spec"]["containers"]
        .as_array()
        .filter(|c| !c.is_empty())
        .cloned()
        .ok_or_else(|| {
            CuoError::not_found(
                "containers of Deployment",
                deployment.metadata.namespace.as_deref().unwrap_or_default(),
                deployment.metadata.name.as_deref().unwrap_or_default(),
            )
        })?;

    if containers[0]["image"].as_str() == Some(image) {
        return Ok(None);
    }
    containers[0]["image"] = json!(image);
    Ok(Some(json!({ "spec": { "template": { "spec": { "containers": containers } } } })))
}

/// Move the cluster's autoscaler to the catalog image for `version`.
///
/// Waiting for the patched Deployment is best effort: a timeout is logged
/// and does not fail the upgrade.
pub async fn execute(
    store: &dyn ObjectStore,
    catalog: &VersionCatalog,
    cluster_name: &str,
    namespace: &str,
    version: &str,
    wait: WaitOptions,
) -> Result<()> {
    let name = deployment_name(cluster_name);
    let Some(deployment) = store
        .get(ResourceKind::Deployment, namespace, &name)
        .await
        .with_context(|| format!("Failed to get autoscaler Deployment {namespace}/{name}"))?
    else {
        debug!("Cluster autoscaler is not enabled for cluster {}", cluster_name);
        return Ok(());
    };

    let image = catalog
        .autoscaler_image(version)
        .ok_or_else(|| anyhow!("No autoscaler image in the version catalog for Kubernetes {version}"))?;

    let Some(patch) = image_patch(&deployment, image)? else {
        info!("Autoscaler {}/{} already runs {}", namespace, name, image);
        return Ok(());
    };

    info!("Patching autoscaler deployment {}/{} to {}", namespace, name, image);
    store
        .patch(ResourceKind::Deployment, namespace, &name, &patch)
        .await
        .map_err(|e| CuoError::patch_failed("Deployment", namespace, &name, &e))?;

    if let Err(e) = readiness::wait_for_deployment(store, namespace, &name, wait).await {
        warn!("Unable to wait for autoscaler deployment to be ready: {:#}", e);
    }
    Ok(())
}
