//! Deployment availability waits.
//!
//! After a management cluster upgrade the addon controllers are redeployed
//! by their manifests. The upgrade is only reported done once they are
//! available again.

use anyhow::{Context, Result};
use kube::api::DynamicObject;
use tracing::{info, warn};

use super::{WaitOptions, wait_until};
use crate::error::CuoError;
use crate::k8s::{ObjectStore, ResourceKind};

pub const TKR_NAMESPACE: &str = "tkr-system";
pub const TKR_CONTROLLER_DEPLOYMENT: &str = "tkr-controller-manager";
pub const KAPP_CONTROLLER_NAMESPACE: &str = "tkg-system";
pub const KAPP_CONTROLLER_DEPLOYMENT: &str = "kapp-controller";
pub const ADDONS_MANAGER_DEPLOYMENT: &str = "tanzu-addons-controller-manager";

/// Observed at the latest generation with every desired replica updated and available.
pub fn is_available(deployment: &DynamicObject) -> bool {
    let desired = deployment.data["spec"]["replicas"].as_i64().unwrap_or(1);
    let status = &deployment.data["status"];
    let count = |field: &str| status[field].as_i64().unwrap_or(0);
    count("observedGeneration") >= deployment.metadata.generation.unwrap_or(0)
        && count("updatedReplicas") >= desired
        && count("availableReplicas") >= desired
}

async fn check(store: &dyn ObjectStore, namespace: &str, name: &str) -> Result<bool> {
    let deployment = store
        .get(ResourceKind::Deployment, namespace, name)
        .await
        .with_context(|| format!("Failed to get Deployment {namespace}/{name}"))?;
    Ok(deployment.as_ref().is_some_and(is_available))
}

/// Wait until a Deployment is available. A missing Deployment keeps the wait going.
pub async fn wait_for_deployment(
    store: &dyn ObjectStore,
    namespace: &str,
    name: &str,
    wait: WaitOptions,
) -> Result<()> {
    if wait_until(wait, || check(store, namespace, name)).await? {
        info!("Deployment {}/{} is available", namespace, name);
        return Ok(());
    }
    Err(CuoError::DeploymentNotReady {
        name: name.to_string(),
        namespace: namespace.to_string(),
        timeout: wait.timeout,
    }
    .into())
}

/// Wait for the management cluster's addon controllers.
///
/// All three are awaited concurrently and each failure is logged. The first
/// failure is returned once every wait has finished.
pub async fn wait_for_management_components(
    store: &dyn ObjectStore,
    wait: WaitOptions,
) -> Result<()> {
    info!("Waiting for additional components to be up and running");
    let (tkr, kapp, addons) = tokio::join!(
        wait_for_deployment(store, TKR_NAMESPACE, TKR_CONTROLLER_DEPLOYMENT, wait),
        wait_for_deployment(store, KAPP_CONTROLLER_NAMESPACE, KAPP_CONTROLLER_DEPLOYMENT, wait),
        wait_for_deployment(store, KAPP_CONTROLLER_NAMESPACE, ADDONS_MANAGER_DEPLOYMENT, wait),
    );

    let mut first = None;
    for result in [tkr, kapp, addons] {
        if let Err(e) = result {
            warn!("{:#}", e);
            first.get_or_insert(e);
        }
    }
    match first {
        Some(e) => Err(e.context("Failed waiting for at least one management component deployment")),
        None => Ok(()),
    }
}
