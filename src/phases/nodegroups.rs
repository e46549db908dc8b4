//! Worker group rollout stage.
//!
//! Machine deployments are upgraded one at a time, in name order. Each one
//! converges before the next is patched.

use anyhow::{Context, Result};
use tracing::info;

use super::WaitOptions;
use super::rollout;
use crate::capi::topology::ClusterTopology;
use crate::error::CuoError;
use crate::infra::TemplatePlan;
use crate::k8s::ObjectStore;

/// Upgrade every worker group of `topology` to `version`.
pub async fn execute(
    store: &dyn ObjectStore,
    topology: &ClusterTopology,
    templates: &TemplatePlan,
    version: &str,
    wait: WaitOptions,
) -> Result<()> {
    if topology.workers.is_empty() {
        info!("Cluster {} has no worker groups", topology.cluster_name);
        return Ok(());
    }

    let total = topology.workers.len();
    for (index, group) in topology.workers.iter().enumerate() {
        let template = templates.worker(&group.name).ok_or_else(|| {
            CuoError::not_found("template plan entry", &group.namespace, &group.name)
        })?;
        info!(
            "Upgrading worker group {}/{} of cluster {}: {}",
            index + 1,
            total,
            topology.cluster_name,
            group.name
        );
        rollout::roll_out(store, group, template, version, wait)
            .await
            .with_context(|| format!("Failed to upgrade worker group {}", group.name))?;
    }

    info!(
        "All {} worker groups of cluster {} are at {}",
        total, topology.cluster_name, version
    );
    Ok(())
}
