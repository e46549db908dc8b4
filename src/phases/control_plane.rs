//! Control plane rollout stage.
//!
//! Always runs, and always converges, before any worker group is touched.

use anyhow::Result;
use tracing::info;

use super::WaitOptions;
use super::rollout::{self, RolloutState};
use crate::capi::topology::ClusterTopology;
use crate::infra::TemplatePlan;
use crate::k8s::ObjectStore;

/// Upgrade the control plane of `topology` to `version`.
pub async fn execute(
    store: &dyn ObjectStore,
    topology: &ClusterTopology,
    templates: &TemplatePlan,
    version: &str,
    wait: WaitOptions,
) -> Result<RolloutState> {
    info!(
        "Upgrading control plane of cluster {} to {}",
        topology.cluster_name, version
    );
    rollout::roll_out(
        store,
        &topology.control_plane,
        &templates.control_plane,
        version,
        wait,
    )
    .await
}
