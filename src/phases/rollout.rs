//! Patch-and-wait rollout of a single node group.
//!
//! A group moves `NotPatched -> Patched -> Converged`. The patch sets the
//! Kubernetes version and, when the template changed, the infrastructure
//! reference in one merge patch. Convergence requires every owned machine
//! to report the target version and the group's replica counts to settle.

use std::fmt;

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tracing::{debug, info};

use super::{WaitOptions, wait_until};
use crate::capi::topology::{self, NodeGroup, NodeGroupKind, TemplateRef};
use crate::error::CuoError;
use crate::k8s::ObjectStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloutState {
    NotPatched,
    Patched,
    Converged,
}

impl fmt::Display for RolloutState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotPatched => write!(f, "NotPatched"),
            Self::Patched => write!(f, "Patched"),
            Self::Converged => write!(f, "Converged"),
        }
    }
}

/// Merge patch moving `group` to `version` on `template`, or `None` if it is already there.
pub fn version_patch(group: &NodeGroup, template: &TemplateRef, version: &str) -> Option<Value> {
    let template_changed = group.template.name != template.name;
    if group.is_at_version(version) && !template_changed {
        return None;
    }

    let infrastructure_ref = json!({
        "name": template.name,
        "namespace": template.namespace,
    });
    let patch = match (group.kind, template_changed) {
        (NodeGroupKind::ControlPlane, true) => json!({
            "spec": {
                "version": version,
                "machineTemplate": { "infrastructureRef": infrastructure_ref }
            }
        }),
        (NodeGroupKind::ControlPlane, false) => json!({ "spec": { "version": version } }),
        (NodeGroupKind::Workers, true) => json!({
            "spec": { "template": { "spec": {
                "version": version,
                "infrastructureRef": infrastructure_ref
            } } }
        }),
        (NodeGroupKind::Workers, false) => {
            json!({ "spec": { "template": { "spec": { "version": version } } } })
        }
    };
    Some(patch)
}

/// Whether `group` and all of its machines run `version`.
pub async fn is_converged(store: &dyn ObjectStore, group: &NodeGroup, version: &str) -> Result<bool> {
    let current = topology::refresh(store, group).await?;
    if !current.is_at_version(version) || !current.replicas.is_rolled_out() {
        debug!("{} not rolled out yet: {:?}", current, current.replicas);
        return Ok(false);
    }
    let lagging = topology::lagging_machines(store, &current, version).await?;
    if !lagging.is_empty() {
        debug!("{} has machines not at {}: {}", current, version, lagging.join(", "));
        return Ok(false);
    }
    Ok(true)
}

/// Drive one node group to `version` on `template` and wait for convergence.
///
/// The group is re-read first, so the patch decision reflects the store as
/// of now rather than the snapshot `group` was taken from.
pub async fn roll_out(
    store: &dyn ObjectStore,
    group: &NodeGroup,
    template: &TemplateRef,
    version: &str,
    wait: WaitOptions,
) -> Result<RolloutState> {
    let group = &topology::refresh(store, group)
        .await
        .with_context(|| format!("Failed to re-read {group} before rollout"))?;
    let mut state = RolloutState::NotPatched;

    if let Some(patch) = version_patch(group, template, version) {
        let kind = group.kind.resource_kind();
        store
            .patch(kind, &group.namespace, &group.name, &patch)
            .await
            .map_err(|e| CuoError::patch_failed(kind.kind(), &group.namespace, &group.name, &e))?;
        state = RolloutState::Patched;
        info!("Patched {} to {} using {}", group, version, template);
    } else {
        info!("{} is already at {}, waiting for machines", group, version);
    }

    info!(
        "Waiting up to {}s for {} to converge (state: {})",
        wait.timeout.as_secs(),
        group,
        state
    );
    let converged = wait_until(wait, || is_converged(store, group, version)).await?;
    if !converged {
        return Err(CuoError::ConvergenceTimeout {
            group: group.to_string(),
            version: version.to_string(),
            timeout: wait.timeout,
        }
        .into());
    }

    info!("{} converged at {}", group, version);
    Ok(RolloutState::Converged)
}
