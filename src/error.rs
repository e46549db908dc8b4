//! Custom error types for cuo.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during cluster upgrade operations.
#[derive(Error, Debug)]
pub enum CuoError {
    #[error("Malformed version: {0}")]
    MalformedVersion(String),

    #[error(
        "attempted to upgrade kubernetes from {current} to {target}. Kubernetes version downgrade is not allowed"
    )]
    RejectedDowngrade { current: String, target: String },

    #[error("Upgrading Kubernetes from {current} to {target} is not supported")]
    UnsupportedUpgradePath { current: String, target: String },

    #[error("{kind} '{name}' not found in namespace '{namespace}'")]
    ResourceNotFound {
        kind: String,
        name: String,
        namespace: String,
    },

    #[error("unable to create {kind} '{name}' in namespace '{namespace}': {reason}")]
    ResourceCreateFailed {
        kind: String,
        name: String,
        namespace: String,
        reason: String,
    },

    #[error("unable to patch {kind} '{name}' in namespace '{namespace}': {reason}")]
    ResourcePatchFailed {
        kind: String,
        name: String,
        namespace: String,
        reason: String,
    },

    #[error("timed out after {}s waiting for {group} to reach kubernetes version {version}", timeout.as_secs())]
    ConvergenceTimeout {
        group: String,
        version: String,
        timeout: Duration,
    },

    #[error("timed out after {}s waiting for deployment '{name}' in namespace '{namespace}' to become available", timeout.as_secs())]
    DeploymentNotReady {
        name: String,
        namespace: String,
        timeout: Duration,
    },

    #[error("upgrade of '{0}' component is not supported")]
    UnsupportedAddon(String),

    #[error("upgrade of '{0}' component is only supported on management cluster")]
    NotApplicableOnWorkloadCluster(String),

    #[error("cannot get installed provider config: {0}")]
    ProviderListUnavailable(String),

    #[error("error while upgrading additional component '{addon}': {reason}")]
    AddonApplyFailed { addon: String, reason: String },

    #[error("infrastructure template kind '{0}' associated with KubeadmControlPlane is not supported")]
    UnsupportedInfrastructure(String),

    #[error("Kubernetes API error: {0}")]
    KubernetesApi(String),
}

impl CuoError {
    /// Build a `ResourceNotFound` error for a namespaced object.
    pub fn not_found(kind: impl Into<String>, namespace: &str, name: &str) -> Self {
        Self::ResourceNotFound {
            kind: kind.into(),
            name: name.to_string(),
            namespace: namespace.to_string(),
        }
    }

    /// Build a `ResourceCreateFailed` error, keeping the full cause chain.
    pub fn create_failed(
        kind: impl Into<String>,
        namespace: &str,
        name: &str,
        err: &anyhow::Error,
    ) -> Self {
        Self::ResourceCreateFailed {
            kind: kind.into(),
            name: name.to_string(),
            namespace: namespace.to_string(),
            reason: format!("{err:#}"),
        }
    }

    /// Build a `ResourcePatchFailed` error, keeping the full cause chain.
    pub fn patch_failed(
        kind: impl Into<String>,
        namespace: &str,
        name: &str,
        err: &anyhow::Error,
    ) -> Self {
        Self::ResourcePatchFailed {
            kind: kind.into(),
            name: name.to_string(),
            namespace: namespace.to_string(),
            reason: format!("{err:#}"),
        }
    }

    /// Whether re-running the same request may succeed without operator action.
    ///
    /// Timeouts and transport failures leave the cluster in a resumable state
    /// because template names are deterministic and patches are idempotent.
    pub const fn is_resumable(&self) -> bool {
        matches!(
            self,
            Self::ConvergenceTimeout { .. }
                | Self::DeploymentNotReady { .. }
                | Self::KubernetesApi(_)
                | Self::ProviderListUnavailable(_)
                | Self::ResourcePatchFailed { .. }
                | Self::ResourceCreateFailed { .. }
                | Self::AddonApplyFailed { .. }
        )
    }
}
