//! Upgrade request types read from YAML request files.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::phases::WaitOptions;

/// Namespace used when a request does not name one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// A request to upgrade one cluster's Kubernetes version.
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeRequest {
    /// Name of the Cluster object to upgrade.
    pub cluster_name: String,

    /// Namespace of the Cluster object.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Target Kubernetes version (e.g., "v1.20.4+vmware.1").
    pub kubernetes_version: String,

    /// Target distribution release version (e.g., "v1.20.4+vmware.1-tkg.1").
    #[serde(default)]
    pub tkr_version: String,

    /// Whether the target is the management cluster itself.
    #[serde(default)]
    pub is_regional_cluster: bool,

    /// Additional addon identifiers to upgrade after the nodes are upgraded.
    #[serde(default)]
    pub addon_names: Vec<String>,

    /// Override for the source VM template on vSphere.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vsphere_template_name: Option<String>,

    /// Skip the addon upgrades that normally bracket the node rollout.
    #[serde(default)]
    pub skip_addon_upgrade: bool,

    /// Build edition; `tce` skips the standard package repository.
    #[serde(default)]
    pub edition: String,

    /// Management cluster kubeconfig context handed to the provider upgrader.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,

    /// Timeout configuration.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

/// A request to upgrade a list of addons on one cluster.
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AddonUpgradeRequest {
    pub cluster_name: String,

    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Addon identifiers in `category/name` form.
    pub addon_names: Vec<String>,

    #[serde(default)]
    pub is_regional_cluster: bool,

    #[serde(default)]
    pub edition: String,

    /// Kubernetes version passed to the manifest renderer.
    #[serde(default)]
    pub kubernetes_version: String,
}

impl AddonUpgradeRequest {
    /// Derive an addon request for the same cluster as a cluster upgrade.
    pub fn for_cluster(request: &UpgradeRequest, addon_names: Vec<String>) -> Self {
        Self {
            cluster_name: request.cluster_name.clone(),
            namespace: request.namespace.clone(),
            addon_names,
            is_regional_cluster: request.is_regional_cluster,
            edition: request.edition.clone(),
            kubernetes_version: request.kubernetes_version.clone(),
        }
    }
}

/// Timeout configuration for convergence waits.
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutConfig {
    /// Interval between convergence polls in seconds (default: 15).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,

    /// Control plane convergence timeout in minutes (default: 30).
    #[serde(default = "default_cp_timeout")]
    pub control_plane_minutes: u64,

    /// Worker group convergence timeout in minutes (default: 60).
    #[serde(default = "default_worker_timeout")]
    pub worker_minutes: u64,

    /// Deployment availability timeout in minutes for the autoscaler and
    /// management components (default: 10).
    #[serde(default = "default_deployment_timeout")]
    pub deployment_minutes: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval(),
            control_plane_minutes: default_cp_timeout(),
            worker_minutes: default_worker_timeout(),
            deployment_minutes: default_deployment_timeout(),
        }
    }
}

impl TimeoutConfig {
    pub const fn control_plane_wait(&self) -> WaitOptions {
        WaitOptions {
            interval: Duration::from_secs(self.poll_interval_seconds),
            timeout: Duration::from_secs(self.control_plane_minutes.saturating_mul(60)),
        }
    }

    pub const fn worker_wait(&self) -> WaitOptions {
        WaitOptions {
            interval: Duration::from_secs(self.poll_interval_seconds),
            timeout: Duration::from_secs(self.worker_minutes.saturating_mul(60)),
        }
    }

    pub const fn deployment_wait(&self) -> WaitOptions {
        WaitOptions {
            interval: Duration::from_secs(self.poll_interval_seconds),
            timeout: Duration::from_secs(self.deployment_minutes.saturating_mul(60)),
        }
    }
}

/// Top-level request file consumed by the CLI.
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RequestFile {
    /// Path to the version catalog (BOM) YAML.
    pub catalog_path: PathBuf,

    /// Directory of rendered addon manifests (`<dir>/<category>/<name>.yaml`).
    #[serde(default = "default_manifest_dir")]
    pub manifest_dir: PathBuf,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade: Option<UpgradeRequest>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addons: Option<AddonUpgradeRequest>,
}

impl RequestFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read request file {}", path.display()))?;
        serde_yaml::from_str(&raw)
            .with_context(|| format!("Failed to parse request file {}", path.display()))
    }
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_manifest_dir() -> PathBuf {
    PathBuf::from("manifests")
}

const fn default_poll_interval() -> u64 {
    15
}
const fn default_cp_timeout() -> u64 {
    30
}
const fn default_worker_timeout() -> u64 {
    60
}
const fn default_deployment_timeout() -> u64 {
    10
}
