//! Provider upgrade planning.
//!
//! Diffs the Cluster API providers installed in the management cluster
//! against the catalog and builds the request handed to the provider
//! upgrader. Only providers strictly older than the catalog version are
//! listed, but the core provider is always present because the upgrade
//! protocol refuses a request without one.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::version::VersionIdentifier;
use crate::catalog::VersionCatalog;
use crate::error::CuoError;
use crate::k8s::{ObjectStore, ResourceKind};

/// Cluster API contract requested from the provider upgrader.
pub const UPGRADE_CONTRACT: &str = "v1beta1";

/// Provider class as recorded in a clusterctl `Provider` object's `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderType {
    Core,
    Bootstrap,
    ControlPlane,
    Infrastructure,
}

impl FromStr for ProviderType {
    type Err = CuoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CoreProvider" => Ok(Self::Core),
            "BootstrapProvider" => Ok(Self::Bootstrap),
            "ControlPlaneProvider" => Ok(Self::ControlPlane),
            "InfrastructureProvider" => Ok(Self::Infrastructure),
            other => Err(CuoError::ResourceNotFound {
                kind: "provider type".to_string(),
                name: other.to_string(),
                namespace: String::new(),
            }),
        }
    }
}

/// One installed provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledProvider {
    pub namespace: String,
    /// Object name, also the catalog key (e.g. `bootstrap-kubeadm`).
    pub name: String,
    /// Short provider name (e.g. `kubeadm`).
    pub provider_name: String,
    pub provider_type: ProviderType,
    pub version: String,
}

impl InstalledProvider {
    fn entry(&self, version: &VersionIdentifier) -> String {
        format!("{}/{}:{}", self.namespace, self.provider_name, version.semver())
    }
}

/// Providers to upgrade, each entry formatted `namespace/providerName:vX.Y.Z`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradePlan {
    pub contract: String,
    pub core_provider: String,
    pub bootstrap_providers: Vec<String>,
    pub control_plane_providers: Vec<String>,
    pub infrastructure_providers: Vec<String>,
}

impl UpgradePlan {
    /// Whether any provider actually changes version.
    pub fn has_upgrades(&self, installed: &[InstalledProvider]) -> bool {
        let core_unchanged = installed.iter().any(|p| {
            p.provider_type == ProviderType::Core
                && VersionIdentifier::from_str(&p.version)
                    .is_ok_and(|v| p.entry(&v) == self.core_provider)
        });
        !core_unchanged
            || !self.bootstrap_providers.is_empty()
            || !self.control_plane_providers.is_empty()
            || !self.infrastructure_providers.is_empty()
    }
}

impl fmt::Display for UpgradePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "core={} bootstrap=[{}] control-plane=[{}] infrastructure=[{}]",
            self.core_provider,
            self.bootstrap_providers.join(","),
            self.control_plane_providers.join(","),
            self.infrastructure_providers.join(","),
        )
    }
}

/// List the providers installed in the management cluster.
pub async fn list_installed(store: &dyn ObjectStore) -> Result<Vec<InstalledProvider>> {
    let objects = store
        .list(ResourceKind::Provider, None, None)
        .await
        .map_err(|e| CuoError::ProviderListUnavailable(format!("{e:#}")))?;

    objects
        .iter()
        .map(|obj| {
            let name = obj.metadata.name.clone().unwrap_or_default();
            let provider_type = obj.data["type"].as_str().unwrap_or_default();
            Ok(InstalledProvider {
                namespace: obj.metadata.namespace.clone().unwrap_or_default(),
                provider_name: obj.data["providerName"]
                    .as_str()
                    .unwrap_or(&name)
                    .to_string(),
                provider_type: provider_type
                    .parse()
                    .with_context(|| format!("Provider '{name}' has an unknown type"))?,
                version: obj.data["version"].as_str().unwrap_or_default().to_string(),
                name,
            })
        })
        .collect()
}

/// Compute the upgrade plan for the installed providers.
pub fn plan(installed: &[InstalledProvider], catalog: &VersionCatalog) -> Result<UpgradePlan> {
    let mut plan = UpgradePlan {
        contract: UPGRADE_CONTRACT.to_string(),
        ..Default::default()
    };

    for provider in installed {
        let current: VersionIdentifier = provider
            .version
            .parse()
            .with_context(|| format!("Provider {}/{} has an invalid version", provider.namespace, provider.name))?;

        let target = match catalog.provider_version(&provider.name).map(str::parse::<VersionIdentifier>) {
            Some(Ok(target)) => Some(target),
            Some(Err(e)) => {
                warn!("Skipping provider {}: catalog version is invalid: {}", provider.name, e);
                None
            }
            None => {
                warn!("Skipping provider {}: no version in catalog", provider.name);
                None
            }
        };
        let upgrade = target.filter(|t| current < *t);

        if provider.provider_type == ProviderType::Core {
            plan.core_provider = provider.entry(upgrade.as_ref().unwrap_or(&current));
            continue;
        }
        let Some(upgrade) = upgrade else {
            debug!("Provider {} is up to date at {}", provider.name, provider.version);
            continue;
        };
        let entry = provider.entry(&upgrade);
        match provider.provider_type {
            ProviderType::Bootstrap => plan.bootstrap_providers.push(entry),
            ProviderType::ControlPlane => plan.control_plane_providers.push(entry),
            ProviderType::Infrastructure => plan.infrastructure_providers.push(entry),
            ProviderType::Core => {}
        }
    }

    if plan.core_provider.is_empty() {
        return Err(CuoError::ResourceNotFound {
            kind: "CoreProvider".to_string(),
            name: "cluster-api".to_string(),
            namespace: String::new(),
        }
        .into());
    }
    Ok(plan)
}

/// Applies an upgrade plan to the management cluster.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProviderUpgradeClient: Send + Sync {
    /// Upgrade providers in the cluster reached through kubeconfig `context`.
    async fn apply_upgrade(&self, context: &str, plan: &UpgradePlan) -> Result<()>;
}

/// Provider upgrader that shells out to `clusterctl upgrade apply`.
pub struct ClusterctlProviderClient {
    binary: PathBuf,
}

impl ClusterctlProviderClient {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn args(context: &str, plan: &UpgradePlan) -> Vec<String> {
        let mut args = vec![
            "upgrade".to_string(),
            "apply".to_string(),
            "--contract".to_string(),
            plan.contract.clone(),
            "--core".to_string(),
            plan.core_provider.clone(),
        ];
        if !context.is_empty() {
            args.push("--kubeconfig-context".to_string());
            args.push(context.to_string());
        }
        for (flag, entries) in [
            ("--bootstrap", &plan.bootstrap_providers),
            ("--control-plane", &plan.control_plane_providers),
            ("--infrastructure", &plan.infrastructure_providers),
        ] {
            if !entries.is_empty() {
                args.push(flag.to_string());
                args.push(entries.join(","));
            }
        }
        args
    }
}

impl Default for ClusterctlProviderClient {
    fn default() -> Self {
        Self::new("clusterctl")
    }
}

#[async_trait]
impl ProviderUpgradeClient for ClusterctlProviderClient {
    async fn apply_upgrade(&self, context: &str, plan: &UpgradePlan) -> Result<()> {
        let args = Self::args(context, plan);
        info!("Running {} {}", self.binary.display(), args.join(" "));

        let output = Command::new(&self.binary)
            .args(&args)
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.binary.display()))?;

        if !output.status.success() {
            anyhow::bail!(
                "clusterctl upgrade apply failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}
