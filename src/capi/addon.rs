//! Addon registry.
//!
//! Fixed table of the addons this tool knows how to upgrade, with the
//! cluster roles each one applies to.

use anyhow::Result;

use crate::error::CuoError;

/// Edition that ships without the standard package repository.
pub const TCE_EDITION: &str = "tce";

/// Label tying a Cluster object to its addon configuration.
pub const ADDON_CLUSTER_NAME_LABEL: &str = "tkg.tanzu.vmware.com/cluster-name";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applicability {
    /// Management and workload clusters.
    Any,
    /// Management clusters only; applied through the management cluster client.
    ManagementOnly,
}

/// One registered addon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddonSpec {
    /// `category/name` identifier.
    pub id: &'static str,
    pub applicability: Applicability,
    /// Namespace passed to the renderer; the cluster namespace when `None`.
    pub namespace: Option<&'static str>,
}

impl AddonSpec {
    const fn new(id: &'static str, applicability: Applicability, namespace: Option<&'static str>) -> Self {
        Self {
            id,
            applicability,
            namespace,
        }
    }

    pub const fn management_only(&self) -> bool {
        matches!(self.applicability, Applicability::ManagementOnly)
    }

    /// Fail unless this addon may be upgraded on a cluster of the given role.
    pub fn check_applicable(&self, is_regional_cluster: bool) -> Result<()> {
        if self.management_only() && !is_regional_cluster {
            return Err(CuoError::NotApplicableOnWorkloadCluster(self.id.to_string()).into());
        }
        Ok(())
    }

    pub fn target_namespace(&self, cluster_namespace: &str) -> String {
        self.namespace.unwrap_or(cluster_namespace).to_string()
    }

    /// `(category, name)` halves of the identifier.
    pub fn parts(&self) -> (&'static str, &'static str) {
        self.id.split_once('/').unwrap_or(("", self.id))
    }
}

pub const METADATA_TKG: &str = "metadata/tkg";
pub const KAPP_CONTROLLER: &str = "addons-management/kapp-controller";
pub const TANZU_ADDONS_MANAGER: &str = "addons-management/tanzu-addons-manager";
pub const CORE_PACKAGE_REPO: &str = "addons-management/core-package-repo";
pub const STANDARD_PACKAGE_REPO: &str = "addons-management/standard-package-repo";
pub const TKR_CONTROLLER: &str = "tkr/tkr-controller";
pub const MANAGEMENT_PACKAGE_REPO: &str = "packages/management-package-repo";
pub const MANAGEMENT_PACKAGE: &str = "packages/management-package";

/// Every addon that can be upgraded.
pub static REGISTRY: [AddonSpec; 8] = [
    AddonSpec::new(METADATA_TKG, Applicability::Any, Some("tkg-system-public")),
    AddonSpec::new(KAPP_CONTROLLER, Applicability::Any, None),
    AddonSpec::new(STANDARD_PACKAGE_REPO, Applicability::Any, None),
    AddonSpec::new(TANZU_ADDONS_MANAGER, Applicability::ManagementOnly, None),
    AddonSpec::new(CORE_PACKAGE_REPO, Applicability::ManagementOnly, None),
    AddonSpec::new(TKR_CONTROLLER, Applicability::ManagementOnly, Some("tkr-system")),
    AddonSpec::new(MANAGEMENT_PACKAGE_REPO, Applicability::ManagementOnly, None),
    AddonSpec::new(MANAGEMENT_PACKAGE, Applicability::ManagementOnly, None),
];

/// Look up an addon by identifier.
pub fn lookup(id: &str) -> Result<&'static AddonSpec> {
    REGISTRY
        .iter()
        .find(|spec| spec.id == id)
        .ok_or_else(|| CuoError::UnsupportedAddon(id.to_string()).into())
}

/// Addons upgraded before the node rollout.
pub fn pre_node_addons(is_regional_cluster: bool) -> Vec<String> {
    let mut addons = vec![KAPP_CONTROLLER];
    if is_regional_cluster {
        addons.extend([
            TANZU_ADDONS_MANAGER,
            TKR_CONTROLLER,
            CORE_PACKAGE_REPO,
            MANAGEMENT_PACKAGE_REPO,
            MANAGEMENT_PACKAGE,
        ]);
    }
    addons.into_iter().map(str::to_string).collect()
}

/// Addons upgraded after the node rollout, followed by any extras requested.
pub fn post_node_addons(edition: &str, extra: &[String]) -> Vec<String> {
    let mut addons = vec![METADATA_TKG.to_string()];
    if edition != TCE_EDITION {
        addons.push(STANDARD_PACKAGE_REPO.to_string());
    }
    for name in extra {
        if !addons.contains(name) {
            addons.push(name.clone());
        }
    }
    addons
}
