//! Version catalog (BOM) describing the default component versions of a release.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Operating system of a machine image, recorded on the Cluster after upgrade.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OsInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub arch: String,
}

impl OsInfo {
    pub fn is_empty(&self) -> bool {
        self.name.is_empty() && self.version.is_empty() && self.arch.is_empty()
    }

    /// `name,version,arch` as stored in the cluster's `osInfo` annotation.
    pub fn annotation(&self) -> String {
        format!("{},{},{}", self.name, self.version, self.arch)
    }
}

/// AMI published for one AWS region.
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AmiInfo {
    pub id: String,
    #[serde(default)]
    pub os_info: OsInfo,
}

/// Azure image, either a marketplace image or a shared gallery image.
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct AzureImage {
    #[serde(default)]
    pub publisher: String,
    #[serde(default)]
    pub offer: String,
    #[serde(default)]
    pub sku: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub third_party_image: bool,
    #[serde(default)]
    pub resource_group: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "subscriptionID")]
    pub subscription_id: String,
    #[serde(default)]
    pub gallery: String,
    #[serde(default)]
    pub os_info: OsInfo,
}

impl AzureImage {
    pub fn is_marketplace(&self) -> bool {
        !self.publisher.is_empty()
            && !self.offer.is_empty()
            && !self.sku.is_empty()
            && !self.version.is_empty()
    }

    pub fn is_shared_gallery(&self) -> bool {
        !self.name.is_empty()
            && !self.resource_group.is_empty()
            && !self.subscription_id.is_empty()
            && !self.gallery.is_empty()
            && !self.version.is_empty()
    }
}

/// vSphere VM template published for a release.
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct VmTemplateInfo {
    /// Inventory name or path of the VM template.
    pub name: String,
    /// Managed object id of the VM template.
    pub moid: String,
    /// Kubernetes version baked into the template.
    pub kubernetes_version: String,
    #[serde(default)]
    pub os_info: OsInfo,
}

/// Per-addon manifest metadata.
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct AddonManifest {
    #[serde(default)]
    pub version: String,
    /// Manifest path relative to the manifest directory, overriding the default layout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Default component versions for a release.
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct VersionCatalog {
    /// Release (distribution) version this catalog describes.
    #[serde(default)]
    pub release_version: String,

    /// Default Kubernetes version of the release.
    #[serde(default)]
    pub kubernetes_version: String,

    /// Provider versions keyed by provider manifest label (e.g. `bootstrap-kubeadm`).
    #[serde(default)]
    pub providers: BTreeMap<String, String>,

    /// AMIs keyed by AWS region.
    #[serde(default)]
    pub ami: BTreeMap<String, AmiInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure_image: Option<AzureImage>,

    #[serde(default)]
    pub vsphere_templates: Vec<VmTemplateInfo>,

    #[serde(default)]
    pub addons: BTreeMap<String, AddonManifest>,

    /// Cluster autoscaler images keyed by Kubernetes version or by `vMAJOR.MINOR`.
    #[serde(default)]
    pub autoscaler_images: BTreeMap<String, String>,
}

impl VersionCatalog {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read version catalog {}", path.display()))?;
        Self::from_yaml(&raw)
            .with_context(|| format!("Failed to parse version catalog {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Target version for a provider, ignoring empty entries.
    pub fn provider_version(&self, provider: &str) -> Option<&str> {
        self.providers
            .get(provider)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn ami_for_region(&self, region: &str) -> Option<&AmiInfo> {
        self.ami.get(region).filter(|ami| !ami.id.is_empty())
    }

    /// Autoscaler image for a Kubernetes version, falling back to its minor line.
    pub fn autoscaler_image(&self, kubernetes_version: &str) -> Option<&str> {
        let minor = kubernetes_version.splitn(3, '.').take(2).collect::<Vec<_>>().join(".");
        self.autoscaler_images
            .get(kubernetes_version)
            .or_else(|| self.autoscaler_images.get(&minor))
            .map(String::as_str)
            .filter(|image| !image.is_empty())
    }
}
