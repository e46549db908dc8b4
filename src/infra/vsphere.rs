//! vSphere machine templates backed by VM templates.

use anyhow::{Context, Result};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde_json::{Value, json};
use tracing::info;

use crate::catalog::{OsInfo, VersionCatalog, VmTemplateInfo};
use crate::error::CuoError;

/// Annotation recording the managed object id of the source VM template.
pub const VM_TEMPLATE_MOID_ANNOTATION: &str = "vmTemplateMoid";

/// Source VM template selected for the target version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VSphereImage {
    pub template: String,
    pub moid: String,
    pub os_info: OsInfo,
}

impl VSphereImage {
    pub(super) fn discriminator(&self) -> String {
        format!("{}/{}", self.template, self.moid)
    }

    pub(super) fn matches(&self, template: &Value) -> bool {
        template["metadata"]["annotations"][VM_TEMPLATE_MOID_ANNOTATION].as_str()
            == Some(self.moid.as_str())
    }

    pub(super) fn apply(&self, machine_spec: &mut Value) {
        machine_spec["template"] = json!(self.template);
    }

    pub(super) fn annotations(&self) -> Value {
        json!({ VM_TEMPLATE_MOID_ANNOTATION: self.moid })
    }
}

/// Checks that a VM template can host the target Kubernetes version.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VmTemplateVerifier: Send + Sync {
    async fn verify(&self, template: &VmTemplateInfo, kubernetes_version: &str) -> Result<()>;
}

/// Verifier that trusts the Kubernetes version recorded in the catalog.
pub struct CatalogTemplateVerifier;

#[async_trait]
impl VmTemplateVerifier for CatalogTemplateVerifier {
    async fn verify(&self, template: &VmTemplateInfo, kubernetes_version: &str) -> Result<()> {
        if template.moid.is_empty() {
            anyhow::bail!("VM template '{}' has no managed object id", template.name);
        }
        if template.kubernetes_version != kubernetes_version {
            anyhow::bail!(
                "VM template '{}' is built for kubernetes {}, not {}",
                template.name,
                template.kubernetes_version,
                kubernetes_version
            );
        }
        Ok(())
    }
}

/// Pick and verify the VM template for `kubernetes_version`.
///
/// `template_name` selects a specific template; it matches either the full
/// inventory path or its last path segment.
pub async fn resolve(
    verifier: &dyn VmTemplateVerifier,
    catalog: &VersionCatalog,
    kubernetes_version: &str,
    template_name: Option<&str>,
) -> Result<VSphereImage> {
    let candidate = catalog.vsphere_templates.iter().find(|t| match template_name {
        Some(name) => t.name == name || t.name.rsplit('/').next() == Some(name),
        None => t.kubernetes_version == kubernetes_version,
    });
    let template = candidate.ok_or_else(|| {
        CuoError::not_found(
            "VM template",
            "",
            template_name.unwrap_or(kubernetes_version),
        )
    })?;

    verifier
        .verify(template, kubernetes_version)
        .await
        .with_context(|| format!("VM template '{}' failed verification", template.name))?;
    info!("Using VM template {} ({})", template.name, template.moid);

    Ok(VSphereImage {
        template: template.name.clone(),
        moid: template.moid.clone(),
        os_info: template.os_info.clone(),
    })
}
