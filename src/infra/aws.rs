//! AWS machine templates backed by per-region AMIs.

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tracing::info;

use crate::catalog::{OsInfo, VersionCatalog};
use crate::error::CuoError;
use crate::k8s::{ObjectStore, ResourceKind};

/// AMI selected for the cluster's region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwsImage {
    pub region: String,
    pub ami_id: String,
    pub os_info: OsInfo,
}

impl AwsImage {
    pub(super) fn discriminator(&self) -> String {
        format!("{}/{}", self.region, self.ami_id)
    }

    pub(super) fn matches(&self, template: &Value) -> bool {
        template["spec"]["template"]["spec"]["ami"]["id"].as_str() == Some(self.ami_id.as_str())
    }

    pub(super) fn apply(&self, machine_spec: &mut Value) {
        machine_spec["ami"] = json!({ "id": self.ami_id });
    }
}

/// Read the cluster's region from its AWSCluster and pick the catalog AMI.
pub async fn resolve(
    store: &dyn ObjectStore,
    catalog: &VersionCatalog,
    cluster_name: &str,
    namespace: &str,
) -> Result<AwsImage> {
    let aws_cluster = store
        .get(ResourceKind::AwsCluster, namespace, cluster_name)
        .await
        .with_context(|| format!("Failed to get AWSCluster {namespace}/{cluster_name}"))?
        .ok_or_else(|| CuoError::not_found("AWSCluster", namespace, cluster_name))?;

    let region = aws_cluster.data["spec"]["region"]
        .as_str()
        .filter(|r| !r.is_empty())
        .ok_or_else(|| {
            CuoError::not_found("region of AWSCluster", namespace, cluster_name)
        })?;

    let ami = catalog
        .ami_for_region(region)
        .ok_or_else(|| CuoError::not_found("AMI", "", region))?;
    info!("Using AMI {} in region {} for cluster {}", ami.id, region, cluster_name);

    Ok(AwsImage {
        region: region.to_string(),
        ami_id: ami.id.clone(),
        os_info: ami.os_info.clone(),
    })
}
