//! Cluster topology: the control plane and worker groups of one cluster.
//!
//! Always read fresh from the store. Convergence checks re-read the group
//! and its machines on every poll rather than reusing a cached copy.

use std::fmt;

use anyhow::{Context, Result};
use kube::api::DynamicObject;
use serde_json::Value;

use crate::error::CuoError;
use crate::k8s::{ObjectStore, ResourceKind};

pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";
pub const CONTROL_PLANE_LABEL: &str = "cluster.x-k8s.io/control-plane";
pub const DEPLOYMENT_NAME_LABEL: &str = "cluster.x-k8s.io/deployment-name";

/// Reference from a node group to its infrastructure machine template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateRef {
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

impl fmt::Display for TemplateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// Replica counts reported by a node group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicaStatus {
    pub desired: i64,
    pub replicas: i64,
    pub updated: i64,
    pub ready: i64,
}

impl ReplicaStatus {
    /// All desired replicas exist, run the latest spec, and are ready.
    pub const fn is_rolled_out(&self) -> bool {
        self.replicas == self.desired && self.updated == self.desired && self.ready == self.desired
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeGroupKind {
    ControlPlane,
    Workers,
}

impl NodeGroupKind {
    pub const fn resource_kind(self) -> ResourceKind {
        match self {
            Self::ControlPlane => ResourceKind::KubeadmControlPlane,
            Self::Workers => ResourceKind::MachineDeployment,
        }
    }
}

/// A control plane or a machine deployment.
#[derive(Debug, Clone)]
pub struct NodeGroup {
    pub kind: NodeGroupKind,
    pub cluster_name: String,
    pub name: String,
    pub namespace: String,
    /// Kubernetes version in the group's spec, if set.
    pub version: Option<String>,
    pub template: TemplateRef,
    pub replicas: ReplicaStatus,
}

impl NodeGroup {
    /// Label selector matching the machines this group owns.
    pub fn machine_selector(&self) -> String {
        match self.kind {
            NodeGroupKind::ControlPlane => {
                format!("{CLUSTER_NAME_LABEL}={},{CONTROL_PLANE_LABEL}", self.cluster_name)
            }
            NodeGroupKind::Workers => format!("{DEPLOYMENT_NAME_LABEL}={}", self.name),
        }
    }

    pub fn is_at_version(&self, version: &str) -> bool {
        self.version.as_deref() == Some(version)
    }

    fn from_object(kind: NodeGroupKind, cluster_name: &str, obj: &DynamicObject) -> Result<Self> {
        let name = obj.metadata.name.clone().unwrap_or_default();
        let namespace = obj.metadata.namespace.clone().unwrap_or_default();
        let spec = &obj.data["spec"];

        let (version, template) = match kind {
            NodeGroupKind::ControlPlane => (
                &spec["version"],
                &spec["machineTemplate"]["infrastructureRef"],
            ),
            NodeGroupKind::Workers => (
                &spec["template"]["spec"]["version"],
                &spec["template"]["spec"]["infrastructureRef"],
            ),
        };

        let template_name = template["name"].as_str().ok_or_else(|| {
            CuoError::not_found(
                format!("infrastructureRef of {}", kind.resource_kind()),
                &namespace,
                &name,
            )
        })?;

        let status = &obj.data["status"];
        Ok(Self {
            kind,
            cluster_name: cluster_name.to_string(),
            version: version.as_str().map(str::to_string),
            template: TemplateRef {
                kind: template["kind"].as_str().unwrap_or_default().to_string(),
                name: template_name.to_string(),
                namespace: template["namespace"]
                    .as_str()
                    .unwrap_or(&namespace)
                    .to_string(),
            },
            replicas: ReplicaStatus {
                desired: spec["replicas"].as_i64().unwrap_or(1),
                replicas: int(&status["replicas"]),
                updated: int(&status["updatedReplicas"]),
                ready: int(&status["readyReplicas"]),
            },
            name,
            namespace,
        })
    }
}

impl fmt::Display for NodeGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{}",
            self.kind.resource_kind(),
            self.namespace,
            self.name
        )
    }
}

fn int(value: &Value) -> i64 {
    value.as_i64().unwrap_or(0)
}

/// The node groups of one cluster.
#[derive(Debug, Clone)]
pub struct ClusterTopology {
    pub cluster_name: String,
    pub namespace: String,
    pub control_plane: NodeGroup,
    pub workers: Vec<NodeGroup>,
}

/// Fetch the Cluster object or fail with `ResourceNotFound`.
pub async fn get_cluster(
    store: &dyn ObjectStore,
    cluster_name: &str,
    namespace: &str,
) -> Result<DynamicObject> {
    store
        .get(ResourceKind::Cluster, namespace, cluster_name)
        .await
        .with_context(|| format!("Failed to get Cluster {namespace}/{cluster_name}"))?
        .ok_or_else(|| CuoError::not_found("Cluster", namespace, cluster_name).into())
}

/// Read the control plane and every machine deployment of a cluster.
pub async fn read_topology(
    store: &dyn ObjectStore,
    cluster_name: &str,
    namespace: &str,
) -> Result<ClusterTopology> {
    let cluster = get_cluster(store, cluster_name, namespace).await?;
    let selector = format!("{CLUSTER_NAME_LABEL}={cluster_name}");

    let kcp = match cluster.data["spec"]["controlPlaneRef"]["name"].as_str() {
        Some(kcp_name) => store
            .get(ResourceKind::KubeadmControlPlane, namespace, kcp_name)
            .await
            .with_context(|| format!("Failed to get KubeadmControlPlane {namespace}/{kcp_name}"))?,
        None => store
            .list(
                ResourceKind::KubeadmControlPlane,
                Some(namespace),
                Some(&selector),
            )
            .await
            .with_context(|| format!("Failed to list KubeadmControlPlanes of cluster {namespace}/{cluster_name}"))?
            .into_iter()
            .next(),
    }
    .ok_or_else(|| CuoError::not_found("KubeadmControlPlane", namespace, cluster_name))?;
    let control_plane = NodeGroup::from_object(NodeGroupKind::ControlPlane, cluster_name, &kcp)?;

    let mut workers = store
        .list(
            ResourceKind::MachineDeployment,
            Some(namespace),
            Some(&selector),
        )
        .await
        .with_context(|| format!("Failed to list MachineDeployments of cluster {namespace}/{cluster_name}"))?
        .iter()
        .map(|md| NodeGroup::from_object(NodeGroupKind::Workers, cluster_name, md))
        .collect::<Result<Vec<_>>>()?;
    workers.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(ClusterTopology {
        cluster_name: cluster_name.to_string(),
        namespace: namespace.to_string(),
        control_plane,
        workers,
    })
}

/// Re-read a single node group.
pub async fn refresh(store: &dyn ObjectStore, group: &NodeGroup) -> Result<NodeGroup> {
    let kind = group.kind.resource_kind();
    let obj = store
        .get(kind, &group.namespace, &group.name)
        .await
        .with_context(|| format!("Failed to get {group}"))?
        .ok_or_else(|| CuoError::not_found(kind.kind(), &group.namespace, &group.name))?;
    NodeGroup::from_object(group.kind, &group.cluster_name, &obj)
}

/// Names of machines owned by `group` that do not report `version` yet.
pub async fn lagging_machines(
    store: &dyn ObjectStore,
    group: &NodeGroup,
    version: &str,
) -> Result<Vec<String>> {
    let machines = store
        .list(
            ResourceKind::Machine,
            Some(&group.namespace),
            Some(&group.machine_selector()),
        )
        .await
        .with_context(|| format!("Failed to list machines of {group}"))?;
    Ok(machines
        .iter()
        .filter(|m| m.data["spec"]["version"].as_str() != Some(version))
        .map(|m| m.metadata.name.clone().unwrap_or_default())
        .collect())
}
