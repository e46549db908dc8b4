//! Infrastructure machine templates.
//!
//! Resolves the machine image for the target version on the cluster's
//! infrastructure provider and materialises one template per node group.
//! Template names are derived from the group, the target version and a hash
//! of the image, so a re-run finds the template it created before instead
//! of creating a duplicate. Templates are never modified after creation.

pub mod aws;
pub mod azure;
pub mod vsphere;

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use kube::api::DynamicObject;
use serde_json::{Value, json};
use tracing::info;

use crate::capi::topology::{ClusterTopology, NodeGroup, TemplateRef};
use crate::capi::version::sanitize_for_name;
use crate::catalog::{OsInfo, VersionCatalog};
use crate::error::CuoError;
use crate::k8s::{ObjectStore, ResourceKind};
use crate::request::UpgradeRequest;

pub use vsphere::{CatalogTemplateVerifier, VmTemplateVerifier};

/// Machine image selected for the target version, per infrastructure provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfraProvider {
    VSphere(vsphere::VSphereImage),
    Aws(aws::AwsImage),
    Azure(azure::AzureImageSpec),
}

impl InfraProvider {
    pub const fn template_kind(&self) -> ResourceKind {
        match self {
            Self::VSphere(_) => ResourceKind::VSphereMachineTemplate,
            Self::Aws(_) => ResourceKind::AwsMachineTemplate,
            Self::Azure(_) => ResourceKind::AzureMachineTemplate,
        }
    }

    /// Value hashed into template names.
    pub fn discriminator(&self) -> String {
        match self {
            Self::VSphere(image) => image.discriminator(),
            Self::Aws(image) => image.discriminator(),
            Self::Azure(image) => image.discriminator(),
        }
    }

    pub const fn os_info(&self) -> &OsInfo {
        match self {
            Self::VSphere(image) => &image.os_info,
            Self::Aws(image) => &image.os_info,
            Self::Azure(image) => &image.os_info,
        }
    }

    /// Whether an existing template object already uses this image.
    fn matches(&self, template: &Value) -> bool {
        match self {
            Self::VSphere(image) => image.matches(template),
            Self::Aws(image) => image.matches(template),
            Self::Azure(image) => image.matches(template),
        }
    }

    /// Point a cloned `spec.template.spec` at this image.
    fn apply(&self, machine_spec: &mut Value) {
        match self {
            Self::VSphere(image) => image.apply(machine_spec),
            Self::Aws(image) => image.apply(machine_spec),
            Self::Azure(image) => image.apply(machine_spec),
        }
    }

    fn annotations(&self) -> Value {
        match self {
            Self::VSphere(image) => image.annotations(),
            Self::Aws(_) | Self::Azure(_) => json!({}),
        }
    }
}

/// Resolve the image for the target version from the control plane's template kind.
pub async fn resolve(
    store: &dyn ObjectStore,
    verifier: &dyn VmTemplateVerifier,
    catalog: &VersionCatalog,
    request: &UpgradeRequest,
    topology: &ClusterTopology,
) -> Result<InfraProvider> {
    let kind = &topology.control_plane.template.kind;
    match ResourceKind::infrastructure_template(kind) {
        Some(ResourceKind::VSphereMachineTemplate) => Ok(InfraProvider::VSphere(
            vsphere::resolve(
                verifier,
                catalog,
                &request.kubernetes_version,
                request.vsphere_template_name.as_deref(),
            )
            .await?,
        )),
        Some(ResourceKind::AwsMachineTemplate) => Ok(InfraProvider::Aws(
            aws::resolve(store, catalog, &topology.cluster_name, &topology.namespace).await?,
        )),
        Some(ResourceKind::AzureMachineTemplate) => {
            Ok(InfraProvider::Azure(azure::resolve(catalog)?))
        }
        _ => Err(CuoError::UnsupportedInfrastructure(kind.clone()).into()),
    }
}

/// 64-bit FNV-1a.
fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(PRIME))
}

/// Deterministic template name: `<base>-<version>-<first 5 hex of hash>`.
pub fn template_name(base: &str, version: &str, discriminator: &str) -> String {
    let hash = fnv1a64(discriminator.as_bytes()) >> 44;
    format!("{base}-{}-{hash:05x}", sanitize_for_name(version))
}

/// Target templates for every node group of a cluster.
#[derive(Debug, Clone)]
pub struct TemplatePlan {
    pub control_plane: TemplateRef,
    /// Keyed by machine deployment name.
    pub workers: BTreeMap<String, TemplateRef>,
    pub os_info: OsInfo,
}

impl TemplatePlan {
    pub fn worker(&self, name: &str) -> Option<&TemplateRef> {
        self.workers.get(name)
    }
}

/// Find or create the template for one node group.
pub async fn ensure_template(
    store: &dyn ObjectStore,
    provider: &InfraProvider,
    group: &NodeGroup,
    base_name: &str,
    version: &str,
) -> Result<TemplateRef> {
    let kind = provider.template_kind();
    let current_ref = &group.template;
    let current = store
        .get(kind, &current_ref.namespace, &current_ref.name)
        .await
        .with_context(|| format!("Failed to read {current_ref}"))?
        .ok_or_else(|| CuoError::not_found(kind.kind(), &current_ref.namespace, &current_ref.name))?;
    let current = serde_json::to_value(&current)?;

    if group.is_at_version(version) && provider.matches(&current) {
        info!("{} already uses {} for {}", group, current_ref, version);
        return Ok(current_ref.clone());
    }

    let name = template_name(base_name, version, &provider.discriminator());
    let target = TemplateRef {
        kind: kind.kind().to_string(),
        name: name.clone(),
        namespace: current_ref.namespace.clone(),
    };

    if store
        .get(kind, &target.namespace, &name)
        .await
        .with_context(|| format!("Failed to look up {target}"))?
        .is_some()
    {
        info!("Reusing existing {} for {}", target, group);
        return Ok(target);
    }

    let mut spec = current["spec"].clone();
    provider.apply(&mut spec["template"]["spec"]);
    let object: DynamicObject = serde_json::from_value(json!({
        "apiVersion": kind.api_version(),
        "kind": kind.kind(),
        "metadata": {
            "name": name,
            "namespace": target.namespace,
            "labels": current["metadata"]["labels"].clone(),
            "annotations": provider.annotations(),
        },
        "spec": spec,
    }))?;

    store
        .create(kind, &object)
        .await
        .map_err(|e| CuoError::create_failed(kind.kind(), &target.namespace, &name, &e))?;
    info!("Created {} for {}", target, group);
    Ok(target)
}

/// Ensure templates for the control plane and every worker group.
pub async fn prepare_templates(
    store: &dyn ObjectStore,
    provider: &InfraProvider,
    topology: &ClusterTopology,
    version: &str,
) -> Result<TemplatePlan> {
    let control_plane = ensure_template(
        store,
        provider,
        &topology.control_plane,
        &format!("{}-control-plane", topology.cluster_name),
        version,
    )
    .await?;

    let mut workers = BTreeMap::new();
    for group in &topology.workers {
        let target = ensure_template(store, provider, group, &group.name, version).await?;
        workers.insert(group.name.clone(), target);
    }

    Ok(TemplatePlan {
        control_plane,
        workers,
        os_info: provider.os_info().clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capi::topology::read_topology;
    use crate::k8s::fake::{self, FakeStore, Op};

    fn aws_image() -> InfraProvider {
        InfraProvider::Aws(aws::AwsImage {
            region: "us-west-2".to_string(),
            ami_id: "ami-0456".to_string(),
            os_info: OsInfo::default(),
        })
    }

    fn seeded(version: &str) -> FakeStore {
        let store = FakeStore::new();
        store.insert(ResourceKind::Cluster, fake::cluster("wc-1", "default"));
        store.insert(
            ResourceKind::KubeadmControlPlane,
            fake::control_plane("wc-1", "default", version, "AWSMachineTemplate", "wc-1-control-plane"),
        );
        store.insert(
            ResourceKind::MachineDeployment,
            fake::machine_deployment("wc-1", "default", "wc-1-md-0", version, "AWSMachineTemplate", "wc-1-md-0"),
        );
        for name in ["wc-1-control-plane", "wc-1-md-0"] {
            store.insert(
                ResourceKind::AwsMachineTemplate,
                fake::template(
                    "AWSMachineTemplate",
                    "default",
                    name,
                    json!({ "instanceType": "m5.large", "ami": { "id": "ami-0123" } }),
                ),
            );
        }
        store
    }

    #[test]
    fn test_fnv1a64() {
        assert_eq!(fnv1a64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a64(b"a"), 0xaf63_dc4c_8601_ec8c);
    }

    #[test]
    fn test_template_name_is_deterministic() {
        let a = template_name("wc-1-control-plane", "v1.20.4+vmware.1", "us-west-2/ami-0456");
        let b = template_name("wc-1-control-plane", "v1.20.4+vmware.1", "us-west-2/ami-0456");
        let c = template_name("wc-1-control-plane", "v1.20.4+vmware.1", "us-west-2/ami-0789");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("wc-1-control-plane-v1-20-4-vmware-1-"));
        assert_eq!(a.len(), "wc-1-control-plane-v1-20-4-vmware-1-".len() + 5);
    }

    #[tokio::test]
    async fn test_prepare_templates_creates_once() {
        let store = seeded("v1.19.1+vmware.2");
        let provider = aws_image();
        let topology = read_topology(&store, "wc-1", "default").await.unwrap();

        let first = prepare_templates(&store, &provider, &topology, "v1.20.4+vmware.1")
            .await
            .unwrap();
        let second = prepare_templates(&store, &provider, &topology, "v1.20.4+vmware.1")
            .await
            .unwrap();

        assert_eq!(first.control_plane, second.control_plane);
        assert_eq!(first.worker("wc-1-md-0"), second.worker("wc-1-md-0"));
        assert_eq!(store.count(Op::Create, ResourceKind::AwsMachineTemplate), 2);

        let created = store
            .object(ResourceKind::AwsMachineTemplate, "default", &first.control_plane.name)
            .unwrap();
        assert_eq!(created["spec"]["template"]["spec"]["ami"]["id"], "ami-0456");
        assert_eq!(created["spec"]["template"]["spec"]["instanceType"], "m5.large");
        assert_eq!(created["apiVersion"], "infrastructure.cluster.x-k8s.io/v1beta2");
    }

    #[tokio::test]
    async fn test_reuses_current_template_when_already_upgraded() {
        let store = seeded("v1.20.4+vmware.1");
        store.insert(
            ResourceKind::AwsMachineTemplate,
            fake::template(
                "AWSMachineTemplate",
                "default",
                "wc-1-control-plane",
                json!({ "ami": { "id": "ami-0456" } }),
            ),
        );
        let topology = read_topology(&store, "wc-1", "default").await.unwrap();
        let target = ensure_template(
            &store,
            &aws_image(),
            &topology.control_plane,
            "wc-1-control-plane",
            "v1.20.4+vmware.1",
        )
        .await
        .unwrap();
        assert_eq!(target, topology.control_plane.template);
        assert_eq!(store.count(Op::Create, ResourceKind::AwsMachineTemplate), 0);
    }

    #[tokio::test]
    async fn test_missing_current_template() {
        let store = FakeStore::new();
        store.insert(ResourceKind::Cluster, fake::cluster("wc-1", "default"));
        store.insert(
            ResourceKind::KubeadmControlPlane,
            fake::control_plane("wc-1", "default", "v1.19.1+vmware.2", "AWSMachineTemplate", "gone"),
        );
        let topology = read_topology(&store, "wc-1", "default").await.unwrap();
        let err = prepare_templates(&store, &aws_image(), &topology, "v1.20.4+vmware.1")
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CuoError>(),
            Some(CuoError::ResourceNotFound { name, .. }) if name == "gone"
        ));
    }

    #[tokio::test]
    async fn test_create_failure_names_template() {
        let store = seeded("v1.19.1+vmware.2");
        store.fail_on(Op::Create, Some(ResourceKind::AwsMachineTemplate));
        let topology = read_topology(&store, "wc-1", "default").await.unwrap();
        let err = prepare_templates(&store, &aws_image(), &topology, "v1.20.4+vmware.1")
            .await
            .unwrap_err();
        match err.downcast_ref::<CuoError>() {
            Some(CuoError::ResourceCreateFailed { kind, name, .. }) => {
                assert_eq!(kind, "AWSMachineTemplate");
                assert!(name.starts_with("wc-1-control-plane-v1-20-4-vmware-1-"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_resolve_unsupported_infrastructure() {
        let store = FakeStore::new();
        store.insert(ResourceKind::Cluster, fake::cluster("wc-1", "default"));
        store.insert(
            ResourceKind::KubeadmControlPlane,
            fake::control_plane("wc-1", "default", "v1.19.1", "DockerMachineTemplate", "t"),
        );
        let topology = read_topology(&store, "wc-1", "default").await.unwrap();
        let request: UpgradeRequest =
            serde_yaml::from_str("clusterName: wc-1\nkubernetesVersion: v1.20.4\n").unwrap();
        let err = resolve(
            &store,
            &CatalogTemplateVerifier,
            &VersionCatalog::default(),
            &request,
            &topology,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CuoError>(),
            Some(CuoError::UnsupportedInfrastructure(kind)) if kind == "DockerMachineTemplate"
        ));
    }
}
