//! Addon upgrade stage.
//!
//! Every requested identifier is checked against the registry and the
//! cluster role before anything is applied. Manifests are then rendered and
//! applied one addon at a time; the first failure abandons the rest of the
//! batch. Addons already applied are left in place.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde_json::json;
use tracing::{debug, info};

use crate::capi::addon::{self, ADDON_CLUSTER_NAME_LABEL, AddonSpec};
use crate::capi::topology;
use crate::catalog::VersionCatalog;
use crate::error::CuoError;
use crate::k8s::{ObjectStore, ResourceKind};
use crate::network::{NetworkConfig, ProxyConfig};
use crate::request::AddonUpgradeRequest;

/// Values an addon manifest is rendered with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderContext {
    pub cluster_name: String,
    /// Namespace the addon is installed into.
    pub namespace: String,
    pub is_management_cluster: bool,
    pub edition: String,
    pub kubernetes_version: String,
    pub network: NetworkConfig,
    pub proxy: ProxyConfig,
}

impl RenderContext {
    /// `${NAME}` variables substituted into manifest files.
    pub fn variables(&self) -> Vec<(&'static str, String)> {
        vec![
            ("CLUSTER_NAME", self.cluster_name.clone()),
            ("NAMESPACE", self.namespace.clone()),
            ("IS_MANAGEMENT_CLUSTER", self.is_management_cluster.to_string()),
            ("EDITION", self.edition.clone()),
            ("KUBERNETES_VERSION", self.kubernetes_version.clone()),
            ("IP_FAMILY", self.network.ip_family.clone()),
            ("CLUSTER_CIDR", self.network.cluster_cidr.clone()),
            ("SERVICE_CIDR", self.network.service_cidr.clone()),
            ("HTTP_PROXY", self.proxy.http_proxy.clone()),
            ("HTTPS_PROXY", self.proxy.https_proxy.clone()),
            ("NO_PROXY", self.proxy.no_proxy.clone()),
            ("PROXY_ENABLED", self.proxy.enabled().to_string()),
        ]
    }
}

/// Produces the manifest bytes for one addon.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ManifestRenderer: Send + Sync {
    async fn render(&self, addon: &AddonSpec, context: &RenderContext) -> Result<Vec<u8>>;
}

/// Renderer reading `<root>/<category>/<name>.yaml` and substituting `${VAR}` placeholders.
pub struct DirectoryRenderer {
    root: PathBuf,
    overrides: BTreeMap<String, PathBuf>,
}

impl DirectoryRenderer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            overrides: BTreeMap::new(),
        }
    }

    /// Honour per-addon manifest paths from the catalog.
    pub fn with_catalog(mut self, catalog: &VersionCatalog) -> Self {
        self.overrides = catalog
            .addons
            .iter()
            .filter_map(|(id, manifest)| manifest.path.clone().map(|p| (id.clone(), p)))
            .collect();
        self
    }

    pub fn manifest_path(&self, addon: &AddonSpec) -> PathBuf {
        if let Some(path) = self.overrides.get(addon.id) {
            return self.root.join(path);
        }
        let (category, name) = addon.parts();
        self.root.join(category).join(format!("{name}.yaml"))
    }
}

fn substitute(template: &str, context: &RenderContext) -> String {
    context
        .variables()
        .iter()
        .fold(template.to_string(), |acc, (key, value)| {
            acc.replace(&format!("${{{key}}}"), value)
        })
}

#[async_trait]
impl ManifestRenderer for DirectoryRenderer {
    async fn render(&self, addon: &AddonSpec, context: &RenderContext) -> Result<Vec<u8>> {
        let path = self.manifest_path(addon);
        let raw = read_manifest(&path).await?;
        debug!("Rendering {} from {}", addon.id, path.display());
        Ok(substitute(&raw, context).into_bytes())
    }
}

async fn read_manifest(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read manifest {}", path.display()))
}

/// Label the Cluster for addon lookup and collect the cluster-wide render inputs.
async fn base_context(
    regional: &dyn ObjectStore,
    target: &dyn ObjectStore,
    request: &AddonUpgradeRequest,
) -> Result<RenderContext> {
    let patch = json!({ "metadata": { "labels": { ADDON_CLUSTER_NAME_LABEL: request.cluster_name } } });
    regional
        .patch(ResourceKind::Cluster, &request.namespace, &request.cluster_name, &patch)
        .await
        .map_err(|e| CuoError::patch_failed("Cluster", &request.namespace, &request.cluster_name, &e))?;

    let cluster = topology::get_cluster(regional, &request.cluster_name, &request.namespace).await?;
    let network = NetworkConfig::from_cluster(&cluster).with_context(|| {
        format!("Failed to read cluster network of {}/{}", request.namespace, request.cluster_name)
    })?;
    let proxy = ProxyConfig::read(target)
        .await
        .with_context(|| format!("Failed to read proxy settings of cluster {}", request.cluster_name))?;

    Ok(RenderContext {
        cluster_name: request.cluster_name.clone(),
        namespace: request.namespace.clone(),
        is_management_cluster: request.is_regional_cluster,
        edition: request.edition.clone(),
        kubernetes_version: request.kubernetes_version.clone(),
        network,
        proxy,
    })
}

/// Upgrade the addons named in `request`.
///
/// Management-only addons are applied through `regional`; the rest through `target`.
pub async fn execute(
    regional: &dyn ObjectStore,
    target: &dyn ObjectStore,
    renderer: &dyn ManifestRenderer,
    request: &AddonUpgradeRequest,
) -> Result<()> {
    if request.addon_names.is_empty() {
        return Ok(());
    }

    let specs = request
        .addon_names
        .iter()
        .map(|name| {
            let spec = addon::lookup(name)?;
            spec.check_applicable(request.is_regional_cluster)?;
            Ok(spec)
        })
        .collect::<Result<Vec<_>>>()?;

    let base = base_context(regional, target, request).await?;

    for spec in specs {
        let context = RenderContext {
            namespace: spec.target_namespace(&request.namespace),
            ..base.clone()
        };
        let apply_failed = |e: anyhow::Error| CuoError::AddonApplyFailed {
            addon: spec.id.to_string(),
            reason: format!("{e:#}"),
        };

        let manifest = renderer.render(spec, &context).await.map_err(apply_failed)?;
        let store = if spec.management_only() { regional } else { target };
        store.apply(&manifest).await.map_err(apply_failed)?;
        info!("Upgraded addon {} on cluster {}", spec.id, request.cluster_name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capi::addon::{KAPP_CONTROLLER, METADATA_TKG, TKR_CONTROLLER};
    use crate::k8s::fake::{self, FakeStore, Op};

    fn request(addons: &[&str], regional: bool) -> AddonUpgradeRequest {
        AddonUpgradeRequest {
            cluster_name: "wc-1".to_string(),
            namespace: "default".to_string(),
            addon_names: addons.iter().map(|s| (*s).to_string()).collect(),
            is_regional_cluster: regional,
            edition: "tkg".to_string(),
            kubernetes_version: "v1.20.4+vmware.1".to_string(),
        }
    }

    fn regional_store() -> FakeStore {
        let store = FakeStore::new();
        store.insert(ResourceKind::Cluster, fake::cluster("wc-1", "default"));
        store
    }

    fn manifest(name: &str) -> Vec<u8> {
        format!("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {name}\n").into_bytes()
    }

    #[tokio::test]
    async fn test_unsupported_addon() {
        let regional = regional_store();
        let target = FakeStore::new();
        let renderer = MockManifestRenderer::new();
        let err = execute(&regional, &target, &renderer, &request(&["invalid-name"], false))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CuoError>(),
            Some(CuoError::UnsupportedAddon(id)) if id == "invalid-name"
        ));
        assert!(regional.calls().is_empty());
    }

    #[tokio::test]
    async fn test_management_only_addon_on_workload_cluster() {
        let regional = regional_store();
        let target = FakeStore::new();
        let renderer = MockManifestRenderer::new();
        let err = execute(&regional, &target, &renderer, &request(&[METADATA_TKG, TKR_CONTROLLER], false))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CuoError>(),
            Some(CuoError::NotApplicableOnWorkloadCluster(id)) if id == TKR_CONTROLLER
        ));
        assert!(target.applied().is_empty());
    }

    #[tokio::test]
    async fn test_routes_addons_to_clusters() {
        let regional = regional_store();
        let target = FakeStore::new();
        let mut renderer = MockManifestRenderer::new();
        renderer
            .expect_render()
            .times(2)
            .returning(|spec, ctx| {
                assert_eq!(ctx.cluster_name, "wc-1");
                assert_eq!(ctx.network.service_cidr, "100.64.0.0/13");
                if spec.id == TKR_CONTROLLER {
                    assert_eq!(ctx.namespace, "tkr-system");
                    Ok(manifest("tkr"))
                } else {
                    assert_eq!(ctx.namespace, "default");
                    Ok(manifest("kapp"))
                }
            });

        execute(&regional, &target, &renderer, &request(&[KAPP_CONTROLLER, TKR_CONTROLLER], true))
            .await
            .unwrap();

        assert_eq!(target.applied().len(), 1);
        assert_eq!(target.applied()[0]["metadata"]["name"], "kapp");
        assert_eq!(regional.applied().len(), 1);
        assert_eq!(regional.applied()[0]["metadata"]["name"], "tkr");

        let cluster = regional.object(ResourceKind::Cluster, "default", "wc-1").unwrap();
        assert_eq!(cluster["metadata"]["labels"][ADDON_CLUSTER_NAME_LABEL], "wc-1");
    }

    #[tokio::test]
    async fn test_apply_failure_stops_batch() {
        let regional = regional_store();
        let target = FakeStore::new();
        target.fail_on(Op::Apply, None);
        let mut renderer = MockManifestRenderer::new();
        renderer
            .expect_render()
            .times(1)
            .returning(|_, _| Ok(manifest("kapp")));

        let err = execute(&regional, &target, &renderer, &request(&[KAPP_CONTROLLER, METADATA_TKG], false))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("additional component 'addons-management/kapp-controller'"));
        assert!(matches!(
            err.downcast_ref::<CuoError>(),
            Some(CuoError::AddonApplyFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_render_failure_is_wrapped() {
        let regional = regional_store();
        let target = FakeStore::new();
        let mut renderer = MockManifestRenderer::new();
        renderer
            .expect_render()
            .returning(|_, _| Err(anyhow::anyhow!("template missing")));
        let err = execute(&regional, &target, &renderer, &request(&[METADATA_TKG], false))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "error while upgrading additional component 'metadata/tkg': template missing"
        );
    }

    #[tokio::test]
    async fn test_invalid_cluster_network_stops_before_render() {
        let regional = FakeStore::new();
        let mut cluster = fake::cluster("wc-1", "default");
        cluster["spec"]["clusterNetwork"]["pods"]["cidrBlocks"] = serde_json::json!(["100.96.0.0"]);
        cluster["spec"]["clusterNetwork"]["services"]["cidrBlocks"] = serde_json::json!(["bogus/13"]);
        regional.insert(ResourceKind::Cluster, cluster);
        let target = FakeStore::new();
        let renderer = MockManifestRenderer::new();

        let err = execute(&regional, &target, &renderer, &request(&[METADATA_TKG], false))
            .await
            .unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("Failed to read cluster network of default/wc-1"));
        assert!(message.contains("'bogus/13'"));
        assert!(target.applied().is_empty());
    }

    #[tokio::test]
    async fn test_directory_renderer() {
        let dir = std::env::temp_dir().join(format!("cuo-render-{}", std::process::id()));
        std::fs::create_dir_all(dir.join("metadata")).unwrap();
        std::fs::write(
            dir.join("metadata/tkg.yaml"),
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: ${CLUSTER_NAME}-metadata\n  namespace: ${NAMESPACE}\ndata:\n  ipFamily: ${IP_FAMILY}\n",
        )
        .unwrap();

        let renderer = DirectoryRenderer::new(&dir);
        let spec = addon::lookup(METADATA_TKG).unwrap();
        let context = RenderContext {
            cluster_name: "wc-1".to_string(),
            namespace: "tkg-system-public".to_string(),
            is_management_cluster: false,
            edition: "tkg".to_string(),
            kubernetes_version: "v1.20.4+vmware.1".to_string(),
            network: NetworkConfig::default(),
            proxy: ProxyConfig::default(),
        };
        let rendered = String::from_utf8(renderer.render(spec, &context).await.unwrap()).unwrap();
        assert!(rendered.contains("name: wc-1-metadata"));
        assert!(rendered.contains("namespace: tkg-system-public"));
        assert!(rendered.contains("ipFamily: ipv4"));

        let missing = addon::lookup(KAPP_CONTROLLER).unwrap();
        assert!(renderer.render(missing, &context).await.is_err());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_manifest_path_override() {
        let catalog = VersionCatalog::from_yaml(
            "addons:\n  tkr/tkr-controller:\n    version: v0.1.0\n    path: tkr/controller-v0.1.0.yaml\n",
        )
        .unwrap();
        let renderer = DirectoryRenderer::new("/m").with_catalog(&catalog);
        assert_eq!(
            renderer.manifest_path(addon::lookup(TKR_CONTROLLER).unwrap()),
            PathBuf::from("/m/tkr/controller-v0.1.0.yaml")
        );
        assert_eq!(
            renderer.manifest_path(addon::lookup(KAPP_CONTROLLER).unwrap()),
            PathBuf::from("/m/addons-management/kapp-controller.yaml")
        );
    }
}
