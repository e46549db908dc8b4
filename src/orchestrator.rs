//! Top-level upgrade sequencing.
//!
//! `upgrade_cluster` runs the stages in a fixed order and stops at the first
//! failure. Errors are wrapped with the cluster name and the failing stage.
//! Nothing is rolled back: re-running the same request resumes, because
//! template names are deterministic and node group patches are idempotent.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::capi::addon;
use crate::capi::provider::{ProviderUpgradeClient, UpgradePlan};
use crate::capi::topology;
use crate::catalog::VersionCatalog;
use crate::infra::VmTemplateVerifier;
use crate::k8s::ObjectStore;
use crate::phases::addons::ManifestRenderer;
use crate::phases::{
    UpgradeStage, addons, autoscaler, control_plane, nodegroups, preflight, providers, readiness,
    templates,
};
use crate::request::{AddonUpgradeRequest, UpgradeRequest};

/// Collaborators of one upgrade invocation.
pub struct Orchestrator {
    /// Management cluster holding the Cluster API objects.
    pub regional: Arc<dyn ObjectStore>,
    /// Cluster being upgraded; the same store as `regional` for a management cluster.
    pub target: Arc<dyn ObjectStore>,
    pub catalog: VersionCatalog,
    pub renderer: Arc<dyn ManifestRenderer>,
    pub providers: Arc<dyn ProviderUpgradeClient>,
    pub verifier: Arc<dyn VmTemplateVerifier>,
}

fn stage_context(cluster: &str, stage: UpgradeStage) -> String {
    format!("Failed to upgrade cluster '{cluster}' at stage {stage}")
}

impl Orchestrator {
    /// Upgrade a cluster's Kubernetes version, templates, providers and addons.
    pub async fn upgrade_cluster(&self, request: &UpgradeRequest) -> Result<()> {
        let cluster = request.cluster_name.as_str();
        let namespace = request.namespace.as_str();
        let regional = self.regional.as_ref();
        let version = request.kubernetes_version.as_str();

        let topology = topology::read_topology(regional, cluster, namespace)
            .await
            .with_context(|| stage_context(cluster, UpgradeStage::Preflight))?;
        let decision = preflight::check_version(&topology, version)
            .with_context(|| stage_context(cluster, UpgradeStage::Preflight))?;
        preflight::label_release(regional, cluster, namespace, &request.tkr_version)
            .await
            .with_context(|| stage_context(cluster, UpgradeStage::Preflight))?;
        info!("Version check for cluster {}: {}", cluster, decision);

        if !request.skip_addon_upgrade {
            let pre = AddonUpgradeRequest::for_cluster(
                request,
                addon::pre_node_addons(request.is_regional_cluster),
            );
            self.dispatch_addons(&pre)
                .await
                .with_context(|| stage_context(cluster, UpgradeStage::PreNodeAddons))?;
        }

        let plan = templates::execute(
            regional,
            self.verifier.as_ref(),
            &self.catalog,
            request,
            &topology,
        )
        .await
        .with_context(|| stage_context(cluster, UpgradeStage::Templates))?;

        control_plane::execute(
            regional,
            &topology,
            &plan,
            version,
            request.timeouts.control_plane_wait(),
        )
        .await
        .with_context(|| stage_context(cluster, UpgradeStage::ControlPlane))?;

        nodegroups::execute(regional, &topology, &plan, version, request.timeouts.worker_wait())
            .await
            .with_context(|| stage_context(cluster, UpgradeStage::Workers))?;

        templates::annotate_os_info(regional, cluster, namespace, &plan.os_info)
            .await
            .with_context(|| stage_context(cluster, UpgradeStage::Templates))?;

        if request.is_regional_cluster {
            self.run_providers(request)
                .await
                .with_context(|| stage_context(cluster, UpgradeStage::Providers))?;
        }

        if !request.skip_addon_upgrade {
            let post = AddonUpgradeRequest::for_cluster(
                request,
                addon::post_node_addons(&request.edition, &request.addon_names),
            );
            self.dispatch_addons(&post)
                .await
                .with_context(|| stage_context(cluster, UpgradeStage::PostNodeAddons))?;
        }

        if request.is_regional_cluster {
            readiness::wait_for_management_components(regional, request.timeouts.deployment_wait())
                .await
                .with_context(|| stage_context(cluster, UpgradeStage::AddonReadiness))?;
        } else {
            autoscaler::execute(
                regional,
                &self.catalog,
                cluster,
                namespace,
                version,
                request.timeouts.deployment_wait(),
            )
            .await
            .with_context(|| stage_context(cluster, UpgradeStage::Autoscaler))?;
        }

        info!("Cluster {} upgraded to {}", cluster, version);
        Ok(())
    }

    /// Upgrade the addons named in `request`.
    ///
    /// A request without a Kubernetes version renders with the catalog default.
    pub async fn upgrade_addons(&self, request: &AddonUpgradeRequest) -> Result<()> {
        let mut request = request.clone();
        if request.kubernetes_version.is_empty() {
            debug!(
                "No Kubernetes version in addon request, using catalog default {}",
                self.catalog.kubernetes_version
            );
            request.kubernetes_version.clone_from(&self.catalog.kubernetes_version);
        }
        self.dispatch_addons(&request)
            .await
            .with_context(|| stage_context(&request.cluster_name, UpgradeStage::Addons))
    }

    /// Upgrade the management cluster's providers to the catalog versions.
    pub async fn upgrade_providers(&self, request: &UpgradeRequest) -> Result<UpgradePlan> {
        self.run_providers(request)
            .await
            .with_context(|| stage_context(&request.cluster_name, UpgradeStage::Providers))
    }

    async fn dispatch_addons(&self, request: &AddonUpgradeRequest) -> Result<()> {
        addons::execute(
            self.regional.as_ref(),
            self.target.as_ref(),
            self.renderer.as_ref(),
            request,
        )
        .await
    }

    async fn run_providers(&self, request: &UpgradeRequest) -> Result<UpgradePlan> {
        providers::execute(
            self.regional.as_ref(),
            self.providers.as_ref(),
            &self.catalog,
            request.context.as_deref().unwrap_or_default(),
        )
        .await
    }
}
