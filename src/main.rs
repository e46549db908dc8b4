//! cuo - Cluster Upgrade Orchestrator for Cluster API managed clusters.
//!
//! Reads an upgrade request file and drives one of three operations against
//! a management cluster: a full cluster upgrade (version gate, templates,
//! control plane and worker rollouts, providers, addons), an addon-only
//! upgrade, or a provider-only upgrade.

mod capi;
mod catalog;
mod config;
mod error;
mod infra;
mod k8s;
mod network;
mod orchestrator;
mod phases;
mod request;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tracing::{error, info, warn};

use capi::provider::ClusterctlProviderClient;
use catalog::VersionCatalog;
use config::{Args, Command};
use error::CuoError;
use infra::CatalogTemplateVerifier;
use k8s::{KubeStore, ObjectStore};
use orchestrator::Orchestrator;
use phases::addons::DirectoryRenderer;
use request::RequestFile;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const COMMIT: &str = env!("BUILD_COMMIT");
pub const BUILD_DATE: &str = env!("BUILD_DATE");

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    if let Err(e) = init_tracing() {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    info!(
        "Starting cuo v{} (commit: {}, build: {})",
        VERSION, COMMIT, BUILD_DATE
    );

    let started = Utc::now();
    if let Err(e) = run(&args).await {
        error!("Upgrade {} failed: {:#}", args.command.name(), e);
        if e.downcast_ref::<CuoError>().is_some_and(CuoError::is_resumable) {
            warn!("Re-running the same request resumes from the failed stage");
        }
        std::process::exit(1);
    }
    info!(
        "Upgrade {} completed in {}s",
        args.command.name(),
        (Utc::now() - started).num_seconds()
    );
}

/// Initialize tracing subscriber with JSON format for production.
fn init_tracing() -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| anyhow::anyhow!("Failed to initialize log filter: {e}"))?;

    fmt()
        .with_env_filter(filter)
        .json()
        .with_target(true)
        .init();

    Ok(())
}

/// Load the request and dispatch the selected operation.
async fn run(args: &Args) -> Result<()> {
    let file = RequestFile::load(args.command.request_path())?;
    let catalog = VersionCatalog::load(&file.catalog_path)?;
    let manifest_dir = args.manifest_dir.as_deref().unwrap_or(&file.manifest_dir);

    match &args.command {
        Command::Cluster { .. } => {
            let request = file
                .upgrade
                .as_ref()
                .context("Request file has no 'upgrade' section")?;
            let orchestrator = connect(
                request.context.as_deref(),
                &request.cluster_name,
                &request.namespace,
                request.is_regional_cluster,
                catalog,
                manifest_dir,
            )
            .await?;
            orchestrator.upgrade_cluster(request).await
        }
        Command::Addons { .. } => {
            let request = file
                .addons
                .as_ref()
                .context("Request file has no 'addons' section")?;
            let context = file.upgrade.as_ref().and_then(|u| u.context.as_deref());
            let orchestrator = connect(
                context,
                &request.cluster_name,
                &request.namespace,
                request.is_regional_cluster,
                catalog,
                manifest_dir,
            )
            .await?;
            orchestrator.upgrade_addons(request).await
        }
        Command::Providers { .. } => {
            let request = file
                .upgrade
                .as_ref()
                .context("Request file has no 'upgrade' section")?;
            let orchestrator = connect(
                request.context.as_deref(),
                &request.cluster_name,
                &request.namespace,
                true,
                catalog,
                manifest_dir,
            )
            .await?;
            let plan = orchestrator.upgrade_providers(request).await?;
            info!("Applied provider plan: {}", plan);
            Ok(())
        }
    }
}

/// Build the management and target stores and wire the orchestrator.
async fn connect(
    context: Option<&str>,
    cluster_name: &str,
    namespace: &str,
    is_regional: bool,
    catalog: VersionCatalog,
    manifest_dir: &Path,
) -> Result<Orchestrator> {
    let client = k8s::build_management_client(context).await?;
    info!("Connected to management cluster");
    let regional: Arc<dyn ObjectStore> = Arc::new(KubeStore::new(client));

    let target: Arc<dyn ObjectStore> = if is_regional {
        Arc::clone(&regional)
    } else {
        let client = k8s::build_workload_client(regional.as_ref(), cluster_name, namespace).await?;
        info!("Connected to workload cluster {}", cluster_name);
        Arc::new(KubeStore::new(client))
    };

    let renderer = DirectoryRenderer::new(manifest_dir).with_catalog(&catalog);
    Ok(Orchestrator {
        regional,
        target,
        catalog,
        renderer: Arc::new(renderer),
        providers: Arc::new(ClusterctlProviderClient::default()),
        verifier: Arc::new(CatalogTemplateVerifier),
    })
}
