//! Provider upgrade stage.

use anyhow::{Context, Result};
use tracing::info;

use crate::capi::provider::{self, ProviderUpgradeClient, UpgradePlan};
use crate::catalog::VersionCatalog;
use crate::k8s::ObjectStore;

/// Plan provider upgrades against the catalog and apply the plan once.
///
/// The plan is applied even when no provider changes version.
pub async fn execute(
    regional: &dyn ObjectStore,
    client: &dyn ProviderUpgradeClient,
    catalog: &VersionCatalog,
    context: &str,
) -> Result<UpgradePlan> {
    let installed = provider::list_installed(regional).await?;
    let plan = provider::plan(&installed, catalog)?;
    if plan.has_upgrades(&installed) {
        info!("Upgrading providers: {}", plan);
    } else {
        info!("Providers are up to date, re-applying: {}", plan);
    }

    client
        .apply_upgrade(context, &plan)
        .await
        .context("Failed to apply provider upgrade")?;
    Ok(plan)
}
