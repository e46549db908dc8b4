//! Kubernetes client builders for the management and workload clusters.
//!
//! The management cluster client comes from the ambient kubeconfig. A
//! workload cluster client is built from the `<cluster>-kubeconfig` Secret
//! that Cluster API keeps in the management cluster.

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Secret;
use kube::config::{KubeConfigOptions, Kubeconfig};
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use super::kinds::ResourceKind;
use super::store::ObjectStore;
use crate::error::CuoError;

/// Key holding the kubeconfig inside the Cluster API kubeconfig Secret.
pub const KUBECONFIG_SECRET_KEY: &str = "value";

/// Name of the Secret holding a cluster's admin kubeconfig.
pub fn kubeconfig_secret_name(cluster_name: &str) -> String {
    format!("{cluster_name}-kubeconfig")
}

/// Build a client for the management cluster.
///
/// Uses the named kubeconfig context when given, otherwise the default
/// inference chain (in-cluster config or current context).
pub async fn build_management_client(context: Option<&str>) -> Result<kube::Client> {
    let Some(context) = context else {
        return kube::Client::try_default()
            .await
            .context("Failed to build management cluster client");
    };

    let options = KubeConfigOptions {
        context: Some(context.to_string()),
        ..Default::default()
    };
    let config = kube::Config::from_kubeconfig(&options)
        .await
        .with_context(|| format!("Failed to load kubeconfig context '{context}'"))?;
    kube::Client::try_from(config).context("Failed to build management cluster client")
}

/// Read a workload cluster's kubeconfig from the management cluster.
pub async fn read_kubeconfig(
    store: &dyn ObjectStore,
    cluster_name: &str,
    namespace: &str,
) -> Result<SecretString> {
    let secret_name = kubeconfig_secret_name(cluster_name);
    let obj = store
        .get(ResourceKind::Secret, namespace, &secret_name)
        .await
        .with_context(|| format!("Failed to get Secret {namespace}/{secret_name}"))?
        .ok_or_else(|| CuoError::not_found("Secret", namespace, &secret_name))?;

    let secret: Secret = obj
        .try_parse()
        .with_context(|| format!("Secret {namespace}/{secret_name} is not a valid Secret"))?;

    let bytes = secret
        .data
        .and_then(|mut data| data.remove(KUBECONFIG_SECRET_KEY))
        .ok_or_else(|| {
            CuoError::KubernetesApi(format!(
                "Secret {namespace}/{secret_name} has no '{KUBECONFIG_SECRET_KEY}' key"
            ))
        })?;

    let kubeconfig = String::from_utf8(bytes.0)
        .with_context(|| format!("Secret {namespace}/{secret_name} is not valid UTF-8"))?;
    Ok(SecretString::from(kubeconfig))
}

/// Build a client for a workload cluster from its kubeconfig Secret.
pub async fn build_workload_client(
    store: &dyn ObjectStore,
    cluster_name: &str,
    namespace: &str,
) -> Result<kube::Client> {
    let kubeconfig = read_kubeconfig(store, cluster_name, namespace).await?;
    let parsed = Kubeconfig::from_yaml(kubeconfig.expose_secret())
        .with_context(|| format!("Failed to parse kubeconfig of cluster {cluster_name}"))?;
    let config = kube::Config::from_custom_kubeconfig(parsed, &KubeConfigOptions::default())
        .await
        .with_context(|| format!("Failed to load kubeconfig of cluster {cluster_name}"))?;
    debug!("Loaded kubeconfig for workload cluster {}", cluster_name);

    kube::Client::try_from(config)
        .with_context(|| format!("Failed to build client for cluster {cluster_name}"))
}
