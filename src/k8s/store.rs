//! Remote object store seam.
//!
//! The orchestrator only needs a handful of verbs against the management
//! and workload clusters. `KubeStore` implements them over `DynamicObject`
//! so no Cluster API types have to be compiled in.

use anyhow::{Context, Result};
use async_trait::async_trait;
use kube::Client;
use kube::api::{Api, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::kinds::{ResourceKind, api_resource_for};
use crate::error::CuoError;

/// Field manager used for server-side apply of rendered manifests.
pub const FIELD_MANAGER: &str = "cuo";

/// Create/get/patch/list/apply primitives against one cluster.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object, returning `None` when it does not exist.
    async fn get(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>>;

    /// Create an object. The namespace is taken from the object's metadata.
    async fn create(&self, kind: ResourceKind, object: &DynamicObject) -> Result<()>;

    /// Apply a JSON merge patch.
    async fn patch(&self, kind: ResourceKind, namespace: &str, name: &str, patch: &Value)
    -> Result<()>;

    /// List objects, optionally scoped to a namespace and a label selector.
    async fn list(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>>;

    /// Server-side apply every document of a multi-document YAML manifest.
    async fn apply(&self, manifest: &[u8]) -> Result<()>;
}

/// `ObjectStore` backed by a live Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub const fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, kind: ResourceKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = kind.api_resource();
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        debug!("Getting {} {}/{}", kind, namespace, name);
        let obj = self
            .api(kind, Some(namespace))
            .get_opt(name)
            .await
            .map_err(|e| {
                CuoError::KubernetesApi(format!("Failed to get {kind} {namespace}/{name}: {e}"))
            })?;
        Ok(obj)
    }

    async fn create(&self, kind: ResourceKind, object: &DynamicObject) -> Result<()> {
        let namespace = object.metadata.namespace.as_deref().unwrap_or("default");
        let name = object.metadata.name.as_deref().unwrap_or_default();
        debug!("Creating {} {}/{}", kind, namespace, name);
        self.api(kind, Some(namespace))
            .create(&PostParams::default(), object)
            .await
            .map_err(|e| {
                CuoError::KubernetesApi(format!("Failed to create {kind} {namespace}/{name}: {e}"))
            })?;
        Ok(())
    }

    async fn patch(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<()> {
        debug!("Patching {} {}/{}: {}", kind, namespace, name, patch);
        self.api(kind, Some(namespace))
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| {
                CuoError::KubernetesApi(format!("Failed to patch {kind} {namespace}/{name}: {e}"))
            })?;
        Ok(())
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>> {
        let mut params = ListParams::default();
        if let Some(selector) = selector {
            params = params.labels(selector);
        }
        let list = self
            .api(kind, namespace)
            .list(&params)
            .await
            .map_err(|e| CuoError::KubernetesApi(format!("Failed to list {kind}: {e}")))?;
        debug!("Listed {} {} objects", list.items.len(), kind);
        Ok(list.items)
    }

    async fn apply(&self, manifest: &[u8]) -> Result<()> {
        for doc in parse_manifest(manifest)? {
            let api_version = doc["apiVersion"].as_str().unwrap_or_default().to_string();
            let kind = doc["kind"].as_str().unwrap_or_default().to_string();
            let name = doc["metadata"]["name"]
                .as_str()
                .unwrap_or_default()
                .to_string();
            let namespace = doc["metadata"]["namespace"].as_str().map(str::to_string);

            let ar = api_resource_for(&api_version, &kind);
            let api: Api<DynamicObject> = match namespace.as_deref() {
                Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
                None => Api::all_with(self.client.clone(), &ar),
            };
            let obj: DynamicObject = serde_json::from_value(doc)
                .with_context(|| format!("Invalid {kind} '{name}' in manifest"))?;

            api.patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&obj),
            )
            .await
            .map_err(|e| CuoError::KubernetesApi(format!("Failed to apply {kind} '{name}': {e}")))?;
            debug!("Applied {} '{}'", kind, name);
        }
        Ok(())
    }
}

/// Split a multi-document YAML manifest into JSON objects.
///
/// Empty documents are skipped. Every remaining document must carry
/// `apiVersion`, `kind` and `metadata.name`.
pub fn parse_manifest(manifest: &[u8]) -> Result<Vec<Value>> {
    let mut docs = Vec::new();
    for (index, de) in serde_yaml::Deserializer::from_slice(manifest).enumerate() {
        let yaml = serde_yaml::Value::deserialize(de)
            .with_context(|| format!("Failed to parse manifest document {index}"))?;
        if yaml.is_null() {
            continue;
        }
        let doc: Value = serde_json::to_value(yaml)
            .with_context(|| format!("Failed to convert manifest document {index}"))?;
        for field in ["apiVersion", "kind"] {
            if doc[field].as_str().is_none_or(str::is_empty) {
                anyhow::bail!("Manifest document {index} is missing '{field}'");
            }
        }
        if doc["metadata"]["name"].as_str().is_none_or(str::is_empty) {
            anyhow::bail!("Manifest document {index} is missing 'metadata.name'");
        }
        docs.push(doc);
    }
    Ok(docs)
}
