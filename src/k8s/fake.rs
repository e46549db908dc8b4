//! In-memory `ObjectStore` used by unit tests.
//!
//! Records every call in order, applies merge patches to stored objects,
//! and simulates the Cluster API controllers rolling machines forward after
//! a control plane or machine deployment is patched.

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::{Result, bail};
use async_trait::async_trait;
use kube::api::DynamicObject;
use serde_json::{Value, json};

use super::kinds::ResourceKind;
use super::store::{ObjectStore, parse_manifest};

pub use crate::capi::topology::{CLUSTER_NAME_LABEL, CONTROL_PLANE_LABEL, DEPLOYMENT_NAME_LABEL};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Get,
    Create,
    Patch,
    List,
    Apply,
}

/// One recorded store call.
#[derive(Debug, Clone)]
pub struct Call {
    pub op: Op,
    pub kind: Option<ResourceKind>,
    pub namespace: String,
    /// Object name, label selector for lists, or the applied document names.
    pub target: String,
    pub body: Option<Value>,
}

type Key = (ResourceKind, String, String);

struct PendingRollout {
    kind: ResourceKind,
    namespace: String,
    name: String,
    version: String,
    polls_left: usize,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Value>,
    calls: Vec<Call>,
    failures: Vec<(Op, Option<ResourceKind>)>,
    pending: Vec<PendingRollout>,
    applied: Vec<Value>,
}

/// Test double for a cluster's object store.
pub struct FakeStore {
    state: Mutex<State>,
    /// Machine list polls before a patched group converges. `None` never converges.
    converge_after: Option<usize>,
}

impl Default for FakeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            converge_after: Some(1),
        }
    }

    /// Store whose simulated controllers never finish a rollout.
    pub fn never_converging() -> Self {
        Self {
            converge_after: None,
            ..Self::new()
        }
    }

    /// Store whose rollouts need `polls` machine list calls to finish.
    pub fn converging_after(polls: usize) -> Self {
        Self {
            converge_after: Some(polls),
            ..Self::new()
        }
    }

    pub fn insert(&self, kind: ResourceKind, object: Value) {
        let namespace = object["metadata"]["namespace"]
            .as_str()
            .unwrap_or("default")
            .to_string();
        let name = object["metadata"]["name"]
            .as_str()
            .expect("fixture has metadata.name")
            .to_string();
        self.state
            .lock()
            .unwrap()
            .objects
            .insert((kind, namespace, name), object);
    }

    pub fn object(&self, kind: ResourceKind, namespace: &str, name: &str) -> Option<Value> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn objects(&self, kind: ResourceKind) -> Vec<Value> {
        self.state
            .lock()
            .unwrap()
            .objects
            .iter()
            .filter(|((k, _, _), _)| *k == kind)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Make every subsequent `op` against `kind` fail. `None` matches any kind.
    pub fn fail_on(&self, op: Op, kind: Option<ResourceKind>) {
        self.state.lock().unwrap().failures.push((op, kind));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn count(&self, op: Op, kind: ResourceKind) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.op == op && c.kind == Some(kind))
            .count()
    }

    /// Documents received through `apply`, in order.
    pub fn applied(&self) -> Vec<Value> {
        self.state.lock().unwrap().applied.clone()
    }

    fn record(&self, op: Op, kind: Option<ResourceKind>, namespace: &str, target: &str, body: Option<Value>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call {
            op,
            kind,
            namespace: namespace.to_string(),
            target: target.to_string(),
            body,
        });
        let failing = state
            .failures
            .iter()
            .any(|(o, k)| *o == op && (k.is_none() || *k == kind));
        if failing {
            bail!("injected {op:?} failure");
        }
        Ok(())
    }

    /// Advance simulated rollouts by one machine poll.
    fn tick(&self) {
        let mut state = self.state.lock().unwrap();
        let mut finished = Vec::new();
        for rollout in &mut state.pending {
            rollout.polls_left = rollout.polls_left.saturating_sub(1);
            if rollout.polls_left == 0 {
                finished.push((
                    rollout.kind,
                    rollout.namespace.clone(),
                    rollout.name.clone(),
                    rollout.version.clone(),
                ));
            }
        }
        state.pending.retain(|r| r.polls_left > 0);

        for (kind, namespace, name, version) in finished {
            let key = (kind, namespace.clone(), name.clone());
            let Some(group) = state.objects.get_mut(&key) else {
                continue;
            };
            let replicas = group["spec"]["replicas"].as_i64().unwrap_or(1);
            group["status"] = json!({
                "replicas": replicas,
                "updatedReplicas": replicas,
                "readyReplicas": replicas,
            });
            let cluster = group["metadata"]["labels"][CLUSTER_NAME_LABEL]
                .as_str()
                .unwrap_or_default()
                .to_string();

            for ((k, ns, _), machine) in &mut state.objects {
                if *k != ResourceKind::Machine || *ns != namespace {
                    continue;
                }
                let labels = &machine["metadata"]["labels"];
                let owned = match kind {
                    ResourceKind::KubeadmControlPlane => {
                        labels[CLUSTER_NAME_LABEL] == cluster.as_str()
                            && labels.get(CONTROL_PLANE_LABEL).is_some()
                    }
                    _ => labels[DEPLOYMENT_NAME_LABEL] == name.as_str(),
                };
                if owned {
                    machine["spec"]["version"] = json!(version);
                }
            }
        }
    }
}

/// RFC 7386 JSON merge patch.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    if let Value::Object(patch_map) = patch {
        if !target.is_object() {
            *target = json!({});
        }
        if let Value::Object(target_map) = target {
            for (key, value) in patch_map {
                if value.is_null() {
                    target_map.remove(key);
                } else {
                    merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
                }
            }
        }
    } else {
        *target = patch.clone();
    }
}

fn matches_selector(labels: &Value, selector: &str) -> bool {
    selector.split(',').filter(|t| !t.is_empty()).all(|term| {
        term.split_once('=').map_or_else(
            || labels.get(term).is_some(),
            |(key, value)| labels[key] == value,
        )
    })
}

fn to_dynamic(value: &Value) -> Result<DynamicObject> {
    Ok(serde_json::from_value(value.clone())?)
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn get(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        self.record(Op::Get, Some(kind), namespace, name, None)?;
        self.object(kind, namespace, name)
            .as_ref()
            .map(to_dynamic)
            .transpose()
    }

    async fn create(&self, kind: ResourceKind, object: &DynamicObject) -> Result<()> {
        let namespace = object.metadata.namespace.clone().unwrap_or_default();
        let name = object.metadata.name.clone().unwrap_or_default();
        let mut value = serde_json::to_value(object)?;
        value["apiVersion"] = json!(kind.api_version());
        value["kind"] = json!(kind.kind());
        self.record(Op::Create, Some(kind), &namespace, &name, Some(value.clone()))?;
        if self.object(kind, &namespace, &name).is_some() {
            bail!("{kind} {namespace}/{name} already exists");
        }
        self.insert(kind, value);
        Ok(())
    }

    async fn patch(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<()> {
        self.record(Op::Patch, Some(kind), namespace, name, Some(patch.clone()))?;
        let mut state = self.state.lock().unwrap();
        let key = (kind, namespace.to_string(), name.to_string());
        let Some(object) = state.objects.get_mut(&key) else {
            bail!("{kind} {namespace}/{name} not found");
        };
        merge_patch(object, patch);

        let version = match kind {
            ResourceKind::KubeadmControlPlane => patch["spec"]["version"].as_str(),
            ResourceKind::MachineDeployment => patch["spec"]["template"]["spec"]["version"].as_str(),
            _ => None,
        };
        if let (Some(version), Some(polls)) = (version, self.converge_after) {
            state.pending.retain(|r| !(r.kind == kind && r.namespace == namespace && r.name == name));
            state.pending.push(PendingRollout {
                kind,
                namespace: namespace.to_string(),
                name: name.to_string(),
                version: version.to_string(),
                polls_left: polls,
            });
        }
        Ok(())
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>> {
        self.record(
            Op::List,
            Some(kind),
            namespace.unwrap_or_default(),
            selector.unwrap_or_default(),
            None,
        )?;
        if kind == ResourceKind::Machine {
            self.tick();
        }
        let state = self.state.lock().unwrap();
        state
            .objects
            .iter()
            .filter(|((k, ns, _), v)| {
                *k == kind
                    && namespace.is_none_or(|n| ns.as_str() == n)
                    && selector.is_none_or(|s| matches_selector(&v["metadata"]["labels"], s))
            })
            .map(|(_, v)| to_dynamic(v))
            .collect()
    }

    async fn apply(&self, manifest: &[u8]) -> Result<()> {
        let docs = parse_manifest(manifest)?;
        let names: Vec<&str> = docs
            .iter()
            .filter_map(|d| d["metadata"]["name"].as_str())
            .collect();
        self.record(Op::Apply, None, "", &names.join(","), None)?;
        self.state.lock().unwrap().applied.extend(docs);
        Ok(())
    }
}

// Fixture builders for Cluster API objects.

pub fn cluster(name: &str, namespace: &str) -> Value {
    json!({
        "apiVersion": "cluster.x-k8s.io/v1beta1",
        "kind": "Cluster",
        "metadata": { "name": name, "namespace": namespace, "labels": {} },
        "spec": {
            "clusterNetwork": {
                "pods": { "cidrBlocks": ["100.96.0.0/11"] },
                "services": { "cidrBlocks": ["100.64.0.0/13"] }
            }
        }
    })
}

pub fn control_plane(
    cluster: &str,
    namespace: &str,
    version: &str,
    template_kind: &str,
    template_name: &str,
) -> Value {
    json!({
        "apiVersion": "controlplane.cluster.x-k8s.io/v1beta1",
        "kind": "KubeadmControlPlane",
        "metadata": {
            "name": format!("{cluster}-control-plane"),
            "namespace": namespace,
            "labels": { CLUSTER_NAME_LABEL: cluster }
        },
        "spec": {
            "replicas": 1,
            "version": version,
            "machineTemplate": {
                "infrastructureRef": {
                    "apiVersion": "infrastructure.cluster.x-k8s.io/v1beta1",
                    "kind": template_kind,
                    "name": template_name,
                    "namespace": namespace
                }
            }
        },
        "status": { "replicas": 1, "updatedReplicas": 1, "readyReplicas": 1 }
    })
}

pub fn machine_deployment(
    cluster: &str,
    namespace: &str,
    name: &str,
    version: &str,
    template_kind: &str,
    template_name: &str,
) -> Value {
    json!({
        "apiVersion": "cluster.x-k8s.io/v1beta1",
        "kind": "MachineDeployment",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "labels": { CLUSTER_NAME_LABEL: cluster }
        },
        "spec": {
            "clusterName": cluster,
            "replicas": 2,
            "template": {
                "spec": {
                    "version": version,
                    "infrastructureRef": {
                        "apiVersion": "infrastructure.cluster.x-k8s.io/v1beta1",
                        "kind": template_kind,
                        "name": template_name,
                        "namespace": namespace
                    }
                }
            }
        },
        "status": { "replicas": 2, "updatedReplicas": 2, "readyReplicas": 2 }
    })
}

pub fn control_plane_machine(cluster: &str, namespace: &str, name: &str, version: &str) -> Value {
    json!({
        "apiVersion": "cluster.x-k8s.io/v1beta1",
        "kind": "Machine",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "labels": { CLUSTER_NAME_LABEL: cluster, CONTROL_PLANE_LABEL: "" }
        },
        "spec": { "clusterName": cluster, "version": version }
    })
}

pub fn worker_machine(
    cluster: &str,
    namespace: &str,
    deployment: &str,
    name: &str,
    version: &str,
) -> Value {
    json!({
        "apiVersion": "cluster.x-k8s.io/v1beta1",
        "kind": "Machine",
        "metadata": {
            "name": name,
            "namespace": namespace,
            "labels": { CLUSTER_NAME_LABEL: cluster, DEPLOYMENT_NAME_LABEL: deployment }
        },
        "spec": { "clusterName": cluster, "version": version }
    })
}

pub fn template(kind: &str, namespace: &str, name: &str, spec: Value) -> Value {
    json!({
        "apiVersion": "infrastructure.cluster.x-k8s.io/v1beta1",
        "kind": kind,
        "metadata": { "name": name, "namespace": namespace },
        "spec": { "template": { "spec": spec } }
    })
}

/// A single-container Deployment; `available` makes the status report every replica available.
pub fn deployment(namespace: &str, name: &str, image: &str, available: bool) -> Value {
    let ready = i64::from(available);
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": { "name": name, "namespace": namespace, "generation": 1 },
        "spec": {
            "replicas": 1,
            "template": { "spec": { "containers": [{ "name": name, "image": image }] } }
        },
        "status": {
            "observedGeneration": 1,
            "replicas": 1,
            "updatedReplicas": ready,
            "availableReplicas": ready
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_patch() {
        let mut target = json!({"a": {"b": 1, "c": 2}, "d": 3});
        merge_patch(&mut target, &json!({"a": {"b": 5, "c": null}, "e": [1]}));
        assert_eq!(target, json!({"a": {"b": 5}, "d": 3, "e": [1]}));
    }

    #[test]
    fn test_matches_selector() {
        let labels = json!({"cluster.x-k8s.io/cluster-name": "c1", "cluster.x-k8s.io/control-plane": ""});
        assert!(matches_selector(&labels, "cluster.x-k8s.io/cluster-name=c1,cluster.x-k8s.io/control-plane"));
        assert!(!matches_selector(&labels, "cluster.x-k8s.io/cluster-name=c2"));
        assert!(!matches_selector(&labels, "cluster.x-k8s.io/deployment-name"));
    }

    #[tokio::test]
    async fn test_patch_triggers_simulated_rollout() {
        let store = FakeStore::new();
        store.insert(
            ResourceKind::KubeadmControlPlane,
            control_plane("c1", "default", "v1.19.1", "AWSMachineTemplate", "t"),
        );
        store.insert(
            ResourceKind::Machine,
            control_plane_machine("c1", "default", "m1", "v1.19.1"),
        );
        store
            .patch(
                ResourceKind::KubeadmControlPlane,
                "default",
                "c1-control-plane",
                &json!({"spec": {"version": "v1.20.4"}}),
            )
            .await
            .unwrap();
        store
            .list(ResourceKind::Machine, Some("default"), Some(CONTROL_PLANE_LABEL))
            .await
            .unwrap();
        let machine = store.object(ResourceKind::Machine, "default", "m1").unwrap();
        assert_eq!(machine["spec"]["version"], "v1.20.4");
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let store = FakeStore::new();
        store.fail_on(Op::Get, Some(ResourceKind::Cluster));
        assert!(store.get(ResourceKind::Cluster, "ns", "c").await.is_err());
        assert!(store.get(ResourceKind::Machine, "ns", "c").await.unwrap().is_none());
    }
}
