// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock cluster for testing.
//!
//! Holds objects in memory and simulates the controllers the engine waits on:
//! claims bind to a volume immediately, volume expansion lands after a few
//! reads, deployments create and terminate pods, and jobs finish after a few
//! status reads. Every call is recorded so tests can assert ordering.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::ApiResource;
use serde_json::{Value, json};
use tokio::sync::Mutex;

use super::{ClusterApi, ClusterError, ClusterResource, Result, merge_patch};

/// Final state a mock job reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// `status.succeeded = 1`.
    Succeed,
    /// `status.failed = 1`.
    Fail,
    /// The job object vanishes.
    Disappear,
    /// The job never finishes.
    Hang,
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterCall {
    /// Verb (`get`, `create`, `replace`, `patch`, `delete`, `list`, `ensure_namespace`, `logs`).
    pub verb: &'static str,
    /// Resource kind.
    pub kind: String,
    /// Namespace (empty for cluster-scoped).
    pub namespace: String,
    /// Object name (empty for list).
    pub name: String,
}

impl ClusterCall {
    /// Whether the call changes cluster state.
    pub fn is_mutation(&self) -> bool {
        !matches!(self.verb, "get" | "list" | "logs")
    }
}

type ObjectKey = (String, String, String);

#[derive(Default)]
pub(crate) struct MockState {
    objects: HashMap<ObjectKey, Value>,
    namespaces: BTreeSet<String>,
    calls: Vec<ClusterCall>,
    resource_version: u64,
    /// PV name -> (target capacity, reads left)
    pending_resizes: HashMap<String, (String, u32)>,
    /// Pod key -> pod lists left before it is gone
    terminating_pods: HashMap<ObjectKey, u32>,
    /// Job key -> status reads left before it finishes
    running_jobs: HashMap<ObjectKey, u32>,
    /// (verb, kind) failing once
    injected_failures: Vec<(&'static str, String)>,
    logs: HashMap<(String, String), String>,
}

/// Mock cluster for testing.
pub struct MockCluster {
    pub(crate) state: Arc<Mutex<MockState>>,
    /// Persistent volume reads before an expansion is reported
    pub resize_lag: u32,
    /// If true, expansions are never reported
    pub stuck_resizes: bool,
    /// Pod lists before a terminating pod disappears
    pub pod_termination_lag: u32,
    /// Job reads before a job reaches its outcome
    pub job_lag: u32,
    /// Outcome of every job
    pub job_outcome: JobOutcome,
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCluster {
    /// Create a new mock cluster.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            resize_lag: 1,
            stuck_resizes: false,
            pod_termination_lag: 1,
            job_lag: 1,
            job_outcome: JobOutcome::Succeed,
        }
    }

    /// Create a mock cluster whose jobs end with `outcome`.
    pub fn with_job_outcome(outcome: JobOutcome) -> Self {
        Self {
            job_outcome: outcome,
            ..Self::new()
        }
    }

    /// Store an object as if it already existed.
    pub async fn seed<K: ClusterResource>(&self, namespace: &str, object: &K) {
        let resource = ApiResource::erase::<K>(&());
        let mut value = serde_json::to_value(object).unwrap_or_default();
        let name = object_name(&value);
        let mut state = self.state.lock().await;
        state.resource_version += 1;
        set_resource_version(&mut value, state.resource_version);
        if resource.kind == "PersistentVolumeClaim" {
            bind_claim(&mut state, namespace, &name, &mut value);
        }
        state
            .objects
            .insert((resource.kind.clone(), namespace.to_string(), name), value);
    }

    /// Raw stored object.
    pub async fn object(&self, kind: &str, namespace: &str, name: &str) -> Option<Value> {
        let state = self.state.lock().await;
        state
            .objects
            .get(&(kind.to_string(), namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Names of all stored objects of a kind in a namespace, sorted.
    pub async fn names(&self, kind: &str, namespace: &str) -> Vec<String> {
        let state = self.state.lock().await;
        let mut names: Vec<String> = state
            .objects
            .keys()
            .filter(|(k, ns, _)| k == kind && ns == namespace)
            .map(|(_, _, name)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// All recorded calls.
    pub async fn calls(&self) -> Vec<ClusterCall> {
        self.state.lock().await.calls.clone()
    }

    /// Recorded calls that change cluster state.
    pub async fn mutations(&self) -> Vec<ClusterCall> {
        self.calls()
            .await
            .into_iter()
            .filter(ClusterCall::is_mutation)
            .collect()
    }

    /// Forget recorded calls.
    pub async fn clear_calls(&self) {
        self.state.lock().await.calls.clear();
    }

    /// Make the next `verb` on `kind` fail with a server error.
    pub async fn fail_next(&self, verb: &'static str, kind: &str) {
        self.state
            .lock()
            .await
            .injected_failures
            .push((verb, kind.to_string()));
    }

    /// Whether the namespace was ensured.
    pub async fn has_namespace(&self, namespace: &str) -> bool {
        self.state.lock().await.namespaces.contains(namespace)
    }

    /// Set the log returned for a pod.
    pub async fn set_pod_log(&self, namespace: &str, pod: &str, log: &str) {
        self.state
            .lock()
            .await
            .logs
            .insert((namespace.to_string(), pod.to_string()), log.to_string());
    }

    fn record(
        state: &mut MockState,
        verb: &'static str,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<()> {
        state.calls.push(ClusterCall {
            verb,
            kind: resource.kind.clone(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
        if let Some(index) = state
            .injected_failures
            .iter()
            .position(|(v, k)| *v == verb && *k == resource.kind)
        {
            state.injected_failures.remove(index);
            return Err(ClusterError::Api {
                verb,
                kind: resource.kind.clone(),
                name: name.to_string(),
                code: 500,
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    /// Side effects of a stored object changing.
    fn after_write(&self, state: &mut MockState, kind: &str, namespace: &str, name: &str, previous: Option<&Value>) {
        let key = (kind.to_string(), namespace.to_string(), name.to_string());
        match kind {
            "Deployment" => {
                sync_pods(state, namespace, name, self.pod_termination_lag);
                rollout_complete(state, &key);
            }
            "PersistentVolumeClaim" => {
                let Some(current) = state.objects.get(&key).cloned() else {
                    return;
                };
                let requested = requested_storage(&current);
                let before = previous.and_then(requested_storage);
                if requested.is_some() && requested != before && !self.stuck_resizes {
                    if let Some(pv) = current
                        .pointer("/spec/volumeName")
                        .and_then(Value::as_str)
                    {
                        state.pending_resizes.insert(
                            pv.to_string(),
                            (requested.unwrap_or_default(), self.resize_lag),
                        );
                    }
                }
            }
            "Job" => {
                if previous.is_none() {
                    state.running_jobs.insert(key, self.job_lag);
                }
            }
            _ => {}
        }
    }

    /// Side effects of reading an object.
    fn before_read(&self, state: &mut MockState, kind: &str, namespace: &str, name: &str) {
        match kind {
            "PersistentVolume" => {
                let Some((capacity, left)) = state.pending_resizes.get_mut(name) else {
                    return;
                };
                if *left > 0 {
                    *left -= 1;
                    return;
                }
                let capacity = capacity.clone();
                state.pending_resizes.remove(name);
                let pv_key = (kind.to_string(), String::new(), name.to_string());
                if let Some(pv) = state.objects.get_mut(&pv_key) {
                    merge_patch(pv, &json!({"spec": {"capacity": {"storage": capacity.clone()}}}));
                }
                if let Some((claim_ns, claim_name)) = claim_of(state, name) {
                    let claim_key = ("PersistentVolumeClaim".to_string(), claim_ns, claim_name);
                    if let Some(claim) = state.objects.get_mut(&claim_key) {
                        merge_patch(claim, &json!({"status": {"capacity": {"storage": capacity}}}));
                    }
                }
            }
            "Job" => {
                let key = (kind.to_string(), namespace.to_string(), name.to_string());
                let Some(left) = state.running_jobs.get_mut(&key) else {
                    return;
                };
                if *left > 0 {
                    *left -= 1;
                    if self.job_outcome != JobOutcome::Hang {
                        return;
                    }
                }
                if self.job_outcome == JobOutcome::Hang {
                    if let Some(job) = state.objects.get_mut(&key) {
                        merge_patch(job, &json!({"status": {"active": 1}}));
                    }
                    return;
                }
                state.running_jobs.remove(&key);
                let status = match self.job_outcome {
                    JobOutcome::Succeed => json!({
                        "succeeded": 1,
                        "conditions": [{"type": "Complete", "status": "True"}]
                    }),
                    JobOutcome::Fail => json!({
                        "failed": 1,
                        "conditions": [{"type": "Failed", "status": "True", "message": "rsync exited with 23"}]
                    }),
                    JobOutcome::Disappear | JobOutcome::Hang => {
                        state.objects.remove(&key);
                        return;
                    }
                };
                if let Some(job) = state.objects.get_mut(&key) {
                    merge_patch(job, &json!({ "status": status }));
                }
            }
            _ => {}
        }
    }

    /// Side effects of listing a kind.
    fn before_list(state: &mut MockState, kind: &str, namespace: &str) {
        if kind != "Pod" {
            return;
        }
        let mut gone = Vec::new();
        for (key, left) in state.terminating_pods.iter_mut() {
            if key.1 != namespace {
                continue;
            }
            if *left == 0 {
                gone.push(key.clone());
            } else {
                *left -= 1;
            }
        }
        for key in gone {
            state.terminating_pods.remove(&key);
            state.objects.remove(&key);
        }
    }
}

fn object_name(value: &Value) -> String {
    value
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn set_resource_version(value: &mut Value, version: u64) {
    merge_patch(
        value,
        &json!({"metadata": {"resourceVersion": version.to_string()}}),
    );
}

fn requested_storage(claim: &Value) -> Option<String> {
    claim
        .pointer("/spec/resources/requests/storage")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn claim_of(state: &MockState, pv_name: &str) -> Option<(String, String)> {
    let pv = state.objects.get(&(
        "PersistentVolume".to_string(),
        String::new(),
        pv_name.to_string(),
    ))?;
    let namespace = pv.pointer("/spec/claimRef/namespace")?.as_str()?.to_string();
    let name = pv.pointer("/spec/claimRef/name")?.as_str()?.to_string();
    Some((namespace, name))
}

/// Bind a new claim to a freshly provisioned volume.
fn bind_claim(state: &mut MockState, namespace: &str, name: &str, claim: &mut Value) {
    let pv_name = format!("pv-{namespace}-{name}");
    let capacity = requested_storage(claim).unwrap_or_else(|| "1Gi".to_string());
    let storage_class = claim
        .pointer("/spec/storageClassName")
        .cloned()
        .unwrap_or(Value::Null);
    merge_patch(
        claim,
        &json!({
            "spec": {"volumeName": pv_name},
            "status": {"phase": "Bound", "capacity": {"storage": capacity}}
        }),
    );
    state.objects.insert(
        ("PersistentVolume".to_string(), String::new(), pv_name.clone()),
        json!({
            "apiVersion": "v1",
            "kind": "PersistentVolume",
            "metadata": {"name": pv_name},
            "spec": {
                "capacity": {"storage": capacity},
                "storageClassName": storage_class,
                "claimRef": {"namespace": namespace, "name": name}
            }
        }),
    );
}

/// Converge a deployment's pods to its replica count.
fn sync_pods(state: &mut MockState, namespace: &str, deployment: &str, termination_lag: u32) {
    let key = ("Deployment".to_string(), namespace.to_string(), deployment.to_string());
    let Some(object) = state.objects.get(&key) else {
        return;
    };
    let replicas = object
        .pointer("/spec/replicas")
        .and_then(Value::as_i64)
        .unwrap_or(1)
        .max(0) as usize;
    let labels = object
        .pointer("/spec/template/metadata/labels")
        .cloned()
        .unwrap_or_else(|| json!({}));

    let mut live: Vec<ObjectKey> = state
        .objects
        .iter()
        .filter(|((kind, ns, _), pod)| {
            kind == "Pod"
                && ns == namespace
                && pod.pointer("/metadata/labels/app").and_then(Value::as_str) == Some(deployment)
        })
        .map(|(key, _)| key.clone())
        .filter(|key| !state.terminating_pods.contains_key(key))
        .collect();
    live.sort();

    while live.len() > replicas {
        if let Some(pod) = live.pop() {
            state.terminating_pods.insert(pod, termination_lag);
        }
    }
    for index in live.len()..replicas {
        let name = format!("{deployment}-{}-{index}", state.resource_version);
        state.objects.insert(
            ("Pod".to_string(), namespace.to_string(), name.clone()),
            json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {"name": name, "namespace": namespace, "labels": labels},
                "status": {"phase": "Running"}
            }),
        );
    }
}

/// Report a finished rollout for the deployment's current generation.
fn rollout_complete(state: &mut MockState, key: &ObjectKey) {
    let Some(object) = state.objects.get_mut(key) else {
        return;
    };
    let generation = object
        .pointer("/metadata/generation")
        .and_then(Value::as_i64)
        .unwrap_or(0)
        + 1;
    let replicas = object
        .pointer("/spec/replicas")
        .and_then(Value::as_i64)
        .unwrap_or(1);
    merge_patch(
        object,
        &json!({
            "metadata": {"generation": generation},
            "status": {
                "observedGeneration": generation,
                "replicas": replicas,
                "updatedReplicas": replicas,
                "readyReplicas": replicas,
                "availableReplicas": replicas
            }
        }),
    );
}

fn matches_selector(object: &Value, selector: Option<&str>) -> bool {
    let Some(selector) = selector else {
        return true;
    };
    selector.split(',').filter(|s| !s.is_empty()).all(|term| {
        let Some((key, value)) = term.split_once('=') else {
            return false;
        };
        object
            .get("metadata")
            .and_then(|m| m.get("labels"))
            .and_then(|l| l.get(key))
            .and_then(Value::as_str)
            == Some(value)
    })
}

#[async_trait]
impl ClusterApi for MockCluster {
    fn backend_type(&self) -> &'static str {
        "mock"
    }

    async fn get(&self, resource: &ApiResource, namespace: &str, name: &str) -> Result<Option<Value>> {
        let mut state = self.state.lock().await;
        Self::record(&mut state, "get", resource, namespace, name)?;
        self.before_read(&mut state, &resource.kind, namespace, name);
        Ok(state
            .objects
            .get(&(resource.kind.clone(), namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn create(&self, resource: &ApiResource, namespace: &str, mut object: Value) -> Result<Value> {
        let name = object_name(&object);
        let mut state = self.state.lock().await;
        Self::record(&mut state, "create", resource, namespace, &name)?;
        let key = (resource.kind.clone(), namespace.to_string(), name.clone());
        if state.objects.contains_key(&key) {
            return Err(ClusterError::AlreadyExists {
                kind: resource.kind.clone(),
                name,
            });
        }
        state.resource_version += 1;
        set_resource_version(&mut object, state.resource_version);
        if resource.kind == "PersistentVolumeClaim" {
            bind_claim(&mut state, namespace, &name, &mut object);
        }
        state.objects.insert(key, object.clone());
        self.after_write(&mut state, &resource.kind, namespace, &name, None);
        Ok(object)
    }

    async fn replace(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        mut object: Value,
    ) -> Result<Value> {
        let mut state = self.state.lock().await;
        Self::record(&mut state, "replace", resource, namespace, name)?;
        let key = (resource.kind.clone(), namespace.to_string(), name.to_string());
        let Some(previous) = state.objects.get(&key).cloned() else {
            return Err(ClusterError::NotFound {
                kind: resource.kind.clone(),
                name: name.to_string(),
            });
        };
        // Server-owned fields survive a replace
        if let Some(status) = previous.get("status") {
            merge_patch(&mut object, &json!({ "status": status }));
        }
        if let Some(volume) = previous.pointer("/spec/volumeName") {
            merge_patch(&mut object, &json!({"spec": {"volumeName": volume}}));
        }
        state.resource_version += 1;
        set_resource_version(&mut object, state.resource_version);
        state.objects.insert(key, object.clone());
        self.after_write(&mut state, &resource.kind, namespace, name, Some(&previous));
        Ok(object)
    }

    async fn patch(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        patch: Value,
    ) -> Result<Value> {
        let mut state = self.state.lock().await;
        Self::record(&mut state, "patch", resource, namespace, name)?;
        let key = (resource.kind.clone(), namespace.to_string(), name.to_string());
        let Some(previous) = state.objects.get(&key).cloned() else {
            return Err(ClusterError::NotFound {
                kind: resource.kind.clone(),
                name: name.to_string(),
            });
        };
        let mut object = previous.clone();
        merge_patch(&mut object, &patch);
        state.resource_version += 1;
        set_resource_version(&mut object, state.resource_version);
        state.objects.insert(key, object.clone());
        self.after_write(&mut state, &resource.kind, namespace, name, Some(&previous));
        Ok(object)
    }

    async fn delete(&self, resource: &ApiResource, namespace: &str, name: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        Self::record(&mut state, "delete", resource, namespace, name)?;
        let key = (resource.kind.clone(), namespace.to_string(), name.to_string());
        let removed = state.objects.remove(&key).is_some();
        state.running_jobs.remove(&key);
        if removed && resource.kind == "Deployment" {
            let pods: Vec<ObjectKey> = state
                .objects
                .iter()
                .filter(|((kind, ns, _), pod)| {
                    kind == "Pod"
                        && ns == namespace
                        && pod.pointer("/metadata/labels/app").and_then(Value::as_str) == Some(name)
                })
                .map(|(key, _)| key.clone())
                .collect();
            for pod in pods {
                state.objects.remove(&pod);
            }
        }
        Ok(removed)
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<Value>> {
        let mut state = self.state.lock().await;
        Self::record(&mut state, "list", resource, namespace, "")?;
        Self::before_list(&mut state, &resource.kind, namespace);
        let mut items: Vec<(String, Value)> = state
            .objects
            .iter()
            .filter(|((kind, ns, _), object)| {
                *kind == resource.kind && ns == namespace && matches_selector(object, label_selector)
            })
            .map(|((_, _, name), object)| (name.clone(), object.clone()))
            .collect();
        items.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(items.into_iter().map(|(_, object)| object).collect())
    }

    async fn ensure_namespace(&self, namespace: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(ClusterCall {
            verb: "ensure_namespace",
            kind: "Namespace".to_string(),
            namespace: String::new(),
            name: namespace.to_string(),
        });
        state.namespaces.insert(namespace.to_string());
        Ok(())
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        _tail_lines: Option<i64>,
    ) -> Result<String> {
        let mut state = self.state.lock().await;
        state.calls.push(ClusterCall {
            verb: "logs",
            kind: "Pod".to_string(),
            namespace: namespace.to_string(),
            name: format!("{pod}/{container}"),
        });
        Ok(state
            .logs
            .get(&(namespace.to_string(), pod.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}
