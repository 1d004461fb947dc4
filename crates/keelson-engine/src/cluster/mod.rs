// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster control API.
//!
//! [`ClusterApi`] is the object-safe boundary to the orchestration cluster: a
//! handful of verbs over JSON objects addressed by [`ApiResource`]. Reconcilers
//! never hold a concrete client; they receive a [`Cluster`], the typed facade
//! over an injected `Arc<dyn ClusterApi>`.
//!
//! | Backend | Description |
//! |---------|-------------|
//! | [`KubeCluster`] | Kubernetes API server via `kube` |
//! | [`MockCluster`] | In-memory cluster for tests |
//!
//! "Not found" is never an error: `get` returns `None` and `delete` returns
//! `false`.

pub mod crd;
pub mod kubernetes;
pub mod mock;

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::Resource;
use kube::api::ApiResource;
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

pub use self::kubernetes::KubeCluster;
pub use self::mock::MockCluster;

/// Label carried by every object the engine creates for an app.
pub const APP_ID_LABEL: &str = "keelson.io/app-id";
/// Pod selector label of an app's workload.
pub const APP_LABEL: &str = "app";
/// Label identifying scheduled backup job pods.
pub const JOB_TYPE_LABEL: &str = "keelson.io/job-type";
/// Value of [`JOB_TYPE_LABEL`] for backup jobs.
pub const BACKUP_JOB_TYPE: &str = "backup";

/// Errors from cluster operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ClusterError {
    /// The API server rejected the request.
    #[error("{verb} {kind} {name} failed ({code}): {message}")]
    Api {
        /// Verb that failed.
        verb: &'static str,
        /// Resource kind.
        kind: String,
        /// Object name.
        name: String,
        /// HTTP status code.
        code: u16,
        /// Server message.
        message: String,
    },

    /// Object already exists on create.
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Resource kind.
        kind: String,
        /// Object name.
        name: String,
    },

    /// Object is missing for a verb that requires it (replace, patch).
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind.
        kind: String,
        /// Object name.
        name: String,
    },

    /// Object could not be converted to or from its typed form.
    #[error("Malformed {kind}: {source}")]
    Malformed {
        /// Resource kind.
        kind: String,
        /// Serde failure.
        #[source]
        source: serde_json::Error,
    },

    /// Transport or client failure.
    #[error("Cluster client error: {0}")]
    Client(String),
}

/// Result type for cluster operations.
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Verbs the engine needs from the cluster.
///
/// Backends are pure transport: they do not know about apps or volumes. An
/// empty `namespace` addresses a cluster-scoped resource.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Backend identifier (e.g. "kube", "mock").
    fn backend_type(&self) -> &'static str;

    /// Read an object.
    async fn get(&self, resource: &ApiResource, namespace: &str, name: &str)
    -> Result<Option<Value>>;

    /// Create an object.
    async fn create(&self, resource: &ApiResource, namespace: &str, object: Value) -> Result<Value>;

    /// Replace an object entirely.
    async fn replace(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        object: Value,
    ) -> Result<Value>;

    /// Apply a JSON merge patch.
    async fn patch(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        patch: Value,
    ) -> Result<Value>;

    /// Delete an object. Returns false when it did not exist.
    async fn delete(&self, resource: &ApiResource, namespace: &str, name: &str) -> Result<bool>;

    /// List objects, optionally filtered by a label selector.
    async fn list(
        &self,
        resource: &ApiResource,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<Value>>;

    /// Create the namespace if it does not exist.
    async fn ensure_namespace(&self, namespace: &str) -> Result<()>;

    /// Read a container's log.
    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        tail_lines: Option<i64>,
    ) -> Result<String>;
}

/// Typed object the engine reads and writes.
pub trait ClusterResource:
    Resource<DynamicType = ()> + Serialize + DeserializeOwned + Clone + Send + Sync + 'static
{
}

impl<K> ClusterResource for K where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned + Clone + Send + Sync + 'static
{
}

/// What [`Cluster::apply`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Object did not exist.
    Created,
    /// Object existed with different content.
    Replaced,
    /// Object already matched.
    Unchanged,
}

/// Typed facade over a [`ClusterApi`] backend.
#[derive(Clone)]
pub struct Cluster {
    api: Arc<dyn ClusterApi>,
}

impl Cluster {
    /// Wrap a backend.
    pub fn new(api: Arc<dyn ClusterApi>) -> Self {
        Self { api }
    }

    /// Underlying backend.
    pub fn api(&self) -> &Arc<dyn ClusterApi> {
        &self.api
    }

    /// Read a typed object.
    pub async fn get<K: ClusterResource>(&self, namespace: &str, name: &str) -> Result<Option<K>> {
        let resource = ApiResource::erase::<K>(&());
        match self.api.get(&resource, namespace, name).await? {
            Some(value) => Ok(Some(from_value(&resource, value)?)),
            None => Ok(None),
        }
    }

    /// Create a typed object.
    pub async fn create<K: ClusterResource>(&self, namespace: &str, object: &K) -> Result<K> {
        let resource = ApiResource::erase::<K>(&());
        let created = self
            .api
            .create(&resource, namespace, to_value(&resource, object)?)
            .await?;
        from_value(&resource, created)
    }

    /// Create the object if absent, replace it if its content differs.
    ///
    /// The observed `resourceVersion` is carried over so the replace is a
    /// conditional update. Content is compared as a subset: fields the server
    /// defaulted on the observed object do not count as drift.
    pub async fn apply<K: ClusterResource>(&self, namespace: &str, object: &K) -> Result<ApplyOutcome> {
        let resource = ApiResource::erase::<K>(&());
        let name = object.meta().name.clone().unwrap_or_default();
        let mut desired = to_value(&resource, object)?;

        let Some(observed) = self.api.get(&resource, namespace, &name).await? else {
            self.api.create(&resource, namespace, desired).await?;
            debug!(kind = %resource.kind, namespace, name = %name, "Created");
            return Ok(ApplyOutcome::Created);
        };

        if is_subset(&desired, &observed) {
            debug!(kind = %resource.kind, namespace, name = %name, "Unchanged");
            return Ok(ApplyOutcome::Unchanged);
        }

        if let Some(version) = observed.pointer("/metadata/resourceVersion").cloned()
            && let Some(metadata) = desired.get_mut("metadata").and_then(Value::as_object_mut)
        {
            metadata.insert("resourceVersion".to_string(), version);
        }

        self.api.replace(&resource, namespace, &name, desired).await?;
        debug!(kind = %resource.kind, namespace, name = %name, "Replaced");
        Ok(ApplyOutcome::Replaced)
    }

    /// Apply a JSON merge patch to a typed object.
    pub async fn patch<K: ClusterResource>(&self, namespace: &str, name: &str, patch: Value) -> Result<K> {
        let resource = ApiResource::erase::<K>(&());
        let patched = self.api.patch(&resource, namespace, name, patch).await?;
        from_value(&resource, patched)
    }

    /// Delete a typed object. Returns false when it did not exist.
    pub async fn delete<K: ClusterResource>(&self, namespace: &str, name: &str) -> Result<bool> {
        let resource = ApiResource::erase::<K>(&());
        let deleted = self.api.delete(&resource, namespace, name).await?;
        if deleted {
            debug!(kind = %resource.kind, namespace, name, "Deleted");
        }
        Ok(deleted)
    }

    /// List typed objects by label selector.
    pub async fn list<K: ClusterResource>(&self, namespace: &str, label_selector: Option<&str>) -> Result<Vec<K>> {
        let resource = ApiResource::erase::<K>(&());
        self.api
            .list(&resource, namespace, label_selector)
            .await?
            .into_iter()
            .map(|value| from_value(&resource, value))
            .collect()
    }

    /// Create the namespace if it does not exist.
    pub async fn ensure_namespace(&self, namespace: &str) -> Result<()> {
        self.api.ensure_namespace(namespace).await
    }

    /// Read a container's log.
    pub async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        tail_lines: Option<i64>,
    ) -> Result<String> {
        self.api.pod_logs(namespace, pod, container, tail_lines).await
    }
}

/// Selector matching every object of one app.
pub fn app_selector(app_id: &str) -> String {
    format!("{APP_ID_LABEL}={app_id}")
}

/// Labels put on every object owned by an app.
pub fn app_labels(app_id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(APP_ID_LABEL.to_string(), app_id.to_string())])
}

fn to_value<K: Serialize>(resource: &ApiResource, object: &K) -> Result<Value> {
    serde_json::to_value(object).map_err(|source| ClusterError::Malformed {
        kind: resource.kind.clone(),
        source,
    })
}

fn from_value<K: DeserializeOwned>(resource: &ApiResource, value: Value) -> Result<K> {
    serde_json::from_value(value).map_err(|source| ClusterError::Malformed {
        kind: resource.kind.clone(),
        source,
    })
}

/// Whether every field set in `desired` has the same value in `observed`.
///
/// Arrays must have equal length and match element-wise. A missing key matches
/// a desired null or empty array.
pub fn is_subset(desired: &Value, observed: &Value) -> bool {
    match (desired, observed) {
        (Value::Object(want), Value::Object(have)) => want.iter().all(|(key, value)| {
            match have.get(key) {
                Some(existing) => is_subset(value, existing),
                // Servers drop empty lists from what they return
                None => value.is_null() || value.as_array().is_some_and(|a| a.is_empty()),
            }
        }),
        (Value::Array(want), Value::Array(have)) => {
            want.len() == have.len() && want.iter().zip(have).all(|(w, h)| is_subset(w, h))
        }
        (want, have) => want == have,
    }
}

/// Apply an RFC 7386 JSON merge patch in place.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use serde_json::json;

    #[test]
    fn test_subset_ignores_server_defaults() {
        let desired = json!({"spec": {"replicas": 1, "ports": [{"port": 80}]}});
        let observed = json!({
            "spec": {"replicas": 1, "ports": [{"port": 80, "protocol": "TCP"}], "clusterIP": "10.0.0.1"},
            "status": {}
        });
        assert!(is_subset(&desired, &observed));

        let changed = json!({"spec": {"replicas": 2}});
        assert!(!is_subset(&changed, &observed));

        let fewer_ports = json!({"spec": {"ports": []}});
        assert!(!is_subset(&fewer_ports, &observed));
    }

    #[test]
    fn test_subset_treats_dropped_empty_list_as_equal() {
        let desired = json!({"spec": {"policyTypes": ["Egress"], "egress": []}});
        let observed = json!({"spec": {"policyTypes": ["Egress"]}});
        assert!(is_subset(&desired, &observed));

        let allowed = json!({"spec": {"egress": [{"to": []}]}});
        assert!(!is_subset(&allowed, &observed));
    }

    #[test]
    fn test_merge_patch() {
        let mut target = json!({"spec": {"replicas": 3, "paused": true}, "keep": 1});
        merge_patch(&mut target, &json!({"spec": {"replicas": 0, "paused": null}}));
        assert_eq!(target, json!({"spec": {"replicas": 0}, "keep": 1}));
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let mock = Arc::new(MockCluster::new());
        let cluster = Cluster::new(mock.clone());
        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some("settings".to_string()),
                namespace: Some("ns".to_string()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([("a".to_string(), "1".to_string())])),
            ..Default::default()
        };

        assert_eq!(cluster.apply("ns", &config_map).await.unwrap(), ApplyOutcome::Created);
        assert_eq!(cluster.apply("ns", &config_map).await.unwrap(), ApplyOutcome::Unchanged);

        let mut changed = config_map.clone();
        changed.data = Some(BTreeMap::from([("a".to_string(), "2".to_string())]));
        assert_eq!(cluster.apply("ns", &changed).await.unwrap(), ApplyOutcome::Replaced);

        let stored: ConfigMap = cluster.get("ns", "settings").await.unwrap().unwrap();
        assert_eq!(stored.data.unwrap()["a"], "2");
    }

    #[tokio::test]
    async fn test_missing_objects_are_not_errors() {
        let cluster = Cluster::new(Arc::new(MockCluster::new()));
        let missing: Option<ConfigMap> = cluster.get("ns", "nope").await.unwrap();
        assert!(missing.is_none());
        assert!(!cluster.delete::<ConfigMap>("ns", "nope").await.unwrap());
    }
}
