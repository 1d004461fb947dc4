// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kubernetes backend for the cluster control API.
//!
//! Every verb goes through `Api<DynamicObject>` so one client serves all
//! resource kinds, including Traefik custom resources.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Client;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, ListParams, LogParams, Patch, PatchParams,
    PostParams,
};
use serde_json::Value;
use tracing::info;

use super::{ClusterApi, ClusterError, Result};

/// Cluster backend talking to a Kubernetes API server.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    /// Wrap an existing client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using in-cluster configuration or the local kubeconfig.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| ClusterError::Client(e.to_string()))?;
        Ok(Self::new(client))
    }

    fn dynamic(&self, resource: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        if namespace.is_empty() {
            Api::all_with(self.client.clone(), resource)
        } else {
            Api::namespaced_with(self.client.clone(), namespace, resource)
        }
    }
}

fn api_error(verb: &'static str, resource: &ApiResource, name: &str, err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(response) if response.code == 409 && verb == "create" => {
            ClusterError::AlreadyExists {
                kind: resource.kind.clone(),
                name: name.to_string(),
            }
        }
        kube::Error::Api(response) if response.code == 404 => ClusterError::NotFound {
            kind: resource.kind.clone(),
            name: name.to_string(),
        },
        kube::Error::Api(response) => ClusterError::Api {
            verb,
            kind: resource.kind.clone(),
            name: name.to_string(),
            code: response.code,
            message: response.message,
        },
        other => ClusterError::Client(other.to_string()),
    }
}

fn to_dynamic(resource: &ApiResource, object: Value) -> Result<DynamicObject> {
    serde_json::from_value(object).map_err(|source| ClusterError::Malformed {
        kind: resource.kind.clone(),
        source,
    })
}

fn from_dynamic(resource: &ApiResource, object: DynamicObject) -> Result<Value> {
    serde_json::to_value(object).map_err(|source| ClusterError::Malformed {
        kind: resource.kind.clone(),
        source,
    })
}

fn object_name(object: &Value) -> String {
    object
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl ClusterApi for KubeCluster {
    fn backend_type(&self) -> &'static str {
        "kube"
    }

    async fn get(&self, resource: &ApiResource, namespace: &str, name: &str) -> Result<Option<Value>> {
        let found = self
            .dynamic(resource, namespace)
            .get_opt(name)
            .await
            .map_err(|e| api_error("get", resource, name, e))?;
        found.map(|object| from_dynamic(resource, object)).transpose()
    }

    async fn create(&self, resource: &ApiResource, namespace: &str, object: Value) -> Result<Value> {
        let name = object_name(&object);
        let created = self
            .dynamic(resource, namespace)
            .create(&PostParams::default(), &to_dynamic(resource, object)?)
            .await
            .map_err(|e| api_error("create", resource, &name, e))?;
        from_dynamic(resource, created)
    }

    async fn replace(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        object: Value,
    ) -> Result<Value> {
        let replaced = self
            .dynamic(resource, namespace)
            .replace(name, &PostParams::default(), &to_dynamic(resource, object)?)
            .await
            .map_err(|e| api_error("replace", resource, name, e))?;
        from_dynamic(resource, replaced)
    }

    async fn patch(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
        patch: Value,
    ) -> Result<Value> {
        let patched = self
            .dynamic(resource, namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| api_error("patch", resource, name, e))?;
        from_dynamic(resource, patched)
    }

    async fn delete(&self, resource: &ApiResource, namespace: &str, name: &str) -> Result<bool> {
        match self
            .dynamic(resource, namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(false),
            Err(e) => Err(api_error("delete", resource, name, e)),
        }
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<Value>> {
        let mut params = ListParams::default();
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        let list = self
            .dynamic(resource, namespace)
            .list(&params)
            .await
            .map_err(|e| api_error("list", resource, "", e))?;
        list.items
            .into_iter()
            .map(|object| from_dynamic(resource, object))
            .collect()
    }

    async fn ensure_namespace(&self, namespace: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let resource = ApiResource::erase::<Namespace>(&());
        let existing = api
            .get_opt(namespace)
            .await
            .map_err(|e| api_error("get", &resource, namespace, e))?;
        if existing.is_some() {
            return Ok(());
        }

        let object = Namespace {
            metadata: ObjectMeta {
                name: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        match api.create(&PostParams::default(), &object).await {
            Ok(_) => {
                info!(namespace, "Created namespace");
                Ok(())
            }
            // Lost a race with a concurrent reconciliation
            Err(kube::Error::Api(response)) if response.code == 409 => Ok(()),
            Err(e) => Err(api_error("create", &resource, namespace, e)),
        }
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        tail_lines: Option<i64>,
    ) -> Result<String> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = LogParams {
            container: Some(container.to_string()),
            tail_lines,
            ..Default::default()
        };
        api.logs(pod, &params)
            .await
            .map_err(|e| api_error("logs", &ApiResource::erase::<Pod>(&()), pod, e))
    }
}
