// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Engine entry point.
//!
//! [`Engine`] wires the reconcilers around an injected cluster backend and
//! declared-state store. Every operation loads what it needs from the store,
//! runs to completion on the caller's task and holds no state afterwards.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use keelson_engine::cluster::KubeCluster;
//! use keelson_engine::engine::Engine;
//! use keelson_engine::store::PostgresStore;
//!
//! let engine = Engine::builder()
//!     .cluster(Arc::new(KubeCluster::try_default().await?))
//!     .store(Arc::new(PostgresStore::new(pool)))
//!     .config(config.engine_config())
//!     .build()?;
//!
//! let report = engine.deploy("app-1", &DeployRequest::new("dep-1"), &cancel).await?;
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Secret, Service};
use k8s_openapi::api::networking::v1::{Ingress, NetworkPolicy};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::basic_auth::reveal_basic_auth;
use crate::cluster::crd::Middleware;
use crate::cluster::{Cluster, ClusterApi, ClusterResource, app_selector};
use crate::config::{ConfigError, EngineConfig};
use crate::deployment::{DeployReport, DeployRequest, deploy};
use crate::error::{Error, Result};
use crate::file_browser::teardown_file_browsers;
use crate::ingress::restart_ingress_router;
use crate::logs::{PodLog, app_pod_logs, read_deployment_log};
use crate::model::{App, AppVolume, BasicAuthEntry};
use crate::storage_migration::{MigrationReport, migrate_volume};
use crate::store::StateStore;
use crate::volumes::{delete_volume, save_volume};

/// Builder for an [`Engine`].
#[derive(Default)]
pub struct EngineBuilder {
    cluster: Option<Arc<dyn ClusterApi>>,
    store: Option<Arc<dyn StateStore>>,
    config: EngineConfig,
}

impl EngineBuilder {
    /// Create a builder with default tunables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the cluster backend (required).
    pub fn cluster(mut self, cluster: Arc<dyn ClusterApi>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Set the declared-state store (required).
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Replace all tunables.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the deployment log directory.
    ///
    /// Default: `.data`
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Build the engine.
    pub fn build(self) -> Result<Engine> {
        let cluster = self
            .cluster
            .ok_or(ConfigError::MissingComponent("cluster backend"))?;
        let store = self
            .store
            .ok_or(ConfigError::MissingComponent("declared-state store"))?;
        Ok(Engine {
            cluster: Cluster::new(cluster),
            store,
            config: self.config,
        })
    }
}

/// Objects removed by [`Engine::delete_app`], as `Kind/name`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteReport {
    /// Removed cluster objects.
    pub removed: Vec<String>,
    /// Whether the declared app existed.
    pub app_deleted: bool,
}

/// Deployment and storage reconciliation engine.
pub struct Engine {
    cluster: Cluster,
    store: Arc<dyn StateStore>,
    config: EngineConfig,
}

impl Engine {
    /// Start building an engine.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Cluster facade.
    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// Declared-state store.
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Tunables.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn load_app(&self, app_id: &str) -> Result<App> {
        self.store
            .get_app(app_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("app {app_id}")))
    }

    /// Deploy a declared app.
    pub async fn deploy(
        &self,
        app_id: &str,
        request: &DeployRequest,
        cancel: &CancellationToken,
    ) -> Result<DeployReport> {
        let app = self.load_app(app_id).await?;
        deploy(&self.cluster, &self.config, &app, request, cancel).await
    }

    /// Migrate a volume to another storage class.
    pub async fn migrate_volume(
        &self,
        volume_id: &str,
        target_class: &str,
        cancel: &CancellationToken,
    ) -> Result<MigrationReport> {
        migrate_volume(
            &self.cluster,
            self.store.as_ref(),
            &self.config,
            volume_id,
            target_class,
            cancel,
        )
        .await
    }

    /// Declare or update a volume.
    ///
    /// An empty storage class keeps the current one, or takes the default for
    /// a new volume.
    pub async fn save_volume(&self, volume: &AppVolume) -> Result<AppVolume> {
        let mut volume = volume.clone();
        if volume.storage_class.trim().is_empty() {
            volume.storage_class = match self.store.get_volume(&volume.id).await? {
                Some(existing) => existing.storage_class,
                None => self.config.default_storage_class.clone(),
            };
        }
        save_volume(self.store.as_ref(), &volume).await
    }

    /// Delete a volume and its claim.
    pub async fn delete_volume(&self, volume_id: &str) -> Result<bool> {
        let Some(volume) = self.store.get_volume(volume_id).await? else {
            return Ok(false);
        };
        let app = self.load_app(&volume.app_id).await?;
        delete_volume(&self.cluster, self.store.as_ref(), app.namespace(), volume_id).await
    }

    /// Remove every cluster object of an app, then the app itself.
    ///
    /// Refused while another app mounts one of its volumes.
    pub async fn delete_app(&self, app_id: &str) -> Result<DeleteReport> {
        let app = self.load_app(app_id).await?;
        for volume in app.volumes.iter().filter(|v| v.owns_claim()) {
            let dependants = self.store.volumes_shared_from(&volume.id).await?;
            if !dependants.is_empty() {
                let apps: Vec<&str> = dependants.iter().map(|v| v.app_id.as_str()).collect();
                return Err(Error::conflict(format!(
                    "volume {} is shared with {}",
                    volume.container_mount_path,
                    apps.join(", ")
                )));
            }
        }

        let namespace = app.namespace();
        let mut report = DeleteReport::default();
        for volume_id in teardown_file_browsers(&self.cluster, &app).await? {
            report.removed.push(format!("FileBrowser/{volume_id}"));
        }

        let selector = app_selector(&app.id);
        let cluster = &self.cluster;
        // Workload first so nothing holds the claims
        report.removed.extend(delete_labeled::<Deployment>(cluster, namespace, &selector).await?);
        report.removed.extend(delete_labeled::<Job>(cluster, namespace, &selector).await?);
        report.removed.extend(delete_labeled::<Ingress>(cluster, namespace, &selector).await?);
        report.removed.extend(delete_labeled::<Middleware>(cluster, namespace, &selector).await?);
        report.removed.extend(delete_labeled::<Service>(cluster, namespace, &selector).await?);
        report.removed.extend(delete_labeled::<NetworkPolicy>(cluster, namespace, &selector).await?);
        report.removed.extend(delete_labeled::<Secret>(cluster, namespace, &selector).await?);
        report.removed.extend(delete_labeled::<ConfigMap>(cluster, namespace, &selector).await?);
        report
            .removed
            .extend(delete_labeled::<PersistentVolumeClaim>(cluster, namespace, &selector).await?);

        report.app_deleted = self.store.delete_app(app_id).await?;
        info!(app_id, namespace, objects = report.removed.len(), "Deleted app");
        Ok(report)
    }

    /// Decrypt an app's basic-auth credentials.
    pub async fn reveal_basic_auth(&self, app_id: &str) -> Result<Vec<BasicAuthEntry>> {
        let app = self.load_app(app_id).await?;
        reveal_basic_auth(
            &self.cluster,
            app.namespace(),
            &app.id,
            self.config.credential_key.as_ref(),
        )
        .await
    }

    /// Restart the ingress router and wait for it to be ready.
    pub async fn restart_ingress_router(&self, cancel: &CancellationToken) -> Result<()> {
        restart_ingress_router(&self.cluster, &self.config, cancel).await
    }

    /// Logs of the app's pods.
    pub async fn pod_logs(&self, app_id: &str, tail_lines: Option<i64>) -> Result<Vec<PodLog>> {
        let app = self.load_app(app_id).await?;
        app_pod_logs(&self.cluster, app.namespace(), &app.id, tail_lines).await
    }

    /// Step log of one deployment.
    pub async fn deployment_log(&self, app_id: &str, deployment_id: &str) -> Result<String> {
        read_deployment_log(&self.config.data_dir, app_id, deployment_id).await
    }
}

async fn delete_labeled<K: ClusterResource>(
    cluster: &Cluster,
    namespace: &str,
    selector: &str,
) -> Result<Vec<String>> {
    let kind = K::kind(&());
    let mut removed = Vec::new();
    for object in cluster.list::<K>(namespace, Some(selector)).await? {
        let Some(name) = object.meta().name.clone() else {
            continue;
        };
        if cluster.delete::<K>(namespace, &name).await? {
            removed.push(format!("{kind}/{name}"));
        }
    }
    Ok(removed)
}
