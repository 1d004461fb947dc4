// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for keelson-engine integration tests.
//!
//! Provides TestContext wiring an engine to the mock cluster and the in-memory
//! store, with polling budgets short enough for tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::ObjectMeta;
use tokio_util::sync::CancellationToken;

use keelson_engine::cluster::MockCluster;
use keelson_engine::config::EngineConfig;
use keelson_engine::engine::Engine;
use keelson_engine::model::{
    AccessMode, App, AppVolume, HealthCheckSettings, ImageSource, NetworkSettings,
    ResourceSettings,
};
use keelson_engine::poll::PollPolicy;
use keelson_engine::store::{MemoryStore, StateStore};

/// Namespace every test app lives in.
pub const NAMESPACE: &str = "proj-1";

/// Engine over a mock cluster and an in-memory store.
pub struct TestContext {
    pub engine: Engine,
    pub mock: Arc<MockCluster>,
    pub store: Arc<MemoryStore>,
    pub cancel: CancellationToken,
    _temp_dir: tempfile::TempDir,
}

impl TestContext {
    /// Create a context around a default mock cluster.
    pub fn new() -> Self {
        Self::with_cluster(MockCluster::new())
    }

    /// Create a context around a configured mock cluster.
    pub fn with_cluster(mock: MockCluster) -> Self {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let mock = Arc::new(mock);
        let store = Arc::new(MemoryStore::new());

        let quick = PollPolicy::fixed(Duration::from_millis(1), 10);
        let config = EngineConfig {
            data_dir: temp_dir.path().to_path_buf(),
            credential_key: Some([9u8; 32]),
            resize_wait: quick,
            pod_termination_wait: quick,
            migration_wait: quick,
            router_restart_wait: quick,
            ..EngineConfig::default()
        };

        let engine = Engine::builder()
            .cluster(mock.clone())
            .store(store.clone())
            .config(config)
            .build()
            .expect("Failed to build engine");

        Self {
            engine,
            mock,
            store,
            cancel: CancellationToken::new(),
            _temp_dir: temp_dir,
        }
    }

    /// Declare an app and its volumes.
    pub async fn declare(&self, app: &App) {
        self.store.save_app(app).await.expect("Failed to save app");
        for volume in &app.volumes {
            self.engine
                .save_volume(volume)
                .await
                .expect("Failed to save volume");
        }
    }

    /// Register a storage class with the cluster.
    pub async fn add_storage_class(&self, name: &str) {
        let class = StorageClass {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            provisioner: "driver.longhorn.io".to_string(),
            ..Default::default()
        };
        self.mock.seed("", &class).await;
    }
}

/// A minimal single-replica app.
pub fn app(id: &str) -> App {
    App {
        id: id.to_string(),
        name: format!("{id} app"),
        project_id: NAMESPACE.to_string(),
        replicas: 1,
        source: ImageSource {
            image: Some("nginx:1.27".to_string()),
            ..ImageSource::default()
        },
        container_command: None,
        container_args: None,
        env_vars: String::new(),
        resources: ResourceSettings::default(),
        health_check: HealthCheckSettings::default(),
        network: NetworkSettings::default(),
        basic_auth: vec![],
        domains: vec![],
        ports: vec![],
        volumes: vec![],
        file_mounts: vec![],
    }
}

/// A volume on the default storage class.
pub fn volume(id: &str, app_id: &str, path: &str, size_mb: i64, mode: AccessMode) -> AppVolume {
    AppVolume {
        id: id.to_string(),
        app_id: app_id.to_string(),
        container_mount_path: path.to_string(),
        size_mb,
        access_mode: mode,
        storage_class: "longhorn".to_string(),
        shared_volume_id: None,
    }
}
