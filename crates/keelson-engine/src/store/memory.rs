// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory declared-state store.
//!
//! Enforces the same uniqueness rules as the PostgreSQL schema. The cut-over
//! runs under a single lock, which gives it the same all-or-nothing behavior
//! as the database transaction.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Result, StateStore, StoreError, VolumeCutover};
use crate::model::{App, AppDomain, AppPort, AppVolume};

#[derive(Default)]
struct Inner {
    /// Apps without volumes
    apps: HashMap<String, App>,
    volumes: HashMap<String, AppVolume>,
}

impl Inner {
    fn volumes_of(&self, app_id: &str) -> Vec<AppVolume> {
        let mut volumes: Vec<AppVolume> = self
            .volumes
            .values()
            .filter(|v| v.app_id == app_id)
            .cloned()
            .collect();
        volumes.sort_by(|a, b| a.container_mount_path.cmp(&b.container_mount_path));
        volumes
    }

    fn path_taken(&self, app_id: &str, path: &str, except: &str) -> bool {
        self.volumes
            .values()
            .any(|v| v.app_id == app_id && v.container_mount_path == path && v.id != except)
    }

    fn app_mut(&mut self, app_id: &str) -> Result<&mut App> {
        self.apps
            .get_mut(app_id)
            .ok_or_else(|| StoreError::NotFound(format!("app {app_id}")))
    }
}

/// In-memory store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    fn backend_type(&self) -> &'static str {
        "memory"
    }

    async fn get_app(&self, app_id: &str) -> Result<Option<App>> {
        let inner = self.inner.lock().await;
        Ok(inner.apps.get(app_id).map(|app| App {
            volumes: inner.volumes_of(app_id),
            ..app.clone()
        }))
    }

    async fn save_app(&self, app: &App) -> Result<()> {
        let mut inner = self.inner.lock().await;
        for (index, domain) in app.domains.iter().enumerate() {
            let duplicate_here = app.domains[..index]
                .iter()
                .any(|d| d.hostname == domain.hostname);
            let taken_elsewhere = inner
                .apps
                .values()
                .filter(|other| other.id != app.id)
                .any(|other| other.domains.iter().any(|d| d.hostname == domain.hostname));
            if duplicate_here || taken_elsewhere {
                return Err(StoreError::Conflict(format!("hostname {}", domain.hostname)));
            }
        }
        for (index, port) in app.ports.iter().enumerate() {
            if app.ports[..index].iter().any(|p| p.port == port.port) {
                return Err(StoreError::Conflict(format!("port {}", port.port)));
            }
        }
        inner.apps.insert(
            app.id.clone(),
            App {
                volumes: vec![],
                ..app.clone()
            },
        );
        Ok(())
    }

    async fn delete_app(&self, app_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        inner.volumes.retain(|_, v| v.app_id != app_id);
        Ok(inner.apps.remove(app_id).is_some())
    }

    async fn get_volume(&self, volume_id: &str) -> Result<Option<AppVolume>> {
        Ok(self.inner.lock().await.volumes.get(volume_id).cloned())
    }

    async fn list_volumes(&self, app_id: &str) -> Result<Vec<AppVolume>> {
        Ok(self.inner.lock().await.volumes_of(app_id))
    }

    async fn volumes_shared_from(&self, volume_id: &str) -> Result<Vec<AppVolume>> {
        let inner = self.inner.lock().await;
        let mut shared: Vec<AppVolume> = inner
            .volumes
            .values()
            .filter(|v| v.shared_volume_id.as_deref() == Some(volume_id))
            .cloned()
            .collect();
        shared.sort_by(|a, b| a.app_id.cmp(&b.app_id));
        Ok(shared)
    }

    async fn insert_volume(&self, volume: &AppVolume) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.volumes.contains_key(&volume.id) {
            return Err(StoreError::Conflict(format!("volume id {}", volume.id)));
        }
        if inner.path_taken(&volume.app_id, &volume.container_mount_path, &volume.id) {
            return Err(StoreError::Conflict(format!(
                "mount path {}",
                volume.container_mount_path
            )));
        }
        inner.volumes.insert(volume.id.clone(), volume.clone());
        Ok(())
    }

    async fn update_volume(&self, volume: &AppVolume) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(existing) = inner.volumes.get(&volume.id).cloned() else {
            return Err(StoreError::NotFound(format!("volume {}", volume.id)));
        };
        if inner.path_taken(&existing.app_id, &volume.container_mount_path, &volume.id) {
            return Err(StoreError::Conflict(format!(
                "mount path {}",
                volume.container_mount_path
            )));
        }
        inner.volumes.insert(
            volume.id.clone(),
            AppVolume {
                container_mount_path: volume.container_mount_path.clone(),
                size_mb: volume.size_mb,
                storage_class: volume.storage_class.clone(),
                ..existing
            },
        );
        Ok(())
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<bool> {
        Ok(self.inner.lock().await.volumes.remove(volume_id).is_some())
    }

    async fn cut_over_volumes(&self, cutover: &VolumeCutover) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let old = inner
            .volumes
            .get(&cutover.old_volume_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("volume {}", cutover.old_volume_id)))?;
        let new = inner
            .volumes
            .get(&cutover.new_volume_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("volume {}", cutover.new_volume_id)))?;

        // Validate both renames against the final state before touching anything
        let others_hold = |path: &str| {
            inner.volumes.values().any(|v| {
                v.app_id == old.app_id
                    && v.container_mount_path == path
                    && v.id != old.id
                    && v.id != new.id
            })
        };
        if others_hold(&cutover.old_volume_path) {
            return Err(StoreError::Conflict(format!(
                "mount path {}",
                cutover.old_volume_path
            )));
        }
        if others_hold(&cutover.new_volume_path) {
            return Err(StoreError::Conflict(format!(
                "mount path {}",
                cutover.new_volume_path
            )));
        }

        if let Some(volume) = inner.volumes.get_mut(&old.id) {
            volume.container_mount_path = cutover.old_volume_path.clone();
        }
        if let Some(volume) = inner.volumes.get_mut(&new.id) {
            volume.container_mount_path = cutover.new_volume_path.clone();
        }
        Ok(())
    }

    async fn save_domain(&self, app_id: &str, domain: &AppDomain) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let taken = inner.apps.values().any(|app| {
            app.domains
                .iter()
                .any(|d| d.hostname == domain.hostname && d.id != domain.id)
        });
        if taken {
            return Err(StoreError::Conflict(format!("hostname {}", domain.hostname)));
        }
        let app = inner.app_mut(app_id)?;
        match app.domains.iter_mut().find(|d| d.id == domain.id) {
            Some(existing) => *existing = domain.clone(),
            None => app.domains.push(domain.clone()),
        }
        Ok(())
    }

    async fn delete_domain(&self, domain_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        for app in inner.apps.values_mut() {
            let before = app.domains.len();
            app.domains.retain(|d| d.id != domain_id);
            if app.domains.len() != before {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn save_port(&self, app_id: &str, port: &AppPort) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let app = inner.app_mut(app_id)?;
        if app.ports.iter().any(|p| p.port == port.port && p.id != port.id) {
            return Err(StoreError::Conflict(format!("port {}", port.port)));
        }
        match app.ports.iter_mut().find(|p| p.id == port.id) {
            Some(existing) => *existing = port.clone(),
            None => app.ports.push(port.clone()),
        }
        Ok(())
    }

    async fn delete_port(&self, port_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        for app in inner.apps.values_mut() {
            let before = app.ports.len();
            app.ports.retain(|p| p.id != port_id);
            if app.ports.len() != before {
                return Ok(true);
            }
        }
        Ok(false)
    }
}
