// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Declared-state store.
//!
//! The store is the source of truth for which volume occupies which mount
//! path. Reconcilers read the app model from it; the only writes the engine
//! performs during reconciliation are the migration's volume records and the
//! cut-over, which must be atomic.
//!
//! | Backend | Description |
//! |---------|-------------|
//! | [`PostgresStore`] | PostgreSQL via sqlx |
//! | [`MemoryStore`] | In-process, for tests and dry runs |

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{App, AppDomain, AppPort, AppVolume};

pub use self::memory::MemoryStore;
pub use self::postgres::PostgresStore;

/// Errors from the declared-state store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Write violates a uniqueness rule (mount path, port, hostname).
    #[error("{0} already in use")]
    Conflict(String),

    /// Row to update does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// Stored row cannot be decoded.
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Atomic swap of two volumes' mount paths at the end of a migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeCutover {
    /// Volume being replaced.
    pub old_volume_id: String,
    /// Path the old volume moves to (`<path>_old`).
    pub old_volume_path: String,
    /// Replacement volume.
    pub new_volume_id: String,
    /// Original mount path the replacement takes over.
    pub new_volume_path: String,
}

/// Read and write access to the declared app model.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Backend identifier (e.g. "postgres", "memory").
    fn backend_type(&self) -> &'static str;

    /// Load an app with its volumes, domains, ports and file mounts.
    async fn get_app(&self, app_id: &str) -> Result<Option<App>>;

    /// Insert or update an app and replace its domains, ports and file mounts.
    ///
    /// Volumes are managed separately through the volume operations.
    async fn save_app(&self, app: &App) -> Result<()>;

    /// Delete an app and everything it owns. Returns false when absent.
    async fn delete_app(&self, app_id: &str) -> Result<bool>;

    /// Load one volume.
    async fn get_volume(&self, volume_id: &str) -> Result<Option<AppVolume>>;

    /// Volumes of an app, ordered by mount path.
    async fn list_volumes(&self, app_id: &str) -> Result<Vec<AppVolume>>;

    /// Volumes of other apps that mount `volume_id`.
    async fn volumes_shared_from(&self, volume_id: &str) -> Result<Vec<AppVolume>>;

    /// Insert a volume. Fails with [`StoreError::Conflict`] on a taken mount path.
    async fn insert_volume(&self, volume: &AppVolume) -> Result<()>;

    /// Update a volume's mount path, size and storage class.
    async fn update_volume(&self, volume: &AppVolume) -> Result<()>;

    /// Delete a volume record. Returns false when absent.
    async fn delete_volume(&self, volume_id: &str) -> Result<bool>;

    /// Swap mount paths in one transaction.
    async fn cut_over_volumes(&self, cutover: &VolumeCutover) -> Result<()>;

    /// Insert or update a domain.
    async fn save_domain(&self, app_id: &str, domain: &AppDomain) -> Result<()>;

    /// Delete a domain. Returns false when absent.
    async fn delete_domain(&self, domain_id: &str) -> Result<bool>;

    /// Insert or update a port.
    async fn save_port(&self, app_id: &str, port: &AppPort) -> Result<()>;

    /// Delete a port. Returns false when absent.
    async fn delete_port(&self, port_id: &str) -> Result<bool>;
}
