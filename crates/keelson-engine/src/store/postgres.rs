// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL declared-state store.

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::types::Json;

use super::{Result, StateStore, StoreError, VolumeCutover};
use crate::model::{
    App, AppDomain, AppFileMount, AppPort, AppVolume, BasicAuthEntry, HealthCheckSettings,
    ImageSource, NetworkSettings, ResourceSettings,
};

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a store over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============================================================================
// Record Types
// ============================================================================

#[derive(Debug, sqlx::FromRow)]
struct AppRow {
    id: String,
    name: String,
    project_id: String,
    replicas: i32,
    image: Option<String>,
    registry_username: Option<String>,
    registry_password: Option<String>,
    container_command: Option<String>,
    container_args: Option<String>,
    env_vars: String,
    cpu_limit: Option<i64>,
    cpu_reservation: Option<i64>,
    memory_limit: Option<i64>,
    memory_reservation: Option<i64>,
    health_check: Json<HealthCheckSettings>,
    use_network_policy: bool,
    ingress_policy: String,
    egress_policy: String,
    basic_auth: Json<Vec<BasicAuthEntry>>,
}

#[derive(Debug, sqlx::FromRow)]
struct VolumeRow {
    id: String,
    app_id: String,
    container_mount_path: String,
    size_mb: i64,
    access_mode: String,
    storage_class: String,
    shared_volume_id: Option<String>,
}

impl TryFrom<VolumeRow> for AppVolume {
    type Error = StoreError;

    fn try_from(row: VolumeRow) -> Result<Self> {
        let access_mode = row
            .access_mode
            .parse()
            .map_err(|_| StoreError::Corrupt(format!("volume {} access mode", row.id)))?;
        Ok(AppVolume {
            id: row.id,
            app_id: row.app_id,
            container_mount_path: row.container_mount_path,
            size_mb: row.size_mb,
            access_mode,
            storage_class: row.storage_class,
            shared_volume_id: row.shared_volume_id,
        })
    }
}

const VOLUME_COLUMNS: &str =
    "id, app_id, container_mount_path, size_mb, access_mode, storage_class, shared_volume_id";

fn unique_violation(err: sqlx::Error, what: impl FnOnce() -> String) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict(what()),
        _ => StoreError::Database(err),
    }
}

// ============================================================================
// App Operations
// ============================================================================

/// Load an app with all of its children.
pub async fn get_app(pool: &PgPool, app_id: &str) -> Result<Option<App>> {
    let row = sqlx::query_as::<_, AppRow>(
        r#"
        SELECT id, name, project_id, replicas, image, registry_username, registry_password,
               container_command, container_args, env_vars,
               cpu_limit, cpu_reservation, memory_limit, memory_reservation,
               health_check, use_network_policy, ingress_policy, egress_policy, basic_auth
        FROM apps
        WHERE id = $1
        "#,
    )
    .bind(app_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let ingress = row
        .ingress_policy
        .parse()
        .map_err(|_| StoreError::Corrupt(format!("app {app_id} ingress policy")))?;
    let egress = row
        .egress_policy
        .parse()
        .map_err(|_| StoreError::Corrupt(format!("app {app_id} egress policy")))?;

    let domains = sqlx::query_as::<_, (String, String, i32, bool, bool)>(
        "SELECT id, hostname, port, use_ssl, redirect_https FROM app_domains WHERE app_id = $1 ORDER BY hostname",
    )
    .bind(app_id)
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(|(id, hostname, port, use_ssl, redirect_https)| AppDomain {
        id,
        hostname,
        port,
        use_ssl,
        redirect_https,
    })
    .collect();

    let ports = sqlx::query_as::<_, (String, i32)>(
        "SELECT id, port FROM app_ports WHERE app_id = $1 ORDER BY port",
    )
    .bind(app_id)
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(|(id, port)| AppPort { id, port })
    .collect();

    let file_mounts = sqlx::query_as::<_, (String, String, String)>(
        "SELECT id, container_mount_path, content FROM app_file_mounts WHERE app_id = $1 ORDER BY container_mount_path",
    )
    .bind(app_id)
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(|(id, container_mount_path, content)| AppFileMount {
        id,
        container_mount_path,
        content,
    })
    .collect();

    let volumes = list_volumes(pool, app_id).await?;

    Ok(Some(App {
        id: row.id,
        name: row.name,
        project_id: row.project_id,
        replicas: row.replicas,
        source: ImageSource {
            image: row.image,
            registry_username: row.registry_username,
            registry_password: row.registry_password,
        },
        container_command: row.container_command,
        container_args: row.container_args,
        env_vars: row.env_vars,
        resources: ResourceSettings {
            cpu_limit: row.cpu_limit,
            cpu_reservation: row.cpu_reservation,
            memory_limit: row.memory_limit,
            memory_reservation: row.memory_reservation,
        },
        health_check: row.health_check.0,
        network: NetworkSettings {
            use_network_policy: row.use_network_policy,
            ingress,
            egress,
        },
        basic_auth: row.basic_auth.0,
        domains,
        ports,
        volumes,
        file_mounts,
    }))
}

/// Upsert an app and replace its domains, ports and file mounts.
pub async fn save_app(pool: &PgPool, app: &App) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO apps (id, name, project_id, replicas, image, registry_username, registry_password,
                          container_command, container_args, env_vars,
                          cpu_limit, cpu_reservation, memory_limit, memory_reservation,
                          health_check, use_network_policy, ingress_policy, egress_policy, basic_auth)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
        ON CONFLICT (id) DO UPDATE SET
            name = EXCLUDED.name,
            project_id = EXCLUDED.project_id,
            replicas = EXCLUDED.replicas,
            image = EXCLUDED.image,
            registry_username = EXCLUDED.registry_username,
            registry_password = EXCLUDED.registry_password,
            container_command = EXCLUDED.container_command,
            container_args = EXCLUDED.container_args,
            env_vars = EXCLUDED.env_vars,
            cpu_limit = EXCLUDED.cpu_limit,
            cpu_reservation = EXCLUDED.cpu_reservation,
            memory_limit = EXCLUDED.memory_limit,
            memory_reservation = EXCLUDED.memory_reservation,
            health_check = EXCLUDED.health_check,
            use_network_policy = EXCLUDED.use_network_policy,
            ingress_policy = EXCLUDED.ingress_policy,
            egress_policy = EXCLUDED.egress_policy,
            basic_auth = EXCLUDED.basic_auth,
            updated_at = NOW()
        "#,
    )
    .bind(&app.id)
    .bind(&app.name)
    .bind(&app.project_id)
    .bind(app.replicas)
    .bind(&app.source.image)
    .bind(&app.source.registry_username)
    .bind(&app.source.registry_password)
    .bind(&app.container_command)
    .bind(&app.container_args)
    .bind(&app.env_vars)
    .bind(app.resources.cpu_limit)
    .bind(app.resources.cpu_reservation)
    .bind(app.resources.memory_limit)
    .bind(app.resources.memory_reservation)
    .bind(Json(&app.health_check))
    .bind(app.network.use_network_policy)
    .bind(app.network.ingress.as_str())
    .bind(app.network.egress.as_str())
    .bind(Json(&app.basic_auth))
    .execute(&mut *tx)
    .await?;

    for table in ["app_domains", "app_ports", "app_file_mounts"] {
        sqlx::query(&format!("DELETE FROM {table} WHERE app_id = $1"))
            .bind(&app.id)
            .execute(&mut *tx)
            .await?;
    }

    for domain in &app.domains {
        sqlx::query(
            "INSERT INTO app_domains (id, app_id, hostname, port, use_ssl, redirect_https) VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&domain.id)
        .bind(&app.id)
        .bind(&domain.hostname)
        .bind(domain.port)
        .bind(domain.use_ssl)
        .bind(domain.redirect_https)
        .execute(&mut *tx)
        .await
        .map_err(|e| unique_violation(e, || format!("hostname {}", domain.hostname)))?;
    }

    for port in &app.ports {
        sqlx::query("INSERT INTO app_ports (id, app_id, port) VALUES ($1, $2, $3)")
            .bind(&port.id)
            .bind(&app.id)
            .bind(port.port)
            .execute(&mut *tx)
            .await
            .map_err(|e| unique_violation(e, || format!("port {}", port.port)))?;
    }

    for mount in &app.file_mounts {
        sqlx::query(
            "INSERT INTO app_file_mounts (id, app_id, container_mount_path, content) VALUES ($1, $2, $3, $4)",
        )
        .bind(&mount.id)
        .bind(&app.id)
        .bind(&mount.container_mount_path)
        .bind(&mount.content)
        .execute(&mut *tx)
        .await
        .map_err(|e| unique_violation(e, || format!("file mount path {}", mount.container_mount_path)))?;
    }

    tx.commit().await?;
    Ok(())
}

/// Delete an app; children cascade.
pub async fn delete_app(pool: &PgPool, app_id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM apps WHERE id = $1")
        .bind(app_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

// ============================================================================
// Volume Operations
// ============================================================================

/// Load one volume.
pub async fn get_volume(pool: &PgPool, volume_id: &str) -> Result<Option<AppVolume>> {
    sqlx::query_as::<_, VolumeRow>(&format!(
        "SELECT {VOLUME_COLUMNS} FROM app_volumes WHERE id = $1"
    ))
    .bind(volume_id)
    .fetch_optional(pool)
    .await?
    .map(AppVolume::try_from)
    .transpose()
}

/// Volumes of an app, ordered by mount path.
pub async fn list_volumes(pool: &PgPool, app_id: &str) -> Result<Vec<AppVolume>> {
    sqlx::query_as::<_, VolumeRow>(&format!(
        "SELECT {VOLUME_COLUMNS} FROM app_volumes WHERE app_id = $1 ORDER BY container_mount_path"
    ))
    .bind(app_id)
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(AppVolume::try_from)
    .collect()
}

/// Volumes mounting `volume_id` by reference.
pub async fn volumes_shared_from(pool: &PgPool, volume_id: &str) -> Result<Vec<AppVolume>> {
    sqlx::query_as::<_, VolumeRow>(&format!(
        "SELECT {VOLUME_COLUMNS} FROM app_volumes WHERE shared_volume_id = $1 ORDER BY app_id"
    ))
    .bind(volume_id)
    .fetch_all(pool)
    .await?
    .into_iter()
    .map(AppVolume::try_from)
    .collect()
}

/// Insert a volume record.
pub async fn insert_volume(pool: &PgPool, volume: &AppVolume) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO app_volumes (id, app_id, container_mount_path, size_mb, access_mode, storage_class, shared_volume_id)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(&volume.id)
    .bind(&volume.app_id)
    .bind(&volume.container_mount_path)
    .bind(volume.size_mb)
    .bind(volume.access_mode.as_str())
    .bind(&volume.storage_class)
    .bind(&volume.shared_volume_id)
    .execute(pool)
    .await
    .map_err(|e| unique_violation(e, || format!("mount path {}", volume.container_mount_path)))?;
    Ok(())
}

/// Update the mutable fields of a volume.
pub async fn update_volume(pool: &PgPool, volume: &AppVolume) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE app_volumes
        SET container_mount_path = $2, size_mb = $3, storage_class = $4, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(&volume.id)
    .bind(&volume.container_mount_path)
    .bind(volume.size_mb)
    .bind(&volume.storage_class)
    .execute(pool)
    .await
    .map_err(|e| unique_violation(e, || format!("mount path {}", volume.container_mount_path)))?;

    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound(format!("volume {}", volume.id)));
    }
    Ok(())
}

/// Delete a volume record.
pub async fn delete_volume(pool: &PgPool, volume_id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM app_volumes WHERE id = $1")
        .bind(volume_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Rename both volumes in one transaction.
///
/// The old volume moves first so the unique mount-path index never sees two
/// rows on the original path.
pub async fn cut_over_volumes(pool: &PgPool, cutover: &VolumeCutover) -> Result<()> {
    let mut tx = pool.begin().await?;

    for (volume_id, path) in [
        (&cutover.old_volume_id, &cutover.old_volume_path),
        (&cutover.new_volume_id, &cutover.new_volume_path),
    ] {
        let result = sqlx::query(
            "UPDATE app_volumes SET container_mount_path = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(volume_id)
        .bind(path)
        .execute(&mut *tx)
        .await
        .map_err(|e| unique_violation(e, || format!("mount path {path}")))?;

        if result.rows_affected() == 0 {
            // Dropping the transaction rolls back the first rename
            return Err(StoreError::NotFound(format!("volume {volume_id}")));
        }
    }

    tx.commit().await?;

    tracing::debug!(
        old_volume_id = %cutover.old_volume_id,
        new_volume_id = %cutover.new_volume_id,
        "Committed volume cut-over"
    );
    Ok(())
}

// ============================================================================
// Domain and Port Operations
// ============================================================================

/// Upsert a domain.
pub async fn save_domain(pool: &PgPool, app_id: &str, domain: &AppDomain) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO app_domains (id, app_id, hostname, port, use_ssl, redirect_https)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (id) DO UPDATE SET
            hostname = EXCLUDED.hostname,
            port = EXCLUDED.port,
            use_ssl = EXCLUDED.use_ssl,
            redirect_https = EXCLUDED.redirect_https
        "#,
    )
    .bind(&domain.id)
    .bind(app_id)
    .bind(&domain.hostname)
    .bind(domain.port)
    .bind(domain.use_ssl)
    .bind(domain.redirect_https)
    .execute(pool)
    .await
    .map_err(|e| unique_violation(e, || format!("hostname {}", domain.hostname)))?;
    Ok(())
}

/// Delete a domain.
pub async fn delete_domain(pool: &PgPool, domain_id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM app_domains WHERE id = $1")
        .bind(domain_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Upsert a port.
pub async fn save_port(pool: &PgPool, app_id: &str, port: &AppPort) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO app_ports (id, app_id, port) VALUES ($1, $2, $3)
        ON CONFLICT (id) DO UPDATE SET port = EXCLUDED.port
        "#,
    )
    .bind(&port.id)
    .bind(app_id)
    .bind(port.port)
    .execute(pool)
    .await
    .map_err(|e| unique_violation(e, || format!("port {}", port.port)))?;
    Ok(())
}

/// Delete a port.
pub async fn delete_port(pool: &PgPool, port_id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM app_ports WHERE id = $1")
        .bind(port_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

#[async_trait]
impl StateStore for PostgresStore {
    fn backend_type(&self) -> &'static str {
        "postgres"
    }

    async fn get_app(&self, app_id: &str) -> Result<Option<App>> {
        get_app(&self.pool, app_id).await
    }

    async fn save_app(&self, app: &App) -> Result<()> {
        save_app(&self.pool, app).await
    }

    async fn delete_app(&self, app_id: &str) -> Result<bool> {
        delete_app(&self.pool, app_id).await
    }

    async fn get_volume(&self, volume_id: &str) -> Result<Option<AppVolume>> {
        get_volume(&self.pool, volume_id).await
    }

    async fn list_volumes(&self, app_id: &str) -> Result<Vec<AppVolume>> {
        list_volumes(&self.pool, app_id).await
    }

    async fn volumes_shared_from(&self, volume_id: &str) -> Result<Vec<AppVolume>> {
        volumes_shared_from(&self.pool, volume_id).await
    }

    async fn insert_volume(&self, volume: &AppVolume) -> Result<()> {
        insert_volume(&self.pool, volume).await
    }

    async fn update_volume(&self, volume: &AppVolume) -> Result<()> {
        update_volume(&self.pool, volume).await
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<bool> {
        delete_volume(&self.pool, volume_id).await
    }

    async fn cut_over_volumes(&self, cutover: &VolumeCutover) -> Result<()> {
        cut_over_volumes(&self.pool, cutover).await
    }

    async fn save_domain(&self, app_id: &str, domain: &AppDomain) -> Result<()> {
        save_domain(&self.pool, app_id, domain).await
    }

    async fn delete_domain(&self, domain_id: &str) -> Result<bool> {
        delete_domain(&self.pool, domain_id).await
    }

    async fn save_port(&self, app_id: &str, port: &AppPort) -> Result<()> {
        save_port(&self.pool, app_id, port).await
    }

    async fn delete_port(&self, port_id: &str) -> Result<bool> {
        delete_port(&self.pool, port_id).await
    }
}
