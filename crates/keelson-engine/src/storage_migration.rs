// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Storage-class migration.
//!
//! Moves a volume's data to a claim on another storage class while the app
//! is scaled to zero:
//!
//! ```text
//! Requested -> ScaledToZero -> TargetClaimCreated -> CopyJobRunning
//!     -> CutOverCommitted
//!     -> RolledBack
//! ```
//!
//! The replacement volume lives at `<path>_migrating` while a `migrate-<id>`
//! job mirrors the data. Cut-over swaps the mount paths in one store
//! transaction: the old volume moves to `<path>_old` and keeps its data. Any
//! failure once the replacement exists deletes its claim and record, leaving
//! the original volume untouched.
//!
//! The job name is derived from the volume ID, so a second migration of the
//! same volume finds the first one's job and is refused.

use std::fmt;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, PersistentVolumeClaim, PersistentVolumeClaimVolumeSource, PodSpec,
    PodTemplateSpec, Volume, VolumeMount,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cluster::{Cluster, JOB_TYPE_LABEL, app_labels};
use crate::config::EngineConfig;
use crate::deployment::scale_to_zero;
use crate::error::{Error, Result};
use crate::model::{App, AppVolume};
use crate::poll::{WaitState, wait_for};
use crate::store::{StateStore, VolumeCutover};
use crate::volumes::{VOLUME_ID_LABEL, build_claim};

/// Mount-path suffix of the replacement volume while data is copied.
pub const MIGRATING_SUFFIX: &str = "_migrating";
/// Mount-path suffix the original volume moves to at cut-over.
pub const OLD_SUFFIX: &str = "_old";
/// Value of the job-type label on copy jobs.
pub const MIGRATION_JOB_TYPE: &str = "migration";

const JOB_TTL_SECONDS: i32 = 86_400;
const SOURCE_MOUNT: &str = "/source";
const TARGET_MOUNT: &str = "/target";

/// Name of the copy job for a volume.
pub fn job_name(volume_id: &str) -> String {
    format!("migrate-{volume_id}")
}

/// Where a migration got to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationPhase {
    /// Guards passed.
    Requested,
    /// The app has no running pods.
    ScaledToZero,
    /// Replacement record and claim exist.
    TargetClaimCreated,
    /// Copy job launched.
    CopyJobRunning,
    /// Replacement is active at the original path.
    CutOverCommitted,
    /// Replacement removed after a failure.
    RolledBack,
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MigrationPhase::Requested => "requested",
            MigrationPhase::ScaledToZero => "scaled-to-zero",
            MigrationPhase::TargetClaimCreated => "target-claim-created",
            MigrationPhase::CopyJobRunning => "copy-job-running",
            MigrationPhase::CutOverCommitted => "cut-over-committed",
            MigrationPhase::RolledBack => "rolled-back",
        };
        f.write_str(name)
    }
}

/// A migration in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRecord {
    /// Volume being migrated.
    pub volume_id: String,
    /// Replacement volume.
    pub new_volume_id: String,
    /// Copy job.
    pub job_name: String,
    /// Namespace of both claims and the job.
    pub namespace: String,
}

/// Result of a committed migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    /// Migration identifiers.
    pub record: MigrationRecord,
    /// Always [`MigrationPhase::CutOverCommitted`].
    pub phase: MigrationPhase,
    /// Path now served by the replacement.
    pub mount_path: String,
    /// Path the original volume moved to.
    pub old_mount_path: String,
    /// Storage class of the replacement.
    pub storage_class: String,
}

/// Copy job state.
pub fn job_state(job: Option<&Job>) -> WaitState<()> {
    let Some(job) = job else {
        return WaitState::Failed("job disappeared".to_string());
    };
    let Some(status) = job.status.as_ref() else {
        return WaitState::Pending;
    };
    if status.succeeded.unwrap_or(0) > 0 {
        return WaitState::Succeeded(());
    }
    if status.failed.unwrap_or(0) > 0 {
        let reason = status
            .conditions
            .iter()
            .flatten()
            .find(|c| c.type_ == "Failed")
            .and_then(|c| c.message.clone())
            .unwrap_or_else(|| "job failed".to_string());
        return WaitState::Failed(reason);
    }
    if status.active.unwrap_or(0) > 0 {
        return WaitState::InProgress("copying".to_string());
    }
    WaitState::Pending
}

/// Copy job mirroring the source claim onto the target claim.
pub fn build_copy_job(
    app: &App,
    source: &AppVolume,
    target: &AppVolume,
    config: &EngineConfig,
) -> Job {
    let mut labels = app_labels(&app.id);
    labels.insert(VOLUME_ID_LABEL.to_string(), source.id.clone());
    labels.insert(JOB_TYPE_LABEL.to_string(), MIGRATION_JOB_TYPE.to_string());

    let claim_volume = |name: &str, claim: String, read_only: bool| Volume {
        name: name.to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: claim,
            read_only: read_only.then_some(true),
        }),
        ..Default::default()
    };

    Job {
        metadata: ObjectMeta {
            name: Some(job_name(&source.id)),
            namespace: Some(app.namespace().to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            ttl_seconds_after_finished: Some(JOB_TTL_SECONDS),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("Never".to_string()),
                    containers: vec![Container {
                        name: "copy".to_string(),
                        image: Some(config.copy_job_image.clone()),
                        command: Some(vec![
                            "rsync".to_string(),
                            "-a".to_string(),
                            "--delete".to_string(),
                            format!("{SOURCE_MOUNT}/"),
                            format!("{TARGET_MOUNT}/"),
                        ]),
                        volume_mounts: Some(vec![
                            VolumeMount {
                                name: "source".to_string(),
                                mount_path: SOURCE_MOUNT.to_string(),
                                read_only: Some(true),
                                ..Default::default()
                            },
                            VolumeMount {
                                name: "target".to_string(),
                                mount_path: TARGET_MOUNT.to_string(),
                                ..Default::default()
                            },
                        ]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![
                        claim_volume("source", source.claim_name(), true),
                        claim_volume("target", target.claim_name(), false),
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Migrate a volume to `target_class`.
///
/// Guards run before anything is changed. A failure after the replacement
/// record exists rolls it back and returns the original error.
pub async fn migrate_volume(
    cluster: &Cluster,
    store: &dyn StateStore,
    config: &EngineConfig,
    volume_id: &str,
    target_class: &str,
    cancel: &CancellationToken,
) -> Result<MigrationReport> {
    let volume = store
        .get_volume(volume_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("volume {volume_id}")))?;
    let app = store
        .get_app(&volume.app_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("app {}", volume.app_id)))?;
    let namespace = app.namespace().to_string();

    check_guards(cluster, store, &app, &volume, target_class).await?;
    let record = MigrationRecord {
        volume_id: volume.id.clone(),
        new_volume_id: Uuid::new_v4().to_string(),
        job_name: job_name(&volume.id),
        namespace: namespace.clone(),
    };
    info!(
        app_id = %app.id,
        volume_id,
        from = %volume.storage_class,
        to = target_class,
        phase = %MigrationPhase::Requested,
        "Storage migration requested"
    );

    scale_to_zero(cluster, &app, config, cancel).await?;
    info!(app_id = %app.id, volume_id, phase = %MigrationPhase::ScaledToZero, "Storage migration");

    let target = AppVolume {
        id: record.new_volume_id.clone(),
        app_id: app.id.clone(),
        container_mount_path: format!("{}{MIGRATING_SUFFIX}", volume.container_mount_path),
        size_mb: volume.size_mb,
        access_mode: volume.access_mode,
        storage_class: target_class.to_string(),
        shared_volume_id: None,
    };
    store.insert_volume(&target).await?;

    match copy_and_cut_over(cluster, store, config, &app, &volume, &target, &record, cancel).await {
        Ok(()) => {
            info!(
                app_id = %app.id,
                volume_id,
                new_volume_id = %record.new_volume_id,
                phase = %MigrationPhase::CutOverCommitted,
                "Storage migration complete"
            );
            Ok(MigrationReport {
                phase: MigrationPhase::CutOverCommitted,
                mount_path: volume.container_mount_path.clone(),
                old_mount_path: format!("{}{OLD_SUFFIX}", volume.container_mount_path),
                storage_class: target_class.to_string(),
                record,
            })
        }
        Err(e) => {
            error!(
                app_id = %app.id,
                volume_id,
                error = %e,
                "Storage migration failed, rolling back"
            );
            rollback(cluster, store, &target, &record).await;
            info!(app_id = %app.id, volume_id, phase = %MigrationPhase::RolledBack, "Storage migration");
            Err(e)
        }
    }
}

async fn check_guards(
    cluster: &Cluster,
    store: &dyn StateStore,
    app: &App,
    volume: &AppVolume,
    target_class: &str,
) -> Result<()> {
    if !volume.owns_claim() {
        return Err(Error::validation(
            "a shared volume reference has no claim of its own to migrate",
        ));
    }
    let dependants = store.volumes_shared_from(&volume.id).await?;
    if !dependants.is_empty() {
        let apps: Vec<&str> = dependants.iter().map(|v| v.app_id.as_str()).collect();
        return Err(Error::validation(format!(
            "volume {} is shared with {} and cannot be migrated",
            volume.container_mount_path,
            apps.join(", ")
        )));
    }
    if volume.storage_class == target_class {
        return Err(Error::validation(format!(
            "volume {} already uses storage class {target_class}",
            volume.container_mount_path
        )));
    }

    let namespace = app.namespace();
    let name = job_name(&volume.id);
    if let Some(job) = cluster.get::<Job>(namespace, &name).await? {
        match job_state(Some(&job)) {
            WaitState::Succeeded(()) | WaitState::Failed(_) => {
                cluster.delete::<Job>(namespace, &name).await?;
                info!(volume_id = %volume.id, job = %name, "Removed finished copy job");
            }
            _ => {
                return Err(Error::conflict(format!(
                    "a migration of volume {} is already running",
                    volume.container_mount_path
                )));
            }
        }
    }

    let siblings = store.list_volumes(&app.id).await?;
    for suffix in [MIGRATING_SUFFIX, OLD_SUFFIX] {
        let path = format!("{}{suffix}", volume.container_mount_path);
        if siblings.iter().any(|v| v.container_mount_path == path) {
            return Err(Error::conflict(format!(
                "mount path {path} is occupied; remove it before migrating again"
            )));
        }
    }

    if cluster
        .get::<StorageClass>("", target_class)
        .await?
        .is_none()
    {
        return Err(Error::validation(format!(
            "storage class {target_class} does not exist"
        )));
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn copy_and_cut_over(
    cluster: &Cluster,
    store: &dyn StateStore,
    config: &EngineConfig,
    app: &App,
    source: &AppVolume,
    target: &AppVolume,
    record: &MigrationRecord,
    cancel: &CancellationToken,
) -> Result<()> {
    let namespace = record.namespace.as_str();

    cluster.create(namespace, &build_claim(app, target)).await?;
    info!(
        volume_id = %source.id,
        new_volume_id = %target.id,
        storage_class = %target.storage_class,
        phase = %MigrationPhase::TargetClaimCreated,
        "Storage migration"
    );

    cluster
        .create(namespace, &build_copy_job(app, source, target, config))
        .await?;
    info!(
        volume_id = %source.id,
        job = %record.job_name,
        phase = %MigrationPhase::CopyJobRunning,
        "Storage migration"
    );

    let operation = format!("copy job {}", record.job_name);
    wait_for(&operation, &config.migration_wait, cancel, || async {
        let job = cluster.get::<Job>(namespace, &record.job_name).await?;
        Ok::<_, Error>(job_state(job.as_ref()))
    })
    .await?;

    store
        .cut_over_volumes(&VolumeCutover {
            old_volume_id: source.id.clone(),
            old_volume_path: format!("{}{OLD_SUFFIX}", source.container_mount_path),
            new_volume_id: target.id.clone(),
            new_volume_path: source.container_mount_path.clone(),
        })
        .await?;
    Ok(())
}

/// Remove the replacement volume. Failures are logged; the original error is
/// what the caller sees.
async fn rollback(
    cluster: &Cluster,
    store: &dyn StateStore,
    target: &AppVolume,
    record: &MigrationRecord,
) {
    let namespace = record.namespace.as_str();
    if let Err(e) = cluster.delete::<Job>(namespace, &record.job_name).await {
        warn!(job = %record.job_name, error = %e, "Rollback could not delete copy job");
    }
    if let Err(e) = cluster
        .delete::<PersistentVolumeClaim>(namespace, &target.claim_name())
        .await
    {
        warn!(claim = %target.claim_name(), error = %e, "Rollback could not delete target claim");
    }
    if let Err(e) = store.delete_volume(&target.id).await {
        warn!(new_volume_id = %target.id, error = %e, "Rollback could not delete target volume record");
    }
}
