// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistent volume reconciliation.
//!
//! Each owned volume is backed by one `PersistentVolumeClaim` named
//! `pvc-<volume_id>`. Claims are created when missing and grown in place when
//! the declared size increases; a resize is only complete once the bound
//! `PersistentVolume` reports the new capacity. Claims are never shrunk.
//!
//! Shared-reference volumes mount another app's claim and own nothing.

use std::collections::{BTreeMap, HashSet};

use k8s_openapi::api::core::v1::{
    PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cluster::{Cluster, app_labels, app_selector};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::model::{App, AppVolume};
use crate::poll::{WaitState, wait_for};
use crate::store::StateStore;

/// Label carrying the volume ID on a claim.
pub const VOLUME_ID_LABEL: &str = "keelson.io/volume-id";

/// Pod volumes and container mounts for manifest assembly.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VolumeMounts {
    /// Pod-level volumes.
    pub volumes: Vec<Volume>,
    /// Container-level mounts.
    pub volume_mounts: Vec<VolumeMount>,
}

impl VolumeMounts {
    /// Append another set.
    pub fn extend(&mut self, other: VolumeMounts) {
        self.volumes.extend(other.volumes);
        self.volume_mounts.extend(other.volume_mounts);
    }
}

/// A claim whose declared size differs from the observed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingResize {
    /// Volume ID.
    pub volume_id: String,
    /// Observed request in MiB.
    pub current_mb: i64,
    /// Declared size in MiB.
    pub declared_mb: i64,
}

/// Storage quantity for a size in MiB.
pub fn quantity_mib(size_mb: i64) -> String {
    format!("{size_mb}Mi")
}

/// Parse a Kubernetes storage quantity into MiB, rounding up.
///
/// Supports plain bytes, binary suffixes (`Ki` .. `Ti`) and decimal suffixes
/// (`k`/`K` .. `T`).
pub fn parse_quantity_mib(quantity: &str) -> Option<i64> {
    const MIB: f64 = 1024.0 * 1024.0;
    let quantity = quantity.trim();
    let split = quantity
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(quantity.len());
    let (number, suffix) = quantity.split_at(split);
    let value: f64 = number.parse().ok()?;
    let multiplier: f64 = match suffix {
        "" => 1.0,
        "Ki" => 1024.0,
        "Mi" => MIB,
        "Gi" => MIB * 1024.0,
        "Ti" => MIB * 1024.0 * 1024.0,
        "k" | "K" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        _ => return None,
    };
    Some((value * multiplier / MIB).ceil() as i64)
}

fn volume_name(volume: &AppVolume) -> String {
    format!("vol-{}", volume.id)
}

fn requested_mib(claim: &PersistentVolumeClaim) -> Option<i64> {
    let requests = claim.spec.as_ref()?.resources.as_ref()?.requests.as_ref()?;
    parse_quantity_mib(&requests.get("storage")?.0)
}

/// Claim object for an owned volume.
pub fn build_claim(app: &App, volume: &AppVolume) -> PersistentVolumeClaim {
    let mut labels = app_labels(&app.id);
    labels.insert(VOLUME_ID_LABEL.to_string(), volume.id.clone());
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(volume.claim_name()),
            namespace: Some(app.namespace().to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec![volume.access_mode.as_str().to_string()]),
            storage_class_name: Some(volume.storage_class.clone()),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(quantity_mib(volume.size_mb)),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Compare declared sizes with the observed claims.
///
/// Fails with a validation error, before anything is changed, when any
/// declared size is smaller than its claim.
pub async fn pending_resizes(cluster: &Cluster, app: &App) -> Result<Vec<PendingResize>> {
    let mut pending = Vec::new();
    for volume in app.volumes.iter().filter(|v| v.owns_claim()) {
        let Some(claim) = cluster
            .get::<PersistentVolumeClaim>(app.namespace(), &volume.claim_name())
            .await?
        else {
            continue;
        };
        let Some(current_mb) = requested_mib(&claim) else {
            continue;
        };
        if volume.size_mb < current_mb {
            return Err(Error::validation(format!(
                "volume {} cannot shrink from {current_mb}MiB to {}MiB",
                volume.container_mount_path, volume.size_mb
            )));
        }
        if volume.size_mb != current_mb {
            pending.push(PendingResize {
                volume_id: volume.id.clone(),
                current_mb,
                declared_mb: volume.size_mb,
            });
        }
    }
    Ok(pending)
}

/// Ensure every volume's claim exists with its declared size and return the
/// pod volumes and mounts.
pub async fn reconcile_volumes(
    cluster: &Cluster,
    app: &App,
    config: &EngineConfig,
    cancel: &CancellationToken,
) -> Result<VolumeMounts> {
    let namespace = app.namespace();
    let mut mounts = VolumeMounts::default();

    for volume in &app.volumes {
        let claim_name = volume.claim_name();

        if volume.owns_claim() {
            ensure_claim(cluster, app, volume, config, cancel).await?;
        } else if cluster
            .get::<PersistentVolumeClaim>(namespace, &claim_name)
            .await?
            .is_none()
        {
            return Err(Error::NotFound(format!(
                "claim {claim_name} shared into {}",
                volume.container_mount_path
            )));
        }

        mounts.volumes.push(Volume {
            name: volume_name(volume),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name,
                read_only: None,
            }),
            ..Default::default()
        });
        mounts.volume_mounts.push(VolumeMount {
            name: volume_name(volume),
            mount_path: volume.container_mount_path.clone(),
            ..Default::default()
        });
    }

    Ok(mounts)
}

async fn ensure_claim(
    cluster: &Cluster,
    app: &App,
    volume: &AppVolume,
    config: &EngineConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let namespace = app.namespace();
    let claim_name = volume.claim_name();

    let Some(claim) = cluster
        .get::<PersistentVolumeClaim>(namespace, &claim_name)
        .await?
    else {
        cluster.create(namespace, &build_claim(app, volume)).await?;
        info!(
            app_id = %app.id,
            volume_id = %volume.id,
            size_mb = volume.size_mb,
            storage_class = %volume.storage_class,
            "Created volume claim"
        );
        return Ok(());
    };

    let current_mb = requested_mib(&claim).unwrap_or(0);
    if volume.size_mb < current_mb {
        return Err(Error::validation(format!(
            "volume {} cannot shrink from {current_mb}MiB to {}MiB",
            volume.container_mount_path, volume.size_mb
        )));
    }
    if volume.size_mb == current_mb {
        debug!(volume_id = %volume.id, "Volume claim up to date");
        return Ok(());
    }

    let patch = json!({
        "spec": {"resources": {"requests": {"storage": quantity_mib(volume.size_mb)}}}
    });
    cluster
        .patch::<PersistentVolumeClaim>(namespace, &claim_name, patch)
        .await?;
    info!(
        app_id = %app.id,
        volume_id = %volume.id,
        from_mb = current_mb,
        to_mb = volume.size_mb,
        "Resizing volume claim"
    );

    wait_for_capacity(cluster, namespace, &claim_name, volume.size_mb, config, cancel).await?;
    info!(volume_id = %volume.id, size_mb = volume.size_mb, "Volume resize complete");
    Ok(())
}

/// Poll the bound persistent volume until it reports at least `size_mb`.
async fn wait_for_capacity(
    cluster: &Cluster,
    namespace: &str,
    claim_name: &str,
    size_mb: i64,
    config: &EngineConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let operation = format!("resize of {claim_name}");
    wait_for(&operation, &config.resize_wait, cancel, || async {
        let Some(claim) = cluster
            .get::<PersistentVolumeClaim>(namespace, claim_name)
            .await?
        else {
            return Ok(WaitState::Failed(format!("claim {claim_name} disappeared")));
        };
        let Some(volume_name) = claim.spec.and_then(|s| s.volume_name) else {
            return Ok(WaitState::Pending);
        };
        let Some(volume) = cluster.get::<PersistentVolume>("", &volume_name).await? else {
            return Ok(WaitState::Pending);
        };
        let capacity = volume
            .spec
            .and_then(|s| s.capacity)
            .and_then(|c| c.get("storage").map(|q| q.0.clone()));
        let state = match capacity.as_deref().and_then(parse_quantity_mib) {
            Some(mb) if mb >= size_mb => WaitState::Succeeded(()),
            Some(mb) => WaitState::InProgress(format!("capacity {mb}MiB of {size_mb}MiB")),
            None => WaitState::Pending,
        };
        Ok::<_, Error>(state)
    })
    .await
}

/// Delete labeled claims of the app that no declared volume owns.
pub async fn collect_unused_claims(cluster: &Cluster, app: &App) -> Result<Vec<String>> {
    let namespace = app.namespace();
    let owned: HashSet<String> = app
        .volumes
        .iter()
        .filter(|v| v.owns_claim())
        .map(AppVolume::claim_name)
        .collect();

    let mut removed = Vec::new();
    let claims: Vec<PersistentVolumeClaim> =
        cluster.list(namespace, Some(&app_selector(&app.id))).await?;
    for claim in claims {
        let Some(name) = claim.metadata.name else {
            continue;
        };
        if owned.contains(&name) {
            continue;
        }
        if cluster
            .delete::<PersistentVolumeClaim>(namespace, &name)
            .await?
        {
            info!(app_id = %app.id, namespace, claim = %name, "Removed unused volume claim");
            removed.push(name);
        }
    }
    Ok(removed)
}

/// Create or update a declared volume.
///
/// Size may only grow, the access mode and shared reference never change and
/// the mount path must be free within the app.
pub async fn save_volume(store: &dyn StateStore, volume: &AppVolume) -> Result<AppVolume> {
    if volume.size_mb <= 0 {
        return Err(Error::validation("volume size must be positive"));
    }
    if !volume.container_mount_path.starts_with('/') {
        return Err(Error::validation(format!(
            "mount path '{}' must be absolute",
            volume.container_mount_path
        )));
    }

    let siblings = store.list_volumes(&volume.app_id).await?;
    if siblings
        .iter()
        .any(|v| v.id != volume.id && v.container_mount_path == volume.container_mount_path)
    {
        return Err(Error::conflict(format!(
            "mount path {} is already used by another volume",
            volume.container_mount_path
        )));
    }

    let Some(existing) = store.get_volume(&volume.id).await? else {
        if let Some(source_id) = &volume.shared_volume_id {
            let source = store
                .get_volume(source_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("volume {source_id}")))?;
            if !source.owns_claim() {
                return Err(Error::validation("cannot share a volume that is itself shared"));
            }
            if source.access_mode != crate::model::AccessMode::ReadWriteMany
                || volume.access_mode != crate::model::AccessMode::ReadWriteMany
            {
                return Err(Error::validation("shared volumes must be ReadWriteMany"));
            }
        }
        store.insert_volume(volume).await?;
        info!(volume_id = %volume.id, app_id = %volume.app_id, "Declared volume");
        return Ok(volume.clone());
    };

    if existing.app_id != volume.app_id {
        return Err(Error::validation("a volume cannot move to another app"));
    }
    if existing.access_mode != volume.access_mode {
        return Err(Error::validation(format!(
            "access mode of {} is immutable ({})",
            existing.container_mount_path, existing.access_mode
        )));
    }
    if existing.shared_volume_id != volume.shared_volume_id {
        return Err(Error::validation("shared volume reference is immutable"));
    }
    if existing.storage_class != volume.storage_class {
        return Err(Error::validation(format!(
            "storage class of {} is {}; use migrate_volume to move it to {}",
            existing.container_mount_path, existing.storage_class, volume.storage_class
        )));
    }
    if volume.size_mb < existing.size_mb {
        return Err(Error::validation(format!(
            "volume {} cannot shrink from {}MiB to {}MiB",
            existing.container_mount_path, existing.size_mb, volume.size_mb
        )));
    }

    store.update_volume(volume).await?;
    Ok(volume.clone())
}

/// Delete a declared volume and its claim.
///
/// Refused while other apps mount the volume by reference.
pub async fn delete_volume(
    cluster: &Cluster,
    store: &dyn StateStore,
    namespace: &str,
    volume_id: &str,
) -> Result<bool> {
    let Some(volume) = store.get_volume(volume_id).await? else {
        return Ok(false);
    };
    let dependants = store.volumes_shared_from(volume_id).await?;
    if !dependants.is_empty() {
        let apps: Vec<&str> = dependants.iter().map(|v| v.app_id.as_str()).collect();
        return Err(Error::conflict(format!(
            "volume {} is shared with {}",
            volume.container_mount_path,
            apps.join(", ")
        )));
    }

    store.delete_volume(volume_id).await?;
    if volume.owns_claim() {
        cluster
            .delete::<PersistentVolumeClaim>(namespace, &volume.claim_name())
            .await?;
    }
    info!(volume_id, app_id = %volume.app_id, "Deleted volume");
    Ok(true)
}
