// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Config-file mounts.
//!
//! Each declared file mount becomes a `ConfigMap` named `fm-<mount_id>` with
//! the file under a single `content` key, mounted with `subPath` so only that
//! file appears at the mount path.

use std::collections::{BTreeMap, HashSet};

use k8s_openapi::api::core::v1::{ConfigMap, ConfigMapVolumeSource, Volume, VolumeMount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use sha2::{Digest, Sha256};
use tracing::info;

use crate::cluster::{Cluster, app_labels, app_selector};
use crate::error::Result;
use crate::model::{App, AppFileMount};
use crate::volumes::VolumeMounts;

const CONTENT_KEY: &str = "content";

/// Name of the config map backing a file mount.
pub fn config_map_name(mount_id: &str) -> String {
    format!("fm-{mount_id}")
}

/// Checksum over every mounted file, written to the pod template so content
/// changes roll the pods.
pub fn file_mounts_checksum(mounts: &[AppFileMount]) -> String {
    let mut sorted: Vec<&AppFileMount> = mounts.iter().collect();
    sorted.sort_by(|a, b| a.container_mount_path.cmp(&b.container_mount_path));

    let mut hasher = Sha256::new();
    for mount in sorted {
        hasher.update(mount.container_mount_path.as_bytes());
        hasher.update([0]);
        hasher.update(mount.content.as_bytes());
        hasher.update([0]);
    }
    format!("{:x}", hasher.finalize())
}

fn build_config_map(app: &App, mount: &AppFileMount) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(config_map_name(&mount.id)),
            namespace: Some(app.namespace().to_string()),
            labels: Some(app_labels(&app.id)),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            CONTENT_KEY.to_string(),
            mount.content.clone(),
        )])),
        ..Default::default()
    }
}

/// Apply a config map per file mount and return the pod volumes and mounts.
pub async fn reconcile_config_maps(cluster: &Cluster, app: &App) -> Result<VolumeMounts> {
    let mut mounts = VolumeMounts::default();
    for mount in &app.file_mounts {
        let name = config_map_name(&mount.id);
        cluster
            .apply(app.namespace(), &build_config_map(app, mount))
            .await?;

        mounts.volumes.push(Volume {
            name: name.clone(),
            config_map: Some(ConfigMapVolumeSource {
                name: name.clone(),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.volume_mounts.push(VolumeMount {
            name,
            mount_path: mount.container_mount_path.clone(),
            sub_path: Some(CONTENT_KEY.to_string()),
            read_only: Some(true),
            ..Default::default()
        });
    }
    Ok(mounts)
}

/// Delete the app's config maps that no file mount declares.
pub async fn collect_unused_config_maps(cluster: &Cluster, app: &App) -> Result<Vec<String>> {
    let namespace = app.namespace();
    let declared: HashSet<String> = app
        .file_mounts
        .iter()
        .map(|m| config_map_name(&m.id))
        .collect();

    let mut removed = Vec::new();
    let observed: Vec<ConfigMap> = cluster.list(namespace, Some(&app_selector(&app.id))).await?;
    for config_map in observed {
        let Some(name) = config_map.metadata.name else {
            continue;
        };
        if declared.contains(&name) {
            continue;
        }
        if cluster.delete::<ConfigMap>(namespace, &name).await? {
            info!(app_id = %app.id, namespace, config_map = %name, "Removed unused config map");
            removed.push(name);
        }
    }
    Ok(removed)
}
