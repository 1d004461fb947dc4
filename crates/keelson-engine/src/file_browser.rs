// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Teardown of the per-volume file browser.
//!
//! Operators can browse a volume through a short-lived `fb-<volume_id>`
//! Deployment, Service and Ingress. The browser mounts the app's claim, so it
//! must be gone before the app is redeployed or a single-writer claim stays
//! attached to the browser pod.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use tracing::info;

use crate::cluster::Cluster;
use crate::error::Result;
use crate::model::App;

/// Name shared by the browser's objects.
pub fn file_browser_name(volume_id: &str) -> String {
    format!("fb-{volume_id}")
}

/// Delete every file browser attached to the app's volumes.
///
/// Returns the volume IDs whose browser was running.
pub async fn teardown_file_browsers(cluster: &Cluster, app: &App) -> Result<Vec<String>> {
    let namespace = app.namespace();
    let mut removed = Vec::new();

    for volume in &app.volumes {
        let name = file_browser_name(&volume.id);
        let deployment = cluster.delete::<Deployment>(namespace, &name).await?;
        let service = cluster.delete::<Service>(namespace, &name).await?;
        let ingress = cluster.delete::<Ingress>(namespace, &name).await?;
        if deployment || service || ingress {
            info!(app_id = %app.id, volume_id = %volume.id, "Removed file browser");
            removed.push(volume.id.clone());
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockCluster;
    use crate::model::AccessMode;
    use crate::model::fixtures::{app, volume};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_browser_objects_removed() {
        let mock = Arc::new(MockCluster::new());
        let cluster = Cluster::new(mock.clone());
        let mut app = app("a1");
        app.volumes = vec![
            volume("v1", "a1", "/data", 100, AccessMode::ReadWriteOnce),
            volume("v2", "a1", "/cache", 100, AccessMode::ReadWriteOnce),
        ];

        let service = Service {
            metadata: ObjectMeta {
                name: Some("fb-v1".into()),
                ..Default::default()
            },
            ..Default::default()
        };
        mock.seed("proj-1", &service).await;

        assert_eq!(teardown_file_browsers(&cluster, &app).await.unwrap(), vec!["v1"]);
        assert!(mock.names("Service", "proj-1").await.is_empty());
    }
}
