// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Image pull secret for apps pulling from a private registry.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::json;
use tracing::info;

use crate::cluster::{Cluster, app_labels};
use crate::error::Result;
use crate::model::App;

const DOCKER_CONFIG_KEY: &str = ".dockerconfigjson";
const DOCKER_CONFIG_TYPE: &str = "kubernetes.io/dockerconfigjson";

/// Name of an app's pull secret.
pub fn registry_secret_name(app_id: &str) -> String {
    format!("{app_id}-registry")
}

/// Whether the app pulls its declared image with credentials.
///
/// Images produced by a build are pulled from the platform registry and
/// never use the app's credentials.
pub fn needs_pull_secret(app: &App, built: bool) -> bool {
    !built && app.source.image.is_some() && app.source.has_credentials()
}

fn build_secret(app: &App) -> Result<Secret> {
    let username = app.source.registry_username.as_deref().unwrap_or_default();
    let password = app.source.registry_password.as_deref().unwrap_or_default();
    let config = json!({
        "auths": {
            app.source.registry_host(): {
                "username": username,
                "password": password,
                "auth": BASE64.encode(format!("{username}:{password}")),
            }
        }
    });

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(registry_secret_name(&app.id)),
            namespace: Some(app.namespace().to_string()),
            labels: Some(app_labels(&app.id)),
            ..Default::default()
        },
        type_: Some(DOCKER_CONFIG_TYPE.to_string()),
        data: Some(BTreeMap::from([(
            DOCKER_CONFIG_KEY.to_string(),
            ByteString(serde_json::to_vec(&config)?),
        )])),
        ..Default::default()
    })
}

/// Apply the pull secret when needed and return its name.
pub async fn reconcile_registry_secret(
    cluster: &Cluster,
    app: &App,
    built: bool,
) -> Result<Option<String>> {
    if !needs_pull_secret(app, built) {
        return Ok(None);
    }
    cluster.apply(app.namespace(), &build_secret(app)?).await?;
    Ok(Some(registry_secret_name(&app.id)))
}

/// Delete the pull secret when the deployment no longer references it.
pub async fn collect_unused_registry_secret(cluster: &Cluster, app: &App, built: bool) -> Result<bool> {
    if needs_pull_secret(app, built) {
        return Ok(false);
    }
    let removed = cluster
        .delete::<Secret>(app.namespace(), &registry_secret_name(&app.id))
        .await?;
    if removed {
        info!(app_id = %app.id, "Removed unused registry secret");
    }
    Ok(removed)
}
