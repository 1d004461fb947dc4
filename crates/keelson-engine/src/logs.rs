// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deployment logs and pod logs.
//!
//! Every deployment writes its steps to
//! `{data_dir}/deployments/{app_id}/{deployment_id}.log`, which callers can
//! tail while the deployment runs and read back afterwards.

use std::path::{Path, PathBuf};

use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::cluster::{APP_LABEL, Cluster};
use crate::error::{Error, Result};

/// Path of a deployment's log file.
pub fn deployment_log_path(data_dir: &Path, app_id: &str, deployment_id: &str) -> PathBuf {
    data_dir
        .join("deployments")
        .join(app_id)
        .join(format!("{deployment_id}.log"))
}

/// Append-only step log of one deployment.
pub struct DeploymentLog {
    deployment_id: String,
    path: PathBuf,
    file: File,
}

impl DeploymentLog {
    /// Create the log file, and its directory if needed.
    pub async fn create(data_dir: &Path, app_id: &str, deployment_id: &str) -> Result<Self> {
        let path = deployment_log_path(data_dir, app_id, deployment_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            deployment_id: deployment_id.to_string(),
            path,
            file,
        })
    }

    /// Deployment ID.
    pub fn deployment_id(&self) -> &str {
        &self.deployment_id
    }

    /// Log file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a timestamped line.
    ///
    /// A failing write never fails the deployment.
    pub async fn step(&mut self, message: impl AsRef<str>) {
        let line = format!("[{}] {}\n", Utc::now().to_rfc3339(), message.as_ref());
        let written = async {
            self.file.write_all(line.as_bytes()).await?;
            self.file.flush().await
        }
        .await;
        if let Err(e) = written {
            warn!(
                deployment_id = %self.deployment_id,
                path = %self.path.display(),
                error = %e,
                "Failed to write deployment log"
            );
        }
    }
}

/// Read a finished or running deployment's log.
pub async fn read_deployment_log(data_dir: &Path, app_id: &str, deployment_id: &str) -> Result<String> {
    let path = deployment_log_path(data_dir, app_id, deployment_id);
    match fs::read_to_string(&path).await {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound(format!(
            "deployment log {deployment_id} of app {app_id}"
        ))),
        Err(e) => Err(e.into()),
    }
}

/// Deployment IDs with a log, oldest first by modification time.
pub async fn list_deployment_logs(data_dir: &Path, app_id: &str) -> Result<Vec<String>> {
    let dir = data_dir.join("deployments").join(app_id);
    let mut entries = match fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(e.into()),
    };

    let mut logs = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("log") {
            continue;
        }
        let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let modified = entry.metadata().await?.modified()?;
        logs.push((modified, id.to_string()));
    }
    logs.sort();
    Ok(logs.into_iter().map(|(_, id)| id).collect())
}

/// Log of one pod of an app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodLog {
    /// Pod name.
    pub pod: String,
    /// Log content.
    pub log: String,
}

/// Logs of every pod of an app's workload container.
pub async fn app_pod_logs(
    cluster: &Cluster,
    namespace: &str,
    app_id: &str,
    tail_lines: Option<i64>,
) -> Result<Vec<PodLog>> {
    let pods: Vec<Pod> = cluster
        .list(namespace, Some(&format!("{APP_LABEL}={app_id}")))
        .await?;

    let mut logs = Vec::with_capacity(pods.len());
    for pod in pods {
        let Some(name) = pod.metadata.name else {
            continue;
        };
        let log = cluster.pod_logs(namespace, &name, app_id, tail_lines).await?;
        logs.push(PodLog { pod: name, log });
    }
    Ok(logs)
}
