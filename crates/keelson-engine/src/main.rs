// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Keelson Engine - operator CLI
//!
//! Runs one engine operation against the configured cluster and
//! declared-state store:
//! - `deploy`: reconcile an app's workload, storage and routing
//! - `migrate-volume`: move a volume to another storage class
//! - `delete-app`: remove an app and every object it owns
//! - `logs`: deployment step log or pod logs
//! - `restart-router`: roll the ingress router
//! - `show-basic-auth`: reveal an app's basic-auth credentials

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use keelson_engine::cluster::KubeCluster;
use keelson_engine::config::Config;
use keelson_engine::deployment::DeployRequest;
use keelson_engine::engine::Engine;
use keelson_engine::migrations;
use keelson_engine::model::BuildRef;
use keelson_engine::store::PostgresStore;

/// Keelson deployment and storage reconciliation engine
#[derive(Parser)]
#[command(name = "keelson-engine", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Deploy an app from its declared state
    Deploy {
        /// App ID
        app_id: String,
        /// Deployment ID (generated when omitted)
        #[arg(long)]
        deployment_id: Option<String>,
        /// Image produced by a build; overrides the declared image
        #[arg(long)]
        image: Option<String>,
        /// Commit the built image comes from
        #[arg(long, requires = "image")]
        git_commit: Option<String>,
        /// Build job that produced the image
        #[arg(long, requires = "image")]
        build_job: Option<String>,
        /// Reason recorded on the rollout
        #[arg(long)]
        change_cause: Option<String>,
    },

    /// Migrate a volume to another storage class
    MigrateVolume {
        /// Volume ID
        volume_id: String,
        /// Target storage class
        #[arg(long)]
        storage_class: String,
    },

    /// Delete an app and all of its cluster objects
    DeleteApp {
        /// App ID
        app_id: String,
    },

    /// Show a deployment log, or pod logs when no deployment is given
    Logs {
        /// App ID
        app_id: String,
        /// Deployment ID
        #[arg(long)]
        deployment_id: Option<String>,
        /// Lines per pod
        #[arg(long, default_value_t = 200)]
        tail: i64,
    },

    /// Restart the ingress router and wait until it is ready
    RestartRouter,

    /// Print an app's basic-auth credentials
    ShowBasicAuth {
        /// App ID
        app_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keelson_engine=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;
    migrations::run(&pool).await?;
    info!("Database schema verified");

    let cluster = KubeCluster::try_default().await?;
    let engine = Engine::builder()
        .cluster(Arc::new(cluster))
        .store(Arc::new(PostgresStore::new(pool)))
        .config(config.engine_config())
        .build()?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received, cancelling");
            on_signal.cancel();
        }
    });

    match cli.command {
        Command::Deploy {
            app_id,
            deployment_id,
            image,
            git_commit,
            build_job,
            change_cause,
        } => {
            let request = DeployRequest {
                deployment_id: deployment_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
                build: image.map(|image| BuildRef {
                    image,
                    git_commit,
                    job_name: build_job,
                }),
                change_cause,
            };
            let report = engine.deploy(&app_id, &request, &cancel).await?;
            println!("deployment {} {:?}", report.deployment_id, report.outcome);
            for resize in &report.resized {
                println!(
                    "  resized {} {}MiB -> {}MiB",
                    resize.volume_id, resize.current_mb, resize.declared_mb
                );
            }
            for ingress in &report.ingress.applied {
                println!("  ingress {ingress}");
            }
            println!("  log {}", report.log_path.display());
        }
        Command::MigrateVolume {
            volume_id,
            storage_class,
        } => {
            let report = engine
                .migrate_volume(&volume_id, &storage_class, &cancel)
                .await?;
            println!(
                "{} now on {} (volume {}); previous data kept at {}",
                report.mount_path,
                report.storage_class,
                report.record.new_volume_id,
                report.old_mount_path
            );
        }
        Command::DeleteApp { app_id } => {
            let report = engine.delete_app(&app_id).await?;
            for object in &report.removed {
                println!("deleted {object}");
            }
        }
        Command::Logs {
            app_id,
            deployment_id: Some(deployment_id),
            ..
        } => {
            print!("{}", engine.deployment_log(&app_id, &deployment_id).await?);
        }
        Command::Logs { app_id, tail, .. } => {
            for log in engine.pod_logs(&app_id, Some(tail)).await? {
                println!("==> {} <==", log.pod);
                print!("{}", log.log);
            }
        }
        Command::RestartRouter => {
            engine.restart_ingress_router(&cancel).await?;
            println!("ingress router ready");
        }
        Command::ShowBasicAuth { app_id } => {
            for entry in engine.reveal_basic_auth(&app_id).await? {
                println!("{}:{}", entry.username, entry.password);
            }
        }
    }

    Ok(())
}
