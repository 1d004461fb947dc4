// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Keelson Engine - Deployment & Storage Reconciliation
//!
//! This crate turns the declared state of tenant apps (image, replicas,
//! ports, domains, volumes, health checks, network isolation) into Kubernetes
//! objects, applies them idempotently and drives the stateful transitions a
//! single apply cannot express: claim resizes, storage-class migration and
//! scale-to-zero.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Callers (CLI, platform API)                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        keelson-engine (This Crate)                       │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐     │
//! │  │ Deployment  │  │   Volume    │  │  Storage    │  │  Ingress &  │     │
//! │  │ Synthesizer │  │ Reconciler  │  │  Migration  │  │ Basic Auth  │     │
//! │  └─────────────┘  └─────────────┘  └─────────────┘  └─────────────┘     │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐                      │
//! │  │  Network    │  │  Service    │  │ Config maps │                      │
//! │  │  Policy     │  │  Ports      │  │ Pull secret │                      │
//! │  └─────────────┘  └─────────────┘  └─────────────┘                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │                                                 │
//!           ▼                                                 ▼
//! ┌───────────────────────────┐               ┌───────────────────────────┐
//! │   Declared-State Store    │               │   Cluster Control API     │
//! │  (PostgreSQL / memory)    │               │   (kube / mock)           │
//! └───────────────────────────┘               └───────────────────────────┘
//! ```
//!
//! # Deploy Flow
//!
//! 1. Validate (replicas vs. access modes, args, probes, image)
//! 2. Tear down file browsers
//! 3. Ensure the namespace
//! 4. Scale to zero when a claim must grow
//! 5. Reconcile volumes and config-file mounts
//! 6. Environment variables
//! 7. Network policy
//! 8. Manifest assembly
//! 9. Rollout strategy (`Recreate` with any ReadWriteOnce volume)
//! 10. Apply
//! 11. Cleanup: config maps, claims, Service, pull secret, ingress
//!
//! # Storage Migration State Machine
//!
//! ```text
//!   ┌───────────┐    ┌──────────────┐    ┌──────────────────────┐
//!   │ REQUESTED │───►│ SCALED TO 0  │───►│ TARGET CLAIM CREATED │
//!   └───────────┘    └──────────────┘    └──────────┬───────────┘
//!                                                   │
//!                                                   ▼
//!                                        ┌──────────────────────┐
//!                                        │  COPY JOB RUNNING    │
//!                                        └──────────┬───────────┘
//!                                     success       │       failure
//!                                 ┌─────────────────┴──────────────┐
//!                                 ▼                                ▼
//!                      ┌────────────────────┐           ┌─────────────────┐
//!                      │ CUT-OVER COMMITTED │           │   ROLLED BACK   │
//!                      └────────────────────┘           └─────────────────┘
//! ```
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `KEELSON_DATABASE_URL` | Yes | - | PostgreSQL connection string |
//! | `KEELSON_DATA_DIR` | No | `.data` | Deployment log directory |
//! | `KEELSON_CREDENTIAL_KEY` | No | - | Base64 AES-256 key for basic-auth credentials |
//! | `KEELSON_COPY_JOB_IMAGE` | No | `instrumentisto/rsync-ssh:latest` | Copy job image |
//! | `KEELSON_DEFAULT_STORAGE_CLASS` | No | `longhorn` | Storage class when unset |
//! | `KEELSON_CERT_ISSUER` | No | `letsencrypt-production` | cert-manager cluster issuer |
//! | `KEELSON_ROUTER_NAMESPACE` | No | `kube-system` | Ingress router namespace |
//! | `KEELSON_ROUTER_DEPLOYMENT` | No | `traefik` | Ingress router deployment |

#![deny(missing_docs)]

/// Database migrations for the declared-state schema.
///
/// ```ignore
/// use keelson_engine::migrations;
///
/// let pool = PgPool::connect(&database_url).await?;
/// migrations::run(&pool).await?;
/// ```
pub mod migrations;

/// Configuration loaded from environment variables.
pub mod config;

/// Error types for engine operations.
pub mod error;

/// Declared app model.
pub mod model;

/// Bounded, cancellable polling.
pub mod poll;

/// Cluster control API, its Kubernetes backend and the test double.
pub mod cluster;

/// Declared-state store backends.
pub mod store;

/// Service port aggregation.
pub mod service_ports;

/// Network policy synthesis.
pub mod network_policy;

/// Basic-auth secrets and middleware.
pub mod basic_auth;

/// Ingress routing and router restarts.
pub mod ingress;

/// Persistent volume reconciliation.
pub mod volumes;

/// Config-file mounts.
pub mod config_maps;

/// Image pull secrets.
pub mod registry_secret;

/// File browser teardown.
pub mod file_browser;

/// Deployment and pod logs.
pub mod logs;

/// Deployment synthesis.
pub mod deployment;

/// Storage-class migration.
pub mod storage_migration;

/// Engine entry point.
pub mod engine;

pub use config::{Config, EngineConfig};
pub use engine::Engine;
pub use error::{Error, ErrorKind};
