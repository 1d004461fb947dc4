// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for keelson-engine.

use std::path::PathBuf;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::poll::PollPolicy;

/// Engine configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL for the declared-state store
    pub database_url: String,
    /// Data directory for deployment logs
    pub data_dir: PathBuf,
    /// AES-256 key used to encrypt redisplayable basic-auth credentials
    pub credential_key: Option<[u8; 32]>,
    /// Image used by storage-class migration copy jobs
    pub copy_job_image: String,
    /// Storage class used when a volume does not name one
    pub default_storage_class: String,
    /// cert-manager cluster issuer for TLS-enabled domains
    pub cert_issuer: String,
    /// Namespace the ingress router runs in
    pub router_namespace: String,
    /// Name of the ingress router deployment
    pub router_deployment: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("KEELSON_DATABASE_URL")
            .ok_or(ConfigError::MissingEnvVar("KEELSON_DATABASE_URL"))?;

        let data_dir = PathBuf::from(lookup("KEELSON_DATA_DIR").unwrap_or_else(|| ".data".to_string()));

        let credential_key = match lookup("KEELSON_CREDENTIAL_KEY") {
            Some(encoded) => Some(decode_key(&encoded)?),
            None => None,
        };

        Ok(Self {
            database_url,
            data_dir,
            credential_key,
            copy_job_image: lookup("KEELSON_COPY_JOB_IMAGE")
                .unwrap_or_else(|| "instrumentisto/rsync-ssh:latest".to_string()),
            default_storage_class: lookup("KEELSON_DEFAULT_STORAGE_CLASS")
                .unwrap_or_else(|| "longhorn".to_string()),
            cert_issuer: lookup("KEELSON_CERT_ISSUER")
                .unwrap_or_else(|| "letsencrypt-production".to_string()),
            router_namespace: lookup("KEELSON_ROUTER_NAMESPACE")
                .unwrap_or_else(|| "kube-system".to_string()),
            router_deployment: lookup("KEELSON_ROUTER_DEPLOYMENT")
                .unwrap_or_else(|| "traefik".to_string()),
        })
    }

    /// Engine tunables derived from this configuration.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            data_dir: self.data_dir.clone(),
            credential_key: self.credential_key,
            copy_job_image: self.copy_job_image.clone(),
            default_storage_class: self.default_storage_class.clone(),
            cert_issuer: self.cert_issuer.clone(),
            router_namespace: self.router_namespace.clone(),
            router_deployment: self.router_deployment.clone(),
            ..EngineConfig::default()
        }
    }
}

fn decode_key(encoded: &str) -> Result<[u8; 32], ConfigError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|_| ConfigError::InvalidCredentialKey)?;
    bytes
        .try_into()
        .map_err(|_| ConfigError::InvalidCredentialKey)
}

/// Runtime tunables shared by all reconcilers.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Deployment log directory root
    pub data_dir: PathBuf,
    /// Key for the encrypted basic-auth plain secret
    pub credential_key: Option<[u8; 32]>,
    /// Copy job container image
    pub copy_job_image: String,
    /// Fallback storage class
    pub default_storage_class: String,
    /// cert-manager issuer
    pub cert_issuer: String,
    /// Ingress router namespace
    pub router_namespace: String,
    /// Ingress router deployment name
    pub router_deployment: String,
    /// Pod label value identifying the ingress router
    pub router_pod_label: String,
    /// Wait for a resized claim to report its new capacity
    pub resize_wait: PollPolicy,
    /// Wait for an app's pods to terminate after scaling to zero
    pub pod_termination_wait: PollPolicy,
    /// Wait for a storage-class copy job
    pub migration_wait: PollPolicy,
    /// Wait for the ingress router to become ready after a restart
    pub router_restart_wait: PollPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".data"),
            credential_key: None,
            copy_job_image: "instrumentisto/rsync-ssh:latest".to_string(),
            default_storage_class: "longhorn".to_string(),
            cert_issuer: "letsencrypt-production".to_string(),
            router_namespace: "kube-system".to_string(),
            router_deployment: "traefik".to_string(),
            router_pod_label: "traefik".to_string(),
            resize_wait: PollPolicy::fixed(Duration::from_secs(3), 30), // ~90s
            pod_termination_wait: PollPolicy::fixed(Duration::from_secs(2), 60),
            migration_wait: PollPolicy::fixed(Duration::from_secs(10), 180), // 30 min
            router_restart_wait: PollPolicy::fixed(Duration::from_secs(2), 60), // ~120s
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// The credential key is not base64 encoded 32 bytes.
    #[error("KEELSON_CREDENTIAL_KEY must be 32 bytes, base64 encoded")]
    InvalidCredentialKey,
    /// A required engine component was not provided to the builder.
    #[error("{0} is required")]
    MissingComponent(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[("KEELSON_DATABASE_URL", "postgres://x")])).unwrap();
        assert_eq!(config.data_dir, PathBuf::from(".data"));
        assert_eq!(config.default_storage_class, "longhorn");
        assert_eq!(config.router_namespace, "kube-system");
        assert!(config.credential_key.is_none());
    }

    #[test]
    fn test_missing_database_url() {
        let err = Config::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar("KEELSON_DATABASE_URL")));
    }

    #[test]
    fn test_credential_key_must_be_32_bytes() {
        let short = STANDARD.encode([1u8; 16]);
        let err = Config::from_lookup(lookup(&[
            ("KEELSON_DATABASE_URL", "postgres://x"),
            ("KEELSON_CREDENTIAL_KEY", short.as_str()),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidCredentialKey));

        let good = STANDARD.encode([7u8; 32]);
        let config = Config::from_lookup(lookup(&[
            ("KEELSON_DATABASE_URL", "postgres://x"),
            ("KEELSON_CREDENTIAL_KEY", good.as_str()),
        ]))
        .unwrap();
        assert_eq!(config.credential_key, Some([7u8; 32]));
    }

    #[test]
    fn test_engine_defaults_match_wait_budgets() {
        let config = EngineConfig::default();
        assert_eq!(config.resize_wait.max_attempts, 30);
        assert_eq!(config.resize_wait.interval, Duration::from_secs(3));
        assert_eq!(config.migration_wait.total_budget(), Duration::from_secs(1800));
    }
}
