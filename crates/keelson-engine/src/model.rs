// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Declared app model consumed by the reconcilers.
//!
//! These types mirror what the declared-state store holds. The engine never
//! mutates an [`App`] during reconciliation; volume records are the only rows
//! it writes (storage-class migration).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Traffic policy applied to one direction of an app's network isolation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PolicyMode {
    /// Router, namespace peers and (egress) the public internet.
    #[default]
    AllowAll,
    /// Same-namespace peers only.
    NamespaceOnly,
    /// Router and public internet only.
    InternetOnly,
    /// Nothing, except scheduled backup jobs on ingress.
    DenyAll,
}

impl PolicyMode {
    /// Value as stored in the declared-state store.
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyMode::AllowAll => "ALLOW_ALL",
            PolicyMode::NamespaceOnly => "NAMESPACE_ONLY",
            PolicyMode::InternetOnly => "INTERNET_ONLY",
            PolicyMode::DenyAll => "DENY_ALL",
        }
    }

    /// All modes, for exhaustive checks.
    pub const ALL: [PolicyMode; 4] = [
        PolicyMode::AllowAll,
        PolicyMode::NamespaceOnly,
        PolicyMode::InternetOnly,
        PolicyMode::DenyAll,
    ];
}

impl FromStr for PolicyMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ALLOW_ALL" => Ok(PolicyMode::AllowAll),
            "NAMESPACE_ONLY" => Ok(PolicyMode::NamespaceOnly),
            "INTERNET_ONLY" => Ok(PolicyMode::InternetOnly),
            "DENY_ALL" => Ok(PolicyMode::DenyAll),
            other => Err(Error::validation(format!("unknown network policy '{other}'"))),
        }
    }
}

/// Network isolation settings of an app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NetworkSettings {
    /// When false, any existing policy is removed and traffic is unrestricted.
    pub use_network_policy: bool,
    /// Inbound policy.
    pub ingress: PolicyMode,
    /// Outbound policy.
    pub egress: PolicyMode,
}

/// Volume access mode. Immutable once the claim exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessMode {
    /// Single writer.
    ReadWriteOnce,
    /// Multiple writers, possibly across apps.
    ReadWriteMany,
}

impl AccessMode {
    /// Kubernetes spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessMode::ReadWriteOnce => "ReadWriteOnce",
            AccessMode::ReadWriteMany => "ReadWriteMany",
        }
    }
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ReadWriteOnce" => Ok(AccessMode::ReadWriteOnce),
            "ReadWriteMany" => Ok(AccessMode::ReadWriteMany),
            other => Err(Error::validation(format!("unknown access mode '{other}'"))),
        }
    }
}

/// Persistent volume declared for an app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppVolume {
    /// Volume ID.
    pub id: String,
    /// Owning app.
    pub app_id: String,
    /// Mount path inside the container, unique per app.
    pub container_mount_path: String,
    /// Requested size in MiB.
    pub size_mb: i64,
    /// Access mode.
    pub access_mode: AccessMode,
    /// Storage class of the backing claim.
    pub storage_class: String,
    /// When set, this volume mounts another app's volume instead of owning a claim.
    pub shared_volume_id: Option<String>,
}

impl AppVolume {
    /// Name of the claim backing this volume.
    ///
    /// Shared-reference volumes resolve to the source volume's claim.
    pub fn claim_name(&self) -> String {
        claim_name(self.shared_volume_id.as_deref().unwrap_or(&self.id))
    }

    /// Whether this volume owns its claim.
    pub fn owns_claim(&self) -> bool {
        self.shared_volume_id.is_none()
    }

    /// Whether a pod mounting this volume prevents running more than one replica.
    pub fn is_single_writer(&self) -> bool {
        self.access_mode == AccessMode::ReadWriteOnce
    }
}

/// Claim name for a volume ID.
pub fn claim_name(volume_id: &str) -> String {
    format!("pvc-{volume_id}")
}

/// Domain routed to an app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppDomain {
    /// Domain ID.
    pub id: String,
    /// Hostname.
    pub hostname: String,
    /// Container port the hostname routes to.
    pub port: i32,
    /// Issue a TLS certificate.
    pub use_ssl: bool,
    /// Redirect plain HTTP to HTTPS.
    pub redirect_https: bool,
}

/// Internal port exposed through the app's Service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppPort {
    /// Port ID.
    pub id: String,
    /// Container port.
    pub port: i32,
}

/// File rendered into the container from a config map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppFileMount {
    /// File mount ID.
    pub id: String,
    /// Absolute path of the file inside the container.
    pub container_mount_path: String,
    /// File content.
    pub content: String,
}

/// Credential pair gating an app behind basic auth.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicAuthEntry {
    /// Username.
    pub username: String,
    /// Password.
    pub password: String,
}

impl fmt::Debug for BasicAuthEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuthEntry")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Raw health-check settings as declared.
///
/// HTTP and TCP fields are independent here; [`HealthCheckSettings::probe`]
/// turns them into a single [`HealthProbe`] and rejects ambiguous input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HealthCheckSettings {
    /// HTTP probe path.
    pub http_path: Option<String>,
    /// HTTP probe port.
    pub http_port: Option<i32>,
    /// HTTP or HTTPS.
    pub http_scheme: Option<String>,
    /// Extra request headers.
    #[serde(default)]
    pub http_headers: Vec<(String, String)>,
    /// TCP probe port.
    pub tcp_port: Option<i32>,
    /// Seconds between probes.
    pub period_seconds: Option<i32>,
    /// Probe timeout in seconds.
    pub timeout_seconds: Option<i32>,
    /// Consecutive failures before the container is considered unhealthy.
    pub failure_threshold: Option<i32>,
}

/// Probe target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeKind {
    /// HTTP GET.
    Http {
        /// Request path.
        path: String,
        /// Container port.
        port: i32,
        /// `HTTP` or `HTTPS`.
        scheme: String,
        /// Extra request headers.
        headers: Vec<(String, String)>,
    },
    /// TCP connect.
    Tcp {
        /// Container port.
        port: i32,
    },
}

/// Validated health probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthProbe {
    /// Target.
    pub kind: ProbeKind,
    /// Seconds between probes.
    pub period_seconds: i32,
    /// Probe timeout in seconds.
    pub timeout_seconds: i32,
    /// Failure threshold.
    pub failure_threshold: i32,
}

impl HealthCheckSettings {
    /// Resolve the declared settings into at most one probe.
    pub fn probe(&self) -> Result<Option<HealthProbe>> {
        let http = self.http_path.is_some() || self.http_port.is_some();
        let tcp = self.tcp_port.is_some();

        let kind = match (http, tcp) {
            (true, true) => {
                return Err(Error::validation(
                    "HTTP and TCP health checks cannot both be configured",
                ));
            }
            (false, false) => return Ok(None),
            (true, false) => {
                let port = self.http_port.ok_or_else(|| {
                    Error::validation("HTTP health check requires a port")
                })?;
                let scheme = self
                    .http_scheme
                    .as_deref()
                    .unwrap_or("HTTP")
                    .to_ascii_uppercase();
                if scheme != "HTTP" && scheme != "HTTPS" {
                    return Err(Error::validation(format!(
                        "unsupported health check scheme '{scheme}'"
                    )));
                }
                ProbeKind::Http {
                    path: self.http_path.clone().unwrap_or_else(|| "/".to_string()),
                    port,
                    scheme,
                    headers: self.http_headers.clone(),
                }
            }
            (false, true) => ProbeKind::Tcp {
                port: self.tcp_port.unwrap_or_default(),
            },
        };

        Ok(Some(HealthProbe {
            kind,
            period_seconds: self.period_seconds.unwrap_or(15),
            timeout_seconds: self.timeout_seconds.unwrap_or(5),
            failure_threshold: self.failure_threshold.unwrap_or(3),
        }))
    }
}

/// Container image source.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ImageSource {
    /// External image reference, used when no build produced an image.
    pub image: Option<String>,
    /// Registry username for pulling `image`.
    pub registry_username: Option<String>,
    /// Registry password for pulling `image`.
    pub registry_password: Option<String>,
}

impl fmt::Debug for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageSource")
            .field("image", &self.image)
            .field("registry_username", &self.registry_username)
            .finish_non_exhaustive()
    }
}

impl ImageSource {
    /// Registry host of `image`, `docker.io` when unqualified.
    pub fn registry_host(&self) -> &str {
        let Some(image) = self.image.as_deref() else {
            return "docker.io";
        };
        match image.split_once('/') {
            Some((host, _)) if host.contains('.') || host.contains(':') || host == "localhost" => {
                host
            }
            _ => "docker.io",
        }
    }

    /// Whether pull credentials are declared.
    pub fn has_credentials(&self) -> bool {
        self.registry_username.as_deref().is_some_and(|u| !u.is_empty())
            && self.registry_password.as_deref().is_some_and(|p| !p.is_empty())
    }
}

/// CPU and memory bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ResourceSettings {
    /// CPU limit in millicores.
    pub cpu_limit: Option<i64>,
    /// CPU reservation in millicores.
    pub cpu_reservation: Option<i64>,
    /// Memory limit in MB.
    pub memory_limit: Option<i64>,
    /// Memory reservation in MB.
    pub memory_reservation: Option<i64>,
}

/// Fully resolved app as read from the declared-state store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct App {
    /// App ID; also names the Deployment.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Project ID; also the namespace.
    pub project_id: String,
    /// Desired replica count.
    pub replicas: i32,
    /// Image source.
    pub source: ImageSource,
    /// Command override, whitespace separated.
    pub container_command: Option<String>,
    /// Args override, a JSON array of strings.
    pub container_args: Option<String>,
    /// `KEY=VALUE` lines.
    pub env_vars: String,
    /// Resource bounds.
    pub resources: ResourceSettings,
    /// Health check.
    pub health_check: HealthCheckSettings,
    /// Network isolation.
    pub network: NetworkSettings,
    /// Basic-auth credentials gating every domain.
    pub basic_auth: Vec<BasicAuthEntry>,
    /// Routed domains.
    pub domains: Vec<AppDomain>,
    /// Internal ports.
    pub ports: Vec<AppPort>,
    /// Persistent volumes.
    pub volumes: Vec<AppVolume>,
    /// Config-file mounts.
    pub file_mounts: Vec<AppFileMount>,
}

impl App {
    /// Namespace the app's objects live in.
    pub fn namespace(&self) -> &str {
        &self.project_id
    }

    /// Parse [`App::container_args`].
    pub fn parsed_args(&self) -> Result<Option<Vec<String>>> {
        match self.container_args.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => serde_json::from_str::<Vec<String>>(raw)
                .map(Some)
                .map_err(|_| Error::validation("container args must be a JSON list of strings")),
        }
    }

    /// Parse [`App::container_command`].
    pub fn parsed_command(&self) -> Option<Vec<String>> {
        let command = self.container_command.as_deref()?.trim();
        if command.is_empty() {
            return None;
        }
        Some(command.split_whitespace().map(str::to_string).collect())
    }

    /// Parse [`App::env_vars`] into ordered pairs.
    ///
    /// Blank lines, `#` comments and lines without `=` are skipped. Values may
    /// contain `=`.
    pub fn parsed_env(&self) -> Vec<(String, String)> {
        self.env_vars
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| {
                let (key, value) = line.split_once('=')?;
                let key = key.trim();
                if key.is_empty() {
                    return None;
                }
                Some((key.to_string(), value.trim().to_string()))
            })
            .collect()
    }

    /// Whether any mounted volume allows only a single writer.
    pub fn has_single_writer_volume(&self) -> bool {
        self.volumes.iter().any(AppVolume::is_single_writer)
    }
}

/// Output of the build collaborator for one deployment.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BuildRef {
    /// Registry image reference produced by the build.
    pub image: String,
    /// Commit the image was built from.
    pub git_commit: Option<String>,
    /// Name of the build job.
    pub job_name: Option<String>,
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_both_probes_rejected() {
        let settings = HealthCheckSettings {
            http_path: Some("/health".to_string()),
            http_port: Some(8080),
            tcp_port: Some(5432),
            ..Default::default()
        };
        assert!(matches!(settings.probe(), Err(Error::Validation(_))));
    }

    #[test]
    fn test_http_probe_defaults() {
        let settings = HealthCheckSettings {
            http_path: Some("/health".to_string()),
            http_port: Some(8080),
            ..Default::default()
        };
        let probe = settings.probe().unwrap().unwrap();
        assert_eq!(probe.period_seconds, 15);
        assert_eq!(
            probe.kind,
            ProbeKind::Http {
                path: "/health".to_string(),
                port: 8080,
                scheme: "HTTP".to_string(),
                headers: vec![],
            }
        );
    }

    #[test]
    fn test_no_probe() {
        assert_eq!(HealthCheckSettings::default().probe().unwrap(), None);
    }

    #[test]
    fn test_args_must_be_string_list() {
        let mut app = app("a1");
        app.container_args = Some(r#"["--port", "80"]"#.to_string());
        assert_eq!(
            app.parsed_args().unwrap(),
            Some(vec!["--port".to_string(), "80".to_string()])
        );

        app.container_args = Some(r#"["--port", 80]"#.to_string());
        assert!(matches!(app.parsed_args(), Err(Error::Validation(_))));

        app.container_args = Some("--port 80".to_string());
        assert!(app.parsed_args().is_err());
    }

    #[test]
    fn test_env_parsing() {
        let mut app = app("a1");
        app.env_vars = "# comment\nDATABASE_URL=postgres://u:p@h/db?x=1\n\nBROKEN\n  PORT = 80 ".to_string();
        assert_eq!(
            app.parsed_env(),
            vec![
                ("DATABASE_URL".to_string(), "postgres://u:p@h/db?x=1".to_string()),
                ("PORT".to_string(), "80".to_string()),
            ]
        );
    }

    #[test]
    fn test_shared_volume_uses_source_claim() {
        let mut v = volume("v2", "a2", "/data", 100, AccessMode::ReadWriteMany);
        v.shared_volume_id = Some("v1".to_string());
        assert_eq!(v.claim_name(), "pvc-v1");
        assert!(!v.owns_claim());
    }

    #[test]
    fn test_registry_host() {
        let mut source = ImageSource::default();
        source.image = Some("ghcr.io/acme/api:1".to_string());
        assert_eq!(source.registry_host(), "ghcr.io");
        source.image = Some("acme/api:1".to_string());
        assert_eq!(source.registry_host(), "docker.io");
    }

    #[test]
    fn test_basic_auth_debug_hides_password() {
        let entry = BasicAuthEntry {
            username: "admin".to_string(),
            password: "hunter2".to_string(),
        };
        assert!(!format!("{entry:?}").contains("hunter2"));
    }

    #[test]
    fn test_app_debug_hides_registry_password() {
        let mut declared = app("a1");
        declared.source.registry_username = Some("robot".to_string());
        declared.source.registry_password = Some("pull-token-42".to_string());
        let printed = format!("{declared:?}");
        assert!(printed.contains("robot"));
        assert!(!printed.contains("pull-token-42"));
    }
}
