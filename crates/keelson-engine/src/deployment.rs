// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deployment synthesis.
//!
//! Turns a declared [`App`] into a `Deployment` and drives the steps around
//! it: file-browser teardown, scale-to-zero ahead of claim resizes, volume and
//! config-file reconciliation, network isolation, the apply itself and the
//! post-apply cleanup of Service, pull secret, ingress and unused objects.
//!
//! Steps run in order and stop at the first failure. Already applied steps are
//! not rolled back; the next deploy converges from wherever the last one
//! stopped.

use std::collections::BTreeMap;
use std::path::PathBuf;

use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment,
};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, HTTPGetAction, HTTPHeader, LocalObjectReference, Pod,
    PodSpec, PodTemplateSpec, Probe, ResourceRequirements, TCPSocketAction,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cluster::{APP_ID_LABEL, APP_LABEL, ApplyOutcome, Cluster, app_labels};
use crate::config::EngineConfig;
use crate::config_maps::{collect_unused_config_maps, file_mounts_checksum, reconcile_config_maps};
use crate::error::{Error, Result};
use crate::file_browser::teardown_file_browsers;
use crate::ingress::{IngressReport, reconcile_ingress};
use crate::logs::DeploymentLog;
use crate::model::{App, BuildRef, HealthProbe, ProbeKind, ResourceSettings};
use crate::network_policy::reconcile_network_policy;
use crate::poll::{WaitState, wait_for};
use crate::registry_secret::{collect_unused_registry_secret, reconcile_registry_secret};
use crate::service_ports::{aggregate_ports, reconcile_service};
use crate::volumes::{
    PendingResize, VolumeMounts, collect_unused_claims, pending_resizes, reconcile_volumes,
};

/// Pod template annotation keys.
pub mod annotations {
    /// App ID.
    pub const APP_ID: &str = "keelson.io/app-id";
    /// Project ID.
    pub const PROJECT_ID: &str = "keelson.io/project-id";
    /// Deployment ID.
    pub const DEPLOYMENT_ID: &str = "keelson.io/deployment-id";
    /// Build job that produced the image.
    pub const BUILD_JOB: &str = "keelson.io/build-job";
    /// Commit the image was built from.
    pub const GIT_COMMIT: &str = "keelson.io/git-commit";
    /// Reason for the rollout, shown by `kubectl rollout history`.
    pub const CHANGE_CAUSE: &str = "kubernetes.io/change-cause";
    /// Checksum of mounted config files.
    pub const FILES_CHECKSUM: &str = "keelson.io/files-checksum";
}

const STRATEGY_RECREATE: &str = "Recreate";
const STRATEGY_ROLLING: &str = "RollingUpdate";

/// One deploy request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployRequest {
    /// Deployment ID, also the log file name.
    pub deployment_id: String,
    /// Image produced by the build collaborator, if any.
    pub build: Option<BuildRef>,
    /// Human readable reason.
    pub change_cause: Option<String>,
}

impl DeployRequest {
    /// Request deploying the app's declared image.
    pub fn new(deployment_id: impl Into<String>) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            build: None,
            change_cause: None,
        }
    }
}

/// What a deploy did.
#[derive(Debug, Clone, PartialEq)]
pub struct DeployReport {
    /// Deployment ID.
    pub deployment_id: String,
    /// Result of applying the Deployment object.
    pub outcome: ApplyOutcome,
    /// Claims that were resized.
    pub resized: Vec<PendingResize>,
    /// Volumes whose file browser was torn down.
    pub removed_file_browsers: Vec<String>,
    /// Network policy outcome; `None` when isolation is disabled.
    pub network_policy: Option<ApplyOutcome>,
    /// Service outcome; `None` when the app exposes no port.
    pub service: Option<ApplyOutcome>,
    /// Ingress changes.
    pub ingress: IngressReport,
    /// Unused config maps deleted.
    pub removed_config_maps: Vec<String>,
    /// Unused claims deleted.
    pub removed_claims: Vec<String>,
    /// Whether an unused pull secret was deleted.
    pub removed_registry_secret: bool,
    /// Deployment log file.
    pub log_path: PathBuf,
}

/// Deploy inputs that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedApp {
    /// Image reference to run.
    pub image: String,
    /// Parsed args override.
    pub args: Option<Vec<String>>,
    /// Health probe.
    pub probe: Option<HealthProbe>,
}

/// Check everything that can be checked without the cluster.
pub fn validate(app: &App, build: Option<&BuildRef>) -> Result<ValidatedApp> {
    if app.replicas < 0 {
        return Err(Error::validation("replica count cannot be negative"));
    }
    if app.replicas > 1 && app.has_single_writer_volume() {
        return Err(Error::validation(format!(
            "{} replicas requested but a ReadWriteOnce volume allows a single writer",
            app.replicas
        )));
    }
    let args = app.parsed_args()?;
    let probe = app.health_check.probe()?;

    let image = match build {
        Some(build) if !build.image.trim().is_empty() => build.image.clone(),
        _ => app
            .source
            .image
            .as_deref()
            .map(str::trim)
            .filter(|image| !image.is_empty())
            .map(str::to_string)
            .ok_or_else(|| Error::validation("no image to deploy: nothing was built and no image is declared"))?,
    };

    Ok(ValidatedApp { image, args, probe })
}

/// Scale the app's Deployment to zero replicas and wait for its pods to go.
///
/// A missing Deployment is not an error; leftover pods are still waited on.
pub async fn scale_to_zero(
    cluster: &Cluster,
    app: &App,
    config: &EngineConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let namespace = app.namespace();
    if cluster.get::<Deployment>(namespace, &app.id).await?.is_some() {
        cluster
            .patch::<Deployment>(namespace, &app.id, json!({"spec": {"replicas": 0}}))
            .await?;
        info!(app_id = %app.id, namespace, "Scaled to zero");
    }

    let selector = format!("{APP_LABEL}={}", app.id);
    let operation = format!("termination of {} pods", app.id);
    wait_for(&operation, &config.pod_termination_wait, cancel, || async {
        let pods: Vec<Pod> = cluster.list(namespace, Some(&selector)).await?;
        let state = if pods.is_empty() {
            WaitState::Succeeded(())
        } else {
            WaitState::InProgress(format!("{} pods remaining", pods.len()))
        };
        Ok::<_, Error>(state)
    })
    .await
}

/// Env vars from the app's environment block.
pub fn build_env(app: &App) -> Vec<EnvVar> {
    app.parsed_env()
        .into_iter()
        .map(|(name, value)| EnvVar {
            name,
            value: Some(value),
            ..Default::default()
        })
        .collect()
}

/// Rollout strategy: pods holding a single-writer claim must stop before
/// their replacement starts.
pub fn rollout_strategy(app: &App) -> DeploymentStrategy {
    if app.has_single_writer_volume() {
        DeploymentStrategy {
            type_: Some(STRATEGY_RECREATE.to_string()),
            rolling_update: None,
        }
    } else {
        DeploymentStrategy {
            type_: Some(STRATEGY_ROLLING.to_string()),
            rolling_update: Some(RollingUpdateDeployment {
                max_surge: Some(IntOrString::Int(1)),
                max_unavailable: Some(IntOrString::Int(0)),
            }),
        }
    }
}

/// Container resources in millicores and megabytes.
pub fn build_resources(resources: &ResourceSettings) -> Option<ResourceRequirements> {
    fn bounds(cpu: Option<i64>, memory: Option<i64>) -> Option<BTreeMap<String, Quantity>> {
        let mut map = BTreeMap::new();
        if let Some(cpu) = cpu {
            map.insert("cpu".to_string(), Quantity(format!("{cpu}m")));
        }
        if let Some(memory) = memory {
            map.insert("memory".to_string(), Quantity(format!("{memory}M")));
        }
        (!map.is_empty()).then_some(map)
    }

    let limits = bounds(resources.cpu_limit, resources.memory_limit);
    let requests = bounds(resources.cpu_reservation, resources.memory_reservation);
    if limits.is_none() && requests.is_none() {
        return None;
    }
    Some(ResourceRequirements {
        limits,
        requests,
        ..Default::default()
    })
}

/// Readiness, liveness and startup probes sharing one target.
pub struct Probes {
    /// Readiness probe.
    pub readiness: Probe,
    /// Liveness probe.
    pub liveness: Probe,
    /// Startup probe.
    pub startup: Probe,
}

/// Build the three container probes from a validated health probe.
pub fn build_probes(probe: &HealthProbe) -> Probes {
    let base = match &probe.kind {
        ProbeKind::Http {
            path,
            port,
            scheme,
            headers,
        } => Probe {
            http_get: Some(HTTPGetAction {
                path: Some(path.clone()),
                port: IntOrString::Int(*port),
                scheme: Some(scheme.clone()),
                http_headers: (!headers.is_empty()).then(|| {
                    headers
                        .iter()
                        .map(|(name, value)| HTTPHeader {
                            name: name.clone(),
                            value: value.clone(),
                        })
                        .collect()
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
        ProbeKind::Tcp { port } => Probe {
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::Int(*port),
                host: None,
            }),
            ..Default::default()
        },
    };
    let base = Probe {
        period_seconds: Some(probe.period_seconds),
        timeout_seconds: Some(probe.timeout_seconds),
        failure_threshold: Some(probe.failure_threshold),
        ..base
    };

    Probes {
        readiness: base.clone(),
        liveness: Probe {
            initial_delay_seconds: Some(probe.period_seconds),
            ..base.clone()
        },
        // Slow starters get 30 periods before liveness kicks in
        startup: Probe {
            failure_threshold: Some(30),
            period_seconds: Some(probe.period_seconds.min(10)),
            ..base
        },
    }
}

/// Pod template annotations.
pub fn pod_annotations(app: &App, request: &DeployRequest) -> BTreeMap<String, String> {
    let mut map = BTreeMap::from([
        (annotations::APP_ID.to_string(), app.id.clone()),
        (annotations::PROJECT_ID.to_string(), app.project_id.clone()),
        (
            annotations::DEPLOYMENT_ID.to_string(),
            request.deployment_id.clone(),
        ),
        (
            annotations::FILES_CHECKSUM.to_string(),
            file_mounts_checksum(&app.file_mounts),
        ),
    ]);
    if let Some(build) = &request.build {
        if let Some(job) = &build.job_name {
            map.insert(annotations::BUILD_JOB.to_string(), job.clone());
        }
        if let Some(commit) = &build.git_commit {
            map.insert(annotations::GIT_COMMIT.to_string(), commit.clone());
        }
    }
    if let Some(cause) = &request.change_cause {
        map.insert(annotations::CHANGE_CAUSE.to_string(), cause.clone());
    }
    map
}

/// Assemble the Deployment object.
pub fn build_deployment(
    app: &App,
    validated: &ValidatedApp,
    mounts: VolumeMounts,
    pull_secret: Option<String>,
    annotations: BTreeMap<String, String>,
) -> Deployment {
    let pod_labels = BTreeMap::from([
        (APP_LABEL.to_string(), app.id.clone()),
        (APP_ID_LABEL.to_string(), app.id.clone()),
    ]);
    let probes = validated.probe.as_ref().map(build_probes);
    let env = build_env(app);

    let container_ports: Vec<ContainerPort> = {
        let mut targets: Vec<i32> = aggregate_ports(&app.domains, &app.ports)
            .iter()
            .map(|p| p.target_port)
            .collect();
        targets.sort_unstable();
        targets.dedup();
        targets
            .into_iter()
            .map(|port| ContainerPort {
                container_port: port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            })
            .collect()
    };

    let container = Container {
        name: app.id.clone(),
        image: Some(validated.image.clone()),
        command: app.parsed_command(),
        args: validated.args.clone(),
        env: (!env.is_empty()).then_some(env),
        ports: (!container_ports.is_empty()).then_some(container_ports),
        volume_mounts: (!mounts.volume_mounts.is_empty()).then_some(mounts.volume_mounts),
        resources: build_resources(&app.resources),
        readiness_probe: probes.as_ref().map(|p| p.readiness.clone()),
        liveness_probe: probes.as_ref().map(|p| p.liveness.clone()),
        startup_probe: probes.map(|p| p.startup),
        ..Default::default()
    };

    let mut labels = app_labels(&app.id);
    labels.insert(APP_LABEL.to_string(), app.id.clone());

    Deployment {
        metadata: ObjectMeta {
            name: Some(app.id.clone()),
            namespace: Some(app.namespace().to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(app.replicas),
            selector: LabelSelector {
                match_labels: Some(BTreeMap::from([(APP_LABEL.to_string(), app.id.clone())])),
                ..Default::default()
            },
            strategy: Some(rollout_strategy(app)),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    annotations: Some(annotations),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: (!mounts.volumes.is_empty()).then_some(mounts.volumes),
                    image_pull_secrets: pull_secret
                        .map(|name| vec![LocalObjectReference { name }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Deploy an app.
///
/// Every step is appended to the deployment log under the configured data
/// directory. Validation runs before any cluster call.
pub async fn deploy(
    cluster: &Cluster,
    config: &EngineConfig,
    app: &App,
    request: &DeployRequest,
    cancel: &CancellationToken,
) -> Result<DeployReport> {
    let mut log = DeploymentLog::create(&config.data_dir, &app.id, &request.deployment_id).await?;
    log.step(format!("Deploying app {} ({})", app.name, app.id)).await;

    match run(cluster, config, app, request, cancel, &mut log).await {
        Ok(report) => {
            log.step("Deployment finished").await;
            info!(
                app_id = %app.id,
                deployment_id = %request.deployment_id,
                outcome = ?report.outcome,
                "Deployment finished"
            );
            Ok(report)
        }
        Err(e) => {
            log.step(format!("Deployment failed: {e}")).await;
            error!(
                app_id = %app.id,
                deployment_id = %request.deployment_id,
                error = %e,
                "Deployment failed"
            );
            Err(e)
        }
    }
}

async fn run(
    cluster: &Cluster,
    config: &EngineConfig,
    app: &App,
    request: &DeployRequest,
    cancel: &CancellationToken,
    log: &mut DeploymentLog,
) -> Result<DeployReport> {
    let namespace = app.namespace();
    let built = request.build.is_some();

    let validated = validate(app, request.build.as_ref())?;
    // Shrinks are rejected here, before anything in the cluster changes
    let resized = pending_resizes(cluster, app).await?;
    log.step(format!("Validated; image {}", validated.image)).await;

    let removed_file_browsers = teardown_file_browsers(cluster, app).await?;
    if !removed_file_browsers.is_empty() {
        log.step(format!(
            "Stopped file browsers of {}",
            removed_file_browsers.join(", ")
        ))
        .await;
    }

    cluster.ensure_namespace(namespace).await?;
    log.step(format!("Namespace {namespace} ready")).await;

    if !resized.is_empty() {
        for resize in &resized {
            log.step(format!(
                "Volume {} will grow from {}MiB to {}MiB",
                resize.volume_id, resize.current_mb, resize.declared_mb
            ))
            .await;
        }
        log.step("Scaling to zero before resizing volumes").await;
        scale_to_zero(cluster, app, config, cancel).await?;
        log.step("All pods terminated").await;
    }

    let mut mounts = reconcile_volumes(cluster, app, config, cancel).await?;
    log.step(format!("{} volumes ready", app.volumes.len())).await;
    mounts.extend(reconcile_config_maps(cluster, app).await?);
    log.step(format!("{} config files ready", app.file_mounts.len())).await;

    let network_policy = reconcile_network_policy(cluster, app, config).await?;
    log.step(match network_policy {
        Some(_) => format!(
            "Network policy applied (ingress {}, egress {})",
            app.network.ingress.as_str(),
            app.network.egress.as_str()
        ),
        None => "Network policy disabled".to_string(),
    })
    .await;

    let pull_secret = reconcile_registry_secret(cluster, app, built).await?;
    if pull_secret.is_some() {
        log.step("Registry credentials applied").await;
    }

    let deployment = build_deployment(
        app,
        &validated,
        mounts,
        pull_secret,
        pod_annotations(app, request),
    );
    let outcome = cluster.apply(namespace, &deployment).await?;
    log.step(format!(
        "Deployment {} {}",
        app.id,
        match outcome {
            ApplyOutcome::Created => "created",
            ApplyOutcome::Replaced => "updated",
            ApplyOutcome::Unchanged => "unchanged",
        }
    ))
    .await;

    let removed_config_maps = collect_unused_config_maps(cluster, app).await?;
    let removed_claims = collect_unused_claims(cluster, app).await?;
    if !removed_claims.is_empty() {
        log.step(format!("Removed unused volumes {}", removed_claims.join(", "))).await;
    }

    let service = reconcile_service(cluster, app).await?;
    log.step(match service {
        Some(_) => "Service applied",
        None => "No ports exposed",
    })
    .await;

    let removed_registry_secret = collect_unused_registry_secret(cluster, app, built).await?;

    let ingress = reconcile_ingress(cluster, app, config).await?;
    log.step(format!(
        "Routing applied for {} domains",
        ingress.applied.len()
    ))
    .await;

    Ok(DeployReport {
        deployment_id: request.deployment_id.clone(),
        outcome,
        resized,
        removed_file_browsers,
        network_policy,
        service,
        ingress,
        removed_config_maps,
        removed_claims,
        removed_registry_secret,
        log_path: log.path().to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockCluster;
    use crate::logs::read_deployment_log;
    use crate::model::fixtures::{app, volume};
    use crate::model::{AccessMode, AppDomain, HealthCheckSettings};
    use crate::poll::PollPolicy;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn quick_config(dir: &TempDir) -> EngineConfig {
        let quick = PollPolicy::fixed(Duration::from_millis(1), 10);
        EngineConfig {
            data_dir: dir.path().to_path_buf(),
            resize_wait: quick,
            pod_termination_wait: quick,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn test_replicas_with_single_writer_rejected() {
        let mut app = app("a1");
        app.replicas = 2;
        app.volumes = vec![volume("v1", "a1", "/data", 100, AccessMode::ReadWriteOnce)];
        assert!(matches!(validate(&app, None), Err(Error::Validation(_))));

        app.volumes[0].access_mode = AccessMode::ReadWriteMany;
        assert!(validate(&app, None).is_ok());
    }

    #[test]
    fn test_build_image_wins() {
        let app = app("a1");
        let build = BuildRef {
            image: "registry.local/a1:abc".to_string(),
            ..Default::default()
        };
        assert_eq!(validate(&app, Some(&build)).unwrap().image, "registry.local/a1:abc");
        assert_eq!(validate(&app, None).unwrap().image, "nginx:1.27");

        let mut imageless = app.clone();
        imageless.source.image = None;
        assert!(matches!(validate(&imageless, None), Err(Error::Validation(_))));
    }

    #[test]
    fn test_strategy_follows_access_modes() {
        let mut app = app("a1");
        assert_eq!(rollout_strategy(&app).type_.as_deref(), Some("RollingUpdate"));
        let rolling = rollout_strategy(&app).rolling_update.unwrap();
        assert_eq!(rolling.max_surge, Some(IntOrString::Int(1)));
        assert_eq!(rolling.max_unavailable, Some(IntOrString::Int(0)));

        app.volumes = vec![volume("v1", "a1", "/data", 100, AccessMode::ReadWriteOnce)];
        let recreate = rollout_strategy(&app);
        assert_eq!(recreate.type_.as_deref(), Some("Recreate"));
        assert!(recreate.rolling_update.is_none());
    }

    #[test]
    fn test_resource_units() {
        let resources = build_resources(&ResourceSettings {
            cpu_limit: Some(500),
            memory_limit: Some(256),
            memory_reservation: Some(128),
            ..Default::default()
        })
        .unwrap();
        let limits = resources.limits.unwrap();
        assert_eq!(limits["cpu"].0, "500m");
        assert_eq!(limits["memory"].0, "256M");
        assert_eq!(resources.requests.unwrap()["memory"].0, "128M");
        assert!(build_resources(&ResourceSettings::default()).is_none());
    }

    #[test]
    fn test_tcp_probe_on_all_three() {
        let probe = HealthCheckSettings {
            tcp_port: Some(5432),
            ..Default::default()
        }
        .probe()
        .unwrap()
        .unwrap();
        let probes = build_probes(&probe);
        for p in [&probes.readiness, &probes.liveness, &probes.startup] {
            assert_eq!(p.tcp_socket.as_ref().unwrap().port, IntOrString::Int(5432));
            assert!(p.http_get.is_none());
        }
        assert_eq!(probes.startup.failure_threshold, Some(30));
    }

    #[test]
    fn test_manifest_shape() {
        let mut app = app("a1");
        app.container_command = Some("npm run start".to_string());
        app.env_vars = "PORT=3000".to_string();
        app.domains = vec![AppDomain {
            id: "d1".into(),
            hostname: "a1.example.com".into(),
            port: 3000,
            use_ssl: true,
            redirect_https: true,
        }];
        let validated = validate(&app, None).unwrap();
        let request = DeployRequest::new("dep-1");
        let deployment = build_deployment(
            &app,
            &validated,
            VolumeMounts::default(),
            Some("a1-registry".to_string()),
            pod_annotations(&app, &request),
        );

        let spec = deployment.spec.unwrap();
        let template = spec.template;
        let annotations = template.metadata.unwrap().annotations.unwrap();
        assert_eq!(annotations[annotations::DEPLOYMENT_ID], "dep-1");
        assert_eq!(annotations[annotations::PROJECT_ID], "proj-1");

        let pod = template.spec.unwrap();
        assert_eq!(pod.image_pull_secrets.unwrap()[0].name, "a1-registry");
        let container = &pod.containers[0];
        assert_eq!(container.name, "a1");
        assert_eq!(
            container.command.as_deref(),
            Some(&["npm".to_string(), "run".to_string(), "start".to_string()][..])
        );
        assert_eq!(container.env.as_ref().unwrap()[0].name, "PORT");
        assert_eq!(container.ports.as_ref().unwrap()[0].container_port, 3000);
    }

    #[tokio::test]
    async fn test_invalid_probe_rejected_before_any_call() {
        let dir = TempDir::new().unwrap();
        let mock = Arc::new(MockCluster::new());
        let cluster = Cluster::new(mock.clone());
        let mut app = app("a1");
        app.health_check = HealthCheckSettings {
            http_path: Some("/health".into()),
            http_port: Some(8080),
            tcp_port: Some(8080),
            ..Default::default()
        };

        let err = deploy(
            &cluster,
            &quick_config(&dir),
            &app,
            &DeployRequest::new("dep-1"),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(mock.calls().await.is_empty());

        let log = read_deployment_log(dir.path(), "a1", "dep-1").await.unwrap();
        assert!(log.contains("Deployment failed"));
    }

    #[tokio::test]
    async fn test_redeploy_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mock = Arc::new(MockCluster::new());
        let cluster = Cluster::new(mock.clone());
        let config = quick_config(&dir);
        let mut app = app("a1");
        app.volumes = vec![volume("v1", "a1", "/data", 100, AccessMode::ReadWriteOnce)];
        let request = DeployRequest::new("dep-1");

        let first = deploy(&cluster, &config, &app, &request, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(first.outcome, ApplyOutcome::Created);
        assert!(mock.has_namespace("proj-1").await);

        mock.clear_calls().await;
        let second = deploy(&cluster, &config, &app, &request, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(second.outcome, ApplyOutcome::Unchanged);
        let writes: Vec<_> = mock
            .mutations()
            .await
            .into_iter()
            .filter(|c| matches!(c.verb, "create" | "replace" | "patch"))
            .collect();
        assert!(writes.is_empty(), "unexpected writes: {writes:?}");
    }

    #[tokio::test]
    async fn test_resize_scales_to_zero_first() {
        let dir = TempDir::new().unwrap();
        let mock = Arc::new(MockCluster::new());
        let cluster = Cluster::new(mock.clone());
        let config = quick_config(&dir);
        let mut app = app("a1");
        app.volumes = vec![volume("v1", "a1", "/data", 100, AccessMode::ReadWriteOnce)];
        deploy(&cluster, &config, &app, &DeployRequest::new("dep-1"), &CancellationToken::new())
            .await
            .unwrap();

        mock.clear_calls().await;
        app.volumes[0].size_mb = 200;
        let report = deploy(&cluster, &config, &app, &DeployRequest::new("dep-2"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.resized.len(), 1);
        assert_eq!(report.outcome, ApplyOutcome::Replaced);

        let calls = mock.mutations().await;
        let position = |verb: &str, kind: &str| {
            calls
                .iter()
                .position(|c| c.verb == verb && c.kind == kind)
                .unwrap()
        };
        assert!(position("patch", "Deployment") < position("patch", "PersistentVolumeClaim"));
        assert!(position("patch", "PersistentVolumeClaim") < position("replace", "Deployment"));

        let deployment = mock.object("Deployment", "proj-1", "a1").await.unwrap();
        assert_eq!(deployment["spec"]["replicas"], 1);
    }
}
