// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ingress reconciliation.
//!
//! One `Ingress` per declared domain routes the hostname to the app's Service.
//! TLS certificates come from cert-manager; the HTTPS redirect and basic auth
//! are Traefik middlewares chained through the router annotation. Ingresses
//! of hostnames no longer declared are deleted afterwards.

use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::basic_auth::reconcile_basic_auth;
use crate::cluster::crd::{Middleware, MiddlewareSpec, RedirectSchemeMiddleware, middleware_ref};
use crate::cluster::{Cluster, app_labels, app_selector};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::model::{App, AppDomain};
use crate::poll::{WaitState, wait_for};
use crate::service_ports::service_name;

/// Shared per-namespace redirect middleware.
pub const REDIRECT_MIDDLEWARE: &str = "redirect-to-https";

const INGRESS_CLASS: &str = "traefik";
const ISSUER_ANNOTATION: &str = "cert-manager.io/cluster-issuer";
const ENTRYPOINTS_ANNOTATION: &str = "traefik.ingress.kubernetes.io/router.entrypoints";
const MIDDLEWARES_ANNOTATION: &str = "traefik.ingress.kubernetes.io/router.middlewares";
const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

/// DNS-label-safe form of a hostname.
pub fn sanitize_hostname(hostname: &str) -> String {
    let mapped: String = hostname
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let mut name = mapped.trim_matches('-').to_string();
    // Leaves room for the `ingress-` prefix and the digest within 63 characters
    name.truncate(46);
    name.trim_end_matches('-').to_string()
}

/// Sanitized hostname followed by a digest of the exact hostname, so hosts
/// that sanitize alike still get distinct names.
fn hostname_label(hostname: &str) -> String {
    let digest = Sha256::digest(hostname.to_ascii_lowercase().as_bytes());
    let hex = format!("{digest:x}");
    format!("{}-{}", sanitize_hostname(hostname), &hex[..8])
}

/// Name of the ingress for a hostname.
pub fn ingress_name(hostname: &str) -> String {
    format!("ingress-{}", hostname_label(hostname))
}

/// Ingress for one domain.
pub fn build_ingress(
    app: &App,
    domain: &AppDomain,
    basic_auth_middleware: Option<&str>,
    config: &EngineConfig,
) -> Ingress {
    let namespace = app.namespace();
    let mut annotations = BTreeMap::new();
    let mut middlewares = Vec::new();

    if domain.use_ssl {
        annotations.insert(ISSUER_ANNOTATION.to_string(), config.cert_issuer.clone());
        annotations.insert(ENTRYPOINTS_ANNOTATION.to_string(), "web,websecure".to_string());
        if domain.redirect_https {
            middlewares.push(middleware_ref(namespace, REDIRECT_MIDDLEWARE));
        }
    } else {
        annotations.insert(ENTRYPOINTS_ANNOTATION.to_string(), "web".to_string());
    }
    if let Some(name) = basic_auth_middleware {
        middlewares.push(middleware_ref(namespace, name));
    }
    if !middlewares.is_empty() {
        annotations.insert(MIDDLEWARES_ANNOTATION.to_string(), middlewares.join(","));
    }

    let tls = domain.use_ssl.then(|| {
        vec![IngressTLS {
            hosts: Some(vec![domain.hostname.clone()]),
            secret_name: Some(format!("tls-{}", hostname_label(&domain.hostname))),
        }]
    });

    Ingress {
        metadata: ObjectMeta {
            name: Some(ingress_name(&domain.hostname)),
            namespace: Some(namespace.to_string()),
            labels: Some(app_labels(&app.id)),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            ingress_class_name: Some(INGRESS_CLASS.to_string()),
            rules: Some(vec![IngressRule {
                host: Some(domain.hostname.clone()),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some("/".to_string()),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: service_name(&app.id),
                                port: Some(ServiceBackendPort {
                                    number: Some(domain.port),
                                    ..Default::default()
                                }),
                            }),
                            ..Default::default()
                        },
                    }],
                }),
            }]),
            tls,
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn redirect_middleware(namespace: &str) -> Middleware {
    let mut middleware = Middleware::new(
        REDIRECT_MIDDLEWARE,
        MiddlewareSpec {
            basic_auth: None,
            redirect_scheme: Some(RedirectSchemeMiddleware {
                scheme: "https".to_string(),
                permanent: true,
            }),
        },
    );
    middleware.metadata.namespace = Some(namespace.to_string());
    middleware
}

fn ingress_host(ingress: &Ingress) -> Option<&str> {
    ingress
        .spec
        .as_ref()?
        .rules
        .as_ref()?
        .first()?
        .host
        .as_deref()
}

/// Summary of one ingress reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngressReport {
    /// Ingresses applied, by name.
    pub applied: Vec<String>,
    /// Stale ingresses deleted, by name.
    pub removed: Vec<String>,
}

/// Reconcile basic auth, every domain's ingress and the garbage collection of
/// undeclared hostnames.
pub async fn reconcile_ingress(
    cluster: &Cluster,
    app: &App,
    config: &EngineConfig,
) -> Result<IngressReport> {
    let namespace = app.namespace();
    let basic_auth = reconcile_basic_auth(
        cluster,
        namespace,
        &app.id,
        &app.basic_auth,
        config.credential_key.as_ref(),
    )
    .await?;

    if app.domains.iter().any(|d| d.use_ssl && d.redirect_https) {
        cluster.apply(namespace, &redirect_middleware(namespace)).await?;
    }

    let mut report = IngressReport::default();
    for domain in &app.domains {
        let ingress = build_ingress(app, domain, basic_auth.as_deref(), config);
        cluster.apply(namespace, &ingress).await?;
        report.applied.push(ingress_name(&domain.hostname));
    }

    let declared: HashSet<&str> = app.domains.iter().map(|d| d.hostname.as_str()).collect();
    let observed: Vec<Ingress> = cluster
        .list(namespace, Some(&app_selector(&app.id)))
        .await?;
    for ingress in observed {
        let declared_host = ingress_host(&ingress).is_some_and(|h| declared.contains(h));
        if declared_host {
            continue;
        }
        let Some(name) = ingress.metadata.name else {
            continue;
        };
        if cluster.delete::<Ingress>(namespace, &name).await? {
            info!(app_id = %app.id, namespace, ingress = %name, "Removed stale ingress");
            report.removed.push(name);
        }
    }

    Ok(report)
}

/// Roll the ingress router's pods and wait until the new ones are ready.
pub async fn restart_ingress_router(
    cluster: &Cluster,
    config: &EngineConfig,
    cancel: &CancellationToken,
) -> Result<()> {
    let namespace = config.router_namespace.as_str();
    let name = config.router_deployment.as_str();
    let patch = json!({
        "spec": {"template": {"metadata": {"annotations": {
            RESTARTED_AT_ANNOTATION: Utc::now().to_rfc3339()
        }}}}
    });
    cluster.patch::<Deployment>(namespace, name, patch).await?;
    info!(namespace, deployment = name, "Restarting ingress router");

    wait_for("ingress router restart", &config.router_restart_wait, cancel, || async {
        let Some(deployment) = cluster.get::<Deployment>(namespace, name).await? else {
            return Ok(WaitState::Failed(format!("deployment {name} disappeared")));
        };
        Ok::<_, Error>(rollout_state(&deployment))
    })
    .await?;

    info!(namespace, deployment = name, "Ingress router ready");
    Ok(())
}

/// Rollout progress of a deployment.
pub fn rollout_state(deployment: &Deployment) -> WaitState<()> {
    let generation = deployment.metadata.generation.unwrap_or(0);
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let Some(status) = deployment.status.as_ref() else {
        return WaitState::Pending;
    };
    if status.observed_generation.unwrap_or(0) < generation {
        return WaitState::Pending;
    }
    let updated = status.updated_replicas.unwrap_or(0);
    let ready = status.ready_replicas.unwrap_or(0);
    let available = status.available_replicas.unwrap_or(0);
    if updated >= desired && ready >= desired && available >= desired {
        WaitState::Succeeded(())
    } else {
        WaitState::InProgress(format!("{ready}/{desired} ready, {updated} updated"))
    }
}
