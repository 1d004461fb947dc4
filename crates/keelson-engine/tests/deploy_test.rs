// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end deploy tests against the mock cluster.
//!
//! These tests drive the engine the way the platform does: declare an app in
//! the store, deploy it, change the declaration, deploy again.

mod common;

use common::{NAMESPACE, TestContext, app, volume};
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::ObjectMeta;
use keelson_engine::cluster::ApplyOutcome;
use keelson_engine::deployment::DeployRequest;
use keelson_engine::ingress::ingress_name;
use keelson_engine::model::{AccessMode, App, AppDomain, AppPort, BasicAuthEntry, PolicyMode};
use keelson_engine::store::StateStore;
use keelson_engine::Error;

fn web_app() -> App {
    let mut web = app("web");
    web.domains = vec![AppDomain {
        id: "dom-1".to_string(),
        hostname: "app.example.com".to_string(),
        port: 8080,
        use_ssl: true,
        redirect_https: true,
    }];
    web.ports = vec![AppPort {
        id: "port-1".to_string(),
        port: 9000,
    }];
    web.basic_auth = vec![BasicAuthEntry {
        username: "admin".to_string(),
        password: "s3cret".to_string(),
    }];
    web.network.use_network_policy = true;
    web.network.egress = PolicyMode::InternetOnly;
    web.volumes = vec![volume("vol-1", "web", "/data", 1024, AccessMode::ReadWriteOnce)];
    web
}

#[tokio::test]
async fn test_full_deploy_creates_every_object() {
    let ctx = TestContext::new();
    ctx.declare(&web_app()).await;

    let report = ctx
        .engine
        .deploy("web", &DeployRequest::new("dep-1"), &ctx.cancel)
        .await
        .expect("Deploy failed");

    assert_eq!(report.outcome, ApplyOutcome::Created);
    assert_eq!(report.network_policy, Some(ApplyOutcome::Created));
    assert_eq!(report.service, Some(ApplyOutcome::Created));
    assert_eq!(report.ingress.applied, vec![ingress_name("app.example.com")]);
    assert!(ctx.mock.has_namespace(NAMESPACE).await);

    assert_eq!(ctx.mock.names("Deployment", NAMESPACE).await, vec!["web"]);
    assert_eq!(ctx.mock.names("Service", NAMESPACE).await, vec!["svc-web"]);
    assert_eq!(ctx.mock.names("NetworkPolicy", NAMESPACE).await, vec!["web-netpol"]);
    assert_eq!(ctx.mock.names("PersistentVolumeClaim", NAMESPACE).await, vec!["pvc-vol-1"]);
    assert_eq!(
        ctx.mock.names("Secret", NAMESPACE).await,
        vec!["basic-auth-plain-web", "basic-auth-web"]
    );
    assert_eq!(
        ctx.mock.names("Middleware", NAMESPACE).await,
        vec!["basic-auth-web", "redirect-to-https"]
    );

    let deployment = ctx
        .mock
        .object("Deployment", NAMESPACE, "web")
        .await
        .unwrap();
    assert_eq!(deployment["spec"]["strategy"]["type"], "Recreate");
    let container = &deployment["spec"]["template"]["spec"]["containers"][0];
    assert_eq!(container["image"], "nginx:1.27");
    assert_eq!(container["volumeMounts"][0]["mountPath"], "/data");

    let service = ctx.mock.object("Service", NAMESPACE, "svc-web").await.unwrap();
    let ports: Vec<i64> = service["spec"]["ports"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["port"].as_i64().unwrap())
        .collect();
    assert_eq!(ports, vec![8080, 9000]);

    let log = ctx.engine.deployment_log("web", "dep-1").await.unwrap();
    assert!(log.contains("Deploying app web app (web)"));
    assert!(log.contains("Deployment finished"));
}

#[tokio::test]
async fn test_credentials_are_redisplayable() {
    let ctx = TestContext::new();
    ctx.declare(&web_app()).await;
    ctx.engine
        .deploy("web", &DeployRequest::new("dep-1"), &ctx.cancel)
        .await
        .unwrap();

    let entries = ctx.engine.reveal_basic_auth("web").await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].username, "admin");
    assert_eq!(entries[0].password, "s3cret");

    // The htpasswd secret never holds the plain password
    let secret = ctx
        .mock
        .object("Secret", NAMESPACE, "basic-auth-web")
        .await
        .unwrap();
    assert!(!secret.to_string().contains("s3cret"));
}

#[tokio::test]
async fn test_redeploy_with_same_id_is_idempotent() {
    let ctx = TestContext::new();
    ctx.declare(&web_app()).await;
    let request = DeployRequest::new("dep-1");

    ctx.engine.deploy("web", &request, &ctx.cancel).await.unwrap();
    ctx.mock.clear_calls().await;
    let report = ctx.engine.deploy("web", &request, &ctx.cancel).await.unwrap();

    assert_eq!(report.outcome, ApplyOutcome::Unchanged);
    assert_eq!(report.service, Some(ApplyOutcome::Unchanged));
    let writes: Vec<_> = ctx
        .mock
        .mutations()
        .await
        .into_iter()
        .filter(|c| matches!(c.verb, "create" | "replace" | "patch"))
        .collect();
    assert!(writes.is_empty(), "unexpected writes: {writes:?}");
}

#[tokio::test]
async fn test_removed_domain_is_collected() {
    let ctx = TestContext::new();
    let mut web = web_app();
    ctx.declare(&web).await;
    ctx.engine
        .deploy("web", &DeployRequest::new("dep-1"), &ctx.cancel)
        .await
        .unwrap();

    web.domains.clear();
    ctx.store.save_app(&web).await.unwrap();
    let report = ctx
        .engine
        .deploy("web", &DeployRequest::new("dep-2"), &ctx.cancel)
        .await
        .unwrap();

    assert_eq!(report.outcome, ApplyOutcome::Replaced);
    assert_eq!(report.ingress.removed, vec![ingress_name("app.example.com")]);
    assert!(ctx.mock.names("Ingress", NAMESPACE).await.is_empty());

    let service = ctx.mock.object("Service", NAMESPACE, "svc-web").await.unwrap();
    assert_eq!(service["spec"]["ports"].as_array().unwrap().len(), 1);
    assert_eq!(service["spec"]["ports"][0]["port"], 9000);
}

#[tokio::test]
async fn test_no_ports_removes_service() {
    let ctx = TestContext::new();
    let mut web = web_app();
    ctx.declare(&web).await;
    ctx.engine
        .deploy("web", &DeployRequest::new("dep-1"), &ctx.cancel)
        .await
        .unwrap();

    web.domains.clear();
    web.ports.clear();
    ctx.store.save_app(&web).await.unwrap();
    let report = ctx
        .engine
        .deploy("web", &DeployRequest::new("dep-2"), &ctx.cancel)
        .await
        .unwrap();

    assert_eq!(report.service, None);
    assert!(ctx.mock.names("Service", NAMESPACE).await.is_empty());
}

#[tokio::test]
async fn test_growing_a_volume_resizes_the_claim() {
    let ctx = TestContext::new();
    ctx.declare(&web_app()).await;
    ctx.engine
        .deploy("web", &DeployRequest::new("dep-1"), &ctx.cancel)
        .await
        .unwrap();

    let grown = volume("vol-1", "web", "/data", 2048, AccessMode::ReadWriteOnce);
    ctx.engine.save_volume(&grown).await.unwrap();
    let report = ctx
        .engine
        .deploy("web", &DeployRequest::new("dep-2"), &ctx.cancel)
        .await
        .unwrap();

    assert_eq!(report.resized.len(), 1);
    assert_eq!(report.resized[0].current_mb, 1024);
    assert_eq!(report.resized[0].declared_mb, 2048);

    let claim = ctx
        .mock
        .object("PersistentVolumeClaim", NAMESPACE, "pvc-vol-1")
        .await
        .unwrap();
    assert_eq!(claim["spec"]["resources"]["requests"]["storage"], "2048Mi");

    let log = ctx.engine.deployment_log("web", "dep-2").await.unwrap();
    assert!(log.contains("Scaling to zero before resizing volumes"));
}

#[tokio::test]
async fn test_shrinking_a_volume_is_rejected() {
    let ctx = TestContext::new();
    ctx.declare(&web_app()).await;
    ctx.engine
        .deploy("web", &DeployRequest::new("dep-1"), &ctx.cancel)
        .await
        .unwrap();

    let shrunk = volume("vol-1", "web", "/data", 512, AccessMode::ReadWriteOnce);
    let err = ctx.engine.save_volume(&shrunk).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    // A declaration that bypassed validation still never reaches the cluster
    ctx.store.update_volume(&shrunk).await.unwrap();
    let browser = Deployment {
        metadata: ObjectMeta {
            name: Some("fb-vol-1".to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    ctx.mock.seed(NAMESPACE, &browser).await;
    ctx.mock.clear_calls().await;
    let err = ctx
        .engine
        .deploy("web", &DeployRequest::new("dep-2"), &ctx.cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    let mutations = ctx.mock.mutations().await;
    assert!(mutations.is_empty(), "unexpected mutations: {mutations:?}");
    assert!(ctx.mock.object("Deployment", NAMESPACE, "fb-vol-1").await.is_some());

    let claim = ctx
        .mock
        .object("PersistentVolumeClaim", NAMESPACE, "pvc-vol-1")
        .await
        .unwrap();
    assert_eq!(claim["spec"]["resources"]["requests"]["storage"], "1024Mi");
}

#[tokio::test]
async fn test_pod_logs() {
    let ctx = TestContext::new();
    ctx.declare(&web_app()).await;
    ctx.engine
        .deploy("web", &DeployRequest::new("dep-1"), &ctx.cancel)
        .await
        .unwrap();

    let pods = ctx.mock.names("Pod", NAMESPACE).await;
    assert_eq!(pods.len(), 1);
    ctx.mock
        .set_pod_log(NAMESPACE, &pods[0], "listening on :8080\n")
        .await;

    let logs = ctx.engine.pod_logs("web", Some(50)).await.unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].pod, pods[0]);
    assert_eq!(logs[0].log, "listening on :8080\n");
}

#[tokio::test]
async fn test_delete_app_removes_every_object() {
    let ctx = TestContext::new();
    ctx.declare(&web_app()).await;
    ctx.engine
        .deploy("web", &DeployRequest::new("dep-1"), &ctx.cancel)
        .await
        .unwrap();

    let report = ctx.engine.delete_app("web").await.unwrap();

    assert!(report.app_deleted);
    assert!(report.removed.contains(&"Deployment/web".to_string()));
    assert!(report.removed.contains(&"PersistentVolumeClaim/pvc-vol-1".to_string()));
    for kind in [
        "Deployment",
        "Service",
        "Ingress",
        "NetworkPolicy",
        "Secret",
        "PersistentVolumeClaim",
    ] {
        assert!(
            ctx.mock.names(kind, NAMESPACE).await.is_empty(),
            "{kind} left behind"
        );
    }
    assert!(ctx.store.get_app("web").await.unwrap().is_none());
    assert!(ctx.store.get_volume("vol-1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_delete_app_refused_while_volume_is_shared() {
    let ctx = TestContext::new();
    let mut owner = app("owner");
    owner.volumes = vec![volume("vol-1", "owner", "/shared", 1024, AccessMode::ReadWriteMany)];
    ctx.declare(&owner).await;

    let mut reader = app("reader");
    let mut reference = volume("vol-2", "reader", "/shared", 1024, AccessMode::ReadWriteMany);
    reference.shared_volume_id = Some("vol-1".to_string());
    reader.volumes = vec![reference];
    ctx.declare(&reader).await;

    let err = ctx.engine.delete_app("owner").await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
    assert!(ctx.mock.mutations().await.is_empty());
    assert!(ctx.store.get_app("owner").await.unwrap().is_some());
}
