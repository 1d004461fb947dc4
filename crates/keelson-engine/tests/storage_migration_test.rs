// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Storage-class migration tests against the mock cluster.
//!
//! Cover the committed cut-over, rollback after a failed or vanished copy job
//! and the guards that refuse to start a migration.

mod common;

use common::{NAMESPACE, TestContext, app, volume};
use k8s_openapi::api::batch::v1::{Job, JobStatus};
use kube::api::ObjectMeta;
use keelson_engine::Error;
use keelson_engine::cluster::MockCluster;
use keelson_engine::cluster::mock::JobOutcome;
use keelson_engine::deployment::DeployRequest;
use keelson_engine::model::{AccessMode, AppVolume};
use keelson_engine::storage_migration::MigrationPhase;
use keelson_engine::store::StateStore;

/// Declares and deploys a two-replica app with one shared-write volume.
async fn deployed(ctx: &TestContext) {
    let mut web = app("web");
    web.replicas = 2;
    web.volumes = vec![volume("vol-1", "web", "/data", 1024, AccessMode::ReadWriteMany)];
    ctx.declare(&web).await;
    ctx.add_storage_class("fast-ssd").await;
    ctx.engine
        .deploy("web", &DeployRequest::new("dep-1"), &ctx.cancel)
        .await
        .expect("Deploy failed");
    ctx.mock.clear_calls().await;
}

fn by_path<'a>(volumes: &'a [AppVolume], path: &str) -> Option<&'a AppVolume> {
    volumes.iter().find(|v| v.container_mount_path == path)
}

#[tokio::test]
async fn test_migration_cuts_over() {
    let ctx = TestContext::new();
    deployed(&ctx).await;

    let report = ctx
        .engine
        .migrate_volume("vol-1", "fast-ssd", &ctx.cancel)
        .await
        .expect("Migration failed");

    assert_eq!(report.phase, MigrationPhase::CutOverCommitted);
    assert_eq!(report.mount_path, "/data");
    assert_eq!(report.old_mount_path, "/data_old");
    assert_eq!(report.storage_class, "fast-ssd");

    let volumes = ctx.store.list_volumes("web").await.unwrap();
    assert_eq!(volumes.len(), 2);
    let current = by_path(&volumes, "/data").unwrap();
    assert_eq!(current.id, report.record.new_volume_id);
    assert_eq!(current.storage_class, "fast-ssd");
    let old = by_path(&volumes, "/data_old").unwrap();
    assert_eq!(old.id, "vol-1");
    assert_eq!(old.storage_class, "longhorn");

    let claim_name = format!("pvc-{}", report.record.new_volume_id);
    let claim = ctx
        .mock
        .object("PersistentVolumeClaim", NAMESPACE, &claim_name)
        .await
        .unwrap();
    assert_eq!(claim["spec"]["storageClassName"], "fast-ssd");

    // The app was stopped before the copy started
    let calls = ctx.mock.mutations().await;
    let scaled = calls
        .iter()
        .position(|c| c.verb == "patch" && c.kind == "Deployment")
        .unwrap();
    let copied = calls
        .iter()
        .position(|c| c.verb == "create" && c.kind == "Job")
        .unwrap();
    assert!(scaled < copied);
    let deployment = ctx.mock.object("Deployment", NAMESPACE, "web").await.unwrap();
    assert_eq!(deployment["spec"]["replicas"], 0);

    // The next deploy mounts both claims
    let report = ctx
        .engine
        .deploy("web", &DeployRequest::new("dep-2"), &ctx.cancel)
        .await
        .unwrap();
    assert!(report.removed_claims.is_empty());
    let deployment = ctx.mock.object("Deployment", NAMESPACE, "web").await.unwrap();
    assert_eq!(deployment["spec"]["replicas"], 2);
    let mounts = deployment["spec"]["template"]["spec"]["containers"][0]["volumeMounts"]
        .as_array()
        .unwrap()
        .len();
    assert_eq!(mounts, 2);
}

async fn assert_rolled_back(ctx: &TestContext) {
    let volumes = ctx.store.list_volumes("web").await.unwrap();
    assert_eq!(volumes.len(), 1);
    assert_eq!(volumes[0].id, "vol-1");
    assert_eq!(volumes[0].container_mount_path, "/data");
    assert_eq!(volumes[0].storage_class, "longhorn");

    assert_eq!(
        ctx.mock.names("PersistentVolumeClaim", NAMESPACE).await,
        vec!["pvc-vol-1"]
    );
    assert!(ctx.mock.names("Job", NAMESPACE).await.is_empty());
}

#[tokio::test]
async fn test_failed_copy_rolls_back() {
    let ctx = TestContext::with_cluster(MockCluster::with_job_outcome(JobOutcome::Fail));
    deployed(&ctx).await;

    let err = ctx
        .engine
        .migrate_volume("vol-1", "fast-ssd", &ctx.cancel)
        .await
        .unwrap_err();

    match err {
        Error::External(message) => assert!(message.contains("rsync exited with 23")),
        other => panic!("unexpected error: {other}"),
    }
    assert_rolled_back(&ctx).await;
}

#[tokio::test]
async fn test_vanished_job_rolls_back() {
    let ctx = TestContext::with_cluster(MockCluster::with_job_outcome(JobOutcome::Disappear));
    deployed(&ctx).await;

    let err = ctx
        .engine
        .migrate_volume("vol-1", "fast-ssd", &ctx.cancel)
        .await
        .unwrap_err();

    match err {
        Error::External(message) => assert!(message.contains("job disappeared")),
        other => panic!("unexpected error: {other}"),
    }
    assert_rolled_back(&ctx).await;
}

#[tokio::test]
async fn test_stuck_copy_times_out_and_rolls_back() {
    let ctx = TestContext::with_cluster(MockCluster::with_job_outcome(JobOutcome::Hang));
    deployed(&ctx).await;

    let err = ctx
        .engine
        .migrate_volume("vol-1", "fast-ssd", &ctx.cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ConvergenceTimeout { .. }));
    assert_rolled_back(&ctx).await;
}

#[tokio::test]
async fn test_running_copy_job_blocks_new_migration() {
    let ctx = TestContext::new();
    deployed(&ctx).await;
    let running = Job {
        metadata: ObjectMeta {
            name: Some("migrate-vol-1".to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        status: Some(JobStatus {
            active: Some(1),
            ..Default::default()
        }),
        ..Default::default()
    };
    ctx.mock.seed(NAMESPACE, &running).await;
    ctx.mock.clear_calls().await;

    let err = ctx
        .engine
        .migrate_volume("vol-1", "fast-ssd", &ctx.cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Conflict(_)));
    assert!(ctx.mock.mutations().await.is_empty());
}

#[tokio::test]
async fn test_finished_copy_job_is_replaced() {
    let ctx = TestContext::new();
    deployed(&ctx).await;
    let finished = Job {
        metadata: ObjectMeta {
            name: Some("migrate-vol-1".to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        status: Some(JobStatus {
            succeeded: Some(1),
            ..Default::default()
        }),
        ..Default::default()
    };
    ctx.mock.seed(NAMESPACE, &finished).await;

    let report = ctx
        .engine
        .migrate_volume("vol-1", "fast-ssd", &ctx.cancel)
        .await
        .unwrap();
    assert_eq!(report.phase, MigrationPhase::CutOverCommitted);
}

#[tokio::test]
async fn test_guards_reject_before_any_change() {
    let ctx = TestContext::new();
    deployed(&ctx).await;

    let err = ctx
        .engine
        .migrate_volume("vol-1", "longhorn", &ctx.cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = ctx
        .engine
        .migrate_volume("vol-1", "does-not-exist", &ctx.cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = ctx
        .engine
        .migrate_volume("missing", "fast-ssd", &ctx.cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    assert!(ctx.mock.mutations().await.is_empty());
    assert_eq!(ctx.store.list_volumes("web").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_second_migration_needs_old_path_cleared() {
    let ctx = TestContext::new();
    deployed(&ctx).await;
    ctx.add_storage_class("archive").await;

    let first = ctx
        .engine
        .migrate_volume("vol-1", "fast-ssd", &ctx.cancel)
        .await
        .unwrap();

    let err = ctx
        .engine
        .migrate_volume(&first.record.new_volume_id, "archive", &ctx.cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));

    assert!(ctx.engine.delete_volume("vol-1").await.unwrap());
    let second = ctx
        .engine
        .migrate_volume(&first.record.new_volume_id, "archive", &ctx.cancel)
        .await
        .unwrap();
    assert_eq!(second.storage_class, "archive");
}

#[tokio::test]
async fn test_shared_volume_cannot_migrate() {
    let ctx = TestContext::new();
    deployed(&ctx).await;
    let mut reader = app("reader");
    let mut reference = volume("vol-2", "reader", "/shared", 1024, AccessMode::ReadWriteMany);
    reference.shared_volume_id = Some("vol-1".to_string());
    reader.volumes = vec![reference];
    ctx.declare(&reader).await;

    let err = ctx
        .engine
        .migrate_volume("vol-1", "fast-ssd", &ctx.cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = ctx
        .engine
        .migrate_volume("vol-2", "fast-ssd", &ctx.cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
async fn test_storage_class_changes_only_through_migration() {
    let ctx = TestContext::new();
    deployed(&ctx).await;

    let mut reclassed = volume("vol-1", "web", "/data", 1024, AccessMode::ReadWriteMany);
    reclassed.storage_class = "fast-ssd".to_string();
    let err = ctx.engine.save_volume(&reclassed).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert_eq!(
        ctx.store.get_volume("vol-1").await.unwrap().unwrap().storage_class,
        "longhorn"
    );

    let report = ctx
        .engine
        .migrate_volume("vol-1", "fast-ssd", &ctx.cancel)
        .await
        .unwrap();

    // Growing the migrated volume without naming a class keeps it on fast-ssd
    let mut grown = volume(
        &report.record.new_volume_id,
        "web",
        "/data",
        2048,
        AccessMode::ReadWriteMany,
    );
    grown.storage_class = String::new();
    let saved = ctx.engine.save_volume(&grown).await.unwrap();
    assert_eq!(saved.storage_class, "fast-ssd");
}
