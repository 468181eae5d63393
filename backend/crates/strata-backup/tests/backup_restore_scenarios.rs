//! End-to-end backup and restore scenarios
//!
//! Drives a `BackupHandler` against the in-memory catalog, repository and
//! dispatcher from `strata_backup::test_utils`:
//! - backup to a repository and restore into a new database
//! - cancellation, timeouts and sub-task failures
//! - one job per database under concurrent submission
//! - materialized views waiting for their base tables
//! - external catalog snapshots

use std::collections::BTreeMap;
use std::sync::Arc;

use strata_backup::test_utils::{materialized_view, olap_table, test_settings, RecordingDispatcher, TestCluster};
use strata_backup::{
    BackupError, BackupRequest, Catalog, CatalogMeta, ColumnMeta, CompletionOutcome, Repository,
    RestoreRequest, RestoreSelection, TaskCompletion,
};
use strata_commons::{CatalogRef, JobType, TableRef, TargetKey, TaskKind};

fn sales_cluster() -> (TestCluster, TargetKey) {
    let cluster = TestCluster::new();
    let db = cluster.seed_database("sales", vec![olap_table("orders", &["p1", "p2"], 3, 100)]);
    cluster.add_repository("repo1", false);
    (cluster, TargetKey::Database(db))
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// =============================================================================
// Backup and restore
// =============================================================================

#[test]
fn test_backup_single_table_reaches_finished() {
    let (cluster, target) = sales_cluster();
    let store = cluster.connector.store("mem://repo1");

    let job_id = cluster
        .handler
        .submit_backup(BackupRequest::database("repo1", "nightly", "sales"))
        .unwrap();

    cluster.handler.drive_all();
    assert_eq!(cluster.dispatcher.tasks_of_kind(TaskKind::Snapshot).len(), 6);
    assert_eq!(cluster.handler.get_job(target).unwrap().state, "SNAPSHOTTING");

    let summary = cluster.drive_until_done(target, 10).unwrap();
    assert_eq!(summary.job_id, job_id);
    assert_eq!(summary.state, "FINISHED");
    assert_eq!(summary.outstanding_tasks, 0);
    assert!(summary.finished_at.is_some());

    let times = store.snapshot_times("nightly");
    assert_eq!(times.len(), 1);
    let repo = cluster.handler.context().repositories.resolve("repo1").unwrap();
    let info = repo.get_snapshot_info("nightly", times[0]).unwrap();
    assert_eq!(info.db_name, "sales");
    assert!(info.contains_table("orders"));
    let meta = repo.get_snapshot_meta(&info, info.meta_version).unwrap();
    assert_eq!(meta.get_table("orders").unwrap().tablet_count(), 6);
}

#[test]
fn test_restore_creates_missing_database_and_table() {
    let (cluster, target) = sales_cluster();
    let store = cluster.connector.store("mem://repo1");
    cluster
        .handler
        .submit_backup(BackupRequest::database("repo1", "nightly", "sales"))
        .unwrap();
    cluster.drive_until_done(target, 10).unwrap();
    let backup_time = store.snapshot_times("nightly")[0];

    assert!(cluster.catalog.get_database("sales_restored").is_none());
    cluster
        .handler
        .submit_restore(RestoreRequest::database("repo1", "nightly", backup_time, "sales_restored"))
        .unwrap();
    let db = cluster.catalog.get_database("sales_restored").unwrap();
    let restore_target = TargetKey::Database(db.id);

    cluster.handler.drive_all();
    assert_eq!(cluster.handler.get_job(restore_target).unwrap().state, "DOWNLOADING");
    let downloads = cluster.dispatcher.tasks_of_kind(TaskKind::Download);
    let tablets: usize = downloads
        .iter()
        .map(|task| match &task.payload {
            strata_backup::TaskPayload::Download { files, .. } => files.len(),
            _ => 0,
        })
        .sum();
    assert_eq!(tablets, 6);

    let summary = cluster.drive_until_done(restore_target, 10).unwrap();
    assert_eq!(summary.state, "FINISHED");

    let orders = cluster.catalog.get_table(db.id, "orders").unwrap();
    let source = cluster
        .catalog
        .get_table(target.db_id().unwrap(), "orders")
        .unwrap();
    assert!(orders.same_schema(&source));
    assert_eq!(orders.partitions.len(), 2);
    assert_ne!(orders.id, source.id);
    assert!(cluster.catalog.is_restore_finished(db.id, "orders"));
}

#[test]
fn test_restore_selected_table_under_alias() {
    let cluster = TestCluster::new();
    let db = cluster.seed_database(
        "sales",
        vec![
            olap_table("orders", &["p1", "p2"], 1, 100),
            olap_table("refunds", &["p1"], 1, 200),
        ],
    );
    let store = cluster.add_repository("repo1", false);
    cluster
        .handler
        .submit_backup(BackupRequest::database("repo1", "snap", "sales"))
        .unwrap();
    cluster.drive_until_done(TargetKey::Database(db), 10).unwrap();

    let selection = RestoreSelection::tables(vec![TableRef::new("orders")
        .with_partitions(vec!["p2".to_string()])
        .with_alias("orders_p2")]);
    cluster
        .handler
        .submit_restore(
            RestoreRequest::database("repo1", "snap", store.snapshot_times("snap")[0], "sales")
                .with_selection(selection),
        )
        .unwrap();
    let summary = cluster.drive_until_done(TargetKey::Database(db), 10).unwrap();
    assert_eq!(summary.state, "FINISHED");

    let restored = cluster.catalog.get_table(db, "orders_p2").unwrap();
    let partitions: Vec<_> = restored.partitions.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(partitions, vec!["p2"]);
    assert!(cluster.catalog.get_table(db, "refunds").is_some());
}

#[test]
fn test_restore_rejects_unknown_snapshot_and_partition() {
    let (cluster, target) = sales_cluster();
    let store = cluster.connector.store("mem://repo1");

    let err = cluster
        .handler
        .submit_restore(RestoreRequest::database("repo1", "missing", 1, "sales"))
        .unwrap_err();
    assert!(matches!(err, BackupError::NotFound(_)));

    cluster
        .handler
        .submit_backup(BackupRequest::database("repo1", "snap", "sales"))
        .unwrap();
    cluster.drive_until_done(target, 10).unwrap();

    let selection = RestoreSelection::tables(vec![
        TableRef::new("orders").with_partitions(vec!["p9".to_string()])
    ]);
    let err = cluster
        .handler
        .submit_restore(
            RestoreRequest::database("repo1", "snap", store.snapshot_times("snap")[0], "copy")
                .with_selection(selection),
        )
        .unwrap_err();
    assert!(matches!(err, BackupError::NotFound(_)));
    assert!(cluster.catalog.get_database("copy").is_none());
}

#[test]
fn test_restore_without_readable_meta_finishes_empty() {
    let (cluster, target) = sales_cluster();
    let store = cluster.connector.store("mem://repo1");
    cluster
        .handler
        .submit_backup(BackupRequest::database("repo1", "snap", "sales"))
        .unwrap();
    cluster.drive_until_done(target, 10).unwrap();
    store.set_meta_unavailable(true);

    cluster
        .handler
        .submit_restore(RestoreRequest::database("repo1", "snap", store.snapshot_times("snap")[0], "copy"))
        .unwrap();
    let db = cluster.catalog.get_database("copy").unwrap();
    let summary = cluster.drive_until_done(TargetKey::Database(db.id), 3).unwrap();
    assert_eq!(summary.state, "FINISHED");
    assert!(cluster.catalog.list_tables(db.id).is_empty());
    assert!(cluster.dispatcher.tasks_of_kind(TaskKind::Download).is_empty());
}

#[test]
fn test_restore_into_table_with_other_schema_is_cancelled() {
    let (cluster, target) = sales_cluster();
    let store = cluster.connector.store("mem://repo1");
    cluster
        .handler
        .submit_backup(BackupRequest::database("repo1", "snap", "sales"))
        .unwrap();
    cluster.drive_until_done(target, 10).unwrap();

    let mut conflicting = olap_table("orders", &["p1", "p2"], 3, 500);
    conflicting.columns.push(ColumnMeta::new("note", "VARCHAR(64)"));
    let copy = cluster.seed_database("copy", vec![conflicting]);

    cluster
        .handler
        .submit_restore(RestoreRequest::database("repo1", "snap", store.snapshot_times("snap")[0], "copy"))
        .unwrap();
    let summary = cluster.drive_until_done(TargetKey::Database(copy), 3).unwrap();
    assert_eq!(summary.state, "CANCELLED");
    let error = summary.error.unwrap();
    assert!(error.starts_with("[CATALOG]"), "{}", error);
    assert!(error.contains("different schema"), "{}", error);
    // the pre-existing table is left alone
    assert_eq!(cluster.catalog.get_table(copy, "orders").unwrap().columns.len(), 3);
}

// =============================================================================
// Cancellation, timeouts and failures
// =============================================================================

#[test]
fn test_cancel_before_completion_discards_late_results() {
    let (cluster, target) = sales_cluster();
    cluster
        .handler
        .submit_backup(BackupRequest::database("repo1", "snap", "sales"))
        .unwrap();
    cluster.handler.drive_all();
    let snapshots = cluster.dispatcher.tasks_of_kind(TaskKind::Snapshot);

    cluster.handler.cancel_job(target, JobType::Backup).unwrap();
    let summary = cluster.handler.get_job(target).unwrap();
    assert_eq!(summary.state, "CANCELLED");
    assert_eq!(summary.outstanding_tasks, 0);

    let aborted = cluster.dispatcher.aborted();
    assert_eq!(aborted.len(), 1);
    assert_eq!(aborted[0].1.len(), snapshots.len());

    for task in &snapshots {
        let outcome = cluster
            .handler
            .route_completion(RecordingDispatcher::success_for(task));
        assert_eq!(outcome, CompletionOutcome::Discarded);
    }
    assert_eq!(cluster.handler.get_job(target).unwrap().state, "CANCELLED");

    // the slot is free again
    cluster
        .handler
        .submit_backup(BackupRequest::database("repo1", "snap_retry", "sales"))
        .unwrap();
}

#[test]
fn test_cancelled_restore_drops_created_tables() {
    let (cluster, target) = sales_cluster();
    let store = cluster.connector.store("mem://repo1");
    cluster
        .handler
        .submit_backup(BackupRequest::database("repo1", "snap", "sales"))
        .unwrap();
    cluster.drive_until_done(target, 10).unwrap();

    cluster
        .handler
        .submit_restore(RestoreRequest::database("repo1", "snap", store.snapshot_times("snap")[0], "copy"))
        .unwrap();
    let copy = cluster.catalog.get_database("copy").unwrap().id;
    cluster.handler.drive_all();
    assert!(cluster.catalog.get_table(copy, "orders").is_some());

    cluster
        .handler
        .cancel_job(TargetKey::Database(copy), JobType::Restore)
        .unwrap();
    assert!(cluster.catalog.get_table(copy, "orders").is_none());
    assert_eq!(
        cluster.handler.get_job(TargetKey::Database(copy)).unwrap().state,
        "CANCELLED"
    );
}

#[test]
fn test_job_times_out_without_completions() {
    let (cluster, target) = sales_cluster();
    cluster
        .handler
        .submit_backup(BackupRequest::database("repo1", "slow", "sales").with_timeout_ms(1_000))
        .unwrap();
    cluster.handler.drive_all();
    assert_eq!(cluster.handler.get_job(target).unwrap().state, "SNAPSHOTTING");

    cluster.handler.drive_all_at(now_ms() + 60_000);
    let summary = cluster.handler.get_job(target).unwrap();
    assert_eq!(summary.state, "CANCELLED");
    assert!(summary.error.unwrap().starts_with("[TIMEOUT]"));
    assert_eq!(cluster.dispatcher.aborted().len(), 1);
}

#[test]
fn test_failed_upload_cancels_backup() {
    let (cluster, target) = sales_cluster();
    cluster
        .handler
        .submit_backup(BackupRequest::database("repo1", "snap", "sales"))
        .unwrap();
    cluster.handler.drive_all();
    cluster.deliver_all();
    cluster.handler.drive_all();

    let uploads = cluster.dispatcher.take_tasks();
    assert!(!uploads.is_empty());
    assert!(uploads.iter().all(|t| t.kind == TaskKind::Upload));

    let outcome = cluster
        .handler
        .route_completion(TaskCompletion::failed(&uploads[0], "broker unreachable"));
    assert_eq!(outcome, CompletionOutcome::Accepted);

    let summary = cluster.handler.get_job(target).unwrap();
    assert_eq!(summary.state, "CANCELLED");
    let error = summary.error.unwrap();
    assert!(error.starts_with("[SUB_TASK_FAILURE]"));
    assert!(error.contains("broker unreachable"));
    assert!(cluster.connector.store("mem://repo1").labels().is_empty());
}

#[test]
fn test_progress_reports_reach_upload_tasks_only() {
    let (cluster, target) = sales_cluster();
    let job_id = cluster
        .handler
        .submit_backup(BackupRequest::database("repo1", "snap", "sales"))
        .unwrap();
    cluster.handler.drive_all();
    let snapshot = cluster.dispatcher.tasks_of_kind(TaskKind::Snapshot)[0].clone();
    assert!(!cluster
        .handler
        .report_progress(TaskKind::Upload, job_id, snapshot.task_id, 1, 2));

    cluster.deliver_all();
    cluster.handler.drive_all();
    let upload = cluster.dispatcher.tasks_of_kind(TaskKind::Upload)[0].clone();
    assert!(cluster
        .handler
        .report_progress(TaskKind::Upload, job_id, upload.task_id, 1, 3));
    let progress = cluster.handler.get_job(target).unwrap().progress;
    assert_eq!(progress.get(&upload.task_id), Some(&(1, 3)));
}

// =============================================================================
// Single-flight slot
// =============================================================================

#[test]
fn test_concurrent_backups_for_same_database() {
    let (cluster, _) = sales_cluster();
    let handler = Arc::clone(&cluster.handler);

    let results: Vec<_> = std::thread::scope(|scope| {
        let workers: Vec<_> = ["left", "right"]
            .into_iter()
            .map(|label| {
                let handler = Arc::clone(&handler);
                scope.spawn(move || {
                    handler.submit_backup(BackupRequest::database("repo1", label, "sales"))
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap()).collect()
    });

    let admitted = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(admitted, 1);
    let rejected = results.into_iter().find_map(|r| r.err()).unwrap();
    assert!(matches!(rejected, BackupError::Conflict(_)), "{}", rejected);
    assert_eq!(cluster.handler.running_job_count(), 1);
}

// =============================================================================
// Materialized views and external catalogs
// =============================================================================

#[test]
fn test_materialized_view_waits_for_base_table() {
    let cluster = TestCluster::new();
    let db = cluster.seed_database(
        "sales",
        vec![
            olap_table("orders", &["p1"], 2, 100),
            materialized_view("orders_mv", &["orders"], 200),
        ],
    );
    let store = cluster.add_repository("repo1", false);
    cluster
        .handler
        .submit_backup(BackupRequest::database("repo1", "snap", "sales"))
        .unwrap();
    cluster.drive_until_done(TargetKey::Database(db), 10).unwrap();
    let backup_time = store.snapshot_times("snap")[0];

    // view first: its base is not there yet
    cluster
        .handler
        .submit_restore(
            RestoreRequest::database("repo1", "snap", backup_time, "copy")
                .with_selection(RestoreSelection::tables(vec![TableRef::new("orders_mv")])),
        )
        .unwrap();
    let copy = cluster.catalog.get_database("copy").unwrap().id;
    let summary = cluster.drive_until_done(TargetKey::Database(copy), 10).unwrap();
    assert_eq!(summary.state, "FINISHED");
    assert!(!cluster.catalog.is_mv_active(copy, "orders_mv"));
    assert!(cluster.handler.context().mv_restore.is_waiting(copy, "orders_mv"));

    cluster
        .handler
        .submit_restore(
            RestoreRequest::database("repo1", "snap", backup_time, "copy")
                .with_selection(RestoreSelection::tables(vec![TableRef::new("orders")])),
        )
        .unwrap();
    cluster.drive_until_done(TargetKey::Database(copy), 10).unwrap();
    assert!(cluster.catalog.is_mv_active(copy, "orders_mv"));
    assert_eq!(cluster.handler.context().mv_restore.pending_count(), 0);
}

#[test]
fn test_parked_view_released_by_age_after_job_replaced() {
    let cluster = TestCluster::new();
    let db = cluster.seed_database(
        "sales",
        vec![
            olap_table("orders", &["p1"], 2, 100),
            materialized_view("orders_mv", &["orders"], 200),
        ],
    );
    let store = cluster.add_repository("repo1", false);
    cluster
        .handler
        .submit_backup(BackupRequest::database("repo1", "snap", "sales"))
        .unwrap();
    cluster.drive_until_done(TargetKey::Database(db), 10).unwrap();
    let backup_time = store.snapshot_times("snap")[0];

    cluster
        .handler
        .submit_restore(
            RestoreRequest::database("repo1", "snap", backup_time, "copy")
                .with_selection(RestoreSelection::tables(vec![TableRef::new("orders_mv")])),
        )
        .unwrap();
    let copy = cluster.catalog.get_database("copy").unwrap().id;
    cluster.drive_until_done(TargetKey::Database(copy), 10).unwrap();
    let mv_restore = &cluster.handler.context().mv_restore;
    let parked_at = mv_restore.waiters()[0].parked_at;

    // a running restore replaces the finished one, so no job expiry releases the view
    cluster
        .handler
        .submit_restore(
            RestoreRequest::database("repo1", "snap", backup_time, "copy")
                .with_selection(RestoreSelection::tables(vec![TableRef::new("orders")])),
        )
        .unwrap();
    let keep_ms = test_settings().history_job_keep_max_secs as i64 * 1000;
    cluster.handler.expire_finished_at(parked_at + keep_ms - 1);
    assert!(mv_restore.is_waiting(copy, "orders_mv"));

    cluster.handler.expire_finished_at(parked_at + keep_ms + 1);
    assert_eq!(mv_restore.pending_count(), 0);
    assert!(cluster.handler.get_job(TargetKey::Database(copy)).is_some());
}

#[test]
fn test_external_catalog_backup_and_aliased_restore() {
    let cluster = TestCluster::new();
    let store = cluster.add_repository("repo1", false);
    cluster.catalog.add_external_catalog(CatalogMeta {
        name: "hive_prod".to_string(),
        catalog_type: "hive".to_string(),
        properties: BTreeMap::from([(
            "hive.metastore.uris".to_string(),
            "thrift://metastore:9083".to_string(),
        )]),
    });

    cluster
        .handler
        .submit_backup(BackupRequest::external_catalogs(
            "repo1",
            "catalogs",
            vec![CatalogRef::new("hive_prod")],
        ))
        .unwrap();
    let summary = cluster
        .drive_until_done(TargetKey::ExternalCatalog, 10)
        .unwrap();
    assert_eq!(summary.state, "FINISHED");
    assert!(cluster.dispatcher.tasks().is_empty());

    let err = cluster
        .handler
        .submit_restore(RestoreRequest::database(
            "repo1",
            "catalogs",
            store.snapshot_times("catalogs")[0],
            "sales",
        ))
        .unwrap_err();
    assert!(matches!(err, BackupError::Validation(_)));

    let aliased = CatalogRef {
        name: "hive_prod".to_string(),
        alias: Some("hive_copy".to_string()),
    };
    cluster
        .handler
        .submit_restore(RestoreRequest::external_catalogs(
            "repo1",
            "catalogs",
            store.snapshot_times("catalogs")[0],
            vec![aliased],
        ))
        .unwrap();
    let summary = cluster
        .drive_until_done(TargetKey::ExternalCatalog, 10)
        .unwrap();
    assert_eq!(summary.state, "FINISHED");
    let restored = cluster.catalog.get_external_catalog("hive_copy").unwrap();
    assert_eq!(restored.catalog_type, "hive");
}
