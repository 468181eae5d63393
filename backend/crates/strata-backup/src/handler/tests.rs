use std::sync::Arc;

use strata_commons::{JobId, JobType, TableRef, TargetKey, TaskKind};

use crate::context::Catalog;
use crate::error::BackupError;
use crate::request::{BackupRequest, DropSnapshotRequest, RestoreRequest, SnapshotSelector};
use crate::tasks::CompletionOutcome;
use crate::test_utils::{olap_table, test_settings, MemoryJournal, RecordingDispatcher, TestCluster};

fn cluster_with_sales() -> (TestCluster, TargetKey) {
    let cluster = TestCluster::new();
    let db = cluster.seed_database(
        "sales",
        vec![
            olap_table("orders", &["p1", "p2"], 2, 100),
            olap_table("customers", &["p1"], 1, 200),
        ],
    );
    cluster.add_repository("repo1", false);
    (cluster, TargetKey::Database(db))
}

#[test]
fn test_submit_backup_rejects_incremental_and_unknown_objects() {
    let (cluster, _) = cluster_with_sales();
    let handler = &cluster.handler;

    let err = handler
        .submit_backup(BackupRequest::database("repo1", "snap", "sales").incremental())
        .unwrap_err();
    assert!(matches!(err, BackupError::Validation(_)));

    let err = handler
        .submit_backup(BackupRequest::database("nope", "snap", "sales"))
        .unwrap_err();
    assert!(matches!(err, BackupError::NotFound(_)));

    let err = handler
        .submit_backup(BackupRequest::database("repo1", "snap", "missing_db"))
        .unwrap_err();
    assert_eq!(err.to_string(), "Not found: Database missing_db does not exist");

    let err = handler
        .submit_backup(
            BackupRequest::database("repo1", "snap", "sales").with_tables(vec![TableRef::new("ghost")]),
        )
        .unwrap_err();
    assert!(matches!(err, BackupError::NotFound(_)));
    assert_eq!(handler.job_count(), 0);
}

#[test]
fn test_submit_backup_releases_database_read_lock() {
    let (cluster, target) = cluster_with_sales();
    let db = target.db_id().unwrap();

    cluster
        .handler
        .submit_backup(BackupRequest::database("repo1", "snap", "sales"))
        .unwrap();
    assert_eq!(cluster.catalog.read_locks_held(db), 0);

    let summary = cluster.handler.get_job(target).unwrap();
    assert_eq!(summary.state, "PENDING");
    assert_eq!(summary.job_type, JobType::Backup);
}

#[test]
fn test_read_only_repository_rejects_backup() {
    let (cluster, _) = cluster_with_sales();
    cluster.add_repository("archive", true);

    let err = cluster
        .handler
        .submit_backup(BackupRequest::database("archive", "snap", "sales"))
        .unwrap_err();
    assert_eq!(err.to_string(), "Conflict: Repository archive is read only");
}

#[test]
fn test_one_job_per_target() {
    let (cluster, _) = cluster_with_sales();
    cluster
        .handler
        .submit_backup(BackupRequest::database("repo1", "snap_a", "sales"))
        .unwrap();

    let err = cluster
        .handler
        .submit_backup(BackupRequest::database("repo1", "snap_b", "sales"))
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Conflict: Can only run one backup or restore job of a database at same time"
    );
    assert_eq!(cluster.handler.running_job_count(), 1);
}

#[test]
fn test_busy_sequencing_lock_is_retryable() {
    let (cluster, _) = cluster_with_sales();
    let _held = cluster.handler.lock_seq().unwrap();

    let err = cluster
        .handler
        .submit_backup(BackupRequest::database("repo1", "snap", "sales"))
        .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(cluster.handler.job_count(), 0);
}

#[test]
fn test_backup_then_restore_into_new_database() {
    let (cluster, target) = cluster_with_sales();
    let store = cluster.connector.store("mem://repo1");

    cluster
        .handler
        .submit_backup(BackupRequest::database("repo1", "snap", "sales"))
        .unwrap();
    let summary = cluster.drive_until_done(target, 10).unwrap();
    assert_eq!(summary.state, "FINISHED");
    assert_eq!(summary.error, None);

    let times = store.snapshot_times("snap");
    assert_eq!(times.len(), 1);

    let err = cluster
        .handler
        .submit_backup(BackupRequest::database("repo1", "snap", "sales"))
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Conflict: Snapshot with name 'snap' already exist in repository"
    );

    cluster
        .handler
        .submit_restore(RestoreRequest::database("repo1", "snap", times[0], "sales_copy"))
        .unwrap();
    let copy = cluster.catalog.get_database("sales_copy").unwrap();
    let summary = cluster
        .drive_until_done(TargetKey::Database(copy.id), 10)
        .unwrap();
    assert_eq!(summary.state, "FINISHED");

    let orders = cluster.catalog.get_table(copy.id, "orders").unwrap();
    assert_eq!(orders.tablet_count(), 4);
    assert!(cluster.catalog.is_restore_finished(copy.id, "orders"));
    assert!(cluster.catalog.is_restore_finished(copy.id, "customers"));
}

#[test]
fn test_cancel_job_checks_type_and_state() {
    let (cluster, target) = cluster_with_sales();
    cluster
        .handler
        .submit_backup(BackupRequest::database("repo1", "snap", "sales"))
        .unwrap();
    cluster.handler.drive_all();
    assert!(!cluster.dispatcher.tasks_of_kind(TaskKind::Snapshot).is_empty());

    let err = cluster.handler.cancel_job(target, JobType::Restore).unwrap_err();
    assert!(matches!(err, BackupError::NotFound(_)));

    cluster.handler.cancel_job(target, JobType::Backup).unwrap();
    let summary = cluster.handler.get_job(target).unwrap();
    assert_eq!(summary.state, "CANCELLED");
    assert_eq!(summary.error.as_deref(), Some("[USER_CANCELLED] cancelled by user"));
    assert_eq!(cluster.dispatcher.aborted().len(), 1);

    let err = cluster.handler.cancel_job(target, JobType::Backup).unwrap_err();
    assert!(err.to_string().contains("can not be cancelled"));
}

#[test]
fn test_stale_completion_is_discarded() {
    let (cluster, target) = cluster_with_sales();
    cluster
        .handler
        .submit_backup(BackupRequest::database("repo1", "snap", "sales"))
        .unwrap();
    cluster.handler.drive_all();
    let task = cluster.dispatcher.tasks_of_kind(TaskKind::Snapshot)[0].clone();

    let mut stale = RecordingDispatcher::success_for(&task);
    stale.job_id = JobId::new(task.job_id.as_i64() + 1000);
    assert_eq!(cluster.handler.route_completion(stale), CompletionOutcome::Discarded);

    let mut wrong_target = RecordingDispatcher::success_for(&task);
    wrong_target.target = TargetKey::ExternalCatalog;
    assert_eq!(
        cluster.handler.route_completion(wrong_target),
        CompletionOutcome::Discarded
    );

    let ok = RecordingDispatcher::success_for(&task);
    assert_eq!(cluster.handler.route_completion(ok.clone()), CompletionOutcome::Accepted);
    // a duplicate of an accepted completion is no longer expected
    assert_eq!(cluster.handler.route_completion(ok), CompletionOutcome::Discarded);
    assert_eq!(
        cluster.handler.get_job(target).unwrap().outstanding_tasks,
        cluster.dispatcher.tasks_of_kind(TaskKind::Snapshot).len() - 1
    );
}

#[test]
fn test_drop_repository_in_use() {
    let (cluster, target) = cluster_with_sales();
    cluster
        .handler
        .submit_backup(BackupRequest::database("repo1", "snap", "sales"))
        .unwrap();

    let err = cluster.handler.drop_repository("repo1").unwrap_err();
    assert_eq!(
        err.to_string(),
        "Conflict: Backup or restore job is running on repository repo1"
    );

    cluster.handler.cancel_job(target, JobType::Backup).unwrap();
    cluster.handler.drop_repository("repo1").unwrap();
    assert!(!cluster.handler.context().repositories.contains("repo1"));
}

#[test]
fn test_drop_snapshot_reports_partial_failure() {
    let (cluster, target) = cluster_with_sales();
    let store = cluster.connector.store("mem://repo1");
    for label in ["snap_a", "snap_b"] {
        cluster
            .handler
            .submit_backup(BackupRequest::database("repo1", label, "sales"))
            .unwrap();
        cluster.drive_until_done(target, 10).unwrap();
    }
    store.fail_delete("snap_b");

    let err = cluster
        .handler
        .drop_snapshot(DropSnapshotRequest {
            repo_name: "repo1".to_string(),
            selector: SnapshotSelector::Names(vec![
                "snap_a".to_string(),
                "snap_b".to_string(),
                "snap_c".to_string(),
            ]),
        })
        .unwrap_err();
    match err {
        BackupError::DropSnapshot { failures, total } => {
            assert_eq!(total, 3);
            let labels: Vec<_> = failures.iter().map(|f| f.label.as_str()).collect();
            assert_eq!(labels, vec!["snap_b", "snap_c"]);
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(store.labels(), vec!["snap_b".to_string()]);
}

#[test]
fn test_expire_finished_respects_retention() {
    let (cluster, target) = cluster_with_sales();
    cluster
        .handler
        .submit_backup(BackupRequest::database("repo1", "snap", "sales"))
        .unwrap();
    let finished_at = cluster.drive_until_done(target, 10).unwrap().finished_at.unwrap();
    let keep_ms = cluster.handler.retention_ms();

    assert_eq!(cluster.handler.expire_finished_at(finished_at + keep_ms), 0);
    assert_eq!(cluster.handler.expire_finished_at(finished_at + keep_ms + 1), 1);
    assert!(cluster.handler.get_job(target).is_none());
}

#[test]
fn test_image_and_journal_recovery_converge() {
    let journal = Arc::new(MemoryJournal::new());
    let cluster = TestCluster::with_journal(journal.clone(), test_settings());
    let db = cluster.seed_database("sales", vec![olap_table("orders", &["p1"], 3, 100)]);
    let target = TargetKey::Database(db);
    cluster.add_repository("repo1", false);

    cluster
        .handler
        .submit_backup(BackupRequest::database("repo1", "snap", "sales"))
        .unwrap();
    cluster.handler.drive_all();
    cluster.handler.save_image().unwrap();
    assert!(journal.has_image());

    // snapshot phase completes after the image
    cluster.deliver_all();
    cluster.handler.drive_all();
    let before = cluster.handler.get_job(target).unwrap();
    assert_eq!(before.state, "UPLOADING");

    let (restarted, report) = cluster.restart().unwrap();
    assert_eq!(report.restored.len(), 1);
    assert!(report.replayed > 0);
    assert!(report.dropped.is_empty());
    assert!(restarted.handler.context().repositories.contains("repo1"));

    let after = restarted.handler.get_job(target).unwrap();
    assert_eq!(after.state, before.state);
    assert_eq!(after.outstanding_tasks, before.outstanding_tasks);

    // outstanding uploads are dispatched again on the next tick
    assert!(restarted.dispatcher.tasks().is_empty());
    restarted.handler.drive_all();
    assert_eq!(
        restarted.dispatcher.tasks_of_kind(TaskKind::Upload).len(),
        before.outstanding_tasks
    );
    let summary = restarted.drive_until_done(target, 10).unwrap();
    assert_eq!(summary.state, "FINISHED");
}

#[test]
fn test_create_repository_twice_conflicts() {
    let (cluster, _) = cluster_with_sales();
    let err = cluster
        .handler
        .create_repository("repo1", "mem://other", false)
        .unwrap_err();
    assert!(matches!(err, BackupError::Conflict(_)));
    assert_eq!(cluster.handler.context().repositories.descriptors().len(), 1);
}
