use std::sync::Arc;
use std::time::Duration;

use strata_backup::test_utils::{olap_table, test_settings, MemoryJournal, TestCluster};
use strata_backup::BackupRequest;
use strata_commons::TargetKey;

#[tokio::test]
async fn test_run_loop_drives_job_and_writes_image() {
    let journal = Arc::new(MemoryJournal::new());
    let mut settings = test_settings();
    settings.driver_interval_ms = 10;
    settings.image_interval_secs = 0;
    let cluster = TestCluster::with_journal(journal.clone(), settings);
    let db = cluster.seed_database("sales", vec![olap_table("orders", &["p1"], 2, 100)]);
    cluster.add_repository("repo1", false);
    let target = TargetKey::Database(db);

    let driver = tokio::spawn(Arc::clone(&cluster.handler).run_loop());
    cluster
        .handler
        .submit_backup(BackupRequest::database("repo1", "snap", "sales"))
        .unwrap();

    let mut state = String::new();
    for _ in 0..200 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        cluster.deliver_all();
        state = cluster.handler.get_job(target).unwrap().state;
        if state == "FINISHED" {
            break;
        }
    }
    assert_eq!(state, "FINISHED");

    cluster.handler.shutdown();
    tokio::time::timeout(Duration::from_secs(2), driver)
        .await
        .expect("driver loop did not stop")
        .unwrap();
    assert!(cluster.handler.is_shutdown());
    // image writing is disabled
    assert!(!journal.has_image());
}

#[tokio::test]
async fn test_run_loop_saves_image_periodically() {
    let journal = Arc::new(MemoryJournal::new());
    let mut settings = test_settings();
    settings.driver_interval_ms = 5;
    settings.image_interval_secs = 1;
    let cluster = TestCluster::with_journal(journal.clone(), settings);
    cluster.add_repository("repo1", false);

    let driver = tokio::spawn(Arc::clone(&cluster.handler).run_loop());
    tokio::time::sleep(Duration::from_millis(1_300)).await;
    cluster.handler.shutdown();
    tokio::time::timeout(Duration::from_secs(2), driver)
        .await
        .expect("driver loop did not stop")
        .unwrap();

    assert!(journal.has_image());
    let (restarted, report) = cluster.restart().unwrap();
    assert_eq!(report.replayed, 0);
    assert!(restarted.handler.context().repositories.contains("repo1"));
}
