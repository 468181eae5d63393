//! Server lifecycle helpers: building the handler from configuration,
//! recovering it from the journal and running the driver until Ctrl-C.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use log::info;
use strata_backup::{BackupHandler, ClusterContext, FileJournal, RecoveryReport, RepositoryRegistry};
use strata_configs::ServerConfig;

use crate::standalone::{DetachedCatalog, LoggingDispatcher, OfflineConnector};

/// Open the file journal, wire standalone collaborators and recover.
pub fn bootstrap(config: &ServerConfig) -> Result<(Arc<BackupHandler>, RecoveryReport)> {
    let phase_start = Instant::now();
    let journal = FileJournal::open(&config.backup.journal_dir)
        .with_context(|| format!("Failed to open backup journal at {}", config.backup.journal_dir))?;

    let registry = Arc::new(RepositoryRegistry::new(Arc::new(OfflineConnector)));
    let ctx = ClusterContext::new(Arc::new(DetachedCatalog), Arc::new(LoggingDispatcher), registry)
        .with_settings((&config.backup).into());
    let handler = Arc::new(BackupHandler::new(ctx, Arc::new(journal), config.backup.clone()));

    let report = handler.recover().context("Backup recovery failed")?;
    info!(
        "Backup handler recovered from {} ({:.2}ms): {} job(s), {} running",
        config.backup.journal_dir,
        phase_start.elapsed().as_secs_f64() * 1000.0,
        handler.job_count(),
        handler.running_job_count()
    );
    for (what, reason) in &report.dropped {
        log::warn!("Dropped during recovery: {} ({})", what, reason);
    }
    Ok((handler, report))
}

/// Drive jobs until Ctrl-C, then write a final image.
pub async fn run(handler: Arc<BackupHandler>) -> Result<()> {
    let driver = tokio::spawn(Arc::clone(&handler).run_loop());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received, stopping backup driver");
    handler.shutdown();
    driver.await.context("Backup driver task failed")?;

    let seq = handler.save_image().context("Failed to write final backup image")?;
    info!("Final backup image written at journal seq {}", seq);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_on_empty_journal() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServerConfig::default();
        config.backup.journal_dir = dir.path().join("journal").display().to_string();

        let (handler, report) = bootstrap(&config).unwrap();
        assert!(report.is_empty());
        assert_eq!(handler.job_count(), 0);

        handler.create_repository("archive", "s3://bucket/archive", true).unwrap();
        handler.save_image().unwrap();
        drop(handler);

        let (handler, report) = bootstrap(&config).unwrap();
        assert!(report.dropped.is_empty());
        assert!(handler.context().repositories.contains("archive"));
    }
}
