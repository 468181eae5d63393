//! Collaborators for running the control plane without a cluster attached.
//!
//! The catalog is empty and read-only, dispatched tasks are only logged and
//! repositories cannot be reached. Recovered jobs therefore make no progress
//! beyond timing out, but the driver still expires old jobs and checkpoints
//! the image.

use std::sync::Arc;

use strata_backup::{
    BackupError, BackupJobInfo, BackupMeta, Catalog, CatalogMeta, DatabaseInfo, FunctionMeta, Repository,
    RepositoryConnector, RepositoryDesc, Result, TableMeta, TaskDispatcher, TaskRequest, TimestampOp,
};
use strata_commons::{DbId, FunctionName, JobId, TaskId};

fn detached(what: &str) -> BackupError {
    BackupError::catalog(format!("{} is not available in standalone mode", what))
}

/// Catalog with no databases.
pub struct DetachedCatalog;

impl Catalog for DetachedCatalog {
    fn get_database(&self, _name: &str) -> Option<DatabaseInfo> {
        None
    }

    fn get_database_by_id(&self, _id: DbId) -> Option<DatabaseInfo> {
        None
    }

    fn create_database(&self, name: &str) -> Result<DatabaseInfo> {
        Err(detached(&format!("creating database {}", name)))
    }

    fn get_table(&self, _db: DbId, _name: &str) -> Option<TableMeta> {
        None
    }

    fn list_tables(&self, _db: DbId) -> Vec<String> {
        Vec::new()
    }

    fn create_table(&self, _db: DbId, table: &TableMeta, _replication_num: Option<u16>) -> Result<TableMeta> {
        Err(detached(&format!("creating table {}", table.name)))
    }

    fn drop_table(&self, _db: DbId, name: &str) -> Result<()> {
        Err(detached(&format!("dropping table {}", name)))
    }

    fn finish_table_restore(&self, _db: DbId, name: &str, _allow_load: bool) -> Result<()> {
        Err(detached(&format!("publishing table {}", name)))
    }

    fn get_functions(&self, _db: DbId, _name: &FunctionName) -> Vec<FunctionMeta> {
        Vec::new()
    }

    fn create_function(&self, _db: DbId, function: &FunctionMeta) -> Result<()> {
        Err(detached(&format!("creating function {}", function.name)))
    }

    fn get_external_catalog(&self, _name: &str) -> Option<CatalogMeta> {
        None
    }

    fn create_external_catalog(&self, catalog: &CatalogMeta) -> Result<()> {
        Err(detached(&format!("creating external catalog {}", catalog.name)))
    }

    fn set_mv_state(&self, _db: DbId, name: &str, _active: bool, _reason: Option<&str>) -> Result<()> {
        Err(detached(&format!("updating materialized view {}", name)))
    }

    fn lock_database_read(&self, _db: DbId) {}

    fn unlock_database_read(&self, _db: DbId) {}
}

/// Logs tasks instead of sending them to storage nodes.
pub struct LoggingDispatcher;

impl TaskDispatcher for LoggingDispatcher {
    fn dispatch(&self, task: TaskRequest) -> Result<()> {
        log::debug!(
            "[{}] Not dispatching {} task {} to backend {} (standalone)",
            task.job_id,
            task.kind,
            task.task_id,
            task.backend_id
        );
        Ok(())
    }

    fn abort(&self, job_id: JobId, tasks: &[TaskId]) {
        log::debug!("[{}] Abort of {} task(s) ignored (standalone)", job_id, tasks.len());
    }
}

/// Keeps repository descriptors but never reaches the storage behind them.
pub struct OfflineConnector;

impl RepositoryConnector for OfflineConnector {
    fn connect(&self, desc: &RepositoryDesc) -> Result<Arc<dyn Repository>> {
        Ok(Arc::new(OfflineRepository { desc: desc.clone() }))
    }
}

struct OfflineRepository {
    desc: RepositoryDesc,
}

impl OfflineRepository {
    fn offline(&self) -> BackupError {
        BackupError::repository(format!(
            "repository {} at {} is offline in standalone mode",
            self.desc.name, self.desc.location
        ))
    }
}

impl Repository for OfflineRepository {
    fn desc(&self) -> &RepositoryDesc {
        &self.desc
    }

    fn list_snapshots(&self) -> Result<Vec<String>> {
        Err(self.offline())
    }

    fn get_snapshot_info(&self, _label: &str, _backup_time: i64) -> Result<BackupJobInfo> {
        Err(self.offline())
    }

    fn get_snapshot_meta(&self, _info: &BackupJobInfo, _meta_version: u32) -> Result<BackupMeta> {
        Err(self.offline())
    }

    fn save_snapshot(&self, _info: &BackupJobInfo, _meta: &BackupMeta) -> Result<()> {
        Err(self.offline())
    }

    fn delete_snapshot(&self, _label: &str) -> Result<()> {
        Err(self.offline())
    }

    fn delete_snapshots_by_timestamp(&self, _op: TimestampOp, _ts: i64) -> Result<usize> {
        Err(self.offline())
    }
}
