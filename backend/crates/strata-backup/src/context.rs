//! Narrow view of the cluster handed to jobs.
//!
//! Jobs never reach for global state: everything they need (catalog lookups,
//! task dispatch, repository handles, id allocation) comes through the
//! [`ClusterContext`] passed into each call.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use strata_commons::{DbId, FunctionName, JobId, TaskId};

use crate::error::Result;
use crate::meta::{CatalogMeta, FunctionMeta, TableMeta};
use crate::mv_restore::MvRestoreContext;
use crate::repository::RepositoryRegistry;
use crate::tasks::TaskRequest;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseInfo {
    pub id: DbId,
    pub name: String,
}

/// Catalog operations consumed by backup and restore.
pub trait Catalog: Send + Sync {
    fn get_database(&self, name: &str) -> Option<DatabaseInfo>;

    fn get_database_by_id(&self, id: DbId) -> Option<DatabaseInfo>;

    fn create_database(&self, name: &str) -> Result<DatabaseInfo>;

    fn get_table(&self, db: DbId, name: &str) -> Option<TableMeta>;

    fn list_tables(&self, db: DbId) -> Vec<String>;

    /// Create `table` in `db` with freshly allocated partitions and tablets.
    /// The returned meta carries the local ids, partitions in the same order
    /// and with the same tablet count as the input.
    fn create_table(&self, db: DbId, table: &TableMeta, replication_num: Option<u16>)
        -> Result<TableMeta>;

    fn drop_table(&self, db: DbId, name: &str) -> Result<()>;

    /// Make a restored table visible and writable again.
    fn finish_table_restore(&self, db: DbId, name: &str, allow_load: bool) -> Result<()>;

    fn get_functions(&self, db: DbId, name: &FunctionName) -> Vec<FunctionMeta>;

    fn create_function(&self, db: DbId, function: &FunctionMeta) -> Result<()>;

    fn get_external_catalog(&self, name: &str) -> Option<CatalogMeta>;

    fn create_external_catalog(&self, catalog: &CatalogMeta) -> Result<()>;

    fn set_mv_state(&self, db: DbId, name: &str, active: bool, reason: Option<&str>) -> Result<()>;

    fn lock_database_read(&self, db: DbId);

    fn unlock_database_read(&self, db: DbId);
}

/// Releases a database read lock on drop.
pub struct DatabaseReadGuard<'a> {
    catalog: &'a dyn Catalog,
    db: DbId,
}

impl<'a> DatabaseReadGuard<'a> {
    pub fn new(catalog: &'a dyn Catalog, db: DbId) -> Self {
        catalog.lock_database_read(db);
        Self { catalog, db }
    }
}

impl Drop for DatabaseReadGuard<'_> {
    fn drop(&mut self) {
        self.catalog.unlock_database_read(self.db);
    }
}

/// Sends sub-tasks to storage nodes. Completions come back asynchronously
/// through `BackupHandler::route_completion`.
pub trait TaskDispatcher: Send + Sync {
    fn dispatch(&self, task: TaskRequest) -> Result<()>;

    /// Best-effort abort of tasks a cancelled job still has outstanding.
    fn abort(&self, job_id: JobId, tasks: &[TaskId]);
}

/// Monotonic allocator for job and task ids.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicI64,
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new(1)
    }
}

impl IdGenerator {
    pub fn new(first: i64) -> Self {
        Self {
            next: AtomicI64::new(first),
        }
    }

    pub fn next(&self) -> i64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_task_id(&self) -> TaskId {
        TaskId::new(self.next())
    }

    pub fn next_job_id(&self) -> JobId {
        JobId::new(self.next())
    }

    /// The id the next call to [`IdGenerator::next`] would return.
    pub fn peek(&self) -> i64 {
        self.next.load(Ordering::SeqCst)
    }

    /// Never hand out an id below `next`.
    pub fn advance_to(&self, next: i64) {
        self.next.fetch_max(next, Ordering::SeqCst);
    }

    /// Make sure ids handed out later are greater than `id` (used by replay).
    pub fn observe(&self, id: i64) {
        self.advance_to(id.saturating_add(1));
    }
}

#[derive(Debug, Clone)]
pub struct JobSettings {
    /// Tablets grouped into one upload or download task.
    pub max_tablets_per_task: usize,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            max_tablets_per_task: 10,
        }
    }
}

impl From<&strata_configs::BackupSettings> for JobSettings {
    fn from(settings: &strata_configs::BackupSettings) -> Self {
        Self {
            max_tablets_per_task: settings.max_upload_tablets_per_task.max(1),
        }
    }
}

/// Everything a job may touch outside itself.
#[derive(Clone)]
pub struct ClusterContext {
    pub catalog: Arc<dyn Catalog>,
    pub dispatcher: Arc<dyn TaskDispatcher>,
    pub repositories: Arc<RepositoryRegistry>,
    pub ids: Arc<IdGenerator>,
    pub mv_restore: Arc<MvRestoreContext>,
    pub settings: JobSettings,
}

impl ClusterContext {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        dispatcher: Arc<dyn TaskDispatcher>,
        repositories: Arc<RepositoryRegistry>,
    ) -> Self {
        Self {
            catalog,
            dispatcher,
            repositories,
            ids: Arc::new(IdGenerator::default()),
            mv_restore: Arc::new(MvRestoreContext::new()),
            settings: JobSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: JobSettings) -> Self {
        self.settings = settings;
        self
    }
}
