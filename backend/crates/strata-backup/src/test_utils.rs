//! In-memory collaborators for tests and local experiments.
//!
//! [`TestCluster`] wires a [`BackupHandler`] to a [`MemoryCatalog`], a shared
//! in-memory repository store, a [`RecordingDispatcher`] and a
//! [`MemoryJournal`], and can be "restarted" on the same journal to exercise
//! recovery.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use strata_commons::serialization::{decode, encode};
use strata_commons::{BackendId, DbId, FunctionName, JobId, TableKind, TabletId, TargetKey, TaskId, TaskKind};
use strata_configs::BackupSettings;

pub use crate::journal::MemoryJournal;

use crate::context::{Catalog, ClusterContext, DatabaseInfo, TaskDispatcher};
use crate::error::{BackupError, Result};
use crate::handler::BackupHandler;
use crate::jobs::JobSummary;
use crate::journal::Journal;
use crate::manifest::{BackupJobInfo, META_VERSION};
use crate::meta::{BackupMeta, CatalogMeta, ColumnMeta, FunctionMeta, PartitionMeta, TableMeta, TabletMeta};
use crate::repository::{Repository, RepositoryConnector, RepositoryDesc, RepositoryRegistry, TimestampOp};
use crate::tasks::{CompletionOutcome, CompletionPayload, TaskCompletion, TaskPayload, TaskRequest};

const LOCAL_BACKENDS: i64 = 3;

#[derive(Default)]
struct CatalogState {
    databases: BTreeMap<String, DatabaseInfo>,
    tables: BTreeMap<(DbId, String), TableMeta>,
    functions: Vec<(DbId, FunctionMeta)>,
    catalogs: BTreeMap<String, CatalogMeta>,
    restored: BTreeSet<(DbId, String)>,
    read_locks: BTreeMap<DbId, usize>,
}

/// Catalog kept in memory. Created tables get fresh partition and tablet ids
/// spread over three local backends.
pub struct MemoryCatalog {
    state: Mutex<CatalogState>,
    next_id: AtomicI64,
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CatalogState::default()),
            next_id: AtomicI64::new(10_000),
        }
    }

    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Insert `table` as-is, keeping its ids.
    pub fn add_table(&self, db: DbId, table: TableMeta) {
        self.state.lock().tables.insert((db, table.name.clone()), table);
    }

    pub fn add_external_catalog(&self, catalog: CatalogMeta) {
        self.state.lock().catalogs.insert(catalog.name.clone(), catalog);
    }

    pub fn is_mv_active(&self, db: DbId, name: &str) -> bool {
        self.state
            .lock()
            .tables
            .get(&(db, name.to_string()))
            .map(|t| t.inactive_reason.is_none())
            .unwrap_or(false)
    }

    pub fn is_restore_finished(&self, db: DbId, name: &str) -> bool {
        self.state.lock().restored.contains(&(db, name.to_string()))
    }

    pub fn read_locks_held(&self, db: DbId) -> usize {
        self.state.lock().read_locks.get(&db).copied().unwrap_or(0)
    }
}

impl Catalog for MemoryCatalog {
    fn get_database(&self, name: &str) -> Option<DatabaseInfo> {
        self.state.lock().databases.get(name).cloned()
    }

    fn get_database_by_id(&self, id: DbId) -> Option<DatabaseInfo> {
        self.state
            .lock()
            .databases
            .values()
            .find(|db| db.id == id)
            .cloned()
    }

    fn create_database(&self, name: &str) -> Result<DatabaseInfo> {
        let id = DbId::new(self.next_id());
        let mut state = self.state.lock();
        if state.databases.contains_key(name) {
            return Err(BackupError::catalog(format!("Database {} already exists", name)));
        }
        let db = DatabaseInfo {
            id,
            name: name.to_string(),
        };
        state.databases.insert(name.to_string(), db.clone());
        Ok(db)
    }

    fn get_table(&self, db: DbId, name: &str) -> Option<TableMeta> {
        self.state.lock().tables.get(&(db, name.to_string())).cloned()
    }

    fn list_tables(&self, db: DbId) -> Vec<String> {
        self.state
            .lock()
            .tables
            .keys()
            .filter(|(table_db, _)| *table_db == db)
            .map(|(_, name)| name.clone())
            .collect()
    }

    fn create_table(&self, db: DbId, table: &TableMeta, _replication_num: Option<u16>) -> Result<TableMeta> {
        if self.get_table(db, &table.name).is_some() {
            return Err(BackupError::catalog(format!("Table {} already exists", table.name)));
        }
        let mut local = table.clone();
        local.id = self.next_id();
        for partition in &mut local.partitions {
            partition.id = self.next_id();
            partition.tablets = (0..partition.tablets.len())
                .map(|i| TabletMeta {
                    id: TabletId::new(self.next_id()),
                    backend_id: BackendId::new(1 + (i as i64 % LOCAL_BACKENDS)),
                })
                .collect();
        }
        self.state
            .lock()
            .tables
            .insert((db, local.name.clone()), local.clone());
        Ok(local)
    }

    fn drop_table(&self, db: DbId, name: &str) -> Result<()> {
        self.state
            .lock()
            .tables
            .remove(&(db, name.to_string()))
            .map(|_| ())
            .ok_or_else(|| BackupError::catalog(format!("Table {} does not exist", name)))
    }

    fn finish_table_restore(&self, db: DbId, name: &str, _allow_load: bool) -> Result<()> {
        let mut state = self.state.lock();
        if !state.tables.contains_key(&(db, name.to_string())) {
            return Err(BackupError::catalog(format!("Table {} does not exist", name)));
        }
        state.restored.insert((db, name.to_string()));
        Ok(())
    }

    fn get_functions(&self, db: DbId, name: &FunctionName) -> Vec<FunctionMeta> {
        self.state
            .lock()
            .functions
            .iter()
            .filter(|(f_db, f)| *f_db == db && f.name.function.eq_ignore_ascii_case(&name.function))
            .map(|(_, f)| f.clone())
            .collect()
    }

    fn create_function(&self, db: DbId, function: &FunctionMeta) -> Result<()> {
        self.state.lock().functions.push((db, function.clone()));
        Ok(())
    }

    fn get_external_catalog(&self, name: &str) -> Option<CatalogMeta> {
        self.state.lock().catalogs.get(name).cloned()
    }

    fn create_external_catalog(&self, catalog: &CatalogMeta) -> Result<()> {
        self.add_external_catalog(catalog.clone());
        Ok(())
    }

    fn set_mv_state(&self, db: DbId, name: &str, active: bool, reason: Option<&str>) -> Result<()> {
        let mut state = self.state.lock();
        let table = state
            .tables
            .get_mut(&(db, name.to_string()))
            .ok_or_else(|| BackupError::catalog(format!("Materialized view {} does not exist", name)))?;
        table.inactive_reason = if active {
            None
        } else {
            Some(reason.unwrap_or("inactive").to_string())
        };
        Ok(())
    }

    fn lock_database_read(&self, db: DbId) {
        *self.state.lock().read_locks.entry(db).or_insert(0) += 1;
    }

    fn unlock_database_read(&self, db: DbId) {
        if let Some(count) = self.state.lock().read_locks.get_mut(&db) {
            *count = count.saturating_sub(1);
        }
    }
}

#[derive(Debug, Clone)]
struct StoredSnapshot {
    backup_time: i64,
    manifest_json: String,
    meta_bytes: Vec<u8>,
}

/// Repository content shared by every handle opened on the same location.
#[derive(Debug, Default)]
pub struct RepoStore {
    snapshots: Mutex<BTreeMap<String, Vec<StoredSnapshot>>>,
    meta_unavailable: AtomicBool,
    failing_labels: Mutex<BTreeSet<String>>,
}

impl RepoStore {
    pub fn labels(&self) -> Vec<String> {
        self.snapshots.lock().keys().cloned().collect()
    }

    pub fn snapshot_times(&self, label: &str) -> Vec<i64> {
        self.snapshots
            .lock()
            .get(label)
            .map(|list| list.iter().map(|s| s.backup_time).collect())
            .unwrap_or_default()
    }

    /// Make meta downloads fail, as if the meta file were unreadable.
    pub fn set_meta_unavailable(&self, unavailable: bool) {
        self.meta_unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make deleting `label` fail.
    pub fn fail_delete(&self, label: &str) {
        self.failing_labels.lock().insert(label.to_string());
    }
}

pub struct MemoryRepository {
    desc: RepositoryDesc,
    store: Arc<RepoStore>,
}

impl MemoryRepository {
    pub fn new(desc: RepositoryDesc, store: Arc<RepoStore>) -> Self {
        Self { desc, store }
    }
}

impl Repository for MemoryRepository {
    fn desc(&self) -> &RepositoryDesc {
        &self.desc
    }

    fn list_snapshots(&self) -> Result<Vec<String>> {
        Ok(self.store.labels())
    }

    fn get_snapshot_info(&self, label: &str, backup_time: i64) -> Result<BackupJobInfo> {
        let snapshots = self.store.snapshots.lock();
        let stored = snapshots
            .get(label)
            .and_then(|list| list.iter().find(|s| s.backup_time == backup_time))
            .ok_or_else(|| {
                BackupError::not_found(format!(
                    "Snapshot {} with timestamp {} not found in repository {}",
                    label, backup_time, self.desc.name
                ))
            })?;
        BackupJobInfo::from_json(&stored.manifest_json)
    }

    fn get_snapshot_meta(&self, info: &BackupJobInfo, meta_version: u32) -> Result<BackupMeta> {
        if meta_version > META_VERSION {
            return Err(BackupError::repository(format!(
                "unsupported meta version {}",
                meta_version
            )));
        }
        if self.store.meta_unavailable.load(Ordering::SeqCst) {
            return Err(BackupError::repository(format!(
                "meta file of snapshot {} is unreadable",
                info.name
            )));
        }
        let snapshots = self.store.snapshots.lock();
        let stored = snapshots
            .get(&info.name)
            .and_then(|list| list.iter().find(|s| s.backup_time == info.backup_time))
            .ok_or_else(|| BackupError::not_found(format!("Meta of snapshot {} not found", info.name)))?;
        Ok(decode(&stored.meta_bytes)?)
    }

    fn save_snapshot(&self, info: &BackupJobInfo, meta: &BackupMeta) -> Result<()> {
        let stored = StoredSnapshot {
            backup_time: info.backup_time,
            manifest_json: info.to_json()?,
            meta_bytes: encode(meta)?,
        };
        self.store
            .snapshots
            .lock()
            .entry(info.name.clone())
            .or_default()
            .push(stored);
        Ok(())
    }

    fn delete_snapshot(&self, label: &str) -> Result<()> {
        if self.store.failing_labels.lock().contains(label) {
            return Err(BackupError::repository(format!("permission denied deleting {}", label)));
        }
        self.store
            .snapshots
            .lock()
            .remove(label)
            .map(|_| ())
            .ok_or_else(|| BackupError::not_found(format!("Snapshot {} does not exist", label)))
    }

    fn delete_snapshots_by_timestamp(&self, op: TimestampOp, ts: i64) -> Result<usize> {
        let mut snapshots = self.store.snapshots.lock();
        let mut deleted = 0;
        for list in snapshots.values_mut() {
            let before = list.len();
            list.retain(|s| !op.matches(s.backup_time, ts));
            deleted += before - list.len();
        }
        snapshots.retain(|_, list| !list.is_empty());
        Ok(deleted)
    }
}

/// Hands out [`MemoryRepository`] handles; handles on the same location
/// share one [`RepoStore`].
#[derive(Default)]
pub struct MemoryRepositoryConnector {
    stores: Mutex<HashMap<String, Arc<RepoStore>>>,
}

impl MemoryRepositoryConnector {
    pub fn store(&self, location: &str) -> Arc<RepoStore> {
        Arc::clone(self.stores.lock().entry(location.to_string()).or_default())
    }
}

impl RepositoryConnector for MemoryRepositoryConnector {
    fn connect(&self, desc: &RepositoryDesc) -> Result<Arc<dyn Repository>> {
        Ok(Arc::new(MemoryRepository::new(desc.clone(), self.store(&desc.location))))
    }
}

/// Records dispatched tasks instead of sending them anywhere.
#[derive(Default)]
pub struct RecordingDispatcher {
    tasks: Mutex<Vec<TaskRequest>>,
    aborted: Mutex<Vec<(JobId, Vec<TaskId>)>>,
}

impl RecordingDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn tasks(&self) -> Vec<TaskRequest> {
        self.tasks.lock().clone()
    }

    pub fn tasks_of_kind(&self, kind: TaskKind) -> Vec<TaskRequest> {
        self.tasks.lock().iter().filter(|t| t.kind == kind).cloned().collect()
    }

    /// Remove and return everything dispatched so far.
    pub fn take_tasks(&self) -> Vec<TaskRequest> {
        std::mem::take(&mut *self.tasks.lock())
    }

    pub fn aborted(&self) -> Vec<(JobId, Vec<TaskId>)> {
        self.aborted.lock().clone()
    }

    /// Successful completion for `task` with a plausible payload.
    pub fn success_for(task: &TaskRequest) -> TaskCompletion {
        let payload = match &task.payload {
            TaskPayload::Snapshot { tablet_id, .. } => CompletionPayload::Snapshot {
                snapshot_path: format!("/storage/{}/snapshot/{}", task.backend_id, tablet_id),
            },
            TaskPayload::Upload {
                dest_prefix,
                tablets,
                ..
            } => CompletionPayload::Upload {
                tablet_files: tablets
                    .iter()
                    .map(|(tablet, _)| (*tablet, vec![format!("{}/{}/0.dat", dest_prefix, tablet)]))
                    .collect(),
            },
            TaskPayload::Download { files, .. } => CompletionPayload::Download {
                downloaded: files
                    .iter()
                    .map(|(tablet, _)| (*tablet, format!("/storage/{}/download/{}", task.backend_id, tablet)))
                    .collect(),
            },
            TaskPayload::DirMove { .. } => CompletionPayload::DirMove,
        };
        TaskCompletion::ok(task, payload)
    }
}

impl TaskDispatcher for RecordingDispatcher {
    fn dispatch(&self, task: TaskRequest) -> Result<()> {
        self.tasks.lock().push(task);
        Ok(())
    }

    fn abort(&self, job_id: JobId, tasks: &[TaskId]) {
        self.aborted.lock().push((job_id, tasks.to_vec()));
    }
}

pub fn test_context(dispatcher: Arc<RecordingDispatcher>) -> ClusterContext {
    test_context_with_catalog(Arc::new(MemoryCatalog::new()), dispatcher)
}

pub fn test_context_with_catalog(catalog: Arc<MemoryCatalog>, dispatcher: Arc<RecordingDispatcher>) -> ClusterContext {
    let registry = Arc::new(RepositoryRegistry::new(Arc::new(MemoryRepositoryConnector::default())));
    ClusterContext::new(catalog, dispatcher, registry)
}

/// A native table with `tablets_per_partition` tablets in each partition.
/// Ids are derived from `first_id`.
pub fn olap_table(name: &str, partitions: &[&str], tablets_per_partition: usize, first_id: i64) -> TableMeta {
    let table_id = first_id;
    let mut next = first_id;
    let mut metas = Vec::with_capacity(partitions.len());
    for partition in partitions {
        next += 1;
        let partition_id = next;
        let mut tablets = Vec::with_capacity(tablets_per_partition);
        for i in 0..tablets_per_partition {
            next += 1;
            tablets.push(TabletMeta {
                id: TabletId::new(next),
                backend_id: BackendId::new(1 + (i as i64 % LOCAL_BACKENDS)),
            });
        }
        metas.push(PartitionMeta {
            id: partition_id,
            name: partition.to_string(),
            visible_version: 3,
            tablets,
        });
    }
    TableMeta {
        id: table_id,
        name: name.to_string(),
        kind: TableKind::Olap,
        columns: vec![ColumnMeta::new("id", "BIGINT"), ColumnMeta::new("amount", "DECIMAL(10,2)")],
        partitions: metas,
        has_temp_partitions: false,
        base_tables: Vec::new(),
        inactive_reason: None,
        view_def: None,
    }
}

/// A materialized view over `bases` with a single partition and tablet.
pub fn materialized_view(name: &str, bases: &[&str], first_id: i64) -> TableMeta {
    let mut mv = olap_table(name, &["p0"], 1, first_id);
    mv.kind = TableKind::MaterializedView;
    mv.base_tables = bases.iter().map(|b| b.to_string()).collect();
    mv
}

/// Settings for tests: short lock wait, default retention.
pub fn test_settings() -> BackupSettings {
    BackupSettings {
        seq_lock_timeout_ms: 200,
        ..BackupSettings::default()
    }
}

/// A handler wired to in-memory collaborators.
pub struct TestCluster {
    pub catalog: Arc<MemoryCatalog>,
    pub connector: Arc<MemoryRepositoryConnector>,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub journal: Arc<dyn Journal>,
    pub handler: Arc<BackupHandler>,
}

impl TestCluster {
    pub fn new() -> Self {
        Self::with_journal(Arc::new(MemoryJournal::new()), test_settings())
    }

    pub fn with_journal(journal: Arc<dyn Journal>, settings: BackupSettings) -> Self {
        Self::assemble(
            Arc::new(MemoryCatalog::new()),
            Arc::new(MemoryRepositoryConnector::default()),
            journal,
            settings,
        )
    }

    fn assemble(
        catalog: Arc<MemoryCatalog>,
        connector: Arc<MemoryRepositoryConnector>,
        journal: Arc<dyn Journal>,
        settings: BackupSettings,
    ) -> Self {
        let dispatcher = RecordingDispatcher::new();
        let registry = Arc::new(RepositoryRegistry::new(connector.clone()));
        let ctx = ClusterContext::new(catalog.clone(), dispatcher.clone(), registry)
            .with_settings((&settings).into());
        let handler = Arc::new(BackupHandler::new(ctx, Arc::clone(&journal), settings));
        Self {
            catalog,
            connector,
            dispatcher,
            journal,
            handler,
        }
    }

    /// Create database `name` holding `tables`.
    pub fn seed_database(&self, name: &str, tables: Vec<TableMeta>) -> DbId {
        let db = match self.catalog.get_database(name) {
            Some(db) => db.id,
            None => self.catalog.create_database(name).map(|db| db.id).unwrap_or(DbId::new(0)),
        };
        for table in tables {
            self.catalog.add_table(db, table);
        }
        db
    }

    /// Register a repository stored at `mem://<name>` and return its store.
    pub fn add_repository(&self, name: &str, read_only: bool) -> Arc<RepoStore> {
        let location = format!("mem://{}", name);
        let store = self.connector.store(&location);
        if let Err(e) = self.handler.create_repository(name, &location, read_only) {
            log::warn!("Failed to create test repository {}: {}", name, e);
        }
        store
    }

    /// A new handler on the same catalog, repositories and journal, recovered
    /// from the journal. The new cluster has its own dispatcher.
    pub fn restart(&self) -> Result<(Self, crate::handler::RecoveryReport)> {
        self.restart_with_journal(Arc::clone(&self.journal))
    }

    /// Like [`TestCluster::restart`] but reading from `journal`, e.g. a file
    /// journal reopened from disk.
    pub fn restart_with_journal(
        &self,
        journal: Arc<dyn Journal>,
    ) -> Result<(Self, crate::handler::RecoveryReport)> {
        let cluster = Self::assemble(
            self.catalog.clone(),
            self.connector.clone(),
            journal,
            self.handler.settings().clone(),
        );
        let report = cluster.handler.recover()?;
        Ok((cluster, report))
    }

    /// Complete every dispatched task successfully. Returns how many
    /// completions were accepted.
    pub fn deliver_all(&self) -> usize {
        self.dispatcher
            .take_tasks()
            .iter()
            .map(|task| self.handler.route_completion(RecordingDispatcher::success_for(task)))
            .filter(|outcome| *outcome == CompletionOutcome::Accepted)
            .count()
    }

    /// Drive and complete tasks until the job on `target` is terminal.
    pub fn drive_until_done(&self, target: TargetKey, max_rounds: usize) -> Option<JobSummary> {
        for _ in 0..max_rounds {
            self.handler.drive_all();
            self.deliver_all();
            let summary = self.handler.get_job(target)?;
            if summary.finished_at.is_some() {
                return Some(summary);
            }
        }
        self.handler.get_job(target)
    }
}

impl Default for TestCluster {
    fn default() -> Self {
        Self::new()
    }
}
