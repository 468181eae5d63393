use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use strata_commons::{BackendId, DbId, FunctionName, TabletId, TaskId, TaskKind};

use super::common::{now_millis, DriveMode, JobCommon, JobFailure, JobFailureKind};
use super::{check_replayable, not_cancellable, JobStateMachine};
use crate::context::ClusterContext;
use crate::error::{BackupError, Result};
use crate::manifest::BackupJobInfo;
use crate::meta::{BackupMeta, TableMeta};
use crate::mv_restore::MvWaiter;
use crate::tasks::{CompletionPayload, TaskCompletion, TaskPayload, TaskRequest, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestoreJobState {
    Pending,
    Downloading,
    DirMove,
    Finished,
    Cancelled,
}

impl RestoreJobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreJobState::Pending => "PENDING",
            RestoreJobState::Downloading => "DOWNLOADING",
            RestoreJobState::DirMove => "DIR_MOVE",
            RestoreJobState::Finished => "FINISHED",
            RestoreJobState::Cancelled => "CANCELLED",
        }
    }

    fn task_kind(&self) -> Option<TaskKind> {
        match self {
            RestoreJobState::Downloading => Some(TaskKind::Download),
            RestoreJobState::DirMove => Some(TaskKind::DirMove),
            _ => None,
        }
    }
}

/// Brings a snapshot back into the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreJob {
    common: JobCommon,
    state: RestoreJobState,
    backup_time: i64,
    /// Manifest already narrowed to the requested objects, aliases applied.
    job_info: BackupJobInfo,
    /// `None` when the meta could not be fetched; the restore scope is empty.
    backup_meta: Option<BackupMeta>,
    allow_load: bool,
    replication_num: Option<u16>,
    /// Tables created by this job, dropped again if it is cancelled.
    created_tables: Vec<String>,
    /// Target table name -> table name in the snapshot.
    restored_tables: BTreeMap<String, String>,
    tablet_backends: BTreeMap<TabletId, BackendId>,
    /// Local tablet -> remote files to download into it.
    download_plan: BTreeMap<TabletId, Vec<String>>,
    /// Local tablet -> directory its files were downloaded into.
    downloaded: BTreeMap<TabletId, String>,
    /// Materialized views parked until their base tables are restored.
    mv_waiters: Vec<MvWaiter>,
}

impl RestoreJob {
    pub fn new(
        common: JobCommon,
        backup_time: i64,
        job_info: BackupJobInfo,
        backup_meta: Option<BackupMeta>,
        allow_load: bool,
        replication_num: Option<u16>,
    ) -> Self {
        Self {
            common,
            state: RestoreJobState::Pending,
            backup_time,
            job_info,
            backup_meta,
            allow_load,
            replication_num,
            created_tables: Vec::new(),
            restored_tables: BTreeMap::new(),
            tablet_backends: BTreeMap::new(),
            download_plan: BTreeMap::new(),
            downloaded: BTreeMap::new(),
            mv_waiters: Vec::new(),
        }
    }

    pub fn state(&self) -> RestoreJobState {
        self.state
    }

    pub fn backup_time(&self) -> i64 {
        self.backup_time
    }

    pub fn job_info(&self) -> &BackupJobInfo {
        &self.job_info
    }

    pub fn backup_meta(&self) -> Option<&BackupMeta> {
        self.backup_meta.as_ref()
    }

    pub fn created_tables(&self) -> &[String] {
        &self.created_tables
    }

    pub fn restored_tables(&self) -> Vec<&str> {
        self.restored_tables.keys().map(String::as_str).collect()
    }

    pub fn mv_waiters(&self) -> &[MvWaiter] {
        &self.mv_waiters
    }

    pub fn finish_tablet_download_task(&mut self, ctx: &ClusterContext, completion: &TaskCompletion) -> bool {
        if self.state != RestoreJobState::Downloading || completion.job_id != self.common.job_id {
            return false;
        }
        let Some(task) = self.common.take_outstanding(completion.task_id, TaskKind::Download) else {
            return false;
        };

        match (&completion.status, &completion.payload) {
            (TaskStatus::Failed(msg), _) => {
                let failure = JobFailure::new(
                    JobFailureKind::SubTaskFailure,
                    format!(
                        "download task {} failed on backend {}: {}",
                        task.task_id, task.backend_id, msg
                    ),
                );
                self.cancel_internal(ctx, failure, now_millis());
            }
            (TaskStatus::Ok, CompletionPayload::Download { downloaded }) => {
                let count = downloaded.len() as u32;
                for (tablet, path) in downloaded {
                    self.downloaded.insert(*tablet, path.clone());
                }
                self.common.task_progress.insert(task.task_id, (count, count));
            }
            _ => {
                let failure = JobFailure::new(
                    JobFailureKind::SubTaskFailure,
                    format!("malformed completion for download task {}", task.task_id),
                );
                self.cancel_internal(ctx, failure, now_millis());
            }
        }
        true
    }

    pub fn finish_dir_move_task(&mut self, ctx: &ClusterContext, completion: &TaskCompletion) -> bool {
        if self.state != RestoreJobState::DirMove || completion.job_id != self.common.job_id {
            return false;
        }
        let Some(task) = self.common.take_outstanding(completion.task_id, TaskKind::DirMove) else {
            return false;
        };

        if let TaskStatus::Failed(msg) = &completion.status {
            let failure = JobFailure::new(
                JobFailureKind::SubTaskFailure,
                format!(
                    "dir move task {} failed on backend {}: {}",
                    task.task_id, task.backend_id, msg
                ),
            );
            self.cancel_internal(ctx, failure, now_millis());
        }
        true
    }

    pub fn update_download_progress(&mut self, task_id: TaskId, finished: u32, total: u32) -> bool {
        if self.state != RestoreJobState::Downloading
            || !self.common.is_outstanding(task_id, TaskKind::Download)
        {
            return false;
        }
        self.common.task_progress.insert(task_id, (finished, total));
        true
    }

    fn db_id(&self) -> Result<DbId> {
        self.common.target.db_id().ok_or_else(|| {
            BackupError::catalog(format!(
                "snapshot {} restores tables but the job has no target database",
                self.common.label
            ))
        })
    }

    /// Create catalogs, functions and tables, then plan the downloads.
    fn prepare(&mut self, ctx: &ClusterContext, meta: &BackupMeta) -> Result<()> {
        for catalog in &meta.catalogs {
            match ctx.catalog.get_external_catalog(&catalog.name) {
                Some(existing) if existing.catalog_type != catalog.catalog_type => {
                    return Err(BackupError::catalog(format!(
                        "External catalog {} already exists with type {}",
                        catalog.name, existing.catalog_type
                    )));
                }
                Some(_) => self
                    .common
                    .log_info(&format!("External catalog {} already exists, skipped", catalog.name)),
                None => ctx.catalog.create_external_catalog(catalog)?,
            }
        }

        if !meta.functions.is_empty() {
            let db = self.db_id()?;
            for function in &meta.functions {
                let name = FunctionName::new(self.common.db_name.clone(), function.name.function.clone());
                let exists = ctx
                    .catalog
                    .get_functions(db, &name)
                    .iter()
                    .any(|f| f.signature == function.signature);
                if exists {
                    continue;
                }
                let mut local = function.clone();
                local.name = name;
                ctx.catalog.create_function(db, &local)?;
            }
        }

        if self.job_info.tables.is_empty() {
            return Ok(());
        }
        let db = self.db_id()?;
        let tables: Vec<_> = self.job_info.tables.values().cloned().collect();
        for info in tables {
            let remote = meta.get_table(&info.name).ok_or_else(|| {
                BackupError::catalog(format!("Table {} is missing from the backup meta", info.name))
            })?;
            let partitions: Vec<String> = info.partitions.keys().cloned().collect();
            let mut remote = remote.selective_copy(Some(&partitions)).ok_or_else(|| {
                BackupError::catalog(format!(
                    "Backup meta of table {} lacks partitions listed in the manifest",
                    info.name
                ))
            })?;
            let target_name = info.target_name().to_string();
            remote.name = target_name.clone();

            let local = match ctx.catalog.get_table(db, &target_name) {
                Some(local) => {
                    Self::check_existing_table(&local, &remote)?;
                    local
                }
                None => {
                    let local = ctx.catalog.create_table(db, &remote, self.replication_num)?;
                    self.created_tables.push(target_name.clone());
                    self.common.log_info(&format!("Created table {} for restore", target_name));
                    local
                }
            };

            if remote.kind.has_data() {
                for (partition_name, partition_info) in &info.partitions {
                    let local_partition = local.partition(partition_name).ok_or_else(|| {
                        BackupError::catalog(format!(
                            "Partition {} of table {} was not created",
                            partition_name, target_name
                        ))
                    })?;
                    for (remote_tablet, local_tablet) in
                        partition_info.tablets.iter().zip(&local_partition.tablets)
                    {
                        self.download_plan
                            .insert(local_tablet.id, remote_tablet.files.clone());
                        self.tablet_backends
                            .insert(local_tablet.id, local_tablet.backend_id);
                    }
                }
            }
            self.restored_tables.insert(target_name, info.name.clone());
        }
        Ok(())
    }

    /// An existing table is reused only when it has the same schema and the
    /// same tablet layout for every restored partition.
    fn check_existing_table(local: &TableMeta, remote: &TableMeta) -> Result<()> {
        if !local.same_schema(remote) {
            return Err(BackupError::catalog(format!(
                "Table {} already exist but with different schema",
                local.name
            )));
        }
        for partition in &remote.partitions {
            let Some(existing) = local.partition(&partition.name) else {
                return Err(BackupError::catalog(format!(
                    "Partition {} does not exist in table {}",
                    partition.name, local.name
                )));
            };
            if existing.tablets.len() != partition.tablets.len() {
                return Err(BackupError::catalog(format!(
                    "Partition {} of table {} has {} tablets, snapshot has {}",
                    partition.name,
                    local.name,
                    existing.tablets.len(),
                    partition.tablets.len()
                )));
            }
        }
        Ok(())
    }

    fn download_tasks(&self, ctx: &ClusterContext) -> Vec<TaskRequest> {
        let mut by_backend: BTreeMap<BackendId, Vec<(TabletId, Vec<String>)>> = BTreeMap::new();
        for (tablet, files) in &self.download_plan {
            if let Some(backend) = self.tablet_backends.get(tablet) {
                by_backend
                    .entry(*backend)
                    .or_default()
                    .push((*tablet, files.clone()));
            }
        }

        let chunk_size = ctx.settings.max_tablets_per_task.max(1);
        let mut tasks = Vec::new();
        for (backend, files) in by_backend {
            for chunk in files.chunks(chunk_size) {
                tasks.push(TaskRequest {
                    task_id: ctx.ids.next_task_id(),
                    job_id: self.common.job_id,
                    target: self.common.target,
                    backend_id: backend,
                    kind: TaskKind::Download,
                    payload: TaskPayload::Download {
                        repo_id: self.common.repo_id,
                        files: chunk.to_vec(),
                    },
                });
            }
        }
        tasks
    }

    fn dir_move_tasks(&self, ctx: &ClusterContext) -> Vec<TaskRequest> {
        self.downloaded
            .iter()
            .filter_map(|(tablet, path)| {
                let backend = self.tablet_backends.get(tablet)?;
                Some(TaskRequest {
                    task_id: ctx.ids.next_task_id(),
                    job_id: self.common.job_id,
                    target: self.common.target,
                    backend_id: *backend,
                    kind: TaskKind::DirMove,
                    payload: TaskPayload::DirMove {
                        tablet_id: *tablet,
                        source_path: path.clone(),
                    },
                })
            })
            .collect()
    }

    /// Publish restored tables and reconsider materialized views.
    fn finalize(&mut self, ctx: &ClusterContext, now_ms: i64) -> Result<()> {
        if self.restored_tables.is_empty() {
            return Ok(());
        }
        let db = self.db_id()?;
        for name in self.restored_tables.keys() {
            ctx.catalog.finish_table_restore(db, name, self.allow_load)?;
        }

        let Some(meta) = self.backup_meta.as_ref() else {
            return Ok(());
        };
        let mut waiters = Vec::new();
        for (target, source) in &self.restored_tables {
            let Some(table) = meta.get_table(source).filter(|t| t.is_materialized_view()) else {
                continue;
            };
            let missing: BTreeSet<String> = table
                .base_tables
                .iter()
                .filter(|base| ctx.catalog.get_table(db, base).is_none())
                .cloned()
                .collect();
            if missing.is_empty() {
                ctx.catalog.set_mv_state(db, target, true, None)?;
            } else {
                self.common.log_info(&format!(
                    "Materialized view {} stays inactive until {:?} are restored",
                    target, missing
                ));
                waiters.push(MvWaiter {
                    job_id: self.common.job_id,
                    db_id: db,
                    mv_name: target.clone(),
                    missing_bases: missing,
                    parked_at: now_ms,
                });
            }
        }
        ctx.mv_restore.add_from_job(&waiters);
        self.mv_waiters = waiters;

        let restored: Vec<String> = self.restored_tables.keys().cloned().collect();
        ctx.mv_restore.on_tables_restored(ctx.catalog.as_ref(), db, &restored);
        Ok(())
    }

    fn enter_phase(
        &mut self,
        ctx: &ClusterContext,
        next: RestoreJobState,
        mode: DriveMode,
        now_ms: i64,
    ) -> Result<()> {
        let replayed = |common: &JobCommon| common.outstanding.values().cloned().collect::<Vec<_>>();
        self.state = next;
        match next {
            RestoreJobState::Downloading => {
                let tasks = match mode {
                    DriveMode::Live => self.download_tasks(ctx),
                    DriveMode::Replay => replayed(&self.common),
                };
                for task in &tasks {
                    if let TaskPayload::Download { files, .. } = &task.payload {
                        self.common
                            .task_progress
                            .entry(task.task_id)
                            .or_insert((0, files.len() as u32));
                    }
                }
                if mode == DriveMode::Live {
                    self.common.log_info(&format!(
                        "Downloading {} tablet(s) with {} task(s)",
                        self.download_plan.len(),
                        tasks.len()
                    ));
                }
                self.common.issue_batch(ctx, tasks, mode)?;
            }
            RestoreJobState::DirMove => {
                let tasks = match mode {
                    DriveMode::Live => self.dir_move_tasks(ctx),
                    DriveMode::Replay => replayed(&self.common),
                };
                self.common.issue_batch(ctx, tasks, mode)?;
            }
            RestoreJobState::Finished => {
                self.common.outstanding.clear();
                self.common.mark_finished(now_ms);
                match mode {
                    DriveMode::Live => self.common.log_info(&format!(
                        "Restore of {} finished: {} table(s)",
                        self.common.label,
                        self.restored_tables.len()
                    )),
                    DriveMode::Replay => self.replay_mv_waiters(ctx),
                }
            }
            RestoreJobState::Pending | RestoreJobState::Cancelled => {}
        }
        Ok(())
    }

    /// Re-park this job's views and settle views parked by earlier restores
    /// whose bases this job brought back.
    fn replay_mv_waiters(&self, ctx: &ClusterContext) {
        ctx.mv_restore.add_from_job(&self.mv_waiters);
        if let Some(db) = self.common.target.db_id() {
            let restored: Vec<String> = self.restored_tables.keys().cloned().collect();
            ctx.mv_restore.settle_restored(db, &restored);
        }
    }

    fn run_pending(&mut self, ctx: &ClusterContext, now_ms: i64) -> Result<()> {
        let Some(meta) = self.backup_meta.clone() else {
            self.common
                .log_warn("No backup meta available, nothing to restore");
            return self.enter_phase(ctx, RestoreJobState::Finished, DriveMode::Live, now_ms);
        };
        self.prepare(ctx, &meta)?;
        self.enter_phase(ctx, RestoreJobState::Downloading, DriveMode::Live, now_ms)
    }

    fn cancel_internal(&mut self, ctx: &ClusterContext, failure: JobFailure, now_ms: i64) {
        self.common.abort_outstanding(ctx);
        if let Some(db) = self.common.target.db_id() {
            for table in self.created_tables.iter().rev() {
                if let Err(e) = ctx.catalog.drop_table(db, table) {
                    self.common
                        .log_error(&format!("Failed to drop restored table {}: {}", table, e));
                }
            }
        }
        ctx.mv_restore.discard_job(self.common.job_id);
        self.common.log_warn(&format!(
            "Restore cancelled in state {}: {}",
            self.state.as_str(),
            failure
        ));
        if self.common.failure.is_none() {
            self.common.failure = Some(failure);
        }
        self.state = RestoreJobState::Cancelled;
        self.common.mark_finished(now_ms);
    }

    fn failure_kind(err: &BackupError) -> JobFailureKind {
        match err {
            BackupError::Repository(_) => JobFailureKind::Repository,
            BackupError::SubTaskFailure(_) => JobFailureKind::SubTaskFailure,
            BackupError::Timeout(_) => JobFailureKind::Timeout,
            _ => JobFailureKind::Catalog,
        }
    }
}

impl JobStateMachine for RestoreJob {
    fn common(&self) -> &JobCommon {
        &self.common
    }

    fn common_mut(&mut self) -> &mut JobCommon {
        &mut self.common
    }

    fn phase_name(&self) -> &'static str {
        self.state.as_str()
    }

    fn is_done(&self) -> bool {
        matches!(self.state, RestoreJobState::Finished | RestoreJobState::Cancelled)
    }

    fn is_pending(&self) -> bool {
        self.state == RestoreJobState::Pending
    }

    fn is_cancelled(&self) -> bool {
        self.state == RestoreJobState::Cancelled
    }

    fn run_at(&mut self, ctx: &ClusterContext, now_ms: i64) {
        if self.is_done() {
            return;
        }
        if self.common.is_timed_out(now_ms) {
            let failure = JobFailure::new(
                JobFailureKind::Timeout,
                format!(
                    "restore job {} timed out after {} ms in state {}",
                    self.common.label,
                    self.common.timeout_ms,
                    self.state.as_str()
                ),
            );
            self.cancel_internal(ctx, failure, now_ms);
            return;
        }

        let result = if self.common.needs_redispatch() {
            self.common.dispatch_outstanding(ctx)
        } else {
            match self.state {
                RestoreJobState::Pending => self.run_pending(ctx, now_ms),
                RestoreJobState::Downloading if self.common.outstanding.is_empty() => {
                    self.enter_phase(ctx, RestoreJobState::DirMove, DriveMode::Live, now_ms)
                }
                RestoreJobState::DirMove if self.common.outstanding.is_empty() => self
                    .finalize(ctx, now_ms)
                    .and_then(|_| {
                        self.enter_phase(ctx, RestoreJobState::Finished, DriveMode::Live, now_ms)
                    }),
                _ => Ok(()),
            }
        };

        if let Err(e) = result {
            let failure = JobFailure::new(Self::failure_kind(&e), e.to_string());
            self.cancel_internal(ctx, failure, now_ms);
        }
    }

    fn cancel(&mut self, ctx: &ClusterContext) -> Result<()> {
        if self.is_done() {
            return Err(not_cancellable(&self.common, self.state.as_str()));
        }
        let failure = JobFailure::new(JobFailureKind::UserCancelled, "cancelled by user");
        self.cancel_internal(ctx, failure, now_millis());
        Ok(())
    }

    fn replay_run(&mut self, ctx: &ClusterContext) -> Result<()> {
        check_replayable(&self.common, self.is_done(), self.state.as_str())?;
        let expected = self.state.task_kind();
        if let Some(task) = self.common.outstanding.values().find(|t| Some(t.kind) != expected) {
            return Err(BackupError::recovery(format!(
                "job {} in state {} has an outstanding {} task {}",
                self.common.job_id,
                self.state.as_str(),
                task.kind,
                task.task_id
            )));
        }
        let finished_at = self.common.finished_at.unwrap_or_else(now_millis);
        self.enter_phase(ctx, self.state, DriveMode::Replay, finished_at)
    }

    fn replay_cancel(&mut self, ctx: &ClusterContext) -> Result<()> {
        if self.is_done() {
            return Err(BackupError::recovery(format!(
                "cannot replay cancellation of job {} in state {}",
                self.common.job_id,
                self.state.as_str()
            )));
        }
        self.common.outstanding.clear();
        self.common.batch_dispatched = false;
        ctx.mv_restore.discard_job(self.common.job_id);
        if self.common.failure.is_none() {
            self.common.failure = Some(JobFailure::new(
                JobFailureKind::UserCancelled,
                "cancelled before restart",
            ));
        }
        self.state = RestoreJobState::Cancelled;
        self.common.mark_finished(now_millis());
        Ok(())
    }
}
