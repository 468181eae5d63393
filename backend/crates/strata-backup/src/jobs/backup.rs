use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strata_commons::{BackendId, TableRef, TabletId, TaskId, TaskKind};

use super::common::{now_millis, DriveMode, JobCommon, JobFailure, JobFailureKind};
use super::{check_replayable, not_cancellable, JobStateMachine};
use crate::context::ClusterContext;
use crate::error::{BackupError, Result};
use crate::manifest::BackupJobInfo;
use crate::meta::BackupMeta;
use crate::tasks::{CompletionPayload, TaskCompletion, TaskPayload, TaskRequest, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupJobState {
    Pending,
    Snapshotting,
    Uploading,
    SavingMeta,
    Finished,
    Cancelled,
}

impl BackupJobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupJobState::Pending => "PENDING",
            BackupJobState::Snapshotting => "SNAPSHOTTING",
            BackupJobState::Uploading => "UPLOADING",
            BackupJobState::SavingMeta => "SAVE_META",
            BackupJobState::Finished => "FINISHED",
            BackupJobState::Cancelled => "CANCELLED",
        }
    }

    /// Sub-task kind that may be outstanding in this phase.
    fn task_kind(&self) -> Option<TaskKind> {
        match self {
            BackupJobState::Snapshotting => Some(TaskKind::Snapshot),
            BackupJobState::Uploading => Some(TaskKind::Upload),
            _ => None,
        }
    }
}

/// Snapshots a database's tables (or external catalog metadata) into a
/// repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupJob {
    common: JobCommon,
    state: BackupJobState,
    table_refs: Vec<TableRef>,
    backup_meta: BackupMeta,
    /// Local snapshot per tablet, filled by snapshot completions.
    snapshot_paths: BTreeMap<TabletId, (BackendId, String)>,
    /// Uploaded files per tablet, filled by upload completions.
    snapshot_files: BTreeMap<TabletId, Vec<String>>,
    /// Set when all snapshots are taken; identifies the snapshot in the repository.
    backup_time: Option<i64>,
}

impl BackupJob {
    pub fn new(common: JobCommon, table_refs: Vec<TableRef>, backup_meta: BackupMeta) -> Self {
        Self {
            common,
            state: BackupJobState::Pending,
            table_refs,
            backup_meta,
            snapshot_paths: BTreeMap::new(),
            snapshot_files: BTreeMap::new(),
            backup_time: None,
        }
    }

    pub fn state(&self) -> BackupJobState {
        self.state
    }

    pub fn backup_meta(&self) -> &BackupMeta {
        &self.backup_meta
    }

    pub fn table_refs(&self) -> &[TableRef] {
        &self.table_refs
    }

    pub fn backup_time(&self) -> Option<i64> {
        self.backup_time
    }

    pub fn snapshot_files(&self) -> &BTreeMap<TabletId, Vec<String>> {
        &self.snapshot_files
    }

    /// Apply a snapshot completion. Returns `false` when the completion does
    /// not belong to the current phase of this job.
    pub fn finish_tablet_snapshot_task(&mut self, ctx: &ClusterContext, completion: &TaskCompletion) -> bool {
        if self.state != BackupJobState::Snapshotting || completion.job_id != self.common.job_id {
            return false;
        }
        let Some(task) = self.common.take_outstanding(completion.task_id, TaskKind::Snapshot) else {
            return false;
        };

        match (&completion.status, &task.payload, &completion.payload) {
            (TaskStatus::Failed(msg), TaskPayload::Snapshot { tablet_id, .. }, _) => {
                let failure = JobFailure::new(
                    JobFailureKind::SubTaskFailure,
                    format!(
                        "snapshot task {} for tablet {} failed on backend {}: {}",
                        task.task_id, tablet_id, task.backend_id, msg
                    ),
                );
                self.cancel_internal(ctx, failure, now_millis());
            }
            (
                TaskStatus::Ok,
                TaskPayload::Snapshot { tablet_id, .. },
                CompletionPayload::Snapshot { snapshot_path },
            ) => {
                self.snapshot_paths
                    .insert(*tablet_id, (task.backend_id, snapshot_path.clone()));
                self.common.log_debug(&format!(
                    "Snapshot of tablet {} finished, {} remaining",
                    tablet_id,
                    self.common.outstanding.len()
                ));
            }
            _ => {
                let failure = JobFailure::new(
                    JobFailureKind::SubTaskFailure,
                    format!("malformed completion for snapshot task {}", task.task_id),
                );
                self.cancel_internal(ctx, failure, now_millis());
            }
        }
        true
    }

    /// Apply an upload completion. Same gating as snapshot completions.
    pub fn finish_snapshot_upload_task(&mut self, ctx: &ClusterContext, completion: &TaskCompletion) -> bool {
        if self.state != BackupJobState::Uploading || completion.job_id != self.common.job_id {
            return false;
        }
        let Some(task) = self.common.take_outstanding(completion.task_id, TaskKind::Upload) else {
            return false;
        };

        match (&completion.status, &completion.payload) {
            (TaskStatus::Failed(msg), _) => {
                let failure = JobFailure::new(
                    JobFailureKind::SubTaskFailure,
                    format!(
                        "upload task {} failed on backend {}: {}",
                        task.task_id, task.backend_id, msg
                    ),
                );
                self.cancel_internal(ctx, failure, now_millis());
            }
            (TaskStatus::Ok, CompletionPayload::Upload { tablet_files }) => {
                let count = tablet_files.len() as u32;
                for (tablet, files) in tablet_files {
                    self.snapshot_files.insert(*tablet, files.clone());
                }
                self.common.task_progress.insert(task.task_id, (count, count));
            }
            _ => {
                let failure = JobFailure::new(
                    JobFailureKind::SubTaskFailure,
                    format!("malformed completion for upload task {}", task.task_id),
                );
                self.cancel_internal(ctx, failure, now_millis());
            }
        }
        true
    }

    /// Record upload progress reported by a worker.
    pub fn update_upload_progress(&mut self, task_id: TaskId, finished: u32, total: u32) -> bool {
        if self.state != BackupJobState::Uploading || !self.common.is_outstanding(task_id, TaskKind::Upload) {
            return false;
        }
        self.common.task_progress.insert(task_id, (finished, total));
        true
    }

    fn snapshot_tasks(&self, ctx: &ClusterContext) -> Vec<TaskRequest> {
        let mut tasks = Vec::new();
        for table in self.backup_meta.tables.values().filter(|t| t.kind.has_data()) {
            for partition in &table.partitions {
                for tablet in &partition.tablets {
                    tasks.push(TaskRequest {
                        task_id: ctx.ids.next_task_id(),
                        job_id: self.common.job_id,
                        target: self.common.target,
                        backend_id: tablet.backend_id,
                        kind: TaskKind::Snapshot,
                        payload: TaskPayload::Snapshot {
                            tablet_id: tablet.id,
                            partition_id: partition.id,
                            version: partition.visible_version,
                        },
                    });
                }
            }
        }
        tasks
    }

    /// One upload task per backend and chunk of tablets.
    fn upload_tasks(&self, ctx: &ClusterContext) -> Vec<TaskRequest> {
        let mut by_backend: BTreeMap<BackendId, Vec<(TabletId, String)>> = BTreeMap::new();
        for (tablet, (backend, path)) in &self.snapshot_paths {
            by_backend
                .entry(*backend)
                .or_default()
                .push((*tablet, path.clone()));
        }

        let dest_prefix = format!("{}/__{}", self.common.label, self.common.job_id);
        let chunk_size = ctx.settings.max_tablets_per_task.max(1);
        let mut tasks = Vec::new();
        for (backend, tablets) in by_backend {
            for chunk in tablets.chunks(chunk_size) {
                tasks.push(TaskRequest {
                    task_id: ctx.ids.next_task_id(),
                    job_id: self.common.job_id,
                    target: self.common.target,
                    backend_id: backend,
                    kind: TaskKind::Upload,
                    payload: TaskPayload::Upload {
                        repo_id: self.common.repo_id,
                        dest_prefix: dest_prefix.clone(),
                        tablets: chunk.to_vec(),
                    },
                });
            }
        }
        tasks
    }

    fn enter_phase(
        &mut self,
        ctx: &ClusterContext,
        next: BackupJobState,
        mode: DriveMode,
        now_ms: i64,
    ) -> Result<()> {
        let replayed = |common: &JobCommon| common.outstanding.values().cloned().collect::<Vec<_>>();
        self.state = next;
        match next {
            BackupJobState::Snapshotting => {
                let tasks = match mode {
                    DriveMode::Live => self.snapshot_tasks(ctx),
                    DriveMode::Replay => replayed(&self.common),
                };
                if mode == DriveMode::Live {
                    self.common.log_info(&format!(
                        "Taking snapshots of {} tablet(s)",
                        tasks.len()
                    ));
                }
                self.common.issue_batch(ctx, tasks, mode)?;
            }
            BackupJobState::Uploading => {
                let tasks = match mode {
                    DriveMode::Live => {
                        self.backup_time = Some(now_ms);
                        self.upload_tasks(ctx)
                    }
                    DriveMode::Replay => replayed(&self.common),
                };
                for task in &tasks {
                    if let TaskPayload::Upload { tablets, .. } = &task.payload {
                        self.common
                            .task_progress
                            .entry(task.task_id)
                            .or_insert((0, tablets.len() as u32));
                    }
                }
                if mode == DriveMode::Live {
                    self.common
                        .log_info(&format!("Uploading snapshots with {} task(s)", tasks.len()));
                }
                self.common.issue_batch(ctx, tasks, mode)?;
            }
            BackupJobState::SavingMeta => {
                self.common.outstanding.clear();
            }
            BackupJobState::Finished => {
                self.common.mark_finished(now_ms);
                if mode == DriveMode::Live {
                    self.common.log_info(&format!(
                        "Backup {} finished with {} table(s) and {} tablet file set(s)",
                        self.common.label,
                        self.backup_meta.tables.len(),
                        self.snapshot_files.len()
                    ));
                }
            }
            BackupJobState::Pending | BackupJobState::Cancelled => {}
        }
        Ok(())
    }

    fn save_meta(&mut self, ctx: &ClusterContext, now_ms: i64) -> Result<()> {
        let repo = ctx.repositories.get(self.common.repo_id).ok_or_else(|| {
            BackupError::repository(format!("repository {} no longer exists", self.common.repo_id))
        })?;
        let info = BackupJobInfo::from_backup(
            &self.common.label,
            &self.common.db_name,
            self.common.target.db_id(),
            self.backup_time.unwrap_or(now_ms),
            &self.backup_meta,
            &self.snapshot_files,
        );
        repo.save_snapshot(&info, &self.backup_meta)?;
        self.enter_phase(ctx, BackupJobState::Finished, DriveMode::Live, now_ms)
    }

    fn cancel_internal(&mut self, ctx: &ClusterContext, failure: JobFailure, now_ms: i64) {
        self.common.abort_outstanding(ctx);
        self.common.log_warn(&format!(
            "Backup cancelled in state {}: {}",
            self.state.as_str(),
            failure
        ));
        if self.common.failure.is_none() {
            self.common.failure = Some(failure);
        }
        self.state = BackupJobState::Cancelled;
        self.common.mark_finished(now_ms);
    }

    fn failure_kind(err: &BackupError) -> JobFailureKind {
        match err {
            BackupError::Catalog(_) => JobFailureKind::Catalog,
            BackupError::SubTaskFailure(_) => JobFailureKind::SubTaskFailure,
            BackupError::Timeout(_) => JobFailureKind::Timeout,
            _ => JobFailureKind::Repository,
        }
    }
}

impl JobStateMachine for BackupJob {
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
        matches!(self.state, BackupJobState::Finished | BackupJobState::Cancelled)
    }

    fn is_pending(&self) -> bool {
        self.state == BackupJobState::Pending
    }

    fn is_cancelled(&self) -> bool {
        self.state == BackupJobState::Cancelled
    }

    fn run_at(&mut self, ctx: &ClusterContext, now_ms: i64) {
        if self.is_done() {
            return;
        }
        if self.common.is_timed_out(now_ms) {
            let failure = JobFailure::new(
                JobFailureKind::Timeout,
                format!(
                    "backup job {} timed out after {} ms in state {}",
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
                BackupJobState::Pending => {
                    self.enter_phase(ctx, BackupJobState::Snapshotting, DriveMode::Live, now_ms)
                }
                BackupJobState::Snapshotting if self.common.outstanding.is_empty() => {
                    self.enter_phase(ctx, BackupJobState::Uploading, DriveMode::Live, now_ms)
                }
                BackupJobState::Uploading if self.common.outstanding.is_empty() => {
                    self.enter_phase(ctx, BackupJobState::SavingMeta, DriveMode::Live, now_ms)
                }
                BackupJobState::SavingMeta => self.save_meta(ctx, now_ms),
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

    fn replay_cancel(&mut self, _ctx: &ClusterContext) -> Result<()> {
        if self.is_done() {
            return Err(BackupError::recovery(format!(
                "cannot replay cancellation of job {} in state {}",
                self.common.job_id,
                self.state.as_str()
            )));
        }
        self.common.outstanding.clear();
        self.common.batch_dispatched = false;
        if self.common.failure.is_none() {
            self.common.failure = Some(JobFailure::new(
                JobFailureKind::UserCancelled,
                "cancelled before restart",
            ));
        }
        self.state = BackupJobState::Cancelled;
        self.common.mark_finished(now_millis());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{ColumnMeta, PartitionMeta, TableMeta, TabletMeta};
    use crate::test_utils::{test_context, RecordingDispatcher};
    use strata_commons::{DbId, JobId, JobType, RepoId, TableKind, TargetKey};

    fn job(timeout_ms: u64) -> BackupJob {
        let meta = BackupMeta::new(vec![TableMeta {
            id: 10,
            name: "orders".to_string(),
            kind: TableKind::Olap,
            columns: vec![ColumnMeta::new("id", "BIGINT")],
            partitions: vec![PartitionMeta {
                id: 11,
                name: "p1".to_string(),
                visible_version: 3,
                tablets: vec![
                    TabletMeta {
                        id: TabletId::new(100),
                        backend_id: BackendId::new(1),
                    },
                    TabletMeta {
                        id: TabletId::new(101),
                        backend_id: BackendId::new(2),
                    },
                ],
            }],
            has_temp_partitions: false,
            base_tables: Vec::new(),
            inactive_reason: None,
            view_def: None,
        }]);
        let common = JobCommon::new(
            JobId::new(1000),
            "snap",
            TargetKey::Database(DbId::new(1)),
            "sales",
            RepoId::new(1),
            JobType::Backup,
            now_millis(),
            timeout_ms,
        );
        BackupJob::new(common, vec![TableRef::new("orders")], meta)
    }

    #[test]
    fn test_pending_issues_one_snapshot_per_tablet() {
        let dispatcher = RecordingDispatcher::new();
        let ctx = test_context(dispatcher.clone());
        let mut job = job(60_000);

        job.run(&ctx);
        assert_eq!(job.state(), BackupJobState::Snapshotting);
        assert_eq!(dispatcher.tasks_of_kind(TaskKind::Snapshot).len(), 2);

        // Nothing completed yet: another run does not advance.
        job.run(&ctx);
        assert_eq!(job.state(), BackupJobState::Snapshotting);
    }

    #[test]
    fn test_snapshot_failure_cancels_job() {
        let dispatcher = RecordingDispatcher::new();
        let ctx = test_context(dispatcher.clone());
        let mut job = job(60_000);
        job.run(&ctx);

        let task = dispatcher.tasks_of_kind(TaskKind::Snapshot)[0].clone();
        let completion = TaskCompletion::failed(&task, "disk full");
        assert!(job.finish_tablet_snapshot_task(&ctx, &completion));
        assert!(job.is_cancelled());
        let failure = job.common().failure.clone().unwrap();
        assert_eq!(failure.kind, JobFailureKind::SubTaskFailure);
        assert!(failure.message.contains("disk full"));
        assert_eq!(dispatcher.aborted().len(), 1);
    }

    #[test]
    fn test_duplicate_snapshot_completion_is_rejected() {
        let dispatcher = RecordingDispatcher::new();
        let ctx = test_context(dispatcher.clone());
        let mut job = job(60_000);
        job.run(&ctx);

        let task = dispatcher.tasks_of_kind(TaskKind::Snapshot)[0].clone();
        let completion = RecordingDispatcher::success_for(&task);
        assert!(job.finish_tablet_snapshot_task(&ctx, &completion));
        assert!(!job.finish_tablet_snapshot_task(&ctx, &completion));
        // An upload completion is never accepted while snapshotting.
        assert!(!job.finish_snapshot_upload_task(&ctx, &completion));
    }

    #[test]
    fn test_timeout_checked_on_every_run() {
        let ctx = test_context(RecordingDispatcher::new());
        let mut job = job(1_000);
        let created = job.common().created_at;

        job.run_at(&ctx, created + 10);
        assert_eq!(job.state(), BackupJobState::Snapshotting);

        job.run_at(&ctx, created + 5_000);
        assert!(job.is_cancelled());
        assert_eq!(job.common().failure.as_ref().unwrap().kind, JobFailureKind::Timeout);
        assert_eq!(job.common().finished_at, Some(created + 5_000));
    }

    #[test]
    fn test_cancel_finished_job_fails() {
        let ctx = test_context(RecordingDispatcher::new());
        let mut job = job(60_000);
        job.cancel(&ctx).unwrap();
        let err = job.cancel(&ctx).unwrap_err();
        assert!(matches!(err, BackupError::Conflict(_)));
    }
}
