use std::collections::BTreeMap;
use std::fmt;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use strata_commons::{JobId, JobType, RepoId, TargetKey, TaskId, TaskKind};

use crate::context::ClusterContext;
use crate::error::{BackupError, Result};
use crate::tasks::TaskRequest;

/// Why a job ended up cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobFailureKind {
    Timeout,
    SubTaskFailure,
    UserCancelled,
    Repository,
    Catalog,
}

impl fmt::Display for JobFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobFailureKind::Timeout => "TIMEOUT",
            JobFailureKind::SubTaskFailure => "SUB_TASK_FAILURE",
            JobFailureKind::UserCancelled => "USER_CANCELLED",
            JobFailureKind::Repository => "REPOSITORY",
            JobFailureKind::Catalog => "CATALOG",
        };
        f.write_str(s)
    }
}

/// Last error recorded on a cancelled job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: JobFailureKind,
    pub message: String,
}

impl JobFailure {
    pub fn new(kind: JobFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Turn the recorded failure back into the error taxonomy.
    pub fn to_error(&self) -> BackupError {
        match self.kind {
            JobFailureKind::Timeout => BackupError::Timeout(self.message.clone()),
            JobFailureKind::SubTaskFailure => BackupError::SubTaskFailure(self.message.clone()),
            JobFailureKind::UserCancelled => BackupError::Other(self.message.clone()),
            JobFailureKind::Repository => BackupError::Repository(self.message.clone()),
            JobFailureKind::Catalog => BackupError::Catalog(self.message.clone()),
        }
    }
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

/// Whether a phase entry issues its sub-tasks or only rebuilds bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DriveMode {
    Live,
    Replay,
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Fields shared by backup and restore jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCommon {
    pub job_id: JobId,
    pub label: String,
    pub target: TargetKey,
    /// Empty for external-catalog jobs.
    pub db_name: String,
    pub repo_id: RepoId,
    pub job_type: JobType,
    pub created_at: i64,
    pub finished_at: Option<i64>,
    pub timeout_ms: u64,
    /// Task id -> (finished units, total units).
    pub task_progress: BTreeMap<TaskId, (u32, u32)>,
    pub failure: Option<JobFailure>,
    /// Issued tasks of the current phase still waiting for a completion.
    pub outstanding: BTreeMap<TaskId, TaskRequest>,
    /// Whether `outstanding` has been sent to workers by this process.
    #[serde(skip)]
    pub(crate) batch_dispatched: bool,
}

impl PartialEq for JobCommon {
    fn eq(&self, other: &Self) -> bool {
        self.job_id == other.job_id
            && self.label == other.label
            && self.target == other.target
            && self.db_name == other.db_name
            && self.repo_id == other.repo_id
            && self.job_type == other.job_type
            && self.created_at == other.created_at
            && self.finished_at == other.finished_at
            && self.timeout_ms == other.timeout_ms
            && self.task_progress == other.task_progress
            && self.failure == other.failure
            && self.outstanding == other.outstanding
    }
}

impl JobCommon {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job_id: JobId,
        label: impl Into<String>,
        target: TargetKey,
        db_name: impl Into<String>,
        repo_id: RepoId,
        job_type: JobType,
        created_at: i64,
        timeout_ms: u64,
    ) -> Self {
        Self {
            job_id,
            label: label.into(),
            target,
            db_name: db_name.into(),
            repo_id,
            job_type,
            created_at,
            finished_at: None,
            timeout_ms,
            task_progress: BTreeMap::new(),
            failure: None,
            outstanding: BTreeMap::new(),
            batch_dispatched: false,
        }
    }

    pub fn is_timed_out(&self, now_ms: i64) -> bool {
        let timeout_ms = i64::try_from(self.timeout_ms).unwrap_or(i64::MAX);
        now_ms.saturating_sub(self.created_at) > timeout_ms
    }

    /// Set once, on the first terminal transition.
    pub(crate) fn mark_finished(&mut self, now_ms: i64) {
        if self.finished_at.is_none() {
            self.finished_at = Some(now_ms);
        }
    }

    /// Outstanding tasks recovered from a journal that still have to be sent.
    pub(crate) fn needs_redispatch(&self) -> bool {
        !self.batch_dispatched && !self.outstanding.is_empty()
    }

    /// Record `tasks` as the current batch and, in live mode, send them.
    pub(crate) fn issue_batch(
        &mut self,
        ctx: &ClusterContext,
        tasks: Vec<TaskRequest>,
        mode: DriveMode,
    ) -> Result<()> {
        self.outstanding.clear();
        for task in tasks {
            self.outstanding.insert(task.task_id, task);
        }
        match mode {
            DriveMode::Live => self.dispatch_outstanding(ctx),
            DriveMode::Replay => {
                self.batch_dispatched = false;
                Ok(())
            }
        }
    }

    /// Send every outstanding task. Workers treat a re-sent task idempotently.
    pub(crate) fn dispatch_outstanding(&mut self, ctx: &ClusterContext) -> Result<()> {
        for task in self.outstanding.values() {
            ctx.dispatcher.dispatch(task.clone())?;
        }
        self.batch_dispatched = true;
        if !self.outstanding.is_empty() {
            self.log_debug(&format!("Dispatched {} sub-task(s)", self.outstanding.len()));
        }
        Ok(())
    }

    /// Remove and return the outstanding task `task_id` if it is of `kind`.
    pub(crate) fn take_outstanding(&mut self, task_id: TaskId, kind: TaskKind) -> Option<TaskRequest> {
        match self.outstanding.get(&task_id) {
            Some(task) if task.kind == kind => self.outstanding.remove(&task_id),
            _ => None,
        }
    }

    pub(crate) fn is_outstanding(&self, task_id: TaskId, kind: TaskKind) -> bool {
        self.outstanding
            .get(&task_id)
            .map(|t| t.kind == kind)
            .unwrap_or(false)
    }

    /// Ask workers to drop whatever is still outstanding and forget it.
    pub(crate) fn abort_outstanding(&mut self, ctx: &ClusterContext) {
        if self.outstanding.is_empty() {
            return;
        }
        let ids: Vec<TaskId> = self.outstanding.keys().copied().collect();
        ctx.dispatcher.abort(self.job_id, &ids);
        self.log_debug(&format!("Aborted {} outstanding sub-task(s)", ids.len()));
        self.outstanding.clear();
        self.batch_dispatched = false;
    }

    /// Every task id this job ever allocated that is still known.
    pub(crate) fn max_task_id(&self) -> Option<TaskId> {
        self.outstanding
            .keys()
            .chain(self.task_progress.keys())
            .copied()
            .max()
    }

    pub fn log_debug(&self, message: &str) {
        debug!("[{}] {}", self.job_id, message);
    }

    pub fn log_info(&self, message: &str) {
        info!("[{}] {}", self.job_id, message);
    }

    pub fn log_warn(&self, message: &str) {
        warn!("[{}] {}", self.job_id, message);
    }

    pub fn log_error(&self, message: &str) {
        error!("[{}] {}", self.job_id, message);
    }
}
