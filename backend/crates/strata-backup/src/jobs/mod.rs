//! Backup and restore job state machines.
//!
//! Both job kinds share [`JobCommon`] and the [`JobStateMachine`] contract.
//! The orchestrator holds them as the tagged [`Job`] enum and matches on it
//! wherever kind-specific behavior (completion routing) is needed.
//!
//! `run_at` and `replay_run` drive the same private phase-entry function; the
//! live path issues sub-tasks, the replay path only rebuilds bookkeeping from
//! the persisted fields.

mod backup;
mod common;
mod restore;

pub use backup::{BackupJob, BackupJobState};
pub use common::{JobCommon, JobFailure, JobFailureKind};
pub use restore::{RestoreJob, RestoreJobState};

pub(crate) use common::now_millis;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strata_commons::{JobId, JobType, RepoId, TargetKey, TaskId};

use crate::context::ClusterContext;
use crate::error::{BackupError, Result};

/// Lifecycle contract shared by backup and restore jobs.
pub trait JobStateMachine {
    fn common(&self) -> &JobCommon;

    fn common_mut(&mut self) -> &mut JobCommon;

    /// Upper-case name of the current phase.
    fn phase_name(&self) -> &'static str;

    /// FINISHED or CANCELLED.
    fn is_done(&self) -> bool;

    fn is_pending(&self) -> bool;

    fn is_cancelled(&self) -> bool;

    /// Advance by at most one phase transition. No-op on a terminal job.
    fn run_at(&mut self, ctx: &ClusterContext, now_ms: i64);

    fn run(&mut self, ctx: &ClusterContext) {
        self.run_at(ctx, now_millis());
    }

    /// Cancel on user request. Fails if the job is already terminal.
    fn cancel(&mut self, ctx: &ClusterContext) -> Result<()>;

    /// Rebuild in-memory bookkeeping of a job decoded from the journal or an
    /// image. Never issues sub-tasks; outstanding ones are re-sent by the next
    /// `run`.
    fn replay_run(&mut self, ctx: &ClusterContext) -> Result<()>;

    /// Apply a cancellation decided before the restart.
    fn replay_cancel(&mut self, ctx: &ClusterContext) -> Result<()>;

    fn job_id(&self) -> JobId {
        self.common().job_id
    }

    fn target(&self) -> TargetKey {
        self.common().target
    }
}

/// A backup or restore job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Job {
    Backup(BackupJob),
    Restore(RestoreJob),
}

impl Job {
    pub fn job_type(&self) -> JobType {
        match self {
            Job::Backup(_) => JobType::Backup,
            Job::Restore(_) => JobType::Restore,
        }
    }

    pub fn as_backup(&self) -> Option<&BackupJob> {
        match self {
            Job::Backup(job) => Some(job),
            Job::Restore(_) => None,
        }
    }

    pub fn as_restore(&self) -> Option<&RestoreJob> {
        match self {
            Job::Restore(job) => Some(job),
            Job::Backup(_) => None,
        }
    }

    pub fn repo_id(&self) -> RepoId {
        self.common().repo_id
    }

    /// `(phase, done)` pair used to notice transitions worth journaling.
    pub(crate) fn observed_state(&self) -> (&'static str, bool) {
        (self.phase_name(), self.is_done())
    }

    pub fn summary(&self) -> JobSummary {
        let common = self.common();
        JobSummary {
            job_id: common.job_id,
            label: common.label.clone(),
            job_type: common.job_type,
            target: common.target.to_string(),
            db_name: common.db_name.clone(),
            repo_id: common.repo_id,
            state: self.phase_name().to_string(),
            created_at: common.created_at,
            finished_at: common.finished_at,
            timeout_ms: common.timeout_ms,
            progress: common.task_progress.clone(),
            error: common.failure.as_ref().map(|f| f.to_string()),
            outstanding_tasks: common.outstanding.len(),
        }
    }
}

impl JobStateMachine for Job {
    fn common(&self) -> &JobCommon {
        match self {
            Job::Backup(job) => job.common(),
            Job::Restore(job) => job.common(),
        }
    }

    fn common_mut(&mut self) -> &mut JobCommon {
        match self {
            Job::Backup(job) => job.common_mut(),
            Job::Restore(job) => job.common_mut(),
        }
    }

    fn phase_name(&self) -> &'static str {
        match self {
            Job::Backup(job) => job.phase_name(),
            Job::Restore(job) => job.phase_name(),
        }
    }

    fn is_done(&self) -> bool {
        match self {
            Job::Backup(job) => job.is_done(),
            Job::Restore(job) => job.is_done(),
        }
    }

    fn is_pending(&self) -> bool {
        match self {
            Job::Backup(job) => job.is_pending(),
            Job::Restore(job) => job.is_pending(),
        }
    }

    fn is_cancelled(&self) -> bool {
        match self {
            Job::Backup(job) => job.is_cancelled(),
            Job::Restore(job) => job.is_cancelled(),
        }
    }

    fn run_at(&mut self, ctx: &ClusterContext, now_ms: i64) {
        match self {
            Job::Backup(job) => job.run_at(ctx, now_ms),
            Job::Restore(job) => job.run_at(ctx, now_ms),
        }
    }

    fn cancel(&mut self, ctx: &ClusterContext) -> Result<()> {
        match self {
            Job::Backup(job) => job.cancel(ctx),
            Job::Restore(job) => job.cancel(ctx),
        }
    }

    fn replay_run(&mut self, ctx: &ClusterContext) -> Result<()> {
        match self {
            Job::Backup(job) => job.replay_run(ctx),
            Job::Restore(job) => job.replay_run(ctx),
        }
    }

    fn replay_cancel(&mut self, ctx: &ClusterContext) -> Result<()> {
        match self {
            Job::Backup(job) => job.replay_cancel(ctx),
            Job::Restore(job) => job.replay_cancel(ctx),
        }
    }
}

/// User-visible view of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSummary {
    pub job_id: JobId,
    pub label: String,
    pub job_type: JobType,
    pub target: String,
    pub db_name: String,
    pub repo_id: RepoId,
    pub state: String,
    pub created_at: i64,
    pub finished_at: Option<i64>,
    pub timeout_ms: u64,
    pub progress: BTreeMap<TaskId, (u32, u32)>,
    pub error: Option<String>,
    pub outstanding_tasks: usize,
}

/// Error returned when cancelling a job that already reached a terminal phase.
pub(crate) fn not_cancellable(common: &JobCommon, state: &str) -> BackupError {
    BackupError::conflict(format!(
        "Job with label {} can not be cancelled. state: {}",
        common.label, state
    ))
}

/// Shared consistency checks for a decoded job.
pub(crate) fn check_replayable(common: &JobCommon, done: bool, phase: &str) -> Result<()> {
    if done && common.finished_at.is_none() {
        return Err(BackupError::recovery(format!(
            "job {} is {} but has no finish time",
            common.job_id, phase
        )));
    }
    if !done && common.finished_at.is_some() {
        return Err(BackupError::recovery(format!(
            "job {} is {} but has a finish time",
            common.job_id, phase
        )));
    }
    if done && !common.outstanding.is_empty() {
        return Err(BackupError::recovery(format!(
            "job {} is {} with {} outstanding sub-task(s)",
            common.job_id,
            phase,
            common.outstanding.len()
        )));
    }
    Ok(())
}
