//! BackupHandler - single entry point of the backup control plane.
//!
//! Split the same way as the jobs manager it grew out of:
//! - `submit.rs`: admission of backup and restore jobs
//! - `restore_filter.rs`: narrowing a snapshot to the requested objects
//! - `completion.rs`: routing worker completions and progress to jobs
//! - `runner.rs`: periodic driving, expiry and the background loop
//! - `persistence.rs`: journal records, image and recovery
//! - `admin.rs`: cancel, queries, repository and snapshot management

mod admin;
mod completion;
mod persistence;
mod restore_filter;
mod runner;
mod submit;

#[cfg(test)]
mod tests;

pub use persistence::RecoveryReport;

use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use strata_commons::TargetKey;
use strata_configs::BackupSettings;

use crate::context::ClusterContext;
use crate::error::{BackupError, Result};
use crate::jobs::Job;
use crate::journal::Journal;

/// Active-job table entry. Each job has its own short-held lock.
pub(crate) type JobSlot = Arc<Mutex<Job>>;

pub struct BackupHandler {
    /// At most one non-terminal job per target key.
    jobs: DashMap<TargetKey, JobSlot>,
    /// Serializes submission, cancellation, repository/snapshot drops and
    /// expiry.
    seq_lock: Mutex<()>,
    ctx: ClusterContext,
    journal: Arc<dyn Journal>,
    journal_seq: AtomicU64,
    settings: BackupSettings,
    shutdown: AtomicBool,
}

impl BackupHandler {
    pub fn new(ctx: ClusterContext, journal: Arc<dyn Journal>, settings: BackupSettings) -> Self {
        Self {
            jobs: DashMap::new(),
            seq_lock: Mutex::new(()),
            ctx,
            journal,
            journal_seq: AtomicU64::new(0),
            settings,
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn context(&self) -> &ClusterContext {
        &self.ctx
    }

    pub fn settings(&self) -> &BackupSettings {
        &self.settings
    }

    /// Acquire the sequencing lock with a bounded wait.
    fn lock_seq(&self) -> Result<MutexGuard<'_, ()>> {
        self.seq_lock
            .try_lock_for(Duration::from_millis(self.settings.seq_lock_timeout_ms))
            .ok_or_else(|| {
                BackupError::Concurrency(
                    "Another backup or restore job is being submitted. Please wait and try again"
                        .to_string(),
                )
            })
    }

    /// Snapshot of the active-job table so no map shard stays locked while a
    /// job is worked on.
    fn job_slots(&self) -> Vec<(TargetKey, JobSlot)> {
        self.jobs
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect()
    }

    fn slot(&self, target: &TargetKey) -> Option<JobSlot> {
        self.jobs.get(target).map(|entry| Arc::clone(entry.value()))
    }
}
