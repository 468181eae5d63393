use strata_commons::{JobType, RepoId, TargetKey};

use super::BackupHandler;
use crate::error::{BackupError, Result, SnapshotDropFailure};
use crate::jobs::{JobStateMachine, JobSummary};
use crate::journal::JournalEntry;
use crate::repository::RepositoryDesc;
use crate::request::{DropSnapshotRequest, SnapshotSelector};

impl BackupHandler {
    /// Cancel the running job on `target` if it is of `expected` kind.
    pub fn cancel_job(&self, target: TargetKey, expected: JobType) -> Result<()> {
        let _seq = self.lock_seq()?;
        let not_running =
            || BackupError::not_found(format!("No {} job is currently running on {}", expected, target));

        let slot = self.slot(&target).ok_or_else(not_running)?;
        let mut job = slot.lock();
        if job.job_type() != expected {
            return Err(not_running());
        }
        job.cancel(&self.ctx)?;
        self.journal_job(&job);
        Ok(())
    }

    pub fn get_job(&self, target: TargetKey) -> Option<JobSummary> {
        self.slot(&target).map(|slot| slot.lock().summary())
    }

    /// Summaries of every job in the table, ordered by job id.
    pub fn list_jobs(&self) -> Vec<JobSummary> {
        let mut summaries: Vec<JobSummary> = self
            .job_slots()
            .into_iter()
            .map(|(_, slot)| slot.lock().summary())
            .collect();
        summaries.sort_by_key(|s| s.job_id);
        summaries
    }

    pub fn running_job_count(&self) -> usize {
        self.job_slots()
            .into_iter()
            .filter(|(_, slot)| !slot.lock().is_done())
            .count()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn create_repository(&self, name: &str, location: &str, read_only: bool) -> Result<RepoId> {
        if name.trim().is_empty() {
            return Err(BackupError::validation("Repository name must not be empty"));
        }
        let _seq = self.lock_seq()?;
        if self.ctx.repositories.contains(name) {
            return Err(BackupError::conflict(format!("Repository {} already exists", name)));
        }
        let desc = RepositoryDesc {
            id: RepoId::new(self.ctx.ids.next()),
            name: name.to_string(),
            location: location.to_string(),
            read_only,
        };
        let id = desc.id;
        self.ctx.repositories.add(desc.clone())?;
        if let Err(e) = self.append_entry(JournalEntry::CreateRepository(desc)) {
            self.ctx.repositories.remove(name);
            return Err(e);
        }
        Ok(id)
    }

    /// Rejected while a non-terminal job still uses the repository.
    pub fn drop_repository(&self, name: &str) -> Result<()> {
        let _seq = self.lock_seq()?;
        let repo = self.ctx.repositories.resolve(name)?;
        let repo_id = repo.desc().id;
        let in_use = self.job_slots().into_iter().any(|(_, slot)| {
            let job = slot.lock();
            !job.is_done() && job.repo_id() == repo_id
        });
        if in_use {
            return Err(BackupError::conflict(format!(
                "Backup or restore job is running on repository {}",
                name
            )));
        }
        self.append_entry(JournalEntry::DropRepository(name.to_string()))?;
        self.ctx.repositories.remove(name);
        log::info!("Dropped repository {}", name);
        Ok(())
    }

    /// Delete snapshots from a repository. Returns how many were removed.
    ///
    /// Every named snapshot is attempted; failures are collected and reported
    /// together without undoing the deletions that succeeded.
    pub fn drop_snapshot(&self, request: DropSnapshotRequest) -> Result<usize> {
        let repo = self.ctx.repositories.resolve(&request.repo_name)?;
        if repo.is_read_only() {
            return Err(BackupError::conflict(format!(
                "Repository {} is read only",
                request.repo_name
            )));
        }
        let _seq = self.lock_seq()?;

        let labels = match request.selector {
            SnapshotSelector::Timestamp { op, ts } => {
                let deleted = repo.delete_snapshots_by_timestamp(op, ts)?;
                log::info!(
                    "Dropped {} snapshot(s) with timestamp {} {} from repository {}",
                    deleted,
                    op,
                    ts,
                    request.repo_name
                );
                return Ok(deleted);
            }
            SnapshotSelector::Name(label) => vec![label],
            SnapshotSelector::Names(labels) => labels,
        };

        let total = labels.len();
        let mut failures = Vec::new();
        for label in labels {
            if let Err(e) = repo.delete_snapshot(&label) {
                log::warn!(
                    "Failed to drop snapshot {} from repository {}: {}",
                    label,
                    request.repo_name,
                    e
                );
                failures.push(SnapshotDropFailure {
                    label,
                    message: e.to_string(),
                });
            }
        }
        if failures.is_empty() {
            Ok(total)
        } else {
            Err(BackupError::DropSnapshot { failures, total })
        }
    }
}
