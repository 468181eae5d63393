use strata_commons::{JobId, TaskId, TaskKind};

use super::BackupHandler;
use crate::jobs::{Job, JobStateMachine};
use crate::tasks::{CompletionOutcome, TaskCompletion};

impl BackupHandler {
    /// Forward a worker completion to the job that issued the task.
    ///
    /// Completions for a missing job, a job of the other kind, a superseded
    /// job or a task the job no longer expects are logged and discarded; the
    /// worker treats them as handled either way.
    pub fn route_completion(&self, completion: TaskCompletion) -> CompletionOutcome {
        let Some(slot) = self.slot(&completion.target) else {
            log::warn!(
                "Discarding {} completion of task {}: no job on {}",
                completion.kind,
                completion.task_id,
                completion.target
            );
            return CompletionOutcome::Discarded;
        };

        let mut job = slot.lock();
        if job.job_type() != completion.kind.owner() {
            log::warn!(
                "Discarding {} completion of task {}: job {} on {} is a {} job",
                completion.kind,
                completion.task_id,
                job.job_id(),
                completion.target,
                job.job_type()
            );
            return CompletionOutcome::Discarded;
        }
        if job.job_id() != completion.job_id || job.is_done() {
            log::info!(
                "Discarding stale {} completion of task {} for job {} (current job {} in {})",
                completion.kind,
                completion.task_id,
                completion.job_id,
                job.job_id(),
                job.phase_name()
            );
            return CompletionOutcome::Discarded;
        }

        let before = job.observed_state();
        let accepted = match (&mut *job, completion.kind) {
            (Job::Backup(backup), TaskKind::Snapshot) => {
                backup.finish_tablet_snapshot_task(&self.ctx, &completion)
            }
            (Job::Backup(backup), TaskKind::Upload) => {
                backup.finish_snapshot_upload_task(&self.ctx, &completion)
            }
            (Job::Restore(restore), TaskKind::Download) => {
                restore.finish_tablet_download_task(&self.ctx, &completion)
            }
            (Job::Restore(restore), TaskKind::DirMove) => {
                restore.finish_dir_move_task(&self.ctx, &completion)
            }
            _ => false,
        };

        if !accepted {
            job.common().log_info(&format!(
                "Discarding {} completion of task {} in state {}",
                completion.kind,
                completion.task_id,
                job.phase_name()
            ));
            return CompletionOutcome::Discarded;
        }
        if job.observed_state() != before {
            self.journal_job(&job);
        }
        CompletionOutcome::Accepted
    }

    /// Record progress of an upload (backup) or download (restore) task.
    /// Returns whether a job accepted it.
    pub fn report_progress(
        &self,
        kind: TaskKind,
        job_id: JobId,
        task_id: TaskId,
        finished: u32,
        total: u32,
    ) -> bool {
        for (_, slot) in self.job_slots() {
            let mut job = slot.lock();
            if job.job_id() != job_id {
                continue;
            }
            return match (&mut *job, kind) {
                (Job::Backup(backup), TaskKind::Upload) => {
                    backup.update_upload_progress(task_id, finished, total)
                }
                (Job::Restore(restore), TaskKind::Download) => {
                    restore.update_download_progress(task_id, finished, total)
                }
                _ => false,
            };
        }
        log::debug!("No job {} for {} progress of task {}", job_id, kind, task_id);
        false
    }
}
