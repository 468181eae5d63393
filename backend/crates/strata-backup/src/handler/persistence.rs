use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use strata_commons::serialization::{decode, encode};
use strata_commons::JobId;

use super::BackupHandler;
use crate::error::{BackupError, Result};
use crate::jobs::{now_millis, Job, JobStateMachine};
use crate::journal::{BackupImage, ImageBlockKind, JournalEntry, JournalRecord, IMAGE_VERSION};

/// Outcome of [`BackupHandler::recover`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Jobs loaded from the image
    pub restored: Vec<JobId>,
    /// Journal records applied on top of the image
    pub replayed: usize,
    /// Finished jobs already past the retention window
    pub skipped_expired: Vec<JobId>,
    /// Records or jobs that could not be reconciled, with the reason
    pub dropped: Vec<(String, String)>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.restored.is_empty()
            && self.replayed == 0
            && self.skipped_expired.is_empty()
            && self.dropped.is_empty()
    }
}

impl BackupHandler {
    /// Append one journal record and return its sequence number.
    pub(super) fn append_entry(&self, entry: JournalEntry) -> Result<u64> {
        let seq = self.journal_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let bytes = encode(&JournalRecord { seq, entry })?;
        self.journal.append_record(&bytes)?;
        Ok(seq)
    }

    /// Journal the current state of a job after a phase change. A failed
    /// append is logged; the next change of the same job writes it again.
    pub(super) fn journal_job(&self, job: &Job) {
        if let Err(e) = self.append_entry(JournalEntry::UpsertJob(job.clone())) {
            job.common()
                .log_error(&format!("Failed to journal state {}: {}", job.phase_name(), e));
        }
    }

    /// Write the repository registry, every job and the parked materialized
    /// views as one image block, then drop the journal records it covers.
    ///
    /// The sequence number is read before the jobs are copied: a job change
    /// is applied before it is journaled, so anything at or below that number
    /// is already visible in the copy.
    pub fn save_image(&self) -> Result<u64> {
        let image = {
            let _seq = self.lock_seq()?;
            let last_journal_seq = self.journal_seq.load(Ordering::SeqCst);
            let mut jobs: Vec<Job> = self
                .job_slots()
                .into_iter()
                .map(|(_, slot)| slot.lock().clone())
                .collect();
            jobs.sort_by_key(|job| job.job_id());
            BackupImage {
                version: IMAGE_VERSION,
                last_journal_seq,
                next_id: self.ctx.ids.peek(),
                repositories: self.ctx.repositories.descriptors(),
                jobs,
                mv_waiters: self.ctx.mv_restore.waiters(),
            }
        };

        let bytes = encode(&image)?;
        self.journal
            .write_image_block(ImageBlockKind::BackupManager, &bytes)?;
        log::info!(
            "Saved backup image: {} job(s), {} repositor(ies), journal seq {}",
            image.jobs.len(),
            image.repositories.len(),
            image.last_journal_seq
        );

        if let Err(e) = self.compact_journal(image.last_journal_seq) {
            log::warn!(
                "Failed to drop journal records covered by image at seq {}: {}",
                image.last_journal_seq,
                e
            );
        }
        Ok(image.last_journal_seq)
    }

    /// Remove records with `seq <= through`. Records that no longer decode
    /// go too; recovery would only drop them again.
    pub fn compact_journal(&self, through: u64) -> Result<usize> {
        let dropped = self.journal.retain_records(&mut |bytes: &[u8]| {
            decode::<RecordSeq>(bytes)
                .map(|record| record.seq > through)
                .unwrap_or(false)
        })?;
        if dropped > 0 {
            log::debug!("Dropped {} journal record(s) up to seq {}", dropped, through);
        }
        Ok(dropped)
    }

    /// Rebuild the job table and repository registry from the last image and
    /// the journal records written after it.
    pub fn recover(&self) -> Result<RecoveryReport> {
        self.recover_at(now_millis())
    }

    pub fn recover_at(&self, now_ms: i64) -> Result<RecoveryReport> {
        let _seq = self.lock_seq()?;
        let mut report = RecoveryReport::default();
        self.jobs.clear();

        let mut last_seq = 0;
        if let Some(bytes) = self.journal.read_image_block(ImageBlockKind::BackupManager)? {
            let image: BackupImage = decode(&bytes)?;
            if image.version > IMAGE_VERSION {
                return Err(BackupError::recovery(format!(
                    "backup image version {} is newer than supported version {}",
                    image.version, IMAGE_VERSION
                )));
            }
            last_seq = image.last_journal_seq;
            self.ctx.ids.advance_to(image.next_id);
            for desc in &image.repositories {
                self.ctx.ids.observe(desc.id.as_i64());
            }
            self.ctx.repositories.restore(image.repositories);
            self.ctx.mv_restore.restore(image.mv_waiters);
            for mut job in image.jobs {
                let job_id = job.job_id();
                match job.replay_run(&self.ctx) {
                    Ok(()) => {
                        self.observe_ids(&job);
                        self.jobs.insert(job.target(), Arc::new(Mutex::new(job)));
                        report.restored.push(job_id);
                    }
                    Err(e) => {
                        log::error!("[{}] Dropping job from image: {}", job_id, e);
                        report.dropped.push((format!("job {}", job_id), e.to_string()));
                    }
                }
            }
        }

        let mut max_seq = last_seq;
        for (index, bytes) in self.journal.read_records()?.into_iter().enumerate() {
            let record: JournalRecord = match decode(&bytes) {
                Ok(record) => record,
                Err(e) => {
                    log::error!("Skipping undecodable journal record #{}: {}", index, e);
                    report
                        .dropped
                        .push((format!("record #{}", index), e.to_string()));
                    continue;
                }
            };
            max_seq = max_seq.max(record.seq);
            self.observe_entry_ids(&record.entry);
            if record.seq <= last_seq {
                continue;
            }
            match self.replay_entry(record.entry) {
                Ok(true) => report.replayed += 1,
                Ok(false) => {}
                Err(e) => {
                    log::error!("Dropping journal record {}: {}", record.seq, e);
                    report.dropped.push((format!("record {}", record.seq), e.to_string()));
                }
            }
        }
        self.journal_seq.store(max_seq, Ordering::SeqCst);

        let keep_ms = self.retention_ms();
        self.ctx
            .mv_restore
            .expire_parked_before(now_ms.saturating_sub(keep_ms));
        for (target, slot) in self.job_slots() {
            let expired = {
                let job = slot.lock();
                job_expired(&job, now_ms, keep_ms).then(|| job.job_id())
            };
            if let Some(job_id) = expired {
                self.jobs.remove(&target);
                self.ctx.mv_restore.discard_job(job_id);
                report.skipped_expired.push(job_id);
            }
        }

        log::info!(
            "Backup recovery finished: {} from image, {} record(s) replayed, {} expired, {} dropped",
            report.restored.len(),
            report.replayed,
            report.skipped_expired.len(),
            report.dropped.len()
        );
        Ok(report)
    }

    /// Apply one journal entry. Returns `false` if it was already reflected.
    fn replay_entry(&self, entry: JournalEntry) -> Result<bool> {
        match entry {
            JournalEntry::UpsertJob(job) => self.replay_add_job(job),
            JournalEntry::CreateRepository(desc) => {
                if self.ctx.repositories.contains(&desc.name) {
                    return Ok(false);
                }
                self.ctx.repositories.add(desc)?;
                Ok(true)
            }
            JournalEntry::DropRepository(name) => {
                Ok(self.ctx.repositories.remove(&name).is_some())
            }
        }
    }

    /// A cancelled record cancels the job already in the table; any other
    /// non-pending record must follow a live version of the same job. The
    /// record then replaces the table entry.
    fn replay_add_job(&self, mut job: Job) -> Result<bool> {
        let target = job.target();
        let existing = self.slot(&target);

        if let Some(slot) = &existing {
            if *slot.lock() == job {
                return Ok(false);
            }
        }

        if job.is_cancelled() || !job.is_pending() {
            let slot = existing.ok_or_else(|| {
                BackupError::recovery(format!(
                    "{} record of job {} has no admitted job on {}",
                    job.phase_name(),
                    job.job_id(),
                    target
                ))
            })?;
            let mut current = slot.lock();
            if current.is_done() || current.job_id() != job.job_id() {
                return Err(BackupError::recovery(format!(
                    "invalid existing job {} ({}) for replayed job {} ({})",
                    current.job_id(),
                    current.phase_name(),
                    job.job_id(),
                    job.phase_name()
                )));
            }
            if job.is_cancelled() {
                current.replay_cancel(&self.ctx)?;
            }
        }

        job.replay_run(&self.ctx)?;
        self.observe_ids(&job);
        self.jobs.insert(target, Arc::new(Mutex::new(job)));
        Ok(true)
    }

    /// Ids in a record are burned even if the record is skipped or dropped.
    fn observe_entry_ids(&self, entry: &JournalEntry) {
        match entry {
            JournalEntry::UpsertJob(job) => self.observe_ids(job),
            JournalEntry::CreateRepository(desc) => self.ctx.ids.observe(desc.id.as_i64()),
            JournalEntry::DropRepository(_) => {}
        }
    }

    fn observe_ids(&self, job: &Job) {
        let common = job.common();
        self.ctx.ids.observe(common.job_id.as_i64());
        if let Some(task_id) = common.max_task_id() {
            self.ctx.ids.observe(task_id.as_i64());
        }
    }

    pub(super) fn retention_ms(&self) -> i64 {
        (self.settings.history_job_keep_max_secs as i64).saturating_mul(1000)
    }
}

/// Leading field of an encoded [`JournalRecord`].
#[derive(Deserialize)]
struct RecordSeq {
    seq: u64,
}

/// Done and finished longer ago than the retention window.
pub(super) fn job_expired(job: &Job, now_ms: i64, keep_ms: i64) -> bool {
    job.is_done()
        && job
            .common()
            .finished_at
            .map(|finished| now_ms - finished > keep_ms)
            .unwrap_or(false)
}
