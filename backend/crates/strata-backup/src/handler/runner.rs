use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::persistence::job_expired;
use super::BackupHandler;
use crate::jobs::{now_millis, JobStateMachine};

impl BackupHandler {
    /// Advance every active job once. Returns how many jobs changed phase.
    pub fn drive_all(&self) -> usize {
        self.drive_all_at(now_millis())
    }

    pub fn drive_all_at(&self, now_ms: i64) -> usize {
        let mut changed = 0;
        for (_, slot) in self.job_slots() {
            let mut job = slot.lock();
            if job.is_done() {
                continue;
            }
            let before = job.observed_state();
            job.run_at(&self.ctx, now_ms);
            if job.observed_state() != before {
                job.common().log_debug(&format!("{} -> {}", before.0, job.phase_name()));
                self.journal_job(&job);
                changed += 1;
            }
        }
        changed
    }

    /// Drop terminal jobs older than the retention window. Skipped when the
    /// sequencing lock is busy; the next tick tries again.
    pub fn expire_finished(&self) -> usize {
        self.expire_finished_at(now_millis())
    }

    pub fn expire_finished_at(&self, now_ms: i64) -> usize {
        let _seq = match self.lock_seq() {
            Ok(guard) => guard,
            Err(_) => {
                log::debug!("Sequencing lock busy, skipping expiry of finished jobs");
                return 0;
            }
        };

        let keep_ms = self.retention_ms();
        let mut removed = 0;
        for (target, slot) in self.job_slots() {
            let expired = {
                let job = slot.lock();
                job_expired(&job, now_ms, keep_ms).then(|| job.job_id())
            };
            if let Some(job_id) = expired {
                self.jobs.remove(&target);
                let released = self.ctx.mv_restore.discard_job(job_id);
                log::info!(
                    "[{}] Removed expired job on {} ({} parked view(s) released)",
                    job_id,
                    target,
                    released
                );
                removed += 1;
            }
        }

        let stale_views = self
            .ctx
            .mv_restore
            .expire_parked_before(now_ms.saturating_sub(keep_ms));
        if stale_views > 0 {
            log::info!("Released {} materialized view(s) parked past the retention window", stale_views);
        }
        removed
    }

    /// Ask the background loop to stop after its current tick.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Periodic driver: advances jobs, expires old ones and writes an image
    /// every `image_interval_secs`.
    pub async fn run_loop(self: Arc<Self>) {
        let period = Duration::from_millis(self.settings.driver_interval_ms.max(1));
        let image_every = Duration::from_secs(self.settings.image_interval_secs);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_image = Instant::now();

        log::info!(
            "Backup driver started (interval {} ms, retention {} s)",
            self.settings.driver_interval_ms,
            self.settings.history_job_keep_max_secs
        );
        loop {
            ticker.tick().await;
            if self.is_shutdown() {
                break;
            }

            let changed = self.drive_all();
            let expired = self.expire_finished();
            if changed > 0 || expired > 0 {
                log::debug!("Driver tick: {} job(s) advanced, {} expired", changed, expired);
            }

            if !image_every.is_zero() && last_image.elapsed() >= image_every {
                match self.save_image() {
                    Ok(_) => last_image = Instant::now(),
                    Err(e) => log::error!("Failed to save backup image: {}", e),
                }
            }
        }
        log::info!("Backup driver stopped");
    }
}
