//! Re-linking restored materialized views to their base tables.
//!
//! A materialized view restored before its base tables stays inactive. It is
//! parked here until a later restore brings back the missing bases, at which
//! point it is reactivated. Entries are released when the restore job that
//! parked them is cancelled or expires, or once they have waited longer than
//! the job retention window. The waiting set is part of the backup image.

use std::collections::BTreeSet;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use strata_commons::{DbId, JobId};

use crate::context::Catalog;

/// A restored materialized view waiting for base tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MvWaiter {
    pub job_id: JobId,
    pub db_id: DbId,
    pub mv_name: String,
    pub missing_bases: BTreeSet<String>,
    pub parked_at: i64,
}

#[derive(Debug, Default)]
pub struct MvRestoreContext {
    waiting: DashMap<(DbId, String), MvWaiter>,
}

impl MvRestoreContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `waiter`. Registering the same view twice keeps the first entry.
    pub fn register(&self, waiter: MvWaiter) {
        self.waiting
            .entry((waiter.db_id, waiter.mv_name.clone()))
            .or_insert(waiter);
    }

    /// Re-park waiters recovered from a persisted restore job.
    pub fn add_from_job(&self, waiters: &[MvWaiter]) {
        for waiter in waiters {
            self.register(waiter.clone());
        }
    }

    /// Every parked view, ordered by database and name.
    pub fn waiters(&self) -> Vec<MvWaiter> {
        let mut waiters: Vec<MvWaiter> = self.waiting.iter().map(|e| e.value().clone()).collect();
        waiters.sort_by(|a, b| (a.db_id, &a.mv_name).cmp(&(b.db_id, &b.mv_name)));
        waiters
    }

    /// Replace the waiting set with `waiters` loaded from an image.
    pub fn restore(&self, waiters: Vec<MvWaiter>) {
        self.waiting.clear();
        for waiter in waiters {
            self.register(waiter);
        }
    }

    fn take_resolved(&self, db: DbId, tables: &[String]) -> Vec<(DbId, String)> {
        let mut ready = Vec::new();
        for mut entry in self.waiting.iter_mut() {
            if entry.db_id != db {
                continue;
            }
            for table in tables {
                entry.missing_bases.remove(table);
            }
            if entry.missing_bases.is_empty() {
                ready.push(entry.key().clone());
            }
        }
        ready
    }

    /// Replay counterpart of [`MvRestoreContext::on_tables_restored`]: drops
    /// views whose bases are now all restored without touching the catalog,
    /// which already saw the activation before the restart.
    pub fn settle_restored(&self, db: DbId, tables: &[String]) -> usize {
        let ready = self.take_resolved(db, tables);
        for key in &ready {
            self.waiting.remove(key);
        }
        ready.len()
    }

    /// `tables` just became available in `db`. Activates every parked view
    /// whose last missing base is among them and returns their names.
    pub fn on_tables_restored(&self, catalog: &dyn Catalog, db: DbId, tables: &[String]) -> Vec<String> {
        let ready = self.take_resolved(db, tables);
        let mut activated = Vec::with_capacity(ready.len());
        for key in ready {
            if let Some((_, waiter)) = self.waiting.remove(&key) {
                match catalog.set_mv_state(db, &waiter.mv_name, true, None) {
                    Ok(()) => {
                        log::info!(
                            "[{}] Reactivated materialized view {} after base tables were restored",
                            waiter.job_id,
                            waiter.mv_name
                        );
                        activated.push(waiter.mv_name);
                    }
                    Err(e) => log::warn!(
                        "[{}] Failed to reactivate materialized view {}: {}",
                        waiter.job_id,
                        waiter.mv_name,
                        e
                    ),
                }
            }
        }
        activated
    }

    /// Release everything parked by `job_id`.
    pub fn discard_job(&self, job_id: JobId) -> usize {
        let before = self.waiting.len();
        self.waiting.retain(|_, waiter| waiter.job_id != job_id);
        before - self.waiting.len()
    }

    /// Release views parked at or before `cutoff_ms`.
    pub fn expire_parked_before(&self, cutoff_ms: i64) -> usize {
        let before = self.waiting.len();
        self.waiting.retain(|_, waiter| {
            let keep = waiter.parked_at > cutoff_ms;
            if !keep {
                log::info!(
                    "[{}] Giving up on materialized view {}, still missing {:?}",
                    waiter.job_id,
                    waiter.mv_name,
                    waiter.missing_bases
                );
            }
            keep
        });
        before - self.waiting.len()
    }

    pub fn pending_count(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_waiting(&self, db: DbId, mv_name: &str) -> bool {
        self.waiting.contains_key(&(db, mv_name.to_string()))
    }
}
