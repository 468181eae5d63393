//! Durable edit log and image blocks.
//!
//! Every admitted job and every observed phase change is appended as a
//! [`JournalRecord`]. A periodic [`BackupImage`] captures the whole job table
//! plus the repository registry together with the last sequence number it
//! covers, so recovery only replays records written after the image.

mod file;

pub use file::FileJournal;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::jobs::Job;
use crate::mv_restore::MvWaiter;
use crate::repository::RepositoryDesc;

/// Image format written by this version.
pub const IMAGE_VERSION: u32 = 1;

/// Image sections; the backup orchestrator owns a single one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageBlockKind {
    BackupManager,
}

impl ImageBlockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageBlockKind::BackupManager => "backup-manager",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JournalEntry {
    /// Full state of a job after admission or a phase change.
    UpsertJob(Job),
    CreateRepository(RepositoryDesc),
    DropRepository(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub seq: u64,
    pub entry: JournalEntry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupImage {
    pub version: u32,
    /// Records with `seq <= last_journal_seq` are already reflected here.
    pub last_journal_seq: u64,
    /// First id the generator may hand out after recovery.
    pub next_id: i64,
    pub repositories: Vec<RepositoryDesc>,
    pub jobs: Vec<Job>,
    /// Materialized views still waiting for base tables.
    pub mv_waiters: Vec<MvWaiter>,
}

/// Storage for the edit log and image blocks.
pub trait Journal: Send + Sync {
    /// Append one encoded record. Must be durable when this returns.
    fn append_record(&self, bytes: &[u8]) -> Result<()>;

    /// All records in append order.
    fn read_records(&self) -> Result<Vec<Vec<u8>>>;

    /// Drop every record for which `keep` returns false and return how many
    /// were dropped. Appends wait until the rewrite is done.
    fn retain_records(&self, keep: &mut dyn FnMut(&[u8]) -> bool) -> Result<usize>;

    /// Atomically replace the image block `kind`.
    fn write_image_block(&self, kind: ImageBlockKind, bytes: &[u8]) -> Result<()>;

    fn read_image_block(&self, kind: ImageBlockKind) -> Result<Option<Vec<u8>>>;
}

/// In-memory journal for tests and embedded use.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    records: Mutex<Vec<Vec<u8>>>,
    image: Mutex<Option<Vec<u8>>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().len()
    }

    pub fn has_image(&self) -> bool {
        self.image.lock().is_some()
    }
}

impl Journal for MemoryJournal {
    fn append_record(&self, bytes: &[u8]) -> Result<()> {
        self.records.lock().push(bytes.to_vec());
        Ok(())
    }

    fn read_records(&self) -> Result<Vec<Vec<u8>>> {
        Ok(self.records.lock().clone())
    }

    fn retain_records(&self, keep: &mut dyn FnMut(&[u8]) -> bool) -> Result<usize> {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|bytes| keep(bytes.as_slice()));
        Ok(before - records.len())
    }

    fn write_image_block(&self, _kind: ImageBlockKind, bytes: &[u8]) -> Result<()> {
        *self.image.lock() = Some(bytes.to_vec());
        Ok(())
    }

    fn read_image_block(&self, _kind: ImageBlockKind) -> Result<Option<Vec<u8>>> {
        Ok(self.image.lock().clone())
    }
}
