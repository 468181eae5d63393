//! # strata-backup
//!
//! Backup/restore orchestration core of the Strata metadata control plane.
//!
//! ## Architecture
//!
//! ```text
//! BackupHandler
//! ├── RepositoryRegistry   (named external repositories)
//! ├── active-job table     (TargetKey -> Job, one non-terminal job per key)
//! ├── sequencing lock      (submit / cancel / drop / expire)
//! ├── ClusterContext       (catalog, task dispatch, ids, mv-restore bookkeeping)
//! └── Journal              (edit log records + periodic image)
//! ```
//!
//! ### Job lifecycle
//! ```text
//! Backup:  Pending → Snapshotting → Uploading → SavingMeta → Finished
//! Restore: Pending → Downloading  → DirMove   → Finished
//!                 ↓ (timeout / sub-task failure / cancel)
//!              Cancelled
//! ```
//!
//! The periodic driver calls [`BackupHandler::drive_all`]; worker completions
//! arrive through [`BackupHandler::route_completion`]. Every observed phase
//! change is journaled, and [`BackupHandler::recover`] rebuilds the job table
//! from the last image plus the journal records written after it.

pub mod context;
pub mod error;
pub mod jobs;
pub mod journal;
pub mod manifest;
pub mod meta;
pub mod mv_restore;
pub mod repository;
pub mod request;
pub mod tasks;
pub mod test_utils;

mod handler;

pub use context::{Catalog, ClusterContext, DatabaseInfo, IdGenerator, JobSettings, TaskDispatcher};
pub use error::{BackupError, Result};
pub use handler::{BackupHandler, RecoveryReport};
pub use jobs::{
    BackupJob, BackupJobState, Job, JobFailure, JobFailureKind, JobStateMachine, JobSummary,
    RestoreJob, RestoreJobState,
};
pub use journal::{FileJournal, Journal, JournalEntry};
pub use manifest::{BackupJobInfo, BackupPartitionInfo, BackupTableInfo, BackupTabletInfo};
pub use meta::{BackupMeta, CatalogMeta, ColumnMeta, FunctionMeta, PartitionMeta, TableMeta, TabletMeta};
pub use mv_restore::MvRestoreContext;
pub use repository::{Repository, RepositoryConnector, RepositoryDesc, RepositoryRegistry, TimestampOp};
pub use request::{
    BackupRequest, BackupType, DropSnapshotRequest, RestoreRequest, RestoreSelection,
    SnapshotSelector,
};
pub use tasks::{CompletionOutcome, CompletionPayload, TaskCompletion, TaskPayload, TaskRequest, TaskStatus};
