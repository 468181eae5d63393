// Error types for backup/restore orchestration
use strata_commons::CommonError;
use thiserror::Error;

/// A single failed item of a multi-snapshot drop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotDropFailure {
    pub label: String,
    pub message: String,
}

/// Main error type for the backup control plane.
///
/// Validation, not-found, conflict and concurrency errors are returned
/// synchronously to the submitting caller. Timeouts and sub-task failures are
/// recorded on the job itself (see [`crate::jobs::JobFailure`]) and only show
/// up through status queries.
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("{0}")]
    Concurrency(String),

    #[error("Job timed out: {0}")]
    Timeout(String),

    #[error("Sub-task failed: {0}")]
    SubTaskFailure(String),

    #[error("Recovery error: {0}")]
    Recovery(String),

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Failed to drop {} out of {} snapshots", .failures.len(), .total)]
    DropSnapshot {
        failures: Vec<SnapshotDropFailure>,
        total: usize,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl BackupError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn repository(msg: impl Into<String>) -> Self {
        Self::Repository(msg.into())
    }

    pub fn catalog(msg: impl Into<String>) -> Self {
        Self::Catalog(msg.into())
    }

    pub fn recovery(msg: impl Into<String>) -> Self {
        Self::Recovery(msg.into())
    }

    /// Only a missed sequencing lock is worth retrying verbatim.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackupError::Concurrency(_))
    }
}

impl From<CommonError> for BackupError {
    fn from(err: CommonError) -> Self {
        match err {
            CommonError::Serialization(msg) => BackupError::Serialization(msg),
        }
    }
}

impl From<serde_json::Error> for BackupError {
    fn from(err: serde_json::Error) -> Self {
        BackupError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

/// Attach context to foreign errors while converting them.
pub trait ResultExt<T> {
    fn into_backup_error(self, context: &str) -> Result<T>;
}

impl<T, E: std::fmt::Display> ResultExt<T> for std::result::Result<T, E> {
    fn into_backup_error(self, context: &str) -> Result<T> {
        self.map_err(|e| BackupError::Other(format!("{}: {}", context, e)))
    }
}
