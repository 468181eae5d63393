//! External snapshot repositories.
//!
//! The storage client behind a repository is not part of this crate. The core
//! only talks to it through [`Repository`], and gets handles for registered
//! repositories from the [`RepositoryRegistry`].

mod registry;

pub use registry::RepositoryRegistry;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strata_commons::RepoId;

use crate::error::Result;
use crate::manifest::BackupJobInfo;
use crate::meta::BackupMeta;

/// Persisted description of a registered repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryDesc {
    pub id: RepoId,
    pub name: String,
    pub location: String,
    pub read_only: bool,
}

/// Comparison used when dropping snapshots by backup timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimestampOp {
    Lt,
    Le,
    Eq,
    Ge,
    Gt,
}

impl TimestampOp {
    /// `snapshot_ts <op> ts`
    pub fn matches(&self, snapshot_ts: i64, ts: i64) -> bool {
        match self {
            TimestampOp::Lt => snapshot_ts < ts,
            TimestampOp::Le => snapshot_ts <= ts,
            TimestampOp::Eq => snapshot_ts == ts,
            TimestampOp::Ge => snapshot_ts >= ts,
            TimestampOp::Gt => snapshot_ts > ts,
        }
    }
}

impl fmt::Display for TimestampOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimestampOp::Lt => "<",
            TimestampOp::Le => "<=",
            TimestampOp::Eq => "=",
            TimestampOp::Ge => ">=",
            TimestampOp::Gt => ">",
        };
        f.write_str(s)
    }
}

/// Handle on one external repository.
///
/// Implementations are shared across jobs running on different targets and
/// must be safe to call concurrently.
pub trait Repository: Send + Sync {
    fn desc(&self) -> &RepositoryDesc;

    fn is_read_only(&self) -> bool {
        self.desc().read_only
    }

    /// Labels of all snapshots in the repository.
    fn list_snapshots(&self) -> Result<Vec<String>>;

    /// Manifest of the snapshot `label` taken at `backup_time`.
    fn get_snapshot_info(&self, label: &str, backup_time: i64) -> Result<BackupJobInfo>;

    /// Meta of the snapshot described by `info`, decoded with `meta_version`.
    fn get_snapshot_meta(&self, info: &BackupJobInfo, meta_version: u32) -> Result<BackupMeta>;

    /// Write meta and manifest of a finished backup.
    fn save_snapshot(&self, info: &BackupJobInfo, meta: &BackupMeta) -> Result<()>;

    fn delete_snapshot(&self, label: &str) -> Result<()>;

    /// Delete every snapshot whose backup timestamp satisfies `op`; returns
    /// how many were removed.
    fn delete_snapshots_by_timestamp(&self, op: TimestampOp, ts: i64) -> Result<usize>;
}

/// Opens repository handles from descriptors, both at creation time and when
/// the registry is rebuilt during recovery.
pub trait RepositoryConnector: Send + Sync {
    fn connect(&self, desc: &RepositoryDesc) -> Result<Arc<dyn Repository>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_op_matches() {
        assert!(TimestampOp::Lt.matches(1, 2));
        assert!(!TimestampOp::Lt.matches(2, 2));
        assert!(TimestampOp::Le.matches(2, 2));
        assert!(TimestampOp::Eq.matches(5, 5));
        assert!(TimestampOp::Ge.matches(6, 5));
        assert!(!TimestampOp::Gt.matches(5, 5));
        assert_eq!(TimestampOp::Ge.to_string(), ">=");
    }
}
