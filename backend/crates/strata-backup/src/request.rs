//! Already-parsed backup, restore and drop-snapshot requests.

use serde::{Deserialize, Serialize};
use strata_commons::{CatalogRef, FunctionRef, TableRef};

use crate::repository::TimestampOp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupType {
    Full,
    Incremental,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRequest {
    pub repo_name: String,
    pub label: String,
    /// `None` for a backup of external catalogs only.
    pub db_name: Option<String>,
    /// Empty means every table of the database.
    pub tables: Vec<TableRef>,
    pub functions: Vec<FunctionRef>,
    pub catalogs: Vec<CatalogRef>,
    pub backup_type: BackupType,
    pub timeout_ms: Option<u64>,
}

impl BackupRequest {
    pub fn database(repo_name: impl Into<String>, label: impl Into<String>, db_name: impl Into<String>) -> Self {
        Self {
            repo_name: repo_name.into(),
            label: label.into(),
            db_name: Some(db_name.into()),
            tables: Vec::new(),
            functions: Vec::new(),
            catalogs: Vec::new(),
            backup_type: BackupType::Full,
            timeout_ms: None,
        }
    }

    pub fn external_catalogs(
        repo_name: impl Into<String>,
        label: impl Into<String>,
        catalogs: Vec<CatalogRef>,
    ) -> Self {
        Self {
            repo_name: repo_name.into(),
            label: label.into(),
            db_name: None,
            tables: Vec::new(),
            functions: Vec::new(),
            catalogs,
            backup_type: BackupType::Full,
            timeout_ms: None,
        }
    }

    pub fn with_tables(mut self, tables: Vec<TableRef>) -> Self {
        self.tables = tables;
        self
    }

    pub fn with_functions(mut self, functions: Vec<FunctionRef>) -> Self {
        self.functions = functions;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn incremental(mut self) -> Self {
        self.backup_type = BackupType::Incremental;
        self
    }
}

/// Which objects of a snapshot a restore brings back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreSelection {
    /// Whether objects were named explicitly. `false` restores everything.
    pub explicit: bool,
    pub tables: Vec<TableRef>,
    pub functions: Vec<FunctionRef>,
    /// Also restore every table not named explicitly.
    pub all_tables: bool,
    /// Also restore every materialized view not named explicitly.
    pub all_mvs: bool,
    /// Also restore every view not named explicitly.
    pub all_views: bool,
    /// Also restore every function not named explicitly.
    pub all_functions: bool,
}

impl RestoreSelection {
    /// Restore the whole snapshot.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn tables(tables: Vec<TableRef>) -> Self {
        Self {
            explicit: true,
            tables,
            ..Self::default()
        }
    }

    pub fn with_functions(mut self, functions: Vec<FunctionRef>) -> Self {
        self.explicit = true;
        self.functions = functions;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreRequest {
    pub repo_name: String,
    pub label: String,
    pub backup_timestamp: i64,
    /// Target database; `None` when restoring external catalogs only.
    pub db_name: Option<String>,
    /// When set, must match the database the snapshot was taken from.
    pub origin_db_name: Option<String>,
    pub selection: RestoreSelection,
    pub catalogs: Vec<CatalogRef>,
    /// Restore every catalog of the snapshot.
    pub all_catalogs: bool,
    pub allow_load: bool,
    pub replication_num: Option<u16>,
    pub timeout_ms: Option<u64>,
    pub meta_version: Option<u32>,
}

impl RestoreRequest {
    pub fn database(
        repo_name: impl Into<String>,
        label: impl Into<String>,
        backup_timestamp: i64,
        db_name: impl Into<String>,
    ) -> Self {
        Self {
            repo_name: repo_name.into(),
            label: label.into(),
            backup_timestamp,
            db_name: Some(db_name.into()),
            origin_db_name: None,
            selection: RestoreSelection::all(),
            catalogs: Vec::new(),
            all_catalogs: false,
            allow_load: false,
            replication_num: None,
            timeout_ms: None,
            meta_version: None,
        }
    }

    pub fn external_catalogs(
        repo_name: impl Into<String>,
        label: impl Into<String>,
        backup_timestamp: i64,
        catalogs: Vec<CatalogRef>,
    ) -> Self {
        let all_catalogs = catalogs.is_empty();
        Self {
            repo_name: repo_name.into(),
            label: label.into(),
            backup_timestamp,
            db_name: None,
            origin_db_name: None,
            selection: RestoreSelection::all(),
            catalogs,
            all_catalogs,
            allow_load: false,
            replication_num: None,
            timeout_ms: None,
            meta_version: None,
        }
    }

    pub fn with_selection(mut self, selection: RestoreSelection) -> Self {
        self.selection = selection;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_replication_num(mut self, replication_num: u16) -> Self {
        self.replication_num = Some(replication_num);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotSelector {
    Name(String),
    Names(Vec<String>),
    Timestamp { op: TimestampOp, ts: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropSnapshotRequest {
    pub repo_name: String,
    pub selector: SnapshotSelector,
}
