use serde::{Deserialize, Serialize};

/// Kind of a catalog table as far as backup/restore is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TableKind {
    /// Native columnar table with partitions and tablets.
    Olap,
    /// Materialized view backed by native storage.
    MaterializedView,
    /// Logical view; metadata only.
    View,
    /// Table backed by an external system. Cannot be backed up.
    External,
}

impl TableKind {
    pub fn supports_backup_restore(&self) -> bool {
        !matches!(self, TableKind::External)
    }

    /// Whether tables of this kind own tablet data that must be snapshotted.
    pub fn has_data(&self) -> bool {
        matches!(self, TableKind::Olap | TableKind::MaterializedView)
    }
}
