//! Catalog metadata captured into a backup.
//!
//! [`BackupMeta`] is taken under a database read lock at submission time and
//! never changes afterwards. It is both the payload written to the repository
//! and the reference a restore validates local objects against.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strata_commons::{BackendId, FunctionName, TableKind, TabletId};

/// Inactive reason stamped on materialized views copied into a backup.
pub const MV_BACKUP_INACTIVE_REASON: &str = "it was restored from a backup";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    pub data_type: String,
}

impl ColumnMeta {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletMeta {
    pub id: TabletId,
    pub backend_id: BackendId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMeta {
    pub id: i64,
    pub name: String,
    pub visible_version: i64,
    pub tablets: Vec<TabletMeta>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMeta {
    pub id: i64,
    pub name: String,
    pub kind: TableKind,
    pub columns: Vec<ColumnMeta>,
    pub partitions: Vec<PartitionMeta>,
    /// Temporary partitions are tracked only as a flag: tables carrying them
    /// cannot be backed up.
    pub has_temp_partitions: bool,
    /// Base tables of a materialized view, in the same database.
    pub base_tables: Vec<String>,
    /// Set when a materialized view is inactive.
    pub inactive_reason: Option<String>,
    /// View definition for logical views.
    pub view_def: Option<String>,
}

impl TableMeta {
    pub fn partition(&self, name: &str) -> Option<&PartitionMeta> {
        self.partitions.iter().find(|p| p.name == name)
    }

    pub fn is_materialized_view(&self) -> bool {
        self.kind == TableKind::MaterializedView
    }

    /// Same kind and the same columns in the same order.
    pub fn same_schema(&self, other: &TableMeta) -> bool {
        self.kind == other.kind && self.columns == other.columns
    }

    /// Copy of this table keeping only `partitions` (all when `None`).
    ///
    /// Returns `None` if a requested partition does not exist.
    pub fn selective_copy(&self, partitions: Option<&[String]>) -> Option<TableMeta> {
        let mut copy = self.clone();
        if let Some(names) = partitions {
            let mut kept = Vec::with_capacity(names.len());
            for name in names {
                kept.push(self.partition(name)?.clone());
            }
            copy.partitions = kept;
        }
        Some(copy)
    }

    pub fn tablet_count(&self) -> usize {
        self.partitions.iter().map(|p| p.tablets.len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionMeta {
    pub name: FunctionName,
    /// Argument types, e.g. `(INT, VARCHAR)`; distinguishes overloads.
    pub signature: String,
    pub return_type: String,
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogMeta {
    pub name: String,
    pub catalog_type: String,
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMeta {
    pub tables: BTreeMap<String, TableMeta>,
    pub functions: Vec<FunctionMeta>,
    pub catalogs: Vec<CatalogMeta>,
}

impl BackupMeta {
    pub fn new(tables: Vec<TableMeta>) -> Self {
        Self {
            tables: tables.into_iter().map(|t| (t.name.clone(), t)).collect(),
            functions: Vec::new(),
            catalogs: Vec::new(),
        }
    }

    pub fn get_table(&self, name: &str) -> Option<&TableMeta> {
        self.tables.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty() && self.functions.is_empty() && self.catalogs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(partitions: &[&str]) -> TableMeta {
        TableMeta {
            id: 100,
            name: "orders".to_string(),
            kind: TableKind::Olap,
            columns: vec![ColumnMeta::new("id", "BIGINT")],
            partitions: partitions
                .iter()
                .enumerate()
                .map(|(i, name)| PartitionMeta {
                    id: 200 + i as i64,
                    name: name.to_string(),
                    visible_version: 1,
                    tablets: vec![TabletMeta {
                        id: TabletId::new(300 + i as i64),
                        backend_id: BackendId::new(1),
                    }],
                })
                .collect(),
            has_temp_partitions: false,
            base_tables: Vec::new(),
            inactive_reason: None,
            view_def: None,
        }
    }

    #[test]
    fn test_selective_copy_keeps_requested_partitions() {
        let t = table(&["p1", "p2", "p3"]);
        let copy = t.selective_copy(Some(&["p3".to_string(), "p1".to_string()])).unwrap();
        let names: Vec<_> = copy.partitions.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["p3", "p1"]);
        assert_eq!(copy.tablet_count(), 2);
    }

    #[test]
    fn test_selective_copy_unknown_partition() {
        let t = table(&["p1"]);
        assert!(t.selective_copy(Some(&["nope".to_string()])).is_none());
        assert_eq!(t.selective_copy(None).unwrap(), t);
    }

    #[test]
    fn test_same_schema_ignores_partitions() {
        let a = table(&["p1"]);
        let mut b = table(&["p1", "p2"]);
        assert!(a.same_schema(&b));
        b.columns.push(ColumnMeta::new("amount", "DECIMAL(10,2)"));
        assert!(!a.same_schema(&b));
    }
}
