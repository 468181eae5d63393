//! Job-info manifest stored next to every snapshot.
//!
//! The manifest lists exactly which tables, partitions and tablets (with their
//! uploaded files) a snapshot holds. Restore planning reads it, narrows it to
//! the requested objects and maps remote tablets onto local ones.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use strata_commons::{DbId, TabletId};

use crate::meta::BackupMeta;

/// Current on-repository meta format version.
pub const META_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupTabletInfo {
    pub id: TabletId,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupPartitionInfo {
    pub id: i64,
    pub name: String,
    pub version: i64,
    /// In the same order as the partition's tablets in [`BackupMeta`].
    pub tablets: Vec<BackupTabletInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupTableInfo {
    pub id: i64,
    pub name: String,
    /// Name the table gets in the target database; set from the request.
    pub alias: Option<String>,
    pub partitions: BTreeMap<String, BackupPartitionInfo>,
}

impl BackupTableInfo {
    pub fn contains_partition(&self, name: &str) -> bool {
        self.partitions.contains_key(name)
    }

    /// Keep only the named partitions; `None` keeps everything.
    pub fn retain_partitions(&mut self, names: Option<&[String]>) {
        if let Some(names) = names {
            let keep: BTreeSet<&str> = names.iter().map(String::as_str).collect();
            self.partitions.retain(|name, _| keep.contains(name.as_str()));
        }
    }

    pub fn target_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupJobInfo {
    /// Snapshot label.
    pub name: String,
    /// Empty for snapshots that only hold external catalogs.
    pub db_name: String,
    pub db_id: Option<DbId>,
    /// Backup timestamp in milliseconds; identifies the snapshot under a label.
    pub backup_time: i64,
    pub meta_version: u32,
    pub tables: BTreeMap<String, BackupTableInfo>,
}

impl BackupJobInfo {
    /// Build the manifest of a finished backup from its meta and the files
    /// each tablet uploaded.
    pub fn from_backup(
        label: &str,
        db_name: &str,
        db_id: Option<DbId>,
        backup_time: i64,
        meta: &BackupMeta,
        tablet_files: &BTreeMap<TabletId, Vec<String>>,
    ) -> Self {
        let tables = meta
            .tables
            .values()
            .map(|table| {
                let partitions = table
                    .partitions
                    .iter()
                    .map(|p| {
                        let tablets = p
                            .tablets
                            .iter()
                            .map(|t| BackupTabletInfo {
                                id: t.id,
                                files: tablet_files.get(&t.id).cloned().unwrap_or_default(),
                            })
                            .collect();
                        (
                            p.name.clone(),
                            BackupPartitionInfo {
                                id: p.id,
                                name: p.name.clone(),
                                version: p.visible_version,
                                tablets,
                            },
                        )
                    })
                    .collect();
                (
                    table.name.clone(),
                    BackupTableInfo {
                        id: table.id,
                        name: table.name.clone(),
                        alias: None,
                        partitions,
                    },
                )
            })
            .collect();

        Self {
            name: label.to_string(),
            db_name: db_name.to_string(),
            db_id,
            backup_time,
            meta_version: META_VERSION,
            tables,
        }
    }

    pub fn is_external_catalog_snapshot(&self) -> bool {
        self.db_name.is_empty()
    }

    pub fn contains_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn table_info(&self, name: &str) -> Option<&BackupTableInfo> {
        self.tables.get(name)
    }

    pub fn table_info_mut(&mut self, name: &str) -> Option<&mut BackupTableInfo> {
        self.tables.get_mut(name)
    }

    pub fn set_alias(&mut self, name: &str, alias: &str) {
        if let Some(info) = self.tables.get_mut(name) {
            info.alias = Some(alias.to_string());
        }
    }

    pub fn retain_tables(&mut self, names: &BTreeSet<String>) {
        self.tables.retain(|name, _| names.contains(name));
    }

    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{ColumnMeta, PartitionMeta, TableMeta, TabletMeta};
    use strata_commons::{BackendId, TableKind};

    fn meta() -> BackupMeta {
        BackupMeta::new(vec![TableMeta {
            id: 10,
            name: "events".to_string(),
            kind: TableKind::Olap,
            columns: vec![ColumnMeta::new("ts", "DATETIME")],
            partitions: vec![
                PartitionMeta {
                    id: 11,
                    name: "p1".to_string(),
                    visible_version: 4,
                    tablets: vec![TabletMeta {
                        id: TabletId::new(101),
                        backend_id: BackendId::new(1),
                    }],
                },
                PartitionMeta {
                    id: 12,
                    name: "p2".to_string(),
                    visible_version: 2,
                    tablets: vec![TabletMeta {
                        id: TabletId::new(102),
                        backend_id: BackendId::new(2),
                    }],
                },
            ],
            has_temp_partitions: false,
            base_tables: Vec::new(),
            inactive_reason: None,
            view_def: None,
        }])
    }

    #[test]
    fn test_from_backup_attaches_uploaded_files() {
        let mut files = BTreeMap::new();
        files.insert(TabletId::new(101), vec!["101/0.dat".to_string()]);

        let info = BackupJobInfo::from_backup("snap1", "sales", Some(DbId::new(1)), 1000, &meta(), &files);
        let table = info.table_info("events").unwrap();
        assert_eq!(table.partitions["p1"].tablets[0].files, vec!["101/0.dat".to_string()]);
        assert!(table.partitions["p2"].tablets[0].files.is_empty());
        assert!(!info.is_external_catalog_snapshot());
    }

    #[test]
    fn test_retain_partitions_and_tables() {
        let mut info =
            BackupJobInfo::from_backup("snap1", "sales", None, 1000, &meta(), &BTreeMap::new());
        info.table_info_mut("events")
            .unwrap()
            .retain_partitions(Some(&["p2".to_string()]));
        assert!(!info.table_info("events").unwrap().contains_partition("p1"));

        info.retain_tables(&BTreeSet::new());
        assert!(info.tables.is_empty());
    }

    #[test]
    fn test_json_manifest_roundtrip() {
        let mut info =
            BackupJobInfo::from_backup("snap1", "sales", None, 1000, &meta(), &BTreeMap::new());
        info.set_alias("events", "events_copy");
        let json = info.to_json().unwrap();
        let back = BackupJobInfo::from_json(&json).unwrap();
        assert_eq!(back.table_info("events").unwrap().target_name(), "events_copy");
    }
}
