//! Scope of a backup or restore job.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::DbId;

/// Identifies the slot a job occupies in the active-job table.
///
/// Jobs against a database use that database's id. Jobs that only touch
/// external catalog metadata share the single `ExternalCatalog` slot, so at
/// most one of them can be in flight across the whole cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TargetKey {
    Database(DbId),
    ExternalCatalog,
}

impl TargetKey {
    pub fn db_id(&self) -> Option<DbId> {
        match self {
            TargetKey::Database(id) => Some(*id),
            TargetKey::ExternalCatalog => None,
        }
    }

    pub fn is_external_catalog(&self) -> bool {
        matches!(self, TargetKey::ExternalCatalog)
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKey::Database(id) => write!(f, "db:{}", id),
            TargetKey::ExternalCatalog => write!(f, "external-catalog"),
        }
    }
}

impl From<DbId> for TargetKey {
    fn from(id: DbId) -> Self {
        TargetKey::Database(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_key_display() {
        assert_eq!(TargetKey::Database(DbId::new(5)).to_string(), "db:5");
        assert_eq!(TargetKey::ExternalCatalog.to_string(), "external-catalog");
        assert_eq!(TargetKey::ExternalCatalog.db_id(), None);
        assert!(TargetKey::ExternalCatalog.is_external_catalog());
    }
}
