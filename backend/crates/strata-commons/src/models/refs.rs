//! Object references carried by already-parsed backup/restore requests.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Partition selection attached to a table reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionNames {
    pub names: Vec<String>,
    /// Temporary partitions are never backed up or restored.
    pub temp: bool,
}

impl PartitionNames {
    pub fn new(names: Vec<String>) -> Self {
        Self { names, temp: false }
    }
}

/// Table named in a request, optionally with partitions and an alias.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRef {
    pub name: String,
    pub partitions: Option<PartitionNames>,
    pub alias: Option<String>,
}

impl TableRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            partitions: None,
            alias: None,
        }
    }

    pub fn with_partitions(mut self, names: Vec<String>) -> Self {
        self.partitions = Some(PartitionNames::new(names));
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Name the object will have after restore.
    pub fn target_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// Fully qualified user-function name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionName {
    pub db: String,
    pub function: String,
}

impl FunctionName {
    pub fn new(db: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            function: function.into(),
        }
    }
}

impl fmt::Display for FunctionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.function)
    }
}

/// Function named in a request. Matches every overload with that name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionRef {
    pub name: FunctionName,
    pub alias: Option<String>,
}

impl FunctionRef {
    pub fn new(name: FunctionName) -> Self {
        Self { name, alias: None }
    }

    /// Restore matching ignores the database part: functions are restored
    /// into the target database.
    pub fn matches(&self, other: &FunctionName) -> bool {
        self.name.function.eq_ignore_ascii_case(&other.function)
    }
}

/// External catalog named in a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogRef {
    pub name: String,
    pub alias: Option<String>,
}

impl CatalogRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
        }
    }
}
