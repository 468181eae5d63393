use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of a backup/restore job. Immutable once the job is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobType {
    Backup,
    Restore,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Backup => "backup",
            JobType::Restore => "restore",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
