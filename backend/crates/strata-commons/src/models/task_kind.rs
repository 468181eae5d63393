use std::fmt;

use serde::{Deserialize, Serialize};

use super::JobType;

/// Category of an asynchronously dispatched sub-task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    /// Create a local snapshot of a tablet on its storage node.
    Snapshot,
    /// Upload local snapshot files into the repository.
    Upload,
    /// Download snapshot files from the repository onto a storage node.
    Download,
    /// Move downloaded files into the live tablet directory.
    DirMove,
}

impl TaskKind {
    /// Job type that owns sub-tasks of this kind.
    pub fn owner(&self) -> JobType {
        match self {
            TaskKind::Snapshot | TaskKind::Upload => JobType::Backup,
            TaskKind::Download | TaskKind::DirMove => JobType::Restore,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskKind::Snapshot => "snapshot",
            TaskKind::Upload => "upload",
            TaskKind::Download => "download",
            TaskKind::DirMove => "dir_move",
        };
        f.write_str(s)
    }
}
