//! Sub-task requests handed to the dispatcher and the completions workers
//! report back.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strata_commons::{BackendId, JobId, RepoId, TabletId, TargetKey, TaskId, TaskKind};

/// Work a storage node is asked to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskPayload {
    Snapshot {
        tablet_id: TabletId,
        partition_id: i64,
        version: i64,
    },
    Upload {
        repo_id: RepoId,
        /// Repository prefix the files land under (`<label>/<tablet_id>/...`).
        dest_prefix: String,
        /// Tablet and the local snapshot path to upload from.
        tablets: Vec<(TabletId, String)>,
    },
    Download {
        repo_id: RepoId,
        /// Local tablet and the remote files it receives.
        files: Vec<(TabletId, Vec<String>)>,
    },
    DirMove {
        tablet_id: TabletId,
        source_path: String,
    },
}

/// One issued sub-task. The job keeps it until the completion arrives so the
/// batch can be re-issued after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_id: TaskId,
    pub job_id: JobId,
    pub target: TargetKey,
    pub backend_id: BackendId,
    pub kind: TaskKind,
    pub payload: TaskPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Ok,
    Failed(String),
}

/// Result data carried by a successful completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionPayload {
    None,
    Snapshot {
        snapshot_path: String,
    },
    Upload {
        tablet_files: BTreeMap<TabletId, Vec<String>>,
    },
    Download {
        /// Local directory each tablet's files were downloaded into.
        downloaded: BTreeMap<TabletId, String>,
    },
    DirMove,
}

/// Completion delivered by a worker for a previously issued sub-task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCompletion {
    pub task_id: TaskId,
    pub job_id: JobId,
    pub target: TargetKey,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub payload: CompletionPayload,
}

impl TaskCompletion {
    pub fn ok(request: &TaskRequest, payload: CompletionPayload) -> Self {
        Self {
            task_id: request.task_id,
            job_id: request.job_id,
            target: request.target,
            kind: request.kind,
            status: TaskStatus::Ok,
            payload,
        }
    }

    pub fn failed(request: &TaskRequest, message: impl Into<String>) -> Self {
        Self {
            task_id: request.task_id,
            job_id: request.job_id,
            target: request.target,
            kind: request.kind,
            status: TaskStatus::Failed(message.into()),
            payload: CompletionPayload::None,
        }
    }
}

/// What the orchestrator did with a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// Applied to the owning job.
    Accepted,
    /// Stale, duplicate or unmatched; dropped without error.
    Discarded,
}
