//! strata-commons
//!
//! Shared identifiers, model enums and codecs used by every Strata backend
//! crate. Nothing in here knows about jobs or repositories; it only carries
//! the vocabulary the backup control plane speaks.

pub mod errors;
pub mod models;
pub mod serialization;

pub use errors::{CommonError, Result};
pub use models::ids::{BackendId, DbId, JobId, RepoId, TabletId, TargetKey, TaskId};
pub use models::{
    CatalogRef, FunctionName, FunctionRef, JobType, PartitionNames, TableKind, TableRef, TaskKind,
};
