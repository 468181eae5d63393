//! Model types shared across the backup control plane.

pub mod ids;
mod job_type;
mod refs;
mod table_kind;
mod task_kind;

pub use job_type::JobType;
pub use refs::{CatalogRef, FunctionName, FunctionRef, PartitionNames, TableRef};
pub use table_kind::TableKind;
pub use task_kind::TaskKind;
