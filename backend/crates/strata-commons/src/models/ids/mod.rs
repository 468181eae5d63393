//! Type-safe numeric identifiers.
//!
//! Every id is a thin `i64` newtype so a tablet id can never be passed where a
//! job id is expected.

mod target_key;

pub use target_key::TargetKey;

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
            serde::Serialize, serde::Deserialize,
        )]
        pub struct $name(i64);

        impl $name {
            pub const fn new(id: i64) -> Self {
                Self(id)
            }

            pub const fn as_i64(&self) -> i64 {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }
    };
}

numeric_id!(
    /// Cluster-unique, monotonically allocated backup/restore job id.
    JobId
);
numeric_id!(
    /// Database identifier in the local catalog.
    DbId
);
numeric_id!(
    /// Repository identifier assigned when the repository is created.
    RepoId
);
numeric_id!(
    /// Sub-task identifier allocated by the job that issues the task.
    TaskId
);
numeric_id!(
    /// Tablet identifier.
    TabletId
);
numeric_id!(
    /// Storage node identifier.
    BackendId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_id_ordering_and_display() {
        let a = JobId::new(10);
        let b = JobId::from(11);
        assert!(a < b);
        assert_eq!(a.to_string(), "10");
        assert_eq!(b.as_i64(), 11);
    }
}
