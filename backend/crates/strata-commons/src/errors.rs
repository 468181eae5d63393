//! Shared error types for Strata.
//!
//! Crates that need a richer taxonomy wrap `CommonError` into their own error
//! enum.

use std::fmt;

/// Common error type for Strata operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommonError {
    /// Encoding or decoding a persisted value failed
    Serialization(String),
}

impl CommonError {
    /// Creates a Serialization error with a message.
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }
}

impl fmt::Display for CommonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommonError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
        }
    }
}

impl std::error::Error for CommonError {}

/// Result type alias using CommonError
pub type Result<T> = std::result::Result<T, CommonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CommonError::serialization("bad tag");
        assert_eq!(err.to_string(), "Serialization error: bad tag");
    }
}
