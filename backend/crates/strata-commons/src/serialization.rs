//! Binary codec for persisted control-plane values.
//!
//! Journal records, image blocks and backup meta files all go through the
//! bincode 2.x serde integration with the standard configuration.

use serde::{de::DeserializeOwned, Serialize};

use crate::errors::{CommonError, Result};

/// Encode a value to bytes using bincode.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| CommonError::serialization(format!("bincode encode failed: {}", e)))
}

/// Decode a value from bytes using bincode.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| CommonError::serialization(format!("bincode decode failed: {}", e)))?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ids::{DbId, TargetKey};
    use serde::Deserialize;
    use std::collections::HashMap;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        target: TargetKey,
        progress: HashMap<i64, (u32, u32)>,
        error: Option<String>,
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let mut progress = HashMap::new();
        progress.insert(7, (3, 10));
        let sample = Sample {
            target: TargetKey::Database(DbId::new(42)),
            progress,
            error: Some("boom".to_string()),
        };
        let bytes = encode(&sample).unwrap();
        let decoded: Sample = decode(&bytes).unwrap();
        assert_eq!(sample, decoded);
    }

    #[test]
    fn test_decode_garbage_is_serialization_error() {
        let err = decode::<Sample>(&[0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, CommonError::Serialization(_)));
    }
}
