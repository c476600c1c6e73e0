use serde::Serialize;
use serde_json::Value;
use sha2::{
    Digest,
    Sha256,
};

use crate::utils::error::DbError;

/// Canonical JSON encoding of any serializable value.
///
/// serde_json's default object map is BTree-backed, so converting through
/// `Value` yields sorted keys. Hashing and structural comparison both rely
/// on this; do not enable the `preserve_order` feature.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, DbError> {
    let value = serde_json::to_value(value)?;
    Ok(value.to_string())
}

/// SHA-256 hex digest over the canonical encoding.
pub fn content_hash<T: Serialize>(value: &T) -> Result<String, DbError> {
    let encoded = canonical_json(value)?;
    let mut hasher = Sha256::new();
    hasher.update(encoded.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

/// Structural equality between two serializable values, independent of
/// field ordering in their source encodings.
pub fn structurally_equal<A: Serialize, B: Serialize>(a: &A, b: &B) -> bool {
    let a = serde_json::to_value(a).unwrap_or(Value::Null);
    let b = serde_json::to_value(b).unwrap_or(Value::Null);
    a == b
}
