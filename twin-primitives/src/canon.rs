//! Canonical JSON serialization and SHA-256 digests.
//!
//! Canonical form: object keys sorted lexicographically, no insignificant
//! whitespace, UTF-8, numbers in the narrowest form that round-trips. Both
//! the policy signature and the audit hash chain commit to these bytes, so
//! every producer and verifier must agree on them.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Serializes a value to canonical JSON bytes.
///
/// The value is routed through [`serde_json::Value`], whose object
/// representation is a sorted map, so struct field order never leaks into
/// the canonical bytes.
///
/// # Errors
///
/// Returns [`Error::Serialization`] when the value cannot be represented as
/// JSON (e.g. a non-finite float).
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value).map_err(Error::from)?;
    serde_json::to_vec(&value).map_err(Error::from)
}

/// Returns the lowercase hex SHA-256 digest of the supplied bytes.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Returns the lowercase hex SHA-256 digest of a value's canonical JSON.
///
/// # Errors
///
/// Propagates [`Error::Serialization`] from canonicalization.
pub fn digest_value(value: &Value) -> Result<String> {
    Ok(sha256_hex(&to_canonical_bytes(value)?))
}
