//! Hash-chain primitives.
//!
//! Hash input layout (bytes, in order):
//!   1. `prev_hash` as UTF-8 bytes (64 ASCII hex chars)
//!   2. canonical JSON of the entry with its `hash` field removed
//!
//! The canonical form sorts keys, so the bytes are identical no matter which
//! struct or `Value` produced them.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{AuditError, AuditResult, entry::AuditEntry};

/// `prev_hash` of the first entry in every log: 64 hex zeros.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Computes the chain hash for a sealed entry value.
///
/// `sealed` must be the JSON object of the entry *including* `prev_hash`;
/// any `hash` key is stripped before hashing. Returns lowercase hex.
///
/// # Errors
///
/// Returns [`AuditError::Serialization`] when the value cannot be
/// canonicalized.
pub fn hash_sealed_value(prev_hash: &str, sealed: &Value) -> AuditResult<String> {
    let mut unsealed = sealed.clone();
    if let Some(object) = unsealed.as_object_mut() {
        object.remove("hash");
    }

    let canonical =
        twin_primitives::canon::to_canonical_bytes(&unsealed).map_err(|err| {
            AuditError::Serialization {
                reason: err.to_string(),
            }
        })?;

    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(&canonical);
    Ok(hex::encode(hasher.finalize()))
}

/// Seals an entry in place: computes and stores its `hash`.
pub(crate) fn seal(entry: &mut AuditEntry) -> AuditResult<()> {
    let value = serde_json::to_value(&*entry).map_err(|err| AuditError::Serialization {
        reason: err.to_string(),
    })?;
    entry.hash = hash_sealed_value(&entry.prev_hash, &value)?;
    Ok(())
}

/// Serializes a sealed entry to its canonical log line (no trailing newline).
pub(crate) fn to_line(entry: &AuditEntry) -> AuditResult<Vec<u8>> {
    twin_primitives::canon::to_canonical_bytes(entry).map_err(|err| AuditError::Serialization {
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{AuditEvent, AuditRecord};

    fn entry() -> AuditEntry {
        let record = AuditRecord::new(
            AuditEvent::Denied,
            "alice",
            vec!["viewer".into()],
            "SetSpeed",
            "a".repeat(64),
            "deny:role_unauthorized",
        );
        AuditEntry::from_record(record, 0, "2026-01-01T00:00:00Z".into(), GENESIS_HASH.into())
    }

    #[test]
    fn sealing_is_deterministic() {
        let mut a = entry();
        let mut b = entry();
        seal(&mut a).unwrap();
        seal(&mut b).unwrap();
        assert_eq!(a.hash, b.hash);
        assert_eq!(a.hash.len(), 64);
    }

    #[test]
    fn hash_commits_to_every_field() {
        let mut base = entry();
        seal(&mut base).unwrap();

        let mut altered = entry();
        altered.tool = "SetSpeee".into();
        seal(&mut altered).unwrap();
        assert_ne!(base.hash, altered.hash);

        let mut altered = entry();
        altered.prev_hash = "1".repeat(64);
        seal(&mut altered).unwrap();
        assert_ne!(base.hash, altered.hash);
    }

    #[test]
    fn stored_hash_does_not_feed_itself() {
        let mut sealed = entry();
        seal(&mut sealed).unwrap();
        let value = serde_json::to_value(&sealed).unwrap();
        let recomputed = hash_sealed_value(&sealed.prev_hash, &value).unwrap();
        assert_eq!(sealed.hash, recomputed);
    }
}
