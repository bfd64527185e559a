//! Sequential chain verification over a separate read handle.

use std::path::Path;

use serde_json::Value;
use tokio::fs;
use tracing::warn;

use crate::AuditResult;
use crate::chain::{GENESIS_HASH, hash_sealed_value};

/// Outcome of a verification pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifyReport {
    /// Whether every entry verified.
    pub ok: bool,
    /// Number of entries examined (including the broken one, if any).
    pub entries: u64,
    /// Sequence number of the first entry that failed verification.
    pub first_break_seq: Option<u64>,
}

impl VerifyReport {
    fn intact(entries: u64) -> Self {
        Self {
            ok: true,
            entries,
            first_break_seq: None,
        }
    }

    fn broken(entries: u64, seq: u64) -> Self {
        Self {
            ok: false,
            entries,
            first_break_seq: Some(seq),
        }
    }
}

/// Re-reads the log and recomputes the chain.
///
/// Any mismatch (an unparseable line, a sequence gap, a `prev_hash` that
/// does not match the predecessor, or a stored `hash` that does not match
/// the recomputation) breaks the chain at that entry's expected sequence
/// number. An empty or missing file verifies as intact.
///
/// # Errors
///
/// Returns [`crate::AuditError::Io`] only for I/O failures other than the
/// file being absent; tamper evidence is reported through the
/// [`VerifyReport`], not as an error.
pub async fn verify(path: impl AsRef<Path>) -> AuditResult<VerifyReport> {
    let data = match fs::read(path.as_ref()).await {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(VerifyReport::intact(0));
        }
        Err(err) => return Err(err.into()),
    };

    let mut expected_seq = 0_u64;
    let mut expected_prev = GENESIS_HASH.to_owned();

    for chunk in data
        .split(|byte| *byte == b'\n')
        .filter(|chunk| !chunk.is_empty())
    {
        let Ok(sealed) = serde_json::from_slice::<Value>(chunk) else {
            warn!(seq = expected_seq, "audit entry is not valid JSON");
            return Ok(VerifyReport::broken(expected_seq + 1, expected_seq));
        };

        let seq_matches = sealed.get("seq").and_then(Value::as_u64) == Some(expected_seq);
        let prev_matches =
            sealed.get("prev_hash").and_then(Value::as_str) == Some(expected_prev.as_str());
        let stored_hash = sealed.get("hash").and_then(Value::as_str).unwrap_or("");
        let recomputed = hash_sealed_value(&expected_prev, &sealed)?;

        if !seq_matches || !prev_matches || stored_hash != recomputed {
            warn!(seq = expected_seq, "audit chain broken");
            return Ok(VerifyReport::broken(expected_seq + 1, expected_seq));
        }

        expected_prev = stored_hash.to_owned();
        expected_seq += 1;
    }

    Ok(VerifyReport::intact(expected_seq))
}
