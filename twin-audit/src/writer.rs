//! Durable single-writer appender.

use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::chain::{self, GENESIS_HASH};
use crate::entry::{AuditEntry, AuditRecord};
use crate::{AuditError, AuditResult};

#[derive(Debug)]
struct WriterInner {
    file: tokio::fs::File,
    next_seq: u64,
    prev_hash: String,
}

/// Append-only audit log with a totally ordered, fsynced write path.
///
/// All appends serialize through one internal lock; verifiers read through a
/// separate handle (see [`crate::verify`]).
#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    inner: Mutex<WriterInner>,
}

impl AuditLog {
    /// Opens (or creates) the log at the provided path and resumes the chain
    /// from the last entry on disk.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Io`] on file errors and [`AuditError::Corrupt`]
    /// when the existing tail cannot be parsed.
    pub async fn open(path: impl Into<PathBuf>) -> AuditResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let (next_seq, prev_hash) = resume_tail(&path).await?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        debug!(path = %path.display(), next_seq, "audit log opened");
        Ok(Self {
            path,
            inner: Mutex::new(WriterInner {
                file,
                next_seq,
                prev_hash,
            }),
        })
    }

    /// Returns the log file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends a record, returning the sealed entry.
    ///
    /// The entry is assigned the next sequence number, linked to its
    /// predecessor, written as one canonical JSON line, and fsynced before
    /// this call returns.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Io`] when the write or fsync fails and
    /// [`AuditError::Serialization`] when the entry cannot be encoded.
    pub async fn append(&self, record: AuditRecord) -> AuditResult<AuditEntry> {
        let mut guard = self.inner.lock().await;

        let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let mut entry =
            AuditEntry::from_record(record, guard.next_seq, ts, guard.prev_hash.clone());
        chain::seal(&mut entry)?;

        let line = chain::to_line(&entry)?;
        guard.file.write_all(&line).await?;
        guard.file.write_u8(b'\n').await?;
        guard.file.sync_data().await?;

        guard.next_seq += 1;
        guard.prev_hash = entry.hash.clone();

        Ok(entry)
    }
}

async fn resume_tail(path: &Path) -> AuditResult<(u64, String)> {
    let data = match fs::read(path).await {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok((0, GENESIS_HASH.to_owned()));
        }
        Err(err) => return Err(err.into()),
    };

    let mut next_seq = 0_u64;
    let mut prev_hash = GENESIS_HASH.to_owned();
    let mut line_number = 0_u64;

    for chunk in data
        .split(|byte| *byte == b'\n')
        .filter(|chunk| !chunk.is_empty())
    {
        line_number += 1;
        let entry: AuditEntry =
            serde_json::from_slice(chunk).map_err(|err| AuditError::Corrupt {
                line: line_number,
                reason: err.to_string(),
            })?;
        next_seq = entry.seq + 1;
        prev_hash = entry.hash;
    }

    Ok((next_seq, prev_hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::AuditEvent;
    use uuid::Uuid;

    fn temp_path() -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("twinops-audit-{}.jsonl", Uuid::new_v4()));
        path
    }

    fn record(tool: &str) -> AuditRecord {
        AuditRecord::new(
            AuditEvent::Executed,
            "operator-1",
            vec!["operator".into()],
            tool,
            "a".repeat(64),
            "execute",
        )
    }

    #[tokio::test]
    async fn appends_link_into_a_chain() {
        let path = temp_path();
        let log = AuditLog::open(&path).await.unwrap();

        let first = log.append(record("StartPump")).await.unwrap();
        let second = log.append(record("StopPump")).await.unwrap();

        assert_eq!(first.seq, 0);
        assert_eq!(first.prev_hash, GENESIS_HASH);
        assert_eq!(second.seq, 1);
        assert_eq!(second.prev_hash, first.hash);

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn reopen_resumes_the_chain() {
        let path = temp_path();

        let tail_hash = {
            let log = AuditLog::open(&path).await.unwrap();
            log.append(record("StartPump")).await.unwrap();
            log.append(record("StopPump")).await.unwrap().hash
        };

        let log = AuditLog::open(&path).await.unwrap();
        let third = log.append(record("GetStatus")).await.unwrap();
        assert_eq!(third.seq, 2);
        assert_eq!(third.prev_hash, tail_hash);

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn corrupt_tail_is_reported_on_open() {
        let path = temp_path();
        std::fs::write(&path, b"{not json}\n").unwrap();

        let err = AuditLog::open(&path).await.expect_err("corrupt tail");
        assert!(matches!(err, AuditError::Corrupt { line: 1, .. }));

        let _ = std::fs::remove_file(path);
    }
}
