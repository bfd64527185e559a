//! Tamper-evident audit log for kernel decisions and execution outcomes.
//!
//! Every entry commits to its predecessor through a SHA-256 hash chain over
//! canonical JSON, so any post-hoc mutation is detectable from the mutation
//! point onward. The writer fsyncs each entry; durability is part of the
//! contract, not an option.

#![warn(missing_docs, clippy::pedantic)]

mod chain;
mod entry;
mod verify;
mod writer;

pub use chain::{GENESIS_HASH, hash_sealed_value};
pub use entry::{AuditEntry, AuditEvent, AuditRecord};
pub use verify::{VerifyReport, verify};
pub use writer::AuditLog;

use thiserror::Error;

/// Result alias for audit operations.
pub type AuditResult<T> = Result<T, AuditError>;

/// Errors surfaced by the audit log.
#[derive(Debug, Error)]
pub enum AuditError {
    /// Underlying file I/O failed.
    #[error("audit log i/o failure: {source}")]
    Io {
        /// Source I/O error.
        #[from]
        source: std::io::Error,
    },

    /// An entry could not be serialized to canonical JSON.
    #[error("audit entry serialization failed: {reason}")]
    Serialization {
        /// Human-readable explanation.
        reason: String,
    },

    /// An existing log line could not be parsed while resuming the chain.
    #[error("audit log corrupt at line {line}: {reason}")]
    Corrupt {
        /// One-based line number of the unreadable entry.
        line: u64,
        /// Human-readable explanation.
        reason: String,
    },
}
