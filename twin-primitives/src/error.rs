//! Shared error definitions for TwinOps primitives.

use thiserror::Error;
use uuid::Error as UuidError;

/// Result alias used throughout the runtime.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while manipulating primitive types.
#[derive(Debug, Error)]
pub enum Error {
    /// The provided task identifier could not be parsed.
    #[error("invalid task id: {source}")]
    InvalidTaskId {
        /// Source parsing error from the UUID library.
        #[from]
        source: UuidError,
    },

    /// A risk level string did not match a known level.
    #[error("invalid risk level `{value}`")]
    InvalidRiskLevel {
        /// The offending level string.
        value: String,
    },

    /// Canonical JSON serialization failed.
    #[error("canonical serialization failed: {source}")]
    Serialization {
        /// Source error from `serde_json`.
        #[from]
        source: serde_json::Error,
    },
}
