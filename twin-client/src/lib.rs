//! HTTP client for the Asset Administration Shell repository and the
//! Operation Service.
//!
//! The client wraps every invocation with the reliability machinery the
//! kernel depends on: transient-only retries, a per-endpoint circuit
//! breaker, an idempotency cache that collapses duplicate invocations, and
//! optional HMAC request signing for delegated jobs.

#![warn(missing_docs, clippy::pedantic)]

mod breaker;
mod client;
pub mod http;
mod idempotency;
mod retry;
mod sign;
mod source;

pub use breaker::{BreakerConfig, CircuitBreaker};
pub use client::{OperationRef, TwinClient, TwinClientConfig};
pub use idempotency::{
    FileIdempotencyStore, IdempotencyStore, MemoryIdempotencyStore, cached, fingerprint,
};
pub use retry::RetryPolicy;
pub use sign::{RequestSigner, SIGNATURE_HEADER, SignatureHeaders, TIMESTAMP_HEADER};
pub use source::{SubmodelPolicySource, TwinSnapshotSource};

use thiserror::Error;

/// Result alias for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the twin client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The client is misconfigured (bad URL, missing Operation Service).
    #[error("client not configured: {reason}")]
    Configuration {
        /// Additional context for the failure.
        reason: String,
    },

    /// The circuit for the target endpoint is open; the call failed fast.
    #[error("circuit open for `{endpoint}`")]
    CircuitOpen {
        /// Endpoint whose breaker rejected the call.
        endpoint: String,
    },

    /// The per-call deadline elapsed.
    #[error("execution timed out after {seconds}s")]
    Timeout {
        /// Deadline that was exceeded, in seconds.
        seconds: u64,
    },

    /// Transport-level failure (connect, TLS, mid-stream).
    #[error("transport failure: {reason}")]
    Transport {
        /// Additional context about the error.
        reason: String,
    },

    /// The remote endpoint answered with a non-success status.
    #[error("endpoint returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, for operators.
        body: String,
    },

    /// A delegated job reached a terminal failure state.
    #[error("delegated job failed: {reason}")]
    Job {
        /// Failure reason reported by the Operation Service.
        reason: String,
    },

    /// The response body could not be decoded.
    #[error("undecodable response: {reason}")]
    Response {
        /// Additional context about the decoding failure.
        reason: String,
    },
}

impl ClientError {
    /// Convenience constructor for transport failures.
    #[must_use]
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    /// Convenience constructor for configuration issues.
    #[must_use]
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Returns whether a retry might succeed: network failures and 5xx
    /// responses only. Denials, decode failures, timeouts, and open
    /// circuits never retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Returns whether the failure is definite: retrying the identical call
    /// can only produce the same answer, so the idempotency cache may
    /// record it.
    #[must_use]
    pub const fn is_definite(&self) -> bool {
        match self {
            Self::Status { status, .. } => *status < 500,
            Self::Job { .. } => true,
            _ => false,
        }
    }

    /// Returns the stable error code surfaced to callers.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "malformed_input",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Timeout { .. } => "execution_timeout",
            Self::Transport { .. } => "transport_failure",
            Self::Status { status, .. } => {
                if *status == 404 {
                    "not_found"
                } else {
                    "operation_failed"
                }
            }
            Self::Job { .. } | Self::Response { .. } => "operation_failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transience_covers_network_and_5xx() {
        assert!(ClientError::transport("reset").is_transient());
        assert!(
            ClientError::Status {
                status: 503,
                body: String::new()
            }
            .is_transient()
        );
        assert!(
            !ClientError::Status {
                status: 400,
                body: String::new()
            }
            .is_transient()
        );
        assert!(!ClientError::Timeout { seconds: 30 }.is_transient());
        assert!(
            !ClientError::CircuitOpen {
                endpoint: "aas".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn stable_codes_for_the_error_envelope() {
        assert_eq!(
            ClientError::CircuitOpen {
                endpoint: "aas".into()
            }
            .code(),
            "circuit_open"
        );
        assert_eq!(ClientError::Timeout { seconds: 1 }.code(), "execution_timeout");
        assert_eq!(
            ClientError::Status {
                status: 404,
                body: String::new()
            }
            .code(),
            "not_found"
        );
    }
}
