//! Signed safety policy ("CovenantTwin") for the TwinOps kernel.
//!
//! The policy document travels as a submodel element next to a detached
//! Ed25519 signature over its canonical JSON. The store verifies on fetch,
//! caches with a TTL, and fails closed: no verified policy means every
//! kernel query errors and the kernel denies by default.

#![warn(missing_docs, clippy::pedantic)]

mod document;
mod signature;
mod store;

pub use document::{
    Interlock, InterlockCondition, InterlockOp, PolicyDocument, RoleBinding,
};
pub use signature::{Ed25519Verifier, SignatureVerifier, SignedPolicy};
pub use store::{PolicySource, PolicyStore, PolicyStoreConfig};

use thiserror::Error;

/// Result alias for policy operations.
pub type PolicyResult<T> = Result<T, PolicyError>;

/// Errors surfaced by the policy store.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// No currently verified policy exists (missing, bad signature, or bad
    /// payload). The kernel must deny by default.
    #[error("policy unverified: {reason}")]
    Unverified {
        /// Human-readable explanation for operators.
        reason: String,
    },

    /// The cached policy exceeded the configured maximum age and could not
    /// be refreshed.
    #[error("policy stale: verified {age_seconds}s ago, max age {max_age_seconds}s")]
    Stale {
        /// Seconds since the policy last verified.
        age_seconds: u64,
        /// Configured ceiling.
        max_age_seconds: u64,
    },

    /// The policy source could not be reached.
    #[error("policy source failure: {reason}")]
    Source {
        /// Human-readable explanation.
        reason: String,
    },
}
