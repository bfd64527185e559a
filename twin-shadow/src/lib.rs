//! Shadow Twin: a local mirror of submodel state for fast interlock reads.
//!
//! The projection is seeded from an HTTP snapshot at startup, kept live by
//! MQTT deliveries, and reseeded whenever the broker connection recovers.
//! Interlock evaluation reads through a view that holds the read lock for
//! the duration of one kernel decision, so a burst of updates can never
//! split the observed state across paths.

#![warn(missing_docs, clippy::pedantic)]

mod feed;
mod state;

pub use feed::{MqttFeed, MqttFeedConfig, SnapshotSource};
pub use state::{ShadowEntry, ShadowState, ShadowView, ValueSource};

use thiserror::Error;

/// Result alias for shadow operations.
pub type ShadowResult<T> = Result<T, ShadowError>;

/// Errors surfaced by shadow seeding and the MQTT feed.
#[derive(Debug, Error)]
pub enum ShadowError {
    /// The snapshot source could not produce a full projection.
    #[error("shadow snapshot failed: {reason}")]
    Snapshot {
        /// Human-readable explanation.
        reason: String,
    },

    /// The MQTT client could not be driven.
    #[error("shadow feed failure: {reason}")]
    Feed {
        /// Human-readable explanation.
        reason: String,
    },
}
