//! In-memory projection of submodel values.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Where a shadow entry came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueSource {
    /// Seeded by a full HTTP snapshot.
    Snapshot,
    /// Delivered over the MQTT feed.
    Mqtt,
}

/// A single mirrored value with its bookkeeping.
#[derive(Clone, Debug, PartialEq)]
pub struct ShadowEntry {
    /// The mirrored JSON value.
    pub value: Value,
    /// Monotonic local write stamp.
    pub stamp: u64,
    /// Broker-assigned timestamp (epoch milliseconds), when the payload
    /// carried one. Used to drop out-of-order deliveries.
    pub timestamp: Option<i64>,
    /// Origin of the entry.
    pub source: ValueSource,
}

type SubmodelMap = HashMap<String, HashMap<String, ShadowEntry>>;

/// Thread-safe shadow projection keyed by `(submodel_id, path)`.
///
/// Entries are created, updated, and reseeded, never deleted. Writes stamp
/// a process-local monotonic counter; readers either copy single entries or
/// take a [`ShadowView`] to observe several paths consistently.
#[derive(Debug, Default)]
pub struct ShadowState {
    inner: RwLock<SubmodelMap>,
    clock: AtomicU64,
}

impl ShadowState {
    /// Creates an empty projection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the entry at `(submodel, path)`, if present.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock has been poisoned.
    #[must_use]
    pub fn get(&self, submodel: &str, path: &str) -> Option<ShadowEntry> {
        let guard = self.inner.read().expect("shadow state poisoned");
        guard.get(submodel).and_then(|paths| paths.get(path)).cloned()
    }

    /// Applies one live update, returning `false` when the delivery was
    /// dropped as out-of-order (its embedded timestamp is older than the
    /// stored one).
    ///
    /// # Panics
    ///
    /// Panics if the internal lock has been poisoned.
    pub fn apply_update(
        &self,
        submodel: &str,
        path: &str,
        value: Value,
        timestamp: Option<i64>,
        source: ValueSource,
    ) -> bool {
        let mut guard = self.inner.write().expect("shadow state poisoned");
        let paths = guard.entry(submodel.to_owned()).or_default();

        if let Some(existing) = paths.get(path) {
            if let (Some(incoming), Some(stored)) = (timestamp, existing.timestamp) {
                if incoming < stored {
                    debug!(submodel, path, incoming, stored, "dropping out-of-order delivery");
                    return false;
                }
            }
        }

        paths.insert(
            path.to_owned(),
            ShadowEntry {
                value,
                stamp: self.clock.fetch_add(1, Ordering::SeqCst) + 1,
                timestamp,
                source,
            },
        );
        true
    }

    /// Replaces the projection wholesale from a fresh snapshot, restamping
    /// every entry.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock has been poisoned.
    pub fn apply_snapshot(&self, snapshot: HashMap<String, HashMap<String, Value>>) {
        let mut guard = self.inner.write().expect("shadow state poisoned");
        for (submodel, paths) in snapshot {
            let slot = guard.entry(submodel).or_default();
            for (path, value) in paths {
                slot.insert(
                    path,
                    ShadowEntry {
                        value,
                        stamp: self.clock.fetch_add(1, Ordering::SeqCst) + 1,
                        timestamp: None,
                        source: ValueSource::Snapshot,
                    },
                );
            }
        }
    }

    /// Takes a consistent read view for one kernel decision.
    ///
    /// The view holds the read lock until dropped; updates block for that
    /// long, so every path read through the same view observes one state.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock has been poisoned.
    #[must_use]
    pub fn read_view(&self) -> ShadowView<'_> {
        ShadowView {
            guard: self.inner.read().expect("shadow state poisoned"),
        }
    }
}

/// Consistent multi-path read view over the shadow state.
pub struct ShadowView<'a> {
    guard: RwLockReadGuard<'a, SubmodelMap>,
}

impl ShadowView<'_> {
    /// Returns the entry at `(submodel, path)` within this view.
    #[must_use]
    pub fn get(&self, submodel: &str, path: &str) -> Option<&ShadowEntry> {
        self.guard.get(submodel).and_then(|paths| paths.get(path))
    }
}
