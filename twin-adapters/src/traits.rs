//! Shared selector traits and data structures.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use twin_primitives::ToolSchema;

/// Result alias used by selector adapters.
pub type AdapterResult<T> = Result<T, AdapterError>;

/// Error type shared by adapter implementations.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Adapter is misconfigured or missing credentials.
    #[error("adapter not configured: {reason}")]
    Configuration {
        /// Additional context for the failure.
        reason: String,
    },

    /// The supplied request was invalid for the target provider.
    #[error("invalid selection request: {reason}")]
    InvalidRequest {
        /// Reason describing why the request could not be processed.
        reason: String,
    },

    /// Transport-level failures (network, protocol, etc.).
    #[error("adapter transport error: {reason}")]
    Transport {
        /// Additional context about the error.
        reason: String,
    },

    /// The provider rejected the request due to rate limiting.
    #[error("adapter rate limited (retry after {retry_after:?})")]
    RateLimited {
        /// Suggested delay before retrying.
        retry_after: Option<Duration>,
    },

    /// The provider returned a malformed response.
    #[error("adapter response error: {reason}")]
    Response {
        /// Additional context about the response failure.
        reason: String,
    },
}

impl AdapterError {
    /// Convenience constructor for configuration issues.
    #[must_use]
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Convenience constructor for transport failures.
    #[must_use]
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    /// Convenience constructor for malformed responses.
    #[must_use]
    pub fn response(reason: impl Into<String>) -> Self {
        Self::Response {
            reason: reason.into(),
        }
    }
}

/// Shared bound on concurrent provider calls.
///
/// Clone one limiter into every hosted selector so a single semaphore caps
/// in-flight LLM requests process-wide. Excess selections queue until a
/// permit frees up.
#[derive(Clone, Debug)]
pub struct SelectorLimiter {
    semaphore: Arc<Semaphore>,
}

impl SelectorLimiter {
    /// Creates a limiter admitting up to `max_concurrency` provider calls.
    #[must_use]
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
        }
    }

    /// Waits for a permit, holding it for the duration of one provider
    /// call.
    ///
    /// # Panics
    ///
    /// Panics if the semaphore has been closed, which this type never does.
    pub async fn acquire(&self) -> OwnedSemaphorePermit {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .expect("selector limiter closed")
    }
}

impl Default for SelectorLimiter {
    fn default() -> Self {
        Self::new(2)
    }
}

/// Minimal metadata describing a selector instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectorMetadata {
    provider: &'static str,
    model: String,
}

impl SelectorMetadata {
    /// Creates metadata for the supplied provider and model identifier.
    #[must_use]
    pub fn new(provider: &'static str, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }

    /// Returns the provider identifier (e.g. `"anthropic"`).
    #[must_use]
    pub const fn provider(&self) -> &'static str {
        self.provider
    }

    /// Returns the configured model name.
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }
}

/// A candidate call produced by a selector, before kernel evaluation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SelectedCall {
    name: String,
    #[serde(default)]
    arguments: Value,
}

impl SelectedCall {
    /// Creates a selected call.
    #[must_use]
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
        }
    }

    /// Returns the tool name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the extracted arguments.
    #[must_use]
    pub const fn arguments(&self) -> &Value {
        &self.arguments
    }
}

/// Trait implemented by all tool selectors.
#[async_trait]
pub trait ToolSelector: Send + Sync {
    /// Returns basic metadata describing the selector instance.
    fn metadata(&self) -> &SelectorMetadata;

    /// Maps a message and the tool catalog to zero or more candidate calls,
    /// in the order they should be executed.
    async fn select(
        &self,
        message: &str,
        catalog: &[ToolSchema],
    ) -> AdapterResult<Vec<SelectedCall>>;
}
