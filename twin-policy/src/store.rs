//! Verified-policy store with TTL caching and fail-closed semantics.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use twin_primitives::canon;

use crate::document::PolicyDocument;
use crate::signature::{SignatureVerifier, SignedPolicy};
use crate::{PolicyError, PolicyResult};

/// Fetches the signed policy envelope from wherever it lives (normally the
/// policy submodel element, via the twin client).
#[async_trait]
pub trait PolicySource: Send + Sync {
    /// Returns the current signed envelope.
    async fn fetch(&self) -> PolicyResult<SignedPolicy>;
}

/// Cache behaviour for the store.
#[derive(Clone, Copy, Debug)]
pub struct PolicyStoreConfig {
    cache_ttl: Duration,
    max_age: Option<Duration>,
}

impl PolicyStoreConfig {
    /// Creates a configuration with the supplied cache TTL.
    #[must_use]
    pub const fn new(cache_ttl: Duration) -> Self {
        Self {
            cache_ttl,
            max_age: None,
        }
    }

    /// Sets the hard ceiling on policy age. Past it, decisions fail closed
    /// with [`PolicyError::Stale`] rather than using the cached document.
    #[must_use]
    pub const fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    /// Returns the cache TTL.
    #[must_use]
    pub const fn cache_ttl(self) -> Duration {
        self.cache_ttl
    }

    /// Returns the maximum tolerated age, if configured.
    #[must_use]
    pub const fn max_age(self) -> Option<Duration> {
        self.max_age
    }
}

impl Default for PolicyStoreConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

struct CachedPolicy {
    policy: Arc<PolicyDocument>,
    verified_at: Instant,
}

/// TTL-cached store over a [`PolicySource`] and a [`SignatureVerifier`].
///
/// Refreshes are single-writer behind the cache mutex; readers get a cheap
/// `Arc` clone of the verified document. A failed signature check discards
/// the cache entirely, so every subsequent query fails closed until a good
/// envelope arrives.
pub struct PolicyStore {
    source: Arc<dyn PolicySource>,
    verifier: Arc<dyn SignatureVerifier>,
    public_key: [u8; 32],
    config: PolicyStoreConfig,
    cache: Mutex<Option<CachedPolicy>>,
}

impl PolicyStore {
    /// Creates a store over the supplied source, verifier, and trusted key.
    #[must_use]
    pub fn new(
        source: Arc<dyn PolicySource>,
        verifier: Arc<dyn SignatureVerifier>,
        public_key: [u8; 32],
        config: PolicyStoreConfig,
    ) -> Self {
        Self {
            source,
            verifier,
            public_key,
            config,
            cache: Mutex::new(None),
        }
    }

    /// Returns the current verified policy.
    ///
    /// # Errors
    ///
    /// - [`PolicyError::Unverified`] when no envelope verifies.
    /// - [`PolicyError::Stale`] when the cached policy exceeded the maximum
    ///   age and could not be refreshed.
    /// - [`PolicyError::Source`] when the source fails and nothing usable is
    ///   cached.
    pub async fn current(&self) -> PolicyResult<Arc<PolicyDocument>> {
        let mut guard = self.cache.lock().await;

        if let Some(cached) = guard.as_ref() {
            let age = cached.verified_at.elapsed();
            if age < self.config.cache_ttl() && self.within_max_age(age) {
                return Ok(Arc::clone(&cached.policy));
            }
        }

        match self.fetch_verified().await {
            Ok(policy) => {
                debug!("policy refreshed and verified");
                *guard = Some(CachedPolicy {
                    policy: Arc::clone(&policy),
                    verified_at: Instant::now(),
                });
                Ok(policy)
            }
            Err(err @ PolicyError::Unverified { .. }) => {
                // A bad signature poisons trust in the cached copy too.
                warn!(error = %err, "policy verification failed; discarding cache");
                *guard = None;
                Err(err)
            }
            Err(err) => match guard.as_ref() {
                Some(cached) => {
                    let age = cached.verified_at.elapsed();
                    if self.within_max_age(age) {
                        warn!(error = %err, age_seconds = age.as_secs(), "policy refresh failed; serving cached document");
                        Ok(Arc::clone(&cached.policy))
                    } else {
                        let max_age = self.config.max_age().unwrap_or_default();
                        Err(PolicyError::Stale {
                            age_seconds: age.as_secs(),
                            max_age_seconds: max_age.as_secs(),
                        })
                    }
                }
                None => Err(err),
            },
        }
    }

    fn within_max_age(&self, age: Duration) -> bool {
        self.config.max_age().is_none_or(|max_age| age <= max_age)
    }

    async fn fetch_verified(&self) -> PolicyResult<Arc<PolicyDocument>> {
        let signed = self.source.fetch().await?;
        let canonical =
            canon::to_canonical_bytes(&signed.payload).map_err(|err| PolicyError::Unverified {
                reason: format!("payload cannot be canonicalized: {err}"),
            })?;
        let signature = signed.signature_bytes()?;

        if !self
            .verifier
            .verify(&canonical, &signature, &self.public_key)
        {
            return Err(PolicyError::Unverified {
                reason: format!("signature verification failed for key `{}`", signed.key_id),
            });
        }

        let document: PolicyDocument =
            serde_json::from_value(signed.payload).map_err(|err| PolicyError::Unverified {
                reason: format!("verified payload is not a policy document: {err}"),
            })?;

        Ok(Arc::new(document))
    }
}
