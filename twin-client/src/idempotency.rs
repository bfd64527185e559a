//! Idempotency cache collapsing duplicate invocations.

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use twin_primitives::canon;

use crate::{ClientError, ClientResult};

/// Computes the cache fingerprint for an invocation.
///
/// The fingerprint commits to everything that affects the observable
/// outcome: the qualified operation name, the canonical arguments, the
/// simulation flag, and the caller-supplied idempotency key.
#[must_use]
pub fn fingerprint(operation: &str, args: &Value, simulate: bool, key: Option<&str>) -> String {
    let tuple = json!({
        "operation": operation,
        "args": args,
        "simulate": simulate,
        "key": key,
    });
    let bytes = canon::to_canonical_bytes(&tuple).unwrap_or_default();
    canon::sha256_hex(&bytes)
}

/// Terminal outcome persisted under a fingerprint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
enum StoredOutcome {
    Success { result: Value },
    Failure { code: String, message: String },
}

/// Backend storing terminal invocation outcomes for the configured TTL.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Returns the stored outcome for the fingerprint, if still live.
    async fn get(&self, fingerprint: &str) -> Option<Value>;

    /// Records a terminal outcome under the fingerprint.
    async fn put(&self, fingerprint: &str, outcome: Value);
}

/// Runs `operation` unless the store already holds a live outcome for the
/// fingerprint.
///
/// Successes and definite failures are recorded so replays within the TTL
/// answer without touching the AAS. Transient failures are never recorded.
///
/// # Errors
///
/// Propagates the operation's error, or replays a recorded definite
/// failure.
pub async fn cached<F, Fut>(
    store: &dyn IdempotencyStore,
    fingerprint: &str,
    operation: F,
) -> ClientResult<Value>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ClientResult<Value>>,
{
    if let Some(stored) = store.get(fingerprint).await {
        debug!(fingerprint, "idempotency cache hit");
        return replay(&stored);
    }

    match operation().await {
        Ok(result) => {
            let outcome = serde_json::to_value(StoredOutcome::Success {
                result: result.clone(),
            })
            .unwrap_or(Value::Null);
            store.put(fingerprint, outcome).await;
            Ok(result)
        }
        Err(err) => {
            if err.is_definite() {
                let outcome = serde_json::to_value(StoredOutcome::Failure {
                    code: err.code().to_owned(),
                    message: err.to_string(),
                })
                .unwrap_or(Value::Null);
                store.put(fingerprint, outcome).await;
            }
            Err(err)
        }
    }
}

fn replay(stored: &Value) -> ClientResult<Value> {
    match serde_json::from_value::<StoredOutcome>(stored.clone()) {
        Ok(StoredOutcome::Success { result }) => Ok(result),
        Ok(StoredOutcome::Failure { message, .. }) => Err(ClientError::Job { reason: message }),
        Err(err) => Err(ClientError::Response {
            reason: format!("corrupt idempotency record: {err}"),
        }),
    }
}

fn now_epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

struct MemoryEntry {
    outcome: Value,
    expires_at: u64,
}

/// Bounded in-memory backend with per-entry TTL.
pub struct MemoryIdempotencyStore {
    ttl: Duration,
    inner: Mutex<LruCache<String, MemoryEntry>>,
}

impl MemoryIdempotencyStore {
    /// Creates a store retaining up to `capacity` outcomes for `ttl`.
    #[must_use]
    pub fn new(capacity: NonZeroUsize, ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn get(&self, fingerprint: &str) -> Option<Value> {
        let mut guard = self.inner.lock().expect("idempotency cache poisoned");
        match guard.get(fingerprint) {
            Some(entry) if entry.expires_at > now_epoch_seconds() => Some(entry.outcome.clone()),
            Some(_) => {
                guard.pop(fingerprint);
                None
            }
            None => None,
        }
    }

    async fn put(&self, fingerprint: &str, outcome: Value) {
        let entry = MemoryEntry {
            outcome,
            expires_at: now_epoch_seconds() + self.ttl.as_secs(),
        };
        self.inner
            .lock()
            .expect("idempotency cache poisoned")
            .put(fingerprint.to_owned(), entry);
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FileEntry {
    key: String,
    outcome: Value,
    expires_at: u64,
}

/// Durable key-value backend: newline-delimited JSON, append-on-write.
///
/// Multiple workers may share one file through their own handles; the last
/// appended record for a key wins on reload.
pub struct FileIdempotencyStore {
    path: PathBuf,
    ttl: Duration,
    file: tokio::sync::Mutex<tokio::fs::File>,
    index: Mutex<HashMap<String, (Value, u64)>>,
}

impl FileIdempotencyStore {
    /// Opens (or creates) the backing file and loads the live records.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Configuration`] when the file cannot be
    /// opened or an existing record cannot be parsed.
    pub async fn open(path: impl Into<PathBuf>, ttl: Duration) -> ClientResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| ClientError::configuration(err.to_string()))?;
        }

        let mut index = HashMap::new();
        match fs::read(&path).await {
            Ok(data) => {
                let now = now_epoch_seconds();
                for chunk in data
                    .split(|byte| *byte == b'\n')
                    .filter(|chunk| !chunk.is_empty())
                {
                    let entry: FileEntry = serde_json::from_slice(chunk).map_err(|err| {
                        ClientError::configuration(format!("corrupt idempotency file: {err}"))
                    })?;
                    if entry.expires_at > now {
                        index.insert(entry.key, (entry.outcome, entry.expires_at));
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(ClientError::configuration(err.to_string())),
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|err| ClientError::configuration(err.to_string()))?;

        Ok(Self {
            path,
            ttl,
            file: tokio::sync::Mutex::new(file),
            index: Mutex::new(index),
        })
    }

    /// Returns the backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl IdempotencyStore for FileIdempotencyStore {
    async fn get(&self, fingerprint: &str) -> Option<Value> {
        let guard = self.index.lock().expect("idempotency index poisoned");
        guard.get(fingerprint).and_then(|(outcome, expires_at)| {
            (*expires_at > now_epoch_seconds()).then(|| outcome.clone())
        })
    }

    async fn put(&self, fingerprint: &str, outcome: Value) {
        let expires_at = now_epoch_seconds() + self.ttl.as_secs();
        let entry = FileEntry {
            key: fingerprint.to_owned(),
            outcome: outcome.clone(),
            expires_at,
        };

        {
            let mut guard = self.index.lock().expect("idempotency index poisoned");
            guard.insert(fingerprint.to_owned(), (outcome, expires_at));
        }

        if let Ok(line) = serde_json::to_vec(&entry) {
            let mut file = self.file.lock().await;
            let _ = file.write_all(&line).await;
            let _ = file.write_u8(b'\n').await;
            let _ = file.flush().await;
        }
    }
}
