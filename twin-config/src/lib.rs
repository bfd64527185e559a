//! Environment-driven configuration.
//!
//! Every knob lives under the `TWINOPS_` prefix. Malformed values are
//! configuration errors, never silent defaults; missing optional values
//! fall back to the documented defaults.

#![warn(missing_docs, clippy::pedantic)]

use std::path::PathBuf;
use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use thiserror::Error;
use tracing::debug;

/// Result alias for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors produced while loading configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A required variable is absent.
    #[error("missing required configuration `{key}`")]
    Missing {
        /// The environment variable name.
        key: String,
    },

    /// A variable is present but unusable.
    #[error("invalid configuration `{key}`: {reason}")]
    Invalid {
        /// The environment variable name.
        key: String,
        /// Why the value was rejected.
        reason: String,
    },
}

/// Twin identity and endpoints.
#[derive(Clone, Debug)]
pub struct TwinSection {
    /// AAS repository base URL.
    pub base_url: String,
    /// Operation Service base URL for delegated jobs.
    pub opservice_url: Option<String>,
    /// Asset Administration Shell identifier.
    pub aas_id: String,
    /// Repository identifier (MQTT namespace segment).
    pub repo_id: String,
}

/// MQTT broker settings for the shadow feed.
#[derive(Clone, Debug)]
pub struct MqttSection {
    /// Broker hostname.
    pub broker_host: String,
    /// Broker port.
    pub broker_port: u16,
}

/// Signed-policy store settings.
#[derive(Clone, Debug)]
pub struct PolicySection {
    /// Submodel holding the policy element.
    pub submodel: String,
    /// Path of the policy element within the submodel.
    pub path: String,
    /// Trusted Ed25519 public key (raw 32 bytes).
    pub public_key: [u8; 32],
    /// Cache TTL for the verified policy.
    pub cache_ttl: Duration,
    /// Hard ceiling on policy age, when set.
    pub max_age: Option<Duration>,
}

/// Twin-client reliability settings.
#[derive(Clone, Debug)]
pub struct ClientSection {
    /// Bound on in-flight calls per client.
    pub max_concurrency: usize,
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// Open interval before half-open probing.
    pub recovery_timeout: Duration,
    /// Concurrent half-open probes.
    pub half_open_max_calls: u32,
    /// Per-call execution deadline.
    pub execution_timeout: Duration,
    /// Maximum invocation attempts (including the first).
    pub retry_max_attempts: u32,
    /// Base retry backoff.
    pub retry_base_delay: Duration,
    /// Retry backoff ceiling.
    pub retry_max_delay: Duration,
    /// Delegated-job polling ceiling.
    pub job_poll_max_interval: Duration,
    /// Idempotency record TTL.
    pub idempotency_ttl: Duration,
    /// Shared secret for Operation Service request signing.
    pub hmac_secret: Option<String>,
    /// Acceptance window for signed requests.
    pub hmac_ttl: Duration,
}

/// Orchestration settings.
#[derive(Clone, Debug)]
pub struct OrchestratorSection {
    /// Selected tool-selector provider (`rules`, `anthropic`, `openai`).
    pub llm_provider: String,
    /// Bound on concurrently evaluated tool calls.
    pub tool_concurrency_limit: usize,
    /// Bound on in-flight LLM provider calls, shared across selectors.
    pub llm_concurrency_limit: usize,
    /// Per-request deadline.
    pub request_timeout: Duration,
}

/// Approval-gate settings.
#[derive(Clone, Debug)]
pub struct ApprovalSection {
    /// Pending-task TTL before expiry.
    pub ttl: Duration,
}

/// Audit-log settings.
#[derive(Clone, Debug)]
pub struct AuditSection {
    /// Audit log file path.
    pub log_path: PathBuf,
}

/// Full runtime configuration.
#[derive(Clone, Debug)]
pub struct TwinOpsConfig {
    /// Twin identity and endpoints.
    pub twin: TwinSection,
    /// MQTT broker settings.
    pub mqtt: MqttSection,
    /// Policy store settings.
    pub policy: PolicySection,
    /// Twin-client settings.
    pub client: ClientSection,
    /// Orchestrator settings.
    pub orchestrator: OrchestratorSection,
    /// Approval settings.
    pub approval: ApprovalSection,
    /// Audit settings.
    pub audit: AuditSection,
}

impl TwinOpsConfig {
    /// Loads configuration from process environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for missing required or malformed values.
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through an arbitrary lookup function. Exposed so
    /// tests can supply values without mutating the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for missing required or malformed values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<Self> {
        let env = Lookup { lookup };

        let config = Self {
            twin: TwinSection {
                base_url: env.required("TWINOPS_TWIN_BASE_URL")?,
                opservice_url: env.optional("TWINOPS_OPSERVICE_URL"),
                aas_id: env.required("TWINOPS_AAS_ID")?,
                repo_id: env.required("TWINOPS_REPO_ID")?,
            },
            mqtt: MqttSection {
                broker_host: env.string("TWINOPS_MQTT_BROKER_HOST", "localhost"),
                broker_port: env.parse("TWINOPS_MQTT_BROKER_PORT", 1883_u16)?,
            },
            policy: PolicySection {
                submodel: env.string("TWINOPS_POLICY_SUBMODEL", "CovenantTwin"),
                path: env.string("TWINOPS_POLICY_PATH", "SignedPolicy"),
                public_key: env.public_key("TWINOPS_POLICY_PUBLIC_KEY_B64")?,
                cache_ttl: env.seconds("TWINOPS_POLICY_CACHE_TTL_SECONDS", 30)?,
                max_age: env.optional_seconds("TWINOPS_POLICY_MAX_AGE_SECONDS")?,
            },
            client: ClientSection {
                max_concurrency: env.parse("TWINOPS_TWIN_CLIENT_MAX_CONCURRENCY", 8_usize)?,
                failure_threshold: env.parse("TWINOPS_TWIN_CLIENT_FAILURE_THRESHOLD", 5_u32)?,
                recovery_timeout: env.seconds("TWINOPS_TWIN_CLIENT_RECOVERY_TIMEOUT_SECONDS", 30)?,
                half_open_max_calls: env.parse("TWINOPS_TWIN_CLIENT_HALF_OPEN_MAX_CALLS", 1_u32)?,
                execution_timeout: env.seconds("TWINOPS_TOOL_EXECUTION_TIMEOUT_SECONDS", 30)?,
                retry_max_attempts: env.parse("TWINOPS_TOOL_RETRY_MAX_ATTEMPTS", 3_u32)?,
                retry_base_delay: env.millis("TWINOPS_TOOL_RETRY_BASE_DELAY_MS", 200)?,
                retry_max_delay: env.millis("TWINOPS_TOOL_RETRY_MAX_DELAY_MS", 5_000)?,
                job_poll_max_interval: env.millis("TWINOPS_JOB_POLL_MAX_INTERVAL_MS", 5_000)?,
                idempotency_ttl: env.seconds("TWINOPS_IDEMPOTENCY_TTL_SECONDS", 300)?,
                hmac_secret: env.optional("TWINOPS_OPSERVICE_HMAC_SECRET"),
                hmac_ttl: env.seconds("TWINOPS_OPSERVICE_HMAC_TTL_SECONDS", 60)?,
            },
            orchestrator: OrchestratorSection {
                llm_provider: env.string("TWINOPS_LLM_PROVIDER", "rules"),
                tool_concurrency_limit: env.parse("TWINOPS_TOOL_CONCURRENCY_LIMIT", 4_usize)?,
                llm_concurrency_limit: env.parse("TWINOPS_LLM_CONCURRENCY_LIMIT", 2_usize)?,
                request_timeout: env.seconds("TWINOPS_REQUEST_TIMEOUT_SECONDS", 60)?,
            },
            approval: ApprovalSection {
                ttl: env.seconds("TWINOPS_APPROVAL_TTL_SECONDS", 86_400)?,
            },
            audit: AuditSection {
                log_path: PathBuf::from(env.string("TWINOPS_AUDIT_LOG_PATH", "audit.jsonl")),
            },
        };

        debug!(
            base_url = %config.twin.base_url,
            provider = %config.orchestrator.llm_provider,
            "configuration loaded"
        );
        Ok(config)
    }
}

struct Lookup<F: Fn(&str) -> Option<String>> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Lookup<F> {
    fn optional(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|value| !value.trim().is_empty())
    }

    fn required(&self, key: &str) -> ConfigResult<String> {
        self.optional(key).ok_or_else(|| ConfigError::Missing {
            key: key.to_owned(),
        })
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_owned())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> ConfigResult<T>
    where
        T::Err: std::fmt::Display,
    {
        match self.optional(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|err| ConfigError::Invalid {
                key: key.to_owned(),
                reason: format!("{err}"),
            }),
        }
    }

    fn seconds(&self, key: &str, default: u64) -> ConfigResult<Duration> {
        Ok(Duration::from_secs(self.parse(key, default)?))
    }

    fn optional_seconds(&self, key: &str) -> ConfigResult<Option<Duration>> {
        match self.optional(key) {
            None => Ok(None),
            Some(raw) => {
                let seconds: u64 = raw.trim().parse().map_err(|err| ConfigError::Invalid {
                    key: key.to_owned(),
                    reason: format!("{err}"),
                })?;
                Ok(Some(Duration::from_secs(seconds)))
            }
        }
    }

    fn millis(&self, key: &str, default: u64) -> ConfigResult<Duration> {
        Ok(Duration::from_millis(self.parse(key, default)?))
    }

    fn public_key(&self, key: &str) -> ConfigResult<[u8; 32]> {
        let raw = self.required(key)?;
        let decoded = BASE64
            .decode(raw.trim())
            .map_err(|err| ConfigError::Invalid {
                key: key.to_owned(),
                reason: format!("not valid base64: {err}"),
            })?;
        decoded.try_into().map_err(|_| ConfigError::Invalid {
            key: key.to_owned(),
            reason: "public key must decode to exactly 32 bytes".to_owned(),
        })
    }
}
