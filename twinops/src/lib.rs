//! TwinOps runtime facade.
//!
//! Depend on this crate via `cargo add twinops`. It bundles the internal
//! runtime crates behind feature flags so deployments can drop what they do
//! not need (e.g. the LLM adapters on an air-gapped plant).

#![warn(missing_docs, clippy::pedantic)]

/// Re-export shared primitives for convenience.
pub use twin_primitives as primitives;

/// Signed-policy model and store (enabled by `policy` feature).
#[cfg(feature = "policy")]
pub use twin_policy as policy;

/// Hash-chained audit log (enabled by `audit` feature).
#[cfg(feature = "audit")]
pub use twin_audit as audit;

/// Shadow Twin projection and MQTT feed (enabled by `shadow` feature).
#[cfg(feature = "shadow")]
pub use twin_shadow as shadow;

/// AAS and Operation Service client (enabled by `client` feature).
#[cfg(feature = "client")]
pub use twin_client as client;

/// Tool-selector adapters (enabled by `adapters` feature).
#[cfg(feature = "adapters")]
pub use twin_adapters as adapters;

/// Safety kernel and orchestrator (enabled by `kernel` feature).
#[cfg(feature = "kernel")]
pub use twin_kernel as kernel;

/// Environment configuration (enabled by `config` feature).
#[cfg(feature = "config")]
pub use twin_config as config;
