//! Tool call and catalog schema types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::risk::RiskLevel;

/// A candidate tool invocation submitted to the safety kernel.
///
/// The `risk` field carries the schema-derived hint; the kernel resolves the
/// effective risk by consulting the policy's `operation_risk` map first and
/// falling back to this hint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    name: String,
    #[serde(default)]
    arguments: Value,
    #[serde(default)]
    risk: RiskLevel,
    #[serde(default)]
    requested_simulate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    idempotency_key: Option<String>,
}

impl ToolCall {
    /// Creates a call for the named operation with the supplied arguments.
    #[must_use]
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            name: name.into(),
            arguments,
            risk: RiskLevel::default(),
            requested_simulate: false,
            idempotency_key: None,
        }
    }

    /// Sets the schema-derived risk hint.
    #[must_use]
    pub const fn with_risk(mut self, risk: RiskLevel) -> Self {
        self.risk = risk;
        self
    }

    /// Marks the call as a caller-requested simulation.
    #[must_use]
    pub const fn with_requested_simulate(mut self, simulate: bool) -> Self {
        self.requested_simulate = simulate;
        self
    }

    /// Attaches a caller-supplied idempotency key.
    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Returns the operation name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the invocation arguments.
    #[must_use]
    pub const fn arguments(&self) -> &Value {
        &self.arguments
    }

    /// Returns the schema-derived risk hint.
    #[must_use]
    pub const fn risk(&self) -> RiskLevel {
        self.risk
    }

    /// Returns whether the caller asked for a simulated run.
    #[must_use]
    pub const fn requested_simulate(&self) -> bool {
        self.requested_simulate
    }

    /// Returns the idempotency key, if supplied.
    #[must_use]
    pub fn idempotency_key(&self) -> Option<&str> {
        self.idempotency_key.as_deref()
    }
}

/// Catalog entry describing an invocable operation to the tool selector.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    name: String,
    description: String,
    /// JSON Schema for the operation arguments.
    parameters: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    risk: Option<RiskLevel>,
    #[serde(default)]
    delegated: bool,
}

impl ToolSchema {
    /// Creates a schema entry for the named operation.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            risk: None,
            delegated: false,
        }
    }

    /// Annotates the operation with a risk hint.
    #[must_use]
    pub const fn with_risk(mut self, risk: RiskLevel) -> Self {
        self.risk = Some(risk);
        self
    }

    /// Marks the operation as delegated to the Operation Service.
    #[must_use]
    pub const fn delegated(mut self) -> Self {
        self.delegated = true;
        self
    }

    /// Returns the operation name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the human-readable description surfaced to the selector.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Returns the argument JSON Schema.
    #[must_use]
    pub const fn parameters(&self) -> &Value {
        &self.parameters
    }

    /// Returns the schema risk hint, if annotated.
    #[must_use]
    pub const fn risk(&self) -> Option<RiskLevel> {
        self.risk
    }

    /// Returns whether the operation runs through the Operation Service.
    #[must_use]
    pub const fn is_delegated(&self) -> bool {
        self.delegated
    }
}
