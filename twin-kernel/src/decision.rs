//! First-class decision values.
//!
//! The kernel produces exactly one [`Decision`] per submitted call. Denials
//! are data, not errors: expected paths like RBAC and interlock blocks flow
//! back to the caller as values that tests assert on directly.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use twin_primitives::{TaskId, canon};

/// Stable denial codes surfaced in replies and audit entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyCode {
    /// No currently verified policy; deny-by-default.
    PolicyUnverified,
    /// The verified policy exceeded its maximum age.
    PolicyStale,
    /// No presented role allows the operation.
    RoleUnauthorized,
    /// A state interlock blocked the operation.
    InterlockTriggered,
    /// The requester attempted to approve their own task.
    SelfApproval,
    /// The operation requires an approval that has not been granted.
    ApprovalRequired,
    /// The execution deadline elapsed.
    ExecutionTimeout,
    /// The invocation reached the asset and failed, or was cancelled.
    ExecutionFailed,
    /// The endpoint breaker rejected the call.
    CircuitOpen,
    /// Transport to the asset failed after retries.
    TransportFailure,
    /// The request could not be interpreted.
    MalformedInput,
}

impl DenyCode {
    /// Returns the stable snake_case code string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PolicyUnverified => "policy_unverified",
            Self::PolicyStale => "policy_stale",
            Self::RoleUnauthorized => "role_unauthorized",
            Self::InterlockTriggered => "interlock_triggered",
            Self::SelfApproval => "self_approval",
            Self::ApprovalRequired => "approval_required",
            Self::ExecutionTimeout => "execution_timeout",
            Self::ExecutionFailed => "execution_failed",
            Self::CircuitOpen => "circuit_open",
            Self::TransportFailure => "transport_failure",
            Self::MalformedInput => "malformed_input",
        }
    }
}

impl std::fmt::Display for DenyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one kernel submission.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Decision {
    /// The call executed against the live asset.
    Executed {
        /// Result returned by the invocation.
        result: Value,
        /// SHA-256 digest of the canonical result.
        result_digest: String,
    },
    /// The call ran in simulation only.
    Simulated {
        /// Result returned by the simulated invocation.
        result: Value,
        /// SHA-256 digest of the canonical result.
        result_digest: String,
    },
    /// The call was refused.
    Denied {
        /// Stable code for UIs to branch on.
        code: DenyCode,
        /// Human-readable reason.
        reason: String,
    },
    /// The call awaits human approval.
    PendingApproval {
        /// Identifier of the created approval task.
        task_id: TaskId,
    },
}

impl Decision {
    /// Creates an executed decision, digesting the result.
    #[must_use]
    pub fn executed(result: Value) -> Self {
        let result_digest = canon::digest_value(&result).unwrap_or_default();
        Self::Executed {
            result,
            result_digest,
        }
    }

    /// Creates a simulated decision, digesting the result.
    #[must_use]
    pub fn simulated(result: Value) -> Self {
        let result_digest = canon::digest_value(&result).unwrap_or_default();
        Self::Simulated {
            result,
            result_digest,
        }
    }

    /// Creates a denial with the supplied code and reason.
    #[must_use]
    pub fn denied(code: DenyCode, reason: impl Into<String>) -> Self {
        Self::Denied {
            code,
            reason: reason.into(),
        }
    }

    /// Creates a pending-approval decision.
    #[must_use]
    pub const fn pending(task_id: TaskId) -> Self {
        Self::PendingApproval { task_id }
    }

    /// Returns `true` when the call ran (live or simulated).
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Executed { .. } | Self::Simulated { .. })
    }

    /// Returns `true` for denials.
    #[must_use]
    pub const fn is_denied(&self) -> bool {
        matches!(self, Self::Denied { .. })
    }

    /// Returns `true` when the call is parked on an approval task.
    #[must_use]
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::PendingApproval { .. })
    }

    /// Returns the denial code, if this is a denial.
    #[must_use]
    pub const fn deny_code(&self) -> Option<DenyCode> {
        match self {
            Self::Denied { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Returns the decision string recorded in audit entries.
    #[must_use]
    pub fn audit_label(&self) -> String {
        match self {
            Self::Executed { .. } => "execute".to_owned(),
            Self::Simulated { .. } => "simulate".to_owned(),
            Self::Denied { code, .. } => format!("deny:{code}"),
            Self::PendingApproval { task_id } => format!("pending_approval:{task_id}"),
        }
    }
}
