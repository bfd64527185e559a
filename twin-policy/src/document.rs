//! Policy document model and predicate evaluation.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use twin_primitives::RiskLevel;

/// Operations a role is allowed to invoke. `"*"` grants everything.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleBinding {
    #[serde(default)]
    allow: BTreeSet<String>,
}

impl RoleBinding {
    /// Creates a binding allowing the supplied operation names.
    #[must_use]
    pub fn new<I, S>(allow: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allow: allow.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns whether this binding allows the named operation.
    #[must_use]
    pub fn allows(&self, operation: &str) -> bool {
        self.allow.contains(operation) || self.allow.contains("*")
    }

    /// Returns whether this binding carries the `"*"` wildcard.
    #[must_use]
    pub fn allows_everything(&self) -> bool {
        self.allow.contains("*")
    }
}

/// Comparison operator inside an interlock predicate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterlockOp {
    /// Strictly greater than.
    #[serde(rename = ">")]
    Gt,
    /// Strictly less than.
    #[serde(rename = "<")]
    Lt,
    /// Greater than or equal.
    #[serde(rename = ">=")]
    Ge,
    /// Less than or equal.
    #[serde(rename = "<=")]
    Le,
    /// JSON equality.
    #[serde(rename = "==")]
    Eq,
    /// JSON inequality.
    #[serde(rename = "!=")]
    Ne,
}

/// Predicate over one shadow value; the interlock denies when it holds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InterlockCondition {
    /// Submodel the observed value lives in.
    pub submodel: String,
    /// Path of the element within the submodel.
    pub path: String,
    /// Comparison operator.
    pub op: InterlockOp,
    /// Threshold or expected value.
    pub value: Value,
}

impl InterlockCondition {
    /// Evaluates the predicate against an observed value.
    ///
    /// Ordering comparisons are numeric when both sides parse as numbers and
    /// fall back to string comparison otherwise; `==`/`!=` use JSON
    /// equality.
    #[must_use]
    pub fn holds(&self, observed: &Value) -> bool {
        match self.op {
            InterlockOp::Eq => observed == &self.value,
            InterlockOp::Ne => observed != &self.value,
            op => match (as_number(observed), as_number(&self.value)) {
                (Some(lhs), Some(rhs)) => compare_f64(op, lhs, rhs),
                _ => compare_str(op, &as_string(observed), &as_string(&self.value)),
            },
        }
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn as_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn compare_f64(op: InterlockOp, lhs: f64, rhs: f64) -> bool {
    match op {
        InterlockOp::Gt => lhs > rhs,
        InterlockOp::Lt => lhs < rhs,
        InterlockOp::Ge => lhs >= rhs,
        InterlockOp::Le => lhs <= rhs,
        InterlockOp::Eq | InterlockOp::Ne => unreachable!("handled via JSON equality"),
    }
}

fn compare_str(op: InterlockOp, lhs: &str, rhs: &str) -> bool {
    match op {
        InterlockOp::Gt => lhs > rhs,
        InterlockOp::Lt => lhs < rhs,
        InterlockOp::Ge => lhs >= rhs,
        InterlockOp::Le => lhs <= rhs,
        InterlockOp::Eq | InterlockOp::Ne => unreachable!("handled via JSON equality"),
    }
}

/// A named state interlock.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Interlock {
    /// Stable identifier surfaced in denial reasons and audit entries.
    pub id: String,
    /// Predicate that blocks execution when true.
    pub deny_when: InterlockCondition,
    /// Operator-facing message explaining the block.
    pub message: String,
}

/// The verified safety policy the kernel evaluates against.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolicyDocument {
    /// Risk threshold at which execution is forced into simulation.
    pub require_simulation_for_risk: RiskLevel,
    /// Risk threshold at which execution requires human approval.
    pub require_approval_for_risk: RiskLevel,
    /// Role name to allowed-operation bindings.
    #[serde(default)]
    pub role_bindings: BTreeMap<String, RoleBinding>,
    /// State interlocks, evaluated in order.
    #[serde(default)]
    pub interlocks: Vec<Interlock>,
    /// Per-operation risk overrides; these win over schema hints.
    #[serde(default)]
    pub operation_risk: BTreeMap<String, RiskLevel>,
    /// Roles allowed to resolve approval tasks. When empty, any role whose
    /// binding carries the `"*"` wildcard may approve.
    #[serde(default)]
    pub approver_roles: Vec<String>,
}

impl PolicyDocument {
    /// Returns whether any of the supplied roles may invoke the operation.
    #[must_use]
    pub fn allows(&self, roles: &[String], operation: &str) -> bool {
        roles.iter().any(|role| {
            self.role_bindings
                .get(role)
                .is_some_and(|binding| binding.allows(operation))
        })
    }

    /// Returns the policy risk override for an operation, if present.
    #[must_use]
    pub fn risk_for(&self, operation: &str) -> Option<RiskLevel> {
        self.operation_risk.get(operation).copied()
    }

    /// Returns whether any of the supplied roles may approve pending tasks.
    #[must_use]
    pub fn can_approve(&self, roles: &[String]) -> bool {
        if self.approver_roles.is_empty() {
            return roles.iter().any(|role| {
                self.role_bindings
                    .get(role)
                    .is_some_and(RoleBinding::allows_everything)
            });
        }
        roles.iter().any(|role| self.approver_roles.contains(role))
    }

    /// Returns the interlocks in evaluation order.
    #[must_use]
    pub fn interlocks(&self) -> &[Interlock] {
        &self.interlocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn document() -> PolicyDocument {
        PolicyDocument {
            require_simulation_for_risk: RiskLevel::High,
            require_approval_for_risk: RiskLevel::Critical,
            role_bindings: BTreeMap::from([
                ("viewer".to_owned(), RoleBinding::new(["GetStatus"])),
                ("operator".to_owned(), RoleBinding::new(["GetStatus", "StartPump", "SetSpeed"])),
                ("maintenance".to_owned(), RoleBinding::new(["*"])),
            ]),
            interlocks: vec![Interlock {
                id: "temp-high".into(),
                deny_when: InterlockCondition {
                    submodel: "TelemetryData".into(),
                    path: "CurrentTemperature".into(),
                    op: InterlockOp::Gt,
                    value: json!(95),
                },
                message: "temperature too high".into(),
            }],
            operation_risk: BTreeMap::from([("EmergencyStop".to_owned(), RiskLevel::Critical)]),
            approver_roles: Vec::new(),
        }
    }

    #[test]
    fn rbac_honours_exact_and_wildcard() {
        let policy = document();
        assert!(policy.allows(&["operator".into()], "StartPump"));
        assert!(!policy.allows(&["viewer".into()], "StartPump"));
        assert!(policy.allows(&["maintenance".into()], "anything-at-all"));
        assert!(!policy.allows(&["unknown-role".into()], "GetStatus"));
    }

    #[test]
    fn wildcard_roles_approve_when_no_explicit_approvers() {
        let policy = document();
        assert!(policy.can_approve(&["maintenance".into()]));
        assert!(!policy.can_approve(&["operator".into()]));
    }

    #[test]
    fn explicit_approver_roles_take_over() {
        let mut policy = document();
        policy.approver_roles = vec!["shift-lead".into()];
        assert!(policy.can_approve(&["shift-lead".into()]));
        assert!(!policy.can_approve(&["maintenance".into()]));
    }

    #[test]
    fn numeric_comparison_when_both_sides_parse() {
        let condition = InterlockCondition {
            submodel: "TelemetryData".into(),
            path: "CurrentTemperature".into(),
            op: InterlockOp::Gt,
            value: json!(95),
        };
        assert!(condition.holds(&json!(97)));
        assert!(condition.holds(&json!("96.5")));
        assert!(!condition.holds(&json!(95)));
    }

    #[test]
    fn string_comparison_otherwise() {
        let condition = InterlockCondition {
            submodel: "OperationalData".into(),
            path: "Mode".into(),
            op: InterlockOp::Ge,
            value: json!("manual"),
        };
        assert!(condition.holds(&json!("service")));
        assert!(!condition.holds(&json!("auto")));
    }

    #[test]
    fn equality_is_json_typed() {
        let condition = InterlockCondition {
            submodel: "OperationalData".into(),
            path: "PumpState".into(),
            op: InterlockOp::Eq,
            value: json!("Running"),
        };
        assert!(condition.holds(&json!("Running")));
        assert!(!condition.holds(&json!("Stopped")));
        // "97" (string) is not JSON-equal to 97 (number).
        let numeric = InterlockCondition {
            submodel: "t".into(),
            path: "p".into(),
            op: InterlockOp::Ne,
            value: json!(97),
        };
        assert!(numeric.holds(&json!("97")));
    }

    #[test]
    fn risk_override_lookup() {
        let policy = document();
        assert_eq!(policy.risk_for("EmergencyStop"), Some(RiskLevel::Critical));
        assert_eq!(policy.risk_for("GetStatus"), None);
    }
}
