//! Audit record and sealed entry types.

use serde::{Deserialize, Serialize};
use twin_primitives::TaskId;

/// Kind of transition being recorded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    /// A tool call entered the kernel pipeline.
    Proposed,
    /// The kernel refused the call.
    Denied,
    /// The call ran as a simulation only.
    Simulated,
    /// The call was parked awaiting human approval.
    PendingApproval,
    /// A pending task was approved.
    Approved,
    /// A pending task was rejected.
    Rejected,
    /// The call executed against the live asset.
    Executed,
    /// Execution was attempted and failed.
    ExecFailed,
}

/// Unsealed audit record supplied by the kernel.
///
/// The writer assigns `seq`, `ts`, `prev_hash`, and `hash` when the record is
/// appended; everything the caller knows goes in here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    actor: String,
    roles: Vec<String>,
    event: AuditEvent,
    tool: String,
    args_digest: String,
    decision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    approved_task_id: Option<TaskId>,
}

impl AuditRecord {
    /// Creates a record for the supplied transition.
    #[must_use]
    pub fn new(
        event: AuditEvent,
        actor: impl Into<String>,
        roles: Vec<String>,
        tool: impl Into<String>,
        args_digest: impl Into<String>,
        decision: impl Into<String>,
    ) -> Self {
        Self {
            actor: actor.into(),
            roles,
            event,
            tool: tool.into(),
            args_digest: args_digest.into(),
            decision: decision.into(),
            result_digest: None,
            details: None,
            approved_task_id: None,
        }
    }

    /// Attaches the digest of the execution result.
    #[must_use]
    pub fn with_result_digest(mut self, digest: impl Into<String>) -> Self {
        self.result_digest = Some(digest.into());
        self
    }

    /// Attaches free-form diagnostic details (e.g. interlock warnings).
    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Links the record to the approval task that authorized it.
    #[must_use]
    pub const fn with_approved_task(mut self, task_id: TaskId) -> Self {
        self.approved_task_id = Some(task_id);
        self
    }

    /// Returns the recorded event kind.
    #[must_use]
    pub const fn event(&self) -> AuditEvent {
        self.event
    }

    /// Returns the acting principal.
    #[must_use]
    pub fn actor(&self) -> &str {
        &self.actor
    }

    /// Returns the tool name the record concerns.
    #[must_use]
    pub fn tool(&self) -> &str {
        &self.tool
    }
}

/// A sealed, chain-linked audit entry as persisted on disk.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Monotone sequence number, starting at zero.
    pub seq: u64,
    /// RFC 3339 timestamp assigned at append time.
    pub ts: String,
    /// Acting principal.
    pub actor: String,
    /// Roles the principal presented.
    pub roles: Vec<String>,
    /// Transition kind.
    pub event: AuditEvent,
    /// Tool name.
    pub tool: String,
    /// Digest of the call arguments.
    pub args_digest: String,
    /// Decision code string.
    pub decision: String,
    /// Digest of the execution result, when one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_digest: Option<String>,
    /// Diagnostic details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Approval task that authorized this execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_task_id: Option<TaskId>,
    /// Hash of the preceding entry (64 hex zeros for the first entry).
    pub prev_hash: String,
    /// SHA-256 over `prev_hash` and this entry's canonical JSON sans `hash`.
    pub hash: String,
}

impl AuditEntry {
    pub(crate) fn from_record(record: AuditRecord, seq: u64, ts: String, prev_hash: String) -> Self {
        Self {
            seq,
            ts,
            actor: record.actor,
            roles: record.roles,
            event: record.event,
            tool: record.tool,
            args_digest: record.args_digest,
            decision: record.decision,
            result_digest: record.result_digest,
            details: record.details,
            approved_task_id: record.approved_task_id,
            prev_hash,
            hash: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_snake_case() {
        let json = serde_json::to_string(&AuditEvent::PendingApproval).unwrap();
        assert_eq!(json, "\"pending_approval\"");
        let json = serde_json::to_string(&AuditEvent::ExecFailed).unwrap();
        assert_eq!(json, "\"exec_failed\"");
    }

    #[test]
    fn record_builders_attach_optional_fields() {
        let task = TaskId::random();
        let record = AuditRecord::new(
            AuditEvent::Executed,
            "supervisor",
            vec!["maintenance".into()],
            "EmergencyStop",
            "d".repeat(64),
            "execute",
        )
        .with_result_digest("e".repeat(64))
        .with_approved_task(task);

        assert_eq!(record.event(), AuditEvent::Executed);
        assert_eq!(record.actor(), "supervisor");
        assert_eq!(record.approved_task_id, Some(task));
    }
}
