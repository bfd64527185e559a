//! Pending-approval task store.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use twin_primitives::{TaskId, ToolCall};

/// Lifecycle state of an approval task. Terminal states are immutable.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ApprovalState {
    /// Awaiting a decision.
    Pending,
    /// Approved; the call was (re)submitted for execution.
    Approved {
        /// Approving actor.
        by: String,
        /// RFC 3339 approval time.
        at: String,
    },
    /// Rejected with a reason.
    Rejected {
        /// Rejecting actor.
        by: String,
        /// Reason given by the approver.
        reason: String,
        /// RFC 3339 rejection time.
        at: String,
    },
    /// The task aged out before anyone resolved it.
    Expired,
}

impl ApprovalState {
    /// Returns `true` for terminal states.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// One parked CRITICAL call awaiting a human decision.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApprovalTask {
    /// Unique task identifier.
    pub task_id: TaskId,
    /// The call as originally submitted.
    pub call: ToolCall,
    /// Actor that submitted the call.
    pub requester_actor: String,
    /// Roles the requester presented.
    pub requester_roles: Vec<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Current lifecycle state.
    pub state: ApprovalState,
}

/// Result of an approve/reject attempt.
#[derive(Clone, Debug, PartialEq)]
pub enum Transition {
    /// The state change was applied now.
    Applied(ApprovalTask),
    /// The task was already terminal; the recorded outcome is returned
    /// unchanged (approve/reject are idempotent).
    AlreadyResolved(ApprovalTask),
}

/// Errors from approval-state transitions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApprovalError {
    /// No task with the supplied identifier exists.
    #[error("approval task `{task_id}` not found")]
    NotFound {
        /// The unknown identifier.
        task_id: TaskId,
    },

    /// The requester attempted to approve their own task.
    #[error("approval task `{task_id}` cannot be approved by its requester")]
    SelfApproval {
        /// The affected task.
        task_id: TaskId,
    },
}

/// In-memory map of pending tasks with single-writer transitions per task.
///
/// The store is deliberately passive: it never calls back into the kernel.
/// The kernel drives approve → re-execute itself, which keeps the
/// orchestrator → kernel → store dependency chain acyclic.
pub struct ApprovalStore {
    ttl: Duration,
    inner: Mutex<HashMap<TaskId, ApprovalTask>>,
}

impl ApprovalStore {
    /// Creates a store expiring pending tasks after `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Parks a call, returning the created task.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock has been poisoned.
    pub fn create(&self, call: ToolCall, requester_actor: &str, requester_roles: &[String]) -> ApprovalTask {
        let task = ApprovalTask {
            task_id: TaskId::random(),
            call,
            requester_actor: requester_actor.to_owned(),
            requester_roles: requester_roles.to_vec(),
            created_at: Utc::now(),
            state: ApprovalState::Pending,
        };

        info!(task_id = %task.task_id, tool = task.call.name(), "approval task created");
        self.inner
            .lock()
            .expect("approval store poisoned")
            .insert(task.task_id, task.clone());
        task
    }

    /// Returns a copy of the task, expiring it first if overdue.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock has been poisoned.
    #[must_use]
    pub fn get(&self, task_id: TaskId) -> Option<ApprovalTask> {
        let mut guard = self.inner.lock().expect("approval store poisoned");
        let task = guard.get_mut(&task_id)?;
        expire_if_overdue(task, self.ttl);
        Some(task.clone())
    }

    /// Lists tasks currently pending, oldest first.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock has been poisoned.
    #[must_use]
    pub fn list_pending(&self) -> Vec<ApprovalTask> {
        let mut guard = self.inner.lock().expect("approval store poisoned");
        let mut pending: Vec<ApprovalTask> = guard
            .values_mut()
            .map(|task| {
                expire_if_overdue(task, self.ttl);
                task.clone()
            })
            .filter(|task| task.state == ApprovalState::Pending)
            .collect();
        pending.sort_by_key(|task| task.created_at);
        pending
    }

    /// Transitions a pending task to approved.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::NotFound`] for unknown tasks and
    /// [`ApprovalError::SelfApproval`] when `approver` is the requester (the
    /// task stays pending).
    ///
    /// # Panics
    ///
    /// Panics if the internal lock has been poisoned.
    pub fn approve(&self, task_id: TaskId, approver: &str) -> Result<Transition, ApprovalError> {
        let mut guard = self.inner.lock().expect("approval store poisoned");
        let task = guard
            .get_mut(&task_id)
            .ok_or(ApprovalError::NotFound { task_id })?;

        expire_if_overdue(task, self.ttl);
        if task.state.is_terminal() {
            return Ok(Transition::AlreadyResolved(task.clone()));
        }
        if task.requester_actor == approver {
            return Err(ApprovalError::SelfApproval { task_id });
        }

        task.state = ApprovalState::Approved {
            by: approver.to_owned(),
            at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        info!(task_id = %task_id, approver, "approval task approved");
        Ok(Transition::Applied(task.clone()))
    }

    /// Transitions a pending task to rejected.
    ///
    /// # Errors
    ///
    /// Returns [`ApprovalError::NotFound`] for unknown tasks.
    ///
    /// # Panics
    ///
    /// Panics if the internal lock has been poisoned.
    pub fn reject(
        &self,
        task_id: TaskId,
        approver: &str,
        reason: &str,
    ) -> Result<Transition, ApprovalError> {
        let mut guard = self.inner.lock().expect("approval store poisoned");
        let task = guard
            .get_mut(&task_id)
            .ok_or(ApprovalError::NotFound { task_id })?;

        expire_if_overdue(task, self.ttl);
        if task.state.is_terminal() {
            return Ok(Transition::AlreadyResolved(task.clone()));
        }

        task.state = ApprovalState::Rejected {
            by: approver.to_owned(),
            reason: reason.to_owned(),
            at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };
        info!(task_id = %task_id, approver, reason, "approval task rejected");
        Ok(Transition::Applied(task.clone()))
    }
}

fn expire_if_overdue(task: &mut ApprovalTask, ttl: Duration) {
    if task.state != ApprovalState::Pending {
        return;
    }
    let age = Utc::now().signed_duration_since(task.created_at);
    if age.to_std().is_ok_and(|age| age > ttl) {
        info!(task_id = %task.task_id, "approval task expired");
        task.state = ApprovalState::Expired;
    }
}
