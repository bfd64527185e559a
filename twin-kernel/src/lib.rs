//! The TwinOps Safety Kernel.
//!
//! Between the tool selector and the asset sits a five-layer decision
//! pipeline: authorize, interlock, simulation forcing, approval gating,
//! execution. Decisions are first-class values, every transition is written
//! to the hash-chained audit log, and the kernel fails closed whenever the
//! signed policy cannot be verified.

#![warn(missing_docs, clippy::pedantic)]

mod approval;
mod catalog;
mod decision;
mod kernel;
mod orchestrator;
#[cfg(test)]
mod test_support;

pub use approval::{ApprovalError, ApprovalState, ApprovalStore, ApprovalTask, Transition};
pub use catalog::{CatalogEntry, ToolCatalog};
pub use decision::{Decision, DenyCode};
pub use kernel::{ApprovalOutcome, InvokeError, OperationInvoker, SafetyKernel, TwinInvoker};
pub use orchestrator::{
    ChatReply, ChatRequest, Orchestrator, OrchestratorConfig, ToolReport,
};

use thiserror::Error;
use twin_primitives::TaskId;

/// Result alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

/// Errors emitted by kernel operations.
///
/// Policy refusals are *not* errors; they surface as [`Decision`] values.
/// Errors here mean the kernel itself could not do its job.
#[derive(Debug, Error)]
pub enum KernelError {
    /// A decision could not be recorded in the audit log.
    #[error(transparent)]
    Audit(#[from] twin_audit::AuditError),

    /// The referenced approval task does not exist.
    #[error("approval task `{task_id}` not found")]
    UnknownTask {
        /// The unknown identifier.
        task_id: TaskId,
    },

    /// The tool selector failed.
    #[error("tool selection failed: {reason}")]
    Selection {
        /// Human-readable explanation.
        reason: String,
    },
}
