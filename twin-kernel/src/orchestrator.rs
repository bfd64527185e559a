//! Per-request orchestration loop.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::{Instant, timeout};
use tracing::{debug, info};

use twin_adapters::{SelectedCall, ToolSelector};
use twin_primitives::{TaskId, ToolCall};

use crate::catalog::ToolCatalog;
use crate::decision::Decision;
use crate::kernel::SafetyKernel;
use crate::{KernelError, KernelResult};

/// Request envelope handed in by the HTTP front-end.
#[derive(Clone, Debug, Deserialize)]
pub struct ChatRequest {
    /// Operator's natural-language command.
    pub message: String,
    /// Acting principal.
    pub actor: String,
    /// Roles the principal presented.
    pub roles: Vec<String>,
    /// Caller-requested simulation.
    #[serde(default)]
    pub simulate: Option<bool>,
    /// Caller-supplied idempotency key.
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// Outcome of one tool call within a request.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ToolReport {
    /// Tool name.
    pub tool: String,
    /// Whether the call ran (live or simulated).
    pub success: bool,
    /// Whether the run was simulation-only.
    pub simulated: bool,
    /// Status label: `executed`, `simulated_only`, `denied`,
    /// `pending_approval`, or `cancelled`.
    pub status: String,
    /// Result value for successful runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Stable error code for refusals and failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Human-readable explanation accompanying `error`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Reply envelope returned to the front-end.
#[derive(Clone, Debug, Serialize)]
pub struct ChatReply {
    /// Operator-facing summary text.
    pub reply: String,
    /// Per-call outcomes in execution order.
    pub tool_results: Vec<ToolReport>,
    /// Whether a call is parked awaiting approval.
    pub pending_approval: bool,
    /// Identifier of the pending task, when one exists.
    pub task_id: Option<TaskId>,
}

/// Orchestrator limits.
#[derive(Clone, Copy, Debug)]
pub struct OrchestratorConfig {
    concurrency_limit: usize,
    request_timeout: Duration,
}

impl OrchestratorConfig {
    /// Creates a configuration with the supplied limits.
    #[must_use]
    pub const fn new(concurrency_limit: usize, request_timeout: Duration) -> Self {
        Self {
            concurrency_limit,
            request_timeout,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::new(4, Duration::from_secs(60))
    }
}

/// Sequences one chat request through selection and the kernel.
///
/// Calls execute in selector order; the first non-execute outcome stops the
/// remainder so a partially denied plan never leaves stray side effects.
pub struct Orchestrator {
    selector: Arc<dyn ToolSelector>,
    kernel: Arc<SafetyKernel>,
    catalog: Arc<ToolCatalog>,
    limiter: Arc<Semaphore>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// Wires the orchestrator to its collaborators.
    #[must_use]
    pub fn new(
        selector: Arc<dyn ToolSelector>,
        kernel: Arc<SafetyKernel>,
        catalog: Arc<ToolCatalog>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            selector,
            kernel,
            catalog,
            limiter: Arc::new(Semaphore::new(config.concurrency_limit)),
            config,
        }
    }

    /// Handles one request end to end.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Selection`] when the selector fails and
    /// propagates kernel errors (audit failures).
    pub async fn handle(&self, request: ChatRequest) -> KernelResult<ChatReply> {
        let started = Instant::now();
        let schemas = self.catalog.schemas();
        let selected = self
            .selector
            .select(&request.message, &schemas)
            .await
            .map_err(|err| KernelError::Selection {
                reason: err.to_string(),
            })?;

        info!(
            actor = %request.actor,
            calls = selected.len(),
            "selection complete"
        );

        if selected.is_empty() {
            return Ok(ChatReply {
                reply: "No actionable command was recognized.".to_owned(),
                tool_results: Vec::new(),
                pending_approval: false,
                task_id: None,
            });
        }

        let mut reports = Vec::new();
        let mut pending_task = None;

        for selected_call in selected {
            let call = self.to_tool_call(&selected_call, &request);

            let remaining = self
                .config
                .request_timeout
                .saturating_sub(started.elapsed());

            let permit = self
                .limiter
                .acquire()
                .await
                .expect("orchestrator limiter closed");
            let submitted = timeout(
                remaining,
                self.kernel.submit(&call, &request.actor, &request.roles),
            )
            .await;
            drop(permit);

            let decision = match submitted {
                Ok(decision) => decision?,
                Err(_) => {
                    debug!(tool = call.name(), "request deadline exceeded; cancelling");
                    let decision = self
                        .kernel
                        .cancel(&call, &request.actor, &request.roles)
                        .await?;
                    reports.push(report_for(call.name(), &decision, true));
                    break;
                }
            };

            let stop = !decision.is_success();
            if let Decision::PendingApproval { task_id } = &decision {
                pending_task = Some(*task_id);
            }
            reports.push(report_for(call.name(), &decision, false));

            if stop {
                break;
            }
        }

        Ok(ChatReply {
            reply: summarize(&reports, pending_task),
            pending_approval: pending_task.is_some(),
            task_id: pending_task,
            tool_results: reports,
        })
    }

    fn to_tool_call(&self, selected: &SelectedCall, request: &ChatRequest) -> ToolCall {
        let mut call = ToolCall::new(selected.name(), selected.arguments().clone())
            .with_requested_simulate(request.simulate.unwrap_or(false));
        if let Some(risk) = self.catalog.risk_hint(selected.name()) {
            call = call.with_risk(risk);
        }
        if let Some(key) = &request.idempotency_key {
            call = call.with_idempotency_key(key.clone());
        }
        call
    }
}

fn report_for(tool: &str, decision: &Decision, cancelled: bool) -> ToolReport {
    match decision {
        Decision::Executed { result, .. } => ToolReport {
            tool: tool.to_owned(),
            success: true,
            simulated: false,
            status: "executed".to_owned(),
            result: Some(result.clone()),
            error: None,
            reason: None,
        },
        Decision::Simulated { result, .. } => ToolReport {
            tool: tool.to_owned(),
            success: true,
            simulated: true,
            status: "simulated_only".to_owned(),
            result: Some(result.clone()),
            error: None,
            reason: None,
        },
        Decision::Denied { code, reason } => ToolReport {
            tool: tool.to_owned(),
            success: false,
            simulated: false,
            status: if cancelled { "cancelled" } else { "denied" }.to_owned(),
            result: None,
            error: Some(code.as_str().to_owned()),
            reason: Some(reason.clone()),
        },
        Decision::PendingApproval { .. } => ToolReport {
            tool: tool.to_owned(),
            success: false,
            simulated: false,
            status: "pending_approval".to_owned(),
            result: None,
            error: None,
            reason: Some("awaiting human approval".to_owned()),
        },
    }
}

fn summarize(reports: &[ToolReport], pending_task: Option<TaskId>) -> String {
    if let Some(task_id) = pending_task {
        return format!(
            "This operation requires human approval. Task `{task_id}` was created; a permitted \
             approver must resolve it."
        );
    }

    let lines: Vec<String> = reports
        .iter()
        .map(|report| match report.status.as_str() {
            "executed" => format!("`{}` executed.", report.tool),
            "simulated_only" => format!("`{}` was run in simulation only.", report.tool),
            "cancelled" => format!("`{}` was cancelled by the request deadline.", report.tool),
            _ => format!(
                "`{}` was denied: {}.",
                report.tool,
                report.reason.as_deref().unwrap_or("refused by policy")
            ),
        })
        .collect();
    lines.join(" ")
}
