//! The five-layer decision pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use twin_audit::{AuditEvent, AuditLog, AuditRecord};
use twin_client::{ClientError, TwinClient};
use twin_policy::{PolicyError, PolicyStore};
use twin_primitives::{TaskId, ToolCall, canon};
use twin_shadow::ShadowState;

use crate::approval::{ApprovalError, ApprovalState, ApprovalStore, Transition};
use crate::catalog::ToolCatalog;
use crate::decision::{Decision, DenyCode};
use crate::{KernelError, KernelResult};

/// Failure of an invocation attempt, carried back into the decision.
#[derive(Clone, Debug)]
pub struct InvokeError {
    /// Stable code for the resulting denial.
    pub code: DenyCode,
    /// Human-readable reason.
    pub reason: String,
}

impl InvokeError {
    /// Creates an invocation error.
    #[must_use]
    pub fn new(code: DenyCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Maps a twin-client error onto the denial taxonomy.
    #[must_use]
    pub fn from_client(err: &ClientError) -> Self {
        let code = match err {
            ClientError::CircuitOpen { .. } => DenyCode::CircuitOpen,
            ClientError::Timeout { .. } => DenyCode::ExecutionTimeout,
            ClientError::Transport { .. } => DenyCode::TransportFailure,
            ClientError::Configuration { .. } => DenyCode::MalformedInput,
            _ => DenyCode::ExecutionFailed,
        };
        Self::new(code, err.to_string())
    }
}

/// Seam through which the kernel reaches the asset.
///
/// The production implementation is [`TwinInvoker`]; tests inject stubs
/// that record invocations instead of performing them.
#[async_trait]
pub trait OperationInvoker: Send + Sync {
    /// Performs (or simulates) the invocation.
    async fn invoke(&self, call: &ToolCall, simulate: bool) -> Result<Value, InvokeError>;
}

/// [`OperationInvoker`] backed by the twin client and the tool catalog.
pub struct TwinInvoker {
    client: Arc<TwinClient>,
    catalog: Arc<ToolCatalog>,
}

impl TwinInvoker {
    /// Creates an invoker resolving catalog entries through the client.
    #[must_use]
    pub fn new(client: Arc<TwinClient>, catalog: Arc<ToolCatalog>) -> Self {
        Self { client, catalog }
    }
}

#[async_trait]
impl OperationInvoker for TwinInvoker {
    async fn invoke(&self, call: &ToolCall, simulate: bool) -> Result<Value, InvokeError> {
        let entry = self.catalog.get(call.name()).ok_or_else(|| {
            InvokeError::new(
                DenyCode::MalformedInput,
                format!("`{}` is not in the tool catalog", call.name()),
            )
        })?;

        self.client
            .invoke(
                entry.operation(),
                call.arguments(),
                simulate,
                call.idempotency_key(),
            )
            .await
            .map_err(|err| InvokeError::from_client(&err))
    }
}

/// Outcome of resolving an approval task.
#[derive(Clone, Debug)]
pub enum ApprovalOutcome {
    /// The task was approved and the call re-submitted for execution.
    Executed {
        /// The resolved task.
        task_id: TaskId,
        /// Outcome of the execution.
        decision: Decision,
    },
    /// The task was rejected.
    Rejected {
        /// The resolved task.
        task_id: TaskId,
    },
    /// The task was already terminal; approve/reject are idempotent.
    AlreadyResolved {
        /// The task in question.
        task_id: TaskId,
        /// The recorded terminal state.
        state: ApprovalState,
    },
    /// The resolution attempt itself was refused (self-approval, missing
    /// approver role, unverifiable policy).
    Refused {
        /// The task in question.
        task_id: TaskId,
        /// The denial produced for the approver.
        decision: Decision,
    },
}

/// The Safety Kernel: authorize → interlock → simulate-force → approval
/// gate → execute, in fixed order, first denial terminating.
///
/// Every transition lands in the audit log before the decision is returned;
/// an unwritable audit log fails the call rather than skipping the record.
pub struct SafetyKernel {
    policy: Arc<PolicyStore>,
    shadow: Arc<ShadowState>,
    invoker: Arc<dyn OperationInvoker>,
    audit: Arc<AuditLog>,
    approvals: Arc<ApprovalStore>,
}

impl SafetyKernel {
    /// Wires the kernel to its collaborators.
    #[must_use]
    pub fn new(
        policy: Arc<PolicyStore>,
        shadow: Arc<ShadowState>,
        invoker: Arc<dyn OperationInvoker>,
        audit: Arc<AuditLog>,
        approvals: Arc<ApprovalStore>,
    ) -> Self {
        Self {
            policy,
            shadow,
            invoker,
            audit,
            approvals,
        }
    }

    /// Returns the approval store for listing pending tasks.
    #[must_use]
    pub fn approvals(&self) -> &Arc<ApprovalStore> {
        &self.approvals
    }

    /// Evaluates one candidate call through the full pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Audit`] when a decision cannot be recorded;
    /// every policy-level refusal is a [`Decision`], not an error.
    pub async fn submit(
        &self,
        call: &ToolCall,
        actor: &str,
        roles: &[String],
    ) -> KernelResult<Decision> {
        let args_digest = args_digest(call);
        self.audit
            .append(AuditRecord::new(
                AuditEvent::Proposed,
                actor,
                roles.to_vec(),
                call.name(),
                &args_digest,
                "proposed",
            ))
            .await?;

        // Layer 1: authorization. Fail closed when no policy verifies.
        let policy = match self.policy.current().await {
            Ok(policy) => policy,
            Err(err) => {
                let code = match err {
                    PolicyError::Stale { .. } => DenyCode::PolicyStale,
                    _ => DenyCode::PolicyUnverified,
                };
                let decision = Decision::denied(code, err.to_string());
                self.audit_denied(actor, roles, call, &args_digest, &decision, None)
                    .await?;
                return Ok(decision);
            }
        };

        if !policy.allows(roles, call.name()) {
            let decision = Decision::denied(
                DenyCode::RoleUnauthorized,
                format!("no presented role may invoke `{}`", call.name()),
            );
            self.audit_denied(actor, roles, call, &args_digest, &decision, None)
                .await?;
            return Ok(decision);
        }

        // Layer 2: interlocks, evaluated against one consistent shadow view.
        let mut warnings = Vec::new();
        let triggered = {
            let view = self.shadow.read_view();
            let mut triggered = None;
            for interlock in policy.interlocks() {
                let condition = &interlock.deny_when;
                match view.get(&condition.submodel, &condition.path) {
                    Some(entry) => {
                        if condition.holds(&entry.value) {
                            triggered = Some(interlock.clone());
                            break;
                        }
                    }
                    None => warnings.push(format!(
                        "interlock `{}`: path `{}/{}` missing from shadow",
                        interlock.id, condition.submodel, condition.path
                    )),
                }
            }
            triggered
        };

        if let Some(interlock) = triggered {
            let decision = Decision::denied(
                DenyCode::InterlockTriggered,
                format!("interlock `{}`: {}", interlock.id, interlock.message),
            );
            let details = (!warnings.is_empty()).then(|| warnings.join("; "));
            self.audit_denied(actor, roles, call, &args_digest, &decision, details)
                .await?;
            return Ok(decision);
        }

        // Layer 3: risk classification and simulation forcing. The policy
        // override wins over the schema hint.
        let risk = policy.risk_for(call.name()).unwrap_or_else(|| call.risk());
        let simulate_effective =
            call.requested_simulate() || risk >= policy.require_simulation_for_risk;
        debug!(tool = call.name(), %risk, simulate_effective, "risk classified");

        // Layer 4: approval gate.
        if risk >= policy.require_approval_for_risk && !simulate_effective {
            let task = self.approvals.create(call.clone(), actor, roles);
            let decision = Decision::pending(task.task_id);
            let mut record = AuditRecord::new(
                AuditEvent::PendingApproval,
                actor,
                roles.to_vec(),
                call.name(),
                &args_digest,
                decision.audit_label(),
            );
            if !warnings.is_empty() {
                record = record.with_details(warnings.join("; "));
            }
            self.audit.append(record).await?;
            return Ok(decision);
        }

        // Layer 5: execute.
        self.execute(call, actor, roles, simulate_effective, None, &warnings)
            .await
    }

    /// Approves a pending task and re-submits its call with the approval
    /// gate satisfied.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::UnknownTask`] for unknown identifiers and
    /// [`KernelError::Audit`] when recording fails.
    pub async fn approve(
        &self,
        task_id: TaskId,
        approver_actor: &str,
        approver_roles: &[String],
    ) -> KernelResult<ApprovalOutcome> {
        let task = self
            .approvals
            .get(task_id)
            .ok_or(KernelError::UnknownTask { task_id })?;
        let digest = args_digest(&task.call);

        let policy = match self.policy.current().await {
            Ok(policy) => policy,
            Err(err) => {
                let code = match err {
                    PolicyError::Stale { .. } => DenyCode::PolicyStale,
                    _ => DenyCode::PolicyUnverified,
                };
                let decision = Decision::denied(code, err.to_string());
                self.audit_denied(approver_actor, approver_roles, &task.call, &digest, &decision, None)
                    .await?;
                return Ok(ApprovalOutcome::Refused { task_id, decision });
            }
        };

        if !policy.can_approve(approver_roles) {
            let decision = Decision::denied(
                DenyCode::RoleUnauthorized,
                "no presented role may approve tasks",
            );
            self.audit_denied(approver_actor, approver_roles, &task.call, &digest, &decision, None)
                .await?;
            return Ok(ApprovalOutcome::Refused { task_id, decision });
        }

        match self.approvals.approve(task_id, approver_actor) {
            Err(ApprovalError::NotFound { task_id }) => Err(KernelError::UnknownTask { task_id }),
            Err(ApprovalError::SelfApproval { .. }) => {
                let decision = Decision::denied(
                    DenyCode::SelfApproval,
                    "the requester may not approve their own task",
                );
                self.audit_denied(approver_actor, approver_roles, &task.call, &digest, &decision, None)
                    .await?;
                Ok(ApprovalOutcome::Refused { task_id, decision })
            }
            Ok(Transition::AlreadyResolved(resolved)) => Ok(ApprovalOutcome::AlreadyResolved {
                task_id,
                state: resolved.state,
            }),
            Ok(Transition::Applied(approved)) => {
                self.audit
                    .append(
                        AuditRecord::new(
                            AuditEvent::Approved,
                            approver_actor,
                            approver_roles.to_vec(),
                            approved.call.name(),
                            &digest,
                            "approve",
                        )
                        .with_approved_task(task_id),
                    )
                    .await?;

                // Re-submission: the approval gate is satisfied for this
                // task, so execution proceeds live on behalf of the
                // original requester.
                let decision = self
                    .execute(
                        &approved.call,
                        &approved.requester_actor,
                        &approved.requester_roles,
                        false,
                        Some(task_id),
                        &[],
                    )
                    .await?;
                Ok(ApprovalOutcome::Executed { task_id, decision })
            }
        }
    }

    /// Rejects a pending task.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::UnknownTask`] for unknown identifiers and
    /// [`KernelError::Audit`] when recording fails.
    pub async fn reject(
        &self,
        task_id: TaskId,
        approver_actor: &str,
        approver_roles: &[String],
        reason: &str,
    ) -> KernelResult<ApprovalOutcome> {
        let task = self
            .approvals
            .get(task_id)
            .ok_or(KernelError::UnknownTask { task_id })?;
        let digest = args_digest(&task.call);

        if let Ok(policy) = self.policy.current().await {
            if !policy.can_approve(approver_roles) {
                let decision = Decision::denied(
                    DenyCode::RoleUnauthorized,
                    "no presented role may reject tasks",
                );
                self.audit_denied(approver_actor, approver_roles, &task.call, &digest, &decision, None)
                    .await?;
                return Ok(ApprovalOutcome::Refused { task_id, decision });
            }
        }

        match self.approvals.reject(task_id, approver_actor, reason) {
            Err(ApprovalError::NotFound { task_id } | ApprovalError::SelfApproval { task_id }) => {
                Err(KernelError::UnknownTask { task_id })
            }
            Ok(Transition::AlreadyResolved(resolved)) => Ok(ApprovalOutcome::AlreadyResolved {
                task_id,
                state: resolved.state,
            }),
            Ok(Transition::Applied(rejected)) => {
                self.audit
                    .append(
                        AuditRecord::new(
                            AuditEvent::Rejected,
                            approver_actor,
                            approver_roles.to_vec(),
                            rejected.call.name(),
                            &digest,
                            format!("reject:{reason}"),
                        )
                        .with_approved_task(task_id),
                    )
                    .await?;
                Ok(ApprovalOutcome::Rejected { task_id })
            }
        }
    }

    /// Records a cancelled in-flight call (request deadline exceeded).
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::Audit`] when the record cannot be written.
    pub async fn cancel(
        &self,
        call: &ToolCall,
        actor: &str,
        roles: &[String],
    ) -> KernelResult<Decision> {
        let decision = Decision::denied(DenyCode::ExecutionFailed, "cancelled");
        self.audit
            .append(
                AuditRecord::new(
                    AuditEvent::ExecFailed,
                    actor,
                    roles.to_vec(),
                    call.name(),
                    args_digest(call),
                    decision.audit_label(),
                )
                .with_details("cancelled"),
            )
            .await?;
        Ok(decision)
    }

    async fn execute(
        &self,
        call: &ToolCall,
        actor: &str,
        roles: &[String],
        simulate: bool,
        approved_task: Option<TaskId>,
        warnings: &[String],
    ) -> KernelResult<Decision> {
        let digest = args_digest(call);
        match self.invoker.invoke(call, simulate).await {
            Ok(result) => {
                let decision = if simulate {
                    Decision::simulated(result)
                } else {
                    Decision::executed(result)
                };
                let event = if simulate {
                    AuditEvent::Simulated
                } else {
                    AuditEvent::Executed
                };

                let result_digest = match &decision {
                    Decision::Executed { result_digest, .. }
                    | Decision::Simulated { result_digest, .. } => result_digest.clone(),
                    _ => String::new(),
                };

                let mut record = AuditRecord::new(
                    event,
                    actor,
                    roles.to_vec(),
                    call.name(),
                    &digest,
                    decision.audit_label(),
                )
                .with_result_digest(result_digest);
                if let Some(task_id) = approved_task {
                    record = record.with_approved_task(task_id);
                }
                if !warnings.is_empty() {
                    record = record.with_details(warnings.join("; "));
                }
                self.audit.append(record).await?;
                Ok(decision)
            }
            Err(err) => {
                warn!(tool = call.name(), code = %err.code, reason = %err.reason, "execution failed");
                let decision = Decision::denied(err.code, err.reason.clone());
                let mut record = AuditRecord::new(
                    AuditEvent::ExecFailed,
                    actor,
                    roles.to_vec(),
                    call.name(),
                    &digest,
                    decision.audit_label(),
                )
                .with_details(err.reason);
                if let Some(task_id) = approved_task {
                    record = record.with_approved_task(task_id);
                }
                self.audit.append(record).await?;
                Ok(decision)
            }
        }
    }

    async fn audit_denied(
        &self,
        actor: &str,
        roles: &[String],
        call: &ToolCall,
        args_digest: &str,
        decision: &Decision,
        details: Option<String>,
    ) -> KernelResult<()> {
        let mut record = AuditRecord::new(
            AuditEvent::Denied,
            actor,
            roles.to_vec(),
            call.name(),
            args_digest,
            decision.audit_label(),
        );
        if let Some(details) = details {
            record = record.with_details(details);
        }
        self.audit.append(record).await?;
        Ok(())
    }
}

fn args_digest(call: &ToolCall) -> String {
    canon::digest_value(call.arguments()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Fixture;
    use serde_json::json;

    fn roles(names: &[&str]) -> Vec<String> {
        names.iter().map(|&name| name.to_owned()).collect()
    }

    #[tokio::test]
    async fn deny_by_default_without_verified_policy() {
        let fixture = Fixture::with_unverifiable_policy().await;

        let call = ToolCall::new("GetStatus", json!({}));
        let decision = fixture
            .kernel
            .submit(&call, "operator-1", &roles(&["maintenance"]))
            .await
            .unwrap();

        assert_eq!(decision.deny_code(), Some(DenyCode::PolicyUnverified));
        assert!(fixture.invoker.invocations().is_empty());
        assert_eq!(fixture.audit_events_of(AuditEvent::Denied).await, 1);
    }

    #[tokio::test]
    async fn rbac_closure_denies_unbound_roles() {
        let fixture = Fixture::standard().await;

        let call = ToolCall::new("SetSpeed", json!({"rpm": 1200}));
        let decision = fixture
            .kernel
            .submit(&call, "viewer-1", &roles(&["viewer"]))
            .await
            .unwrap();
        assert_eq!(decision.deny_code(), Some(DenyCode::RoleUnauthorized));

        // The same call proceeds for a role that carries the binding.
        let decision = fixture
            .kernel
            .submit(&call, "operator-1", &roles(&["operator"]))
            .await
            .unwrap();
        assert!(decision.is_success());
    }

    #[tokio::test]
    async fn high_risk_forces_exactly_one_simulated_invocation() {
        let fixture = Fixture::standard().await;

        let call = ToolCall::new("StartPump", json!({}));
        let decision = fixture
            .kernel
            .submit(&call, "operator-1", &roles(&["operator"]))
            .await
            .unwrap();

        assert!(matches!(decision, Decision::Simulated { .. }));
        assert_eq!(
            fixture.invoker.invocations(),
            vec![("StartPump".to_owned(), true)]
        );
        assert_eq!(fixture.audit_events_of(AuditEvent::Simulated).await, 1);
        assert_eq!(fixture.audit_events_of(AuditEvent::Executed).await, 0);
    }

    #[tokio::test]
    async fn critical_risk_parks_on_approval_without_invoking() {
        let fixture = Fixture::standard().await;

        let call = ToolCall::new("EmergencyStop", json!({}));
        let decision = fixture
            .kernel
            .submit(&call, "operator-1", &roles(&["maintenance"]))
            .await
            .unwrap();

        let Decision::PendingApproval { task_id } = decision else {
            panic!("expected pending approval, got {decision:?}");
        };
        assert!(fixture.invoker.invocations().is_empty());

        let outcome = fixture
            .kernel
            .approve(task_id, "supervisor", &roles(&["maintenance"]))
            .await
            .unwrap();
        let ApprovalOutcome::Executed { decision, .. } = outcome else {
            panic!("expected execution after approval");
        };
        assert!(matches!(decision, Decision::Executed { .. }));
        assert_eq!(
            fixture.invoker.invocations(),
            vec![("EmergencyStop".to_owned(), false)]
        );
        assert_eq!(fixture.audit_events_of(AuditEvent::Executed).await, 1);
    }

    #[tokio::test]
    async fn self_approval_is_refused_and_task_stays_pending() {
        let fixture = Fixture::standard().await;

        let call = ToolCall::new("EmergencyStop", json!({}));
        let decision = fixture
            .kernel
            .submit(&call, "operator-1", &roles(&["maintenance"]))
            .await
            .unwrap();
        let Decision::PendingApproval { task_id } = decision else {
            panic!("expected pending approval");
        };

        let outcome = fixture
            .kernel
            .approve(task_id, "operator-1", &roles(&["maintenance"]))
            .await
            .unwrap();
        let ApprovalOutcome::Refused { decision, .. } = outcome else {
            panic!("expected refusal");
        };
        assert_eq!(decision.deny_code(), Some(DenyCode::SelfApproval));
        assert_eq!(
            fixture.kernel.approvals().get(task_id).unwrap().state,
            ApprovalState::Pending
        );
        assert!(fixture.invoker.invocations().is_empty());
    }

    #[tokio::test]
    async fn approver_without_role_is_refused() {
        let fixture = Fixture::standard().await;

        let call = ToolCall::new("EmergencyStop", json!({}));
        let Decision::PendingApproval { task_id } = fixture
            .kernel
            .submit(&call, "operator-1", &roles(&["maintenance"]))
            .await
            .unwrap()
        else {
            panic!("expected pending approval");
        };

        let outcome = fixture
            .kernel
            .approve(task_id, "viewer-1", &roles(&["viewer"]))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            ApprovalOutcome::Refused { ref decision, .. }
                if decision.deny_code() == Some(DenyCode::RoleUnauthorized)
        ));
    }

    #[tokio::test]
    async fn interlock_denies_and_names_itself() {
        let fixture = Fixture::standard().await;
        fixture.set_shadow("TelemetryData", "CurrentTemperature", json!(97));

        let call = ToolCall::new("StartPump", json!({}));
        let decision = fixture
            .kernel
            .submit(&call, "operator-1", &roles(&["operator"]))
            .await
            .unwrap();

        assert_eq!(decision.deny_code(), Some(DenyCode::InterlockTriggered));
        let Decision::Denied { reason, .. } = decision else {
            unreachable!();
        };
        assert!(reason.contains("temp-high"));
        assert!(fixture.invoker.invocations().is_empty());
    }

    #[tokio::test]
    async fn missing_interlock_path_proceeds_with_warning() {
        // Standard fixture never seeds the shadow, so the interlock path is
        // absent: the predicate is treated as false and the call proceeds.
        let fixture = Fixture::standard().await;

        let call = ToolCall::new("SetSpeed", json!({"rpm": 900}));
        let decision = fixture
            .kernel
            .submit(&call, "operator-1", &roles(&["operator"]))
            .await
            .unwrap();
        assert!(decision.is_success());

        let details = fixture.last_entry_details().await;
        assert!(details.is_some_and(|details| details.contains("missing from shadow")));
    }

    #[tokio::test]
    async fn requested_simulation_is_honoured_for_low_risk() {
        let fixture = Fixture::standard().await;

        let call = ToolCall::new("SetSpeed", json!({"rpm": 900})).with_requested_simulate(true);
        let decision = fixture
            .kernel
            .submit(&call, "operator-1", &roles(&["operator"]))
            .await
            .unwrap();

        assert!(matches!(decision, Decision::Simulated { .. }));
        assert_eq!(
            fixture.invoker.invocations(),
            vec![("SetSpeed".to_owned(), true)]
        );
    }

    #[tokio::test]
    async fn execution_failure_becomes_a_denial_and_is_audited() {
        let fixture = Fixture::standard().await;
        fixture.invoker.fail_next(InvokeError::new(
            DenyCode::TransportFailure,
            "connection reset by peer",
        ));

        let call = ToolCall::new("SetSpeed", json!({"rpm": 900}));
        let decision = fixture
            .kernel
            .submit(&call, "operator-1", &roles(&["operator"]))
            .await
            .unwrap();

        assert_eq!(decision.deny_code(), Some(DenyCode::TransportFailure));
        assert_eq!(fixture.audit_events_of(AuditEvent::ExecFailed).await, 1);
    }
}
