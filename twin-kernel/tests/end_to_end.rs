//! End-to-end scenarios through the orchestrator, kernel, and audit log.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use ed25519_dalek::{Signer, SigningKey};
use serde_json::{Value, json};

use twin_adapters::{RulesSelector, SelectionRule};
use twin_audit::{AuditLog, verify};
use twin_client::{MemoryIdempotencyStore, OperationRef, cached, fingerprint};
use twin_kernel::{
    ApprovalOutcome, ApprovalStore, CatalogEntry, ChatRequest, Decision, InvokeError,
    OperationInvoker, Orchestrator, OrchestratorConfig, SafetyKernel, ToolCatalog,
};
use twin_policy::{
    Ed25519Verifier, PolicyResult, PolicySource, PolicyStore, PolicyStoreConfig, SignedPolicy,
};
use twin_primitives::{RiskLevel, ToolCall, ToolSchema, canon};
use twin_shadow::{ShadowState, ValueSource};

/// Invoker simulating the plant: records raw invocations, keeps a pump
/// state, and collapses duplicates through a real idempotency cache.
struct PlantInvoker {
    idempotency: MemoryIdempotencyStore,
    raw_invocations: Mutex<Vec<(String, bool)>>,
    pump_state: Mutex<String>,
}

impl PlantInvoker {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            idempotency: MemoryIdempotencyStore::new(
                NonZeroUsize::new(64).unwrap(),
                Duration::from_secs(300),
            ),
            raw_invocations: Mutex::new(Vec::new()),
            pump_state: Mutex::new("Stopped".to_owned()),
        })
    }

    fn raw_invocations(&self) -> Vec<(String, bool)> {
        self.raw_invocations.lock().unwrap().clone()
    }

    fn pump_state(&self) -> String {
        self.pump_state.lock().unwrap().clone()
    }

    fn perform(&self, name: &str, simulate: bool) -> Value {
        self.raw_invocations
            .lock()
            .unwrap()
            .push((name.to_owned(), simulate));

        match name {
            "EmergencyStop" => {
                if !simulate {
                    *self.pump_state.lock().unwrap() = "Emergency Stop".to_owned();
                }
                json!({"state": "Emergency Stop"})
            }
            "StartPump" => {
                if !simulate {
                    *self.pump_state.lock().unwrap() = "Running".to_owned();
                }
                json!({"state": "Running", "simulated": simulate})
            }
            "GetStatus" => json!({"state": self.pump_state()}),
            other => json!({"ok": true, "operation": other}),
        }
    }
}

#[async_trait]
impl OperationInvoker for PlantInvoker {
    async fn invoke(&self, call: &ToolCall, simulate: bool) -> Result<Value, InvokeError> {
        let fp = fingerprint(
            call.name(),
            call.arguments(),
            simulate,
            call.idempotency_key(),
        );
        cached(&self.idempotency, &fp, || async {
            Ok(self.perform(call.name(), simulate))
        })
        .await
        .map_err(|err| InvokeError::from_client(&err))
    }
}

struct StaticPolicySource {
    envelope: SignedPolicy,
}

#[async_trait]
impl PolicySource for StaticPolicySource {
    async fn fetch(&self) -> PolicyResult<SignedPolicy> {
        Ok(self.envelope.clone())
    }
}

struct Harness {
    orchestrator: Orchestrator,
    kernel: Arc<SafetyKernel>,
    invoker: Arc<PlantInvoker>,
    shadow: Arc<ShadowState>,
    audit_path: PathBuf,
}

impl Harness {
    async fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let payload = json!({
            "require_simulation_for_risk": "HIGH",
            "require_approval_for_risk": "CRITICAL",
            "role_bindings": {
                "viewer": {"allow": ["GetStatus"]},
                "operator": {"allow": ["GetStatus", "SetSpeed", "StartPump"]},
                "maintenance": {"allow": ["*"]}
            },
            "interlocks": [{
                "id": "temp-high",
                "deny_when": {
                    "submodel": "TelemetryData",
                    "path": "CurrentTemperature",
                    "op": ">",
                    "value": 95
                },
                "message": "coolant temperature too high"
            }],
            "operation_risk": {
                "GetStatus": "LOW",
                "SetSpeed": "MEDIUM",
                "StartPump": "HIGH",
                "EmergencyStop": "CRITICAL"
            },
            "approver_roles": []
        });

        let key = SigningKey::generate(&mut rand::rngs::OsRng);
        let canonical = canon::to_canonical_bytes(&payload).unwrap();
        let envelope = SignedPolicy {
            payload,
            signature_b64: BASE64.encode(key.sign(&canonical).to_bytes()),
            key_id: "plant-key-1".into(),
        };

        let policy = Arc::new(PolicyStore::new(
            Arc::new(StaticPolicySource { envelope }),
            Arc::new(Ed25519Verifier),
            key.verifying_key().to_bytes(),
            PolicyStoreConfig::new(Duration::from_secs(60)),
        ));

        let shadow = Arc::new(ShadowState::new());
        shadow.apply_update(
            "TelemetryData",
            "CurrentTemperature",
            json!(63.5),
            None,
            ValueSource::Snapshot,
        );

        let mut audit_path = std::env::temp_dir();
        audit_path.push(format!("twinops-e2e-{}.jsonl", uuid::Uuid::new_v4()));
        let audit = Arc::new(AuditLog::open(&audit_path).await.unwrap());

        let invoker = PlantInvoker::new();
        let approvals = Arc::new(ApprovalStore::new(Duration::from_secs(86_400)));
        let kernel = Arc::new(SafetyKernel::new(
            policy,
            Arc::clone(&shadow),
            Arc::clone(&invoker) as Arc<dyn OperationInvoker>,
            audit,
            approvals,
        ));

        let catalog = ToolCatalog::new(vec![
            CatalogEntry::new(
                ToolSchema::new("GetStatus", "Read the pump status", json!({"type": "object"}))
                    .with_risk(RiskLevel::Low),
                OperationRef::direct("StatusData", "GetStatus"),
            ),
            CatalogEntry::new(
                ToolSchema::new(
                    "SetSpeed",
                    "Set the pump speed in RPM",
                    json!({"type": "object", "properties": {"rpm": {"type": "number"}}}),
                ),
                OperationRef::direct("Control", "SetSpeed"),
            ),
            CatalogEntry::new(
                ToolSchema::new("StartPump", "Start the pump", json!({"type": "object"}))
                    .with_risk(RiskLevel::High),
                OperationRef::direct("Control", "StartPump"),
            ),
            CatalogEntry::new(
                ToolSchema::new(
                    "EmergencyStop",
                    "Trigger an emergency stop",
                    json!({"type": "object"}),
                )
                .with_risk(RiskLevel::Critical),
                OperationRef::direct("Control", "EmergencyStop"),
            ),
        ]);

        let selector = RulesSelector::new(vec![
            SelectionRule::new("EmergencyStop").with_keywords(["emergency stop", "emergency"]),
            SelectionRule::new("SetSpeed")
                .with_keywords(["set speed", "rpm"])
                .with_number_argument("rpm"),
            SelectionRule::new("StartPump").with_keywords(["start the pump", "start pump"]),
            SelectionRule::new("GetStatus").with_keywords(["status", "get status"]),
        ]);

        let orchestrator = Orchestrator::new(
            Arc::new(selector),
            Arc::clone(&kernel),
            Arc::new(catalog),
            OrchestratorConfig::default(),
        );

        Self {
            orchestrator,
            kernel,
            invoker,
            shadow,
            audit_path,
        }
    }

    fn request(message: &str, actor: &str, roles: &[&str]) -> ChatRequest {
        ChatRequest {
            message: message.to_owned(),
            actor: actor.to_owned(),
            roles: roles.iter().map(|&role| role.to_owned()).collect(),
            simulate: None,
            idempotency_key: None,
        }
    }

    async fn audit_entries(&self) -> Vec<Value> {
        let data = tokio::fs::read(&self.audit_path).await.unwrap_or_default();
        data.split(|byte| *byte == b'\n')
            .filter(|chunk| !chunk.is_empty())
            .map(|chunk| serde_json::from_slice(chunk).unwrap())
            .collect()
    }

    async fn events_of(&self, event: &str) -> Vec<Value> {
        self.audit_entries()
            .await
            .into_iter()
            .filter(|entry| entry.get("event").and_then(Value::as_str) == Some(event))
            .collect()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        if self.audit_path.exists() {
            let _ = std::fs::remove_file(&self.audit_path);
        }
    }
}

#[tokio::test]
async fn viewer_is_denied_speed_changes() {
    let harness = Harness::new().await;

    let reply = harness
        .orchestrator
        .handle(Harness::request("Set speed to 1200 RPM", "alice", &["viewer"]))
        .await
        .unwrap();

    assert!(!reply.pending_approval);
    assert_eq!(reply.task_id, None);
    assert_eq!(reply.tool_results.len(), 1);
    let report = &reply.tool_results[0];
    assert_eq!(report.tool, "SetSpeed");
    assert!(!report.success);
    assert_eq!(report.status, "denied");
    assert_eq!(report.error.as_deref(), Some("role_unauthorized"));

    assert!(harness.invoker.raw_invocations().is_empty());
    assert_eq!(harness.events_of("denied").await.len(), 1);
}

#[tokio::test]
async fn high_risk_start_is_forced_into_simulation() {
    let harness = Harness::new().await;

    let reply = harness
        .orchestrator
        .handle(Harness::request("Start the pump", "bob", &["operator"]))
        .await
        .unwrap();

    assert_eq!(reply.tool_results.len(), 1);
    let report = &reply.tool_results[0];
    assert_eq!(report.tool, "StartPump");
    assert!(report.success);
    assert!(report.simulated);
    assert_eq!(report.status, "simulated_only");

    // One simulated invocation, no live one, pump untouched.
    assert_eq!(
        harness.invoker.raw_invocations(),
        vec![("StartPump".to_owned(), true)]
    );
    assert_eq!(harness.invoker.pump_state(), "Stopped");
    assert_eq!(harness.events_of("simulated").await.len(), 1);
    assert!(harness.events_of("executed").await.is_empty());
}

#[tokio::test]
async fn critical_stop_requires_approval_then_executes_once() {
    let harness = Harness::new().await;

    let reply = harness
        .orchestrator
        .handle(Harness::request("Emergency stop", "carol", &["maintenance"]))
        .await
        .unwrap();

    assert!(reply.pending_approval);
    let task_id = reply.task_id.expect("a task must be created");
    assert!(harness.invoker.raw_invocations().is_empty());
    assert_eq!(harness.events_of("pending_approval").await.len(), 1);

    let outcome = harness
        .kernel
        .approve(task_id, "supervisor", &["maintenance".to_owned()])
        .await
        .unwrap();
    let ApprovalOutcome::Executed { decision, .. } = outcome else {
        panic!("expected execution after approval");
    };
    assert!(matches!(decision, Decision::Executed { .. }));

    assert_eq!(harness.invoker.pump_state(), "Emergency Stop");
    let executed = harness.events_of("executed").await;
    assert_eq!(executed.len(), 1);
    assert_eq!(
        executed[0].get("approved_task_id").and_then(Value::as_str),
        Some(task_id.to_string().as_str())
    );
}

#[tokio::test]
async fn hot_plant_interlock_blocks_the_start() {
    let harness = Harness::new().await;
    harness.shadow.apply_update(
        "TelemetryData",
        "CurrentTemperature",
        json!(97),
        None,
        ValueSource::Mqtt,
    );

    let reply = harness
        .orchestrator
        .handle(Harness::request("Start the pump", "bob", &["operator"]))
        .await
        .unwrap();

    let report = &reply.tool_results[0];
    assert_eq!(report.status, "denied");
    assert_eq!(report.error.as_deref(), Some("interlock_triggered"));
    assert!(report.reason.as_deref().unwrap().contains("temp-high"));

    assert!(harness.invoker.raw_invocations().is_empty());
    assert_eq!(harness.events_of("denied").await.len(), 1);
}

#[tokio::test]
async fn tampering_with_the_log_is_detected_at_the_mutated_entry() {
    let harness = Harness::new().await;

    harness
        .orchestrator
        .handle(Harness::request("Start the pump", "bob", &["operator"]))
        .await
        .unwrap();

    let report = verify(&harness.audit_path).await.unwrap();
    assert!(report.ok);

    // Flip one character of the tool name; the first occurrence sits in the
    // earliest entry for this call.
    let entries = harness.audit_entries().await;
    let mutated = entries
        .iter()
        .find(|entry| entry.get("tool").and_then(Value::as_str) == Some("StartPump"))
        .expect("an entry for the call exists");
    let mutated_seq = mutated.get("seq").and_then(Value::as_u64).unwrap();

    let contents = std::fs::read_to_string(&harness.audit_path).unwrap();
    let tampered = contents.replacen("StartPump", "StartPumq", 1);
    assert_ne!(contents, tampered);
    std::fs::write(&harness.audit_path, tampered).unwrap();

    let report = verify(&harness.audit_path).await.unwrap();
    assert!(!report.ok);
    assert_eq!(report.first_break_seq, Some(mutated_seq));
}

#[tokio::test]
async fn duplicate_requests_with_one_key_invoke_once() {
    let harness = Harness::new().await;

    let mut first_result = None;
    for _ in 0..2 {
        let mut request = Harness::request("Get status", "bob", &["operator"]);
        request.idempotency_key = Some("abc".to_owned());

        let reply = harness.orchestrator.handle(request).await.unwrap();
        assert_eq!(reply.tool_results.len(), 1);
        let report = &reply.tool_results[0];
        assert!(report.success);

        match &first_result {
            None => first_result = Some(report.result.clone()),
            Some(previous) => assert_eq!(previous, &report.result),
        }
    }

    assert_eq!(
        harness.invoker.raw_invocations(),
        vec![("GetStatus".to_owned(), false)]
    );
}

#[tokio::test]
async fn second_call_in_a_plan_is_not_dispatched_after_a_denial() {
    let harness = Harness::new().await;

    // Matches SetSpeed (denied for viewer) and GetStatus (allowed) in that
    // order; the denial must stop the plan.
    let reply = harness
        .orchestrator
        .handle(Harness::request(
            "Set speed to 1200 rpm and give me the status",
            "alice",
            &["viewer"],
        ))
        .await
        .unwrap();

    assert_eq!(reply.tool_results.len(), 1);
    assert_eq!(reply.tool_results[0].tool, "SetSpeed");
    assert!(harness.invoker.raw_invocations().is_empty());
}
