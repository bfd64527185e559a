//! Shared fixtures for kernel and orchestrator tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use ed25519_dalek::{Signer, SigningKey};
use serde_json::{Value, json};

use twin_adapters::{RulesSelector, SelectionRule};
use twin_audit::{AuditEvent, AuditLog};
use twin_client::OperationRef;
use twin_policy::{
    Ed25519Verifier, PolicyResult, PolicySource, PolicyStore, PolicyStoreConfig, SignedPolicy,
};
use twin_primitives::{RiskLevel, ToolCall, ToolSchema, canon};
use twin_shadow::{ShadowState, ValueSource};

use crate::approval::ApprovalStore;
use crate::catalog::{CatalogEntry, ToolCatalog};
use crate::kernel::{InvokeError, OperationInvoker, SafetyKernel};
use crate::orchestrator::{Orchestrator, OrchestratorConfig};

pub struct StubInvoker {
    calls: Mutex<Vec<(String, bool)>>,
    results: Mutex<HashMap<String, Value>>,
    fail_next: Mutex<Option<InvokeError>>,
    delay: Mutex<Option<Duration>>,
}

impl StubInvoker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            results: Mutex::new(HashMap::new()),
            fail_next: Mutex::new(None),
            delay: Mutex::new(None),
        })
    }

    pub fn invocations(&self) -> Vec<(String, bool)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn set_result(&self, tool: &str, result: Value) {
        self.results.lock().unwrap().insert(tool.to_owned(), result);
    }

    pub fn fail_next(&self, err: InvokeError) {
        *self.fail_next.lock().unwrap() = Some(err);
    }

    pub fn delay_invocations(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl OperationInvoker for StubInvoker {
    async fn invoke(&self, call: &ToolCall, simulate: bool) -> Result<Value, InvokeError> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(err) = self.fail_next.lock().unwrap().take() {
            return Err(err);
        }

        self.calls
            .lock()
            .unwrap()
            .push((call.name().to_owned(), simulate));
        let results = self.results.lock().unwrap();
        Ok(results
            .get(call.name())
            .cloned()
            .unwrap_or_else(|| json!({"ok": true})))
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

pub fn standard_policy_payload() -> Value {
    json!({
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
    })
}

pub fn sign_payload(payload: &Value, key: &SigningKey) -> SignedPolicy {
    let canonical = canon::to_canonical_bytes(payload).unwrap();
    SignedPolicy {
        payload: payload.clone(),
        signature_b64: BASE64.encode(key.sign(&canonical).to_bytes()),
        key_id: "plant-key-1".into(),
    }
}

pub fn catalog() -> ToolCatalog {
    ToolCatalog::new(vec![
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
            ToolSchema::new("EmergencyStop", "Trigger an emergency stop", json!({"type": "object"}))
                .with_risk(RiskLevel::Critical),
            OperationRef::direct("Control", "EmergencyStop"),
        ),
    ])
}

pub fn rules_selector() -> RulesSelector {
    RulesSelector::new(vec![
        SelectionRule::new("EmergencyStop").with_keywords(["emergency stop", "emergency"]),
        SelectionRule::new("SetSpeed")
            .with_keywords(["set speed", "rpm"])
            .with_number_argument("rpm"),
        SelectionRule::new("StartPump").with_keywords(["start the pump", "start pump"]),
        SelectionRule::new("GetStatus").with_keywords(["status"]),
    ])
}

pub struct Fixture {
    pub kernel: Arc<SafetyKernel>,
    pub invoker: Arc<StubInvoker>,
    pub shadow: Arc<ShadowState>,
    pub audit_path: PathBuf,
}

impl Fixture {
    pub async fn standard() -> Self {
        let key = SigningKey::generate(&mut rand::rngs::OsRng);
        let envelope = sign_payload(&standard_policy_payload(), &key);
        Self::build(envelope, key.verifying_key().to_bytes()).await
    }

    pub async fn with_unverifiable_policy() -> Self {
        // Signed by a key the store does not trust.
        let rogue = SigningKey::generate(&mut rand::rngs::OsRng);
        let trusted = SigningKey::generate(&mut rand::rngs::OsRng);
        let envelope = sign_payload(&standard_policy_payload(), &rogue);
        Self::build(envelope, trusted.verifying_key().to_bytes()).await
    }

    async fn build(envelope: SignedPolicy, public_key: [u8; 32]) -> Self {
        let policy = Arc::new(PolicyStore::new(
            Arc::new(StaticPolicySource { envelope }),
            Arc::new(Ed25519Verifier),
            public_key,
            PolicyStoreConfig::new(Duration::from_secs(60)),
        ));

        let shadow = Arc::new(ShadowState::new());
        let invoker = StubInvoker::new();

        let mut audit_path = std::env::temp_dir();
        audit_path.push(format!("twinops-kernel-{}.jsonl", uuid::Uuid::new_v4()));
        let audit = Arc::new(AuditLog::open(&audit_path).await.unwrap());

        let approvals = Arc::new(ApprovalStore::new(Duration::from_secs(86_400)));
        let kernel = Arc::new(SafetyKernel::new(
            policy,
            Arc::clone(&shadow),
            invoker.clone() as Arc<dyn OperationInvoker>,
            audit,
            approvals,
        ));

        Self {
            kernel,
            invoker,
            shadow,
            audit_path,
        }
    }

    pub fn set_shadow(&self, submodel: &str, path: &str, value: Value) {
        self.shadow
            .apply_update(submodel, path, value, None, ValueSource::Mqtt);
    }

    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(
            Arc::new(rules_selector()),
            Arc::clone(&self.kernel),
            Arc::new(catalog()),
            OrchestratorConfig::default(),
        )
    }

    pub fn orchestrator_with_timeout(&self, request_timeout: Duration) -> Orchestrator {
        Orchestrator::new(
            Arc::new(rules_selector()),
            Arc::clone(&self.kernel),
            Arc::new(catalog()),
            OrchestratorConfig::new(4, request_timeout),
        )
    }

    pub async fn audit_entries(&self) -> Vec<Value> {
        let data = tokio::fs::read(&self.audit_path).await.unwrap_or_default();
        data.split(|byte| *byte == b'\n')
            .filter(|chunk| !chunk.is_empty())
            .map(|chunk| serde_json::from_slice(chunk).unwrap())
            .collect()
    }

    pub async fn audit_events_of(&self, event: AuditEvent) -> usize {
        let label = serde_json::to_value(event).unwrap();
        self.audit_entries()
            .await
            .iter()
            .filter(|entry| entry.get("event") == Some(&label))
            .count()
    }

    pub async fn last_entry_details(&self) -> Option<String> {
        self.audit_entries()
            .await
            .last()
            .and_then(|entry| entry.get("details"))
            .and_then(Value::as_str)
            .map(ToOwned::to_owned)
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        if self.audit_path.exists() {
            let _ = std::fs::remove_file(&self.audit_path);
        }
    }
}
