//! The AAS repository and Operation Service client.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hyper::body::to_bytes;
use hyper::header::CONTENT_TYPE;
use hyper::{Body, Method, Request, Uri};
use rand::Rng;
use serde_json::{Map, Value, json};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::http::{HyperClient, build_client};
use crate::idempotency::{IdempotencyStore, cached, fingerprint};
use crate::retry::{self, RetryPolicy};
use crate::sign::{RequestSigner, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use crate::{ClientError, ClientResult};

/// Addresses one invocable operation on a submodel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationRef {
    submodel: String,
    path: String,
    delegated: bool,
}

impl OperationRef {
    /// Creates a reference to a directly invocable operation.
    #[must_use]
    pub fn direct(submodel: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            submodel: submodel.into(),
            path: path.into(),
            delegated: false,
        }
    }

    /// Creates a reference to an operation served by the Operation Service.
    #[must_use]
    pub fn delegated(submodel: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            submodel: submodel.into(),
            path: path.into(),
            delegated: true,
        }
    }

    /// Returns the owning submodel identifier.
    #[must_use]
    pub fn submodel(&self) -> &str {
        &self.submodel
    }

    /// Returns the element path within the submodel.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns whether the operation runs through the Operation Service.
    #[must_use]
    pub const fn is_delegated(&self) -> bool {
        self.delegated
    }

    /// Returns the `submodel/path` name used for fingerprints and jobs.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.submodel, self.path)
    }
}

/// Settings for the twin client.
#[derive(Clone, Debug)]
pub struct TwinClientConfig {
    base_url: String,
    opservice_url: Option<String>,
    execution_timeout: Duration,
    retry: RetryPolicy,
    breaker: BreakerConfig,
    max_concurrency: usize,
    job_poll_initial: Duration,
    job_poll_max_interval: Duration,
    signer: Option<RequestSigner>,
}

impl TwinClientConfig {
    /// Creates a configuration for the AAS repository at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Configuration`] when the URL is missing a
    /// scheme.
    pub fn new(base_url: impl AsRef<str>) -> ClientResult<Self> {
        Ok(Self {
            base_url: sanitize_base_url(base_url.as_ref())?,
            opservice_url: None,
            execution_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            breaker: BreakerConfig::default(),
            max_concurrency: 8,
            job_poll_initial: Duration::from_millis(250),
            job_poll_max_interval: Duration::from_secs(5),
            signer: None,
        })
    }

    /// Sets the Operation Service base URL for delegated jobs.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Configuration`] when the URL is missing a
    /// scheme.
    pub fn with_opservice_url(mut self, url: impl AsRef<str>) -> ClientResult<Self> {
        self.opservice_url = Some(sanitize_base_url(url.as_ref())?);
        Ok(self)
    }

    /// Sets the per-call execution deadline.
    #[must_use]
    pub const fn with_execution_timeout(mut self, deadline: Duration) -> Self {
        self.execution_timeout = deadline;
        self
    }

    /// Sets the transient-failure retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the circuit-breaker thresholds.
    #[must_use]
    pub const fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    /// Bounds the number of in-flight calls through this client. Excess
    /// callers queue on the internal semaphore up to their deadline.
    #[must_use]
    pub const fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Sets the delegated-job polling ceiling.
    #[must_use]
    pub const fn with_job_poll_max_interval(mut self, max_interval: Duration) -> Self {
        self.job_poll_max_interval = max_interval;
        self
    }

    /// Installs the HMAC signer for Operation Service requests.
    #[must_use]
    pub fn with_signer(mut self, signer: RequestSigner) -> Self {
        self.signer = Some(signer);
        self
    }
}

const AAS_ENDPOINT: &str = "aas";
const OPSERVICE_ENDPOINT: &str = "opservice";

/// HTTP client against the AAS repository and Operation Service.
///
/// In-flight calls are bounded by a per-client semaphore; the circuit
/// breaker and retry policy govern failure handling on top of that.
pub struct TwinClient {
    client: HyperClient,
    config: TwinClientConfig,
    idempotency: Arc<dyn IdempotencyStore>,
    breakers: Mutex<HashMap<&'static str, Arc<CircuitBreaker>>>,
    limiter: Semaphore,
}

impl std::fmt::Debug for TwinClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TwinClient")
            .field("base_url", &self.config.base_url)
            .field("opservice_url", &self.config.opservice_url)
            .finish_non_exhaustive()
    }
}

impl TwinClient {
    /// Creates a client with the supplied configuration and idempotency
    /// backend.
    #[must_use]
    pub fn new(config: TwinClientConfig, idempotency: Arc<dyn IdempotencyStore>) -> Self {
        let limiter = Semaphore::new(config.max_concurrency);
        Self {
            client: build_client(),
            config,
            idempotency,
            breakers: Mutex::new(HashMap::new()),
            limiter,
        }
    }

    /// Reads one submodel element value.
    ///
    /// # Errors
    ///
    /// Surfaces [`ClientError`] after retries are exhausted.
    pub async fn read_path(&self, submodel: &str, path: &str) -> ClientResult<Value> {
        let uri = format!(
            "{}submodels/{submodel}/submodel-elements/{path}",
            self.config.base_url
        );
        let _permit = self.limiter.acquire().await.expect("client limiter closed");
        let body = retry::run(self.config.retry, |_| {
            self.request_json(Method::GET, &uri, None, None)
        })
        .await?;
        Ok(unwrap_element_value(body))
    }

    /// Reads a whole submodel in value-only form, flattened to
    /// `path → value`.
    ///
    /// # Errors
    ///
    /// Surfaces [`ClientError`] after retries are exhausted.
    pub async fn read_submodel_values(&self, submodel: &str) -> ClientResult<HashMap<String, Value>> {
        let uri = format!("{}submodels/{submodel}/$value", self.config.base_url);
        let _permit = self.limiter.acquire().await.expect("client limiter closed");
        let body = retry::run(self.config.retry, |_| {
            self.request_json(Method::GET, &uri, None, None)
        })
        .await?;

        let mut flattened = HashMap::new();
        flatten_values("", &body, &mut flattened);
        Ok(flattened)
    }

    /// Invokes an operation, consulting the idempotency cache first.
    ///
    /// Direct operations POST the AAS invoke endpoint; delegated operations
    /// submit a job to the Operation Service and poll it to a terminal
    /// state. The whole call is bounded by the execution deadline.
    ///
    /// # Errors
    ///
    /// Surfaces [`ClientError`] with [`ClientError::CircuitOpen`] fast-fails
    /// when the endpoint breaker rejects the call.
    pub async fn invoke(
        &self,
        operation: &OperationRef,
        args: &Value,
        simulate: bool,
        idempotency_key: Option<&str>,
    ) -> ClientResult<Value> {
        let fp = fingerprint(&operation.qualified_name(), args, simulate, idempotency_key);
        cached(self.idempotency.as_ref(), &fp, || {
            self.invoke_uncached(operation, args, simulate)
        })
        .await
    }

    async fn invoke_uncached(
        &self,
        operation: &OperationRef,
        args: &Value,
        simulate: bool,
    ) -> ClientResult<Value> {
        let endpoint = if operation.is_delegated() {
            OPSERVICE_ENDPOINT
        } else {
            AAS_ENDPOINT
        };
        let breaker = self.breaker_for(endpoint);
        breaker.try_acquire()?;

        // Queueing for a concurrency slot counts against the deadline.
        let deadline = self.config.execution_timeout;
        let attempt = async {
            let _permit = self.limiter.acquire().await.expect("client limiter closed");
            if operation.is_delegated() {
                self.invoke_delegated(operation, args, simulate).await
            } else {
                self.invoke_direct(operation, args, simulate).await
            }
        };

        let result = match timeout(deadline, attempt).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout {
                seconds: deadline.as_secs(),
            }),
        };

        match &result {
            Ok(_) => breaker.record_success(),
            Err(err) => {
                warn!(operation = %operation.qualified_name(), error = %err, "invocation failed");
                breaker.record_failure();
            }
        }
        result
    }

    async fn invoke_direct(
        &self,
        operation: &OperationRef,
        args: &Value,
        simulate: bool,
    ) -> ClientResult<Value> {
        let mut uri = format!(
            "{}submodels/{}/submodel-elements/{}/invoke",
            self.config.base_url,
            operation.submodel(),
            operation.path()
        );
        if simulate {
            uri.push_str("?simulate=true");
        }

        let body = serde_json::to_vec(&json!({
            "inputArguments": encode_input_arguments(args),
        }))
        .map_err(|err| ClientError::Response {
            reason: format!("unencodable arguments: {err}"),
        })?;

        let response = retry::run(self.config.retry, |_| {
            self.request_json(Method::POST, &uri, Some(body.clone()), None)
        })
        .await?;
        Ok(decode_output_arguments(&response))
    }

    async fn invoke_delegated(
        &self,
        operation: &OperationRef,
        args: &Value,
        simulate: bool,
    ) -> ClientResult<Value> {
        let Some(ops_base) = self.config.opservice_url.clone() else {
            return Err(ClientError::configuration(
                "delegated operation requires an Operation Service URL",
            ));
        };

        let submit_uri = format!("{ops_base}jobs");
        let body = serde_json::to_vec(&json!({
            "operation": operation.qualified_name(),
            "inputArguments": encode_input_arguments(args),
            "simulate": simulate,
        }))
        .map_err(|err| ClientError::Response {
            reason: format!("unencodable arguments: {err}"),
        })?;

        let job = retry::run(self.config.retry, |_| {
            self.request_json(Method::POST, &submit_uri, Some(body.clone()), Some("/jobs"))
        })
        .await?;

        let job_id = job
            .get("job_id")
            .or_else(|| job.get("id"))
            .and_then(Value::as_str)
            .ok_or_else(|| ClientError::Response {
                reason: "job submission reply carries no id".into(),
            })?
            .to_owned();
        debug!(job_id, operation = %operation.qualified_name(), "delegated job submitted");

        self.poll_job(&ops_base, &job_id).await
    }

    async fn poll_job(&self, ops_base: &str, job_id: &str) -> ClientResult<Value> {
        let uri = format!("{ops_base}jobs/{job_id}");
        let signed_path = format!("/jobs/{job_id}");
        let mut interval = self.config.job_poll_initial;

        loop {
            match self
                .request_json(Method::GET, &uri, None, Some(&signed_path))
                .await
            {
                Ok(status) => {
                    match status.get("status").and_then(Value::as_str) {
                        Some("completed") => {
                            return Ok(status.get("result").cloned().unwrap_or(Value::Null));
                        }
                        Some("failed") => {
                            let reason = status
                                .get("error")
                                .and_then(Value::as_str)
                                .unwrap_or("job failed")
                                .to_owned();
                            return Err(ClientError::Job { reason });
                        }
                        Some("timeout") => {
                            return Err(ClientError::Job {
                                reason: "job timed out at the Operation Service".into(),
                            });
                        }
                        _ => {}
                    }
                }
                Err(err) if err.is_transient() => {
                    debug!(job_id, error = %err, "transient poll failure");
                }
                Err(err) => return Err(err),
            }

            tokio::time::sleep(jittered(interval)).await;
            interval = (interval * 2).min(self.config.job_poll_max_interval);
        }
    }

    fn breaker_for(&self, endpoint: &'static str) -> Arc<CircuitBreaker> {
        let mut guard = self.breakers.lock().expect("breaker map poisoned");
        Arc::clone(
            guard
                .entry(endpoint)
                .or_insert_with(|| Arc::new(CircuitBreaker::new(endpoint, self.config.breaker))),
        )
    }

    async fn request_json(
        &self,
        method: Method,
        uri: &str,
        body: Option<Vec<u8>>,
        signed_path: Option<&str>,
    ) -> ClientResult<Value> {
        let uri: Uri = uri
            .parse()
            .map_err(|err| ClientError::configuration(format!("invalid URI `{uri}`: {err}")))?;

        let payload = body.unwrap_or_default();
        let mut builder = Request::builder()
            .method(method.clone())
            .uri(uri)
            .header(CONTENT_TYPE, "application/json");

        if let (Some(signer), Some(path)) = (&self.config.signer, signed_path) {
            let headers = signer.sign(method.as_str(), path, &payload);
            builder = builder
                .header(SIGNATURE_HEADER, headers.signature)
                .header(TIMESTAMP_HEADER, headers.timestamp);
        }

        let request = builder
            .body(Body::from(payload))
            .map_err(|err| ClientError::transport(format!("failed to build request: {err}")))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|err| ClientError::transport(err.to_string()))?;

        let status = response.status();
        let bytes = to_bytes(response.into_body())
            .await
            .map_err(|err| ClientError::transport(format!("failed to read response: {err}")))?;

        if !status.is_success() {
            return Err(ClientError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }

        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|err| ClientError::Response {
            reason: format!("response is not JSON: {err}"),
        })
    }
}

fn sanitize_base_url(input: &str) -> ClientResult<String> {
    let mut base = input.trim().to_owned();
    if !(base.starts_with("http://") || base.starts_with("https://")) {
        return Err(ClientError::configuration(
            "base URL must start with http:// or https://",
        ));
    }
    if !base.ends_with('/') {
        base.push('/');
    }
    base.parse::<Uri>()
        .map_err(|err| ClientError::configuration(format!("invalid base URL: {err}")))?;
    Ok(base)
}

fn jittered(interval: Duration) -> Duration {
    let millis = interval.as_millis();
    let spread = millis / 5;
    if spread == 0 {
        return interval;
    }
    let offset = rand::thread_rng().gen_range(0..=2 * spread);
    // Spread the delay across [0.8·interval, 1.2·interval].
    let base = millis - spread + offset;
    Duration::from_millis(u64::try_from(base).unwrap_or(u64::MAX))
}

/// Encodes a JSON argument object into AAS `inputArguments` variables.
fn encode_input_arguments(args: &Value) -> Vec<Value> {
    match args {
        Value::Null => Vec::new(),
        Value::Object(map) => map
            .iter()
            .map(|(name, value)| json!({"value": {"idShort": name, "value": value}}))
            .collect(),
        other => vec![json!({"value": {"idShort": "input", "value": other}})],
    }
}

/// Collapses an AAS `outputArguments` reply into a plain JSON value.
fn decode_output_arguments(body: &Value) -> Value {
    let Some(outputs) = body.get("outputArguments").and_then(Value::as_array) else {
        return body.clone();
    };

    let mut collected = Map::new();
    for output in outputs {
        let Some(inner) = output.get("value") else {
            continue;
        };
        match (
            inner.get("idShort").and_then(Value::as_str),
            inner.get("value"),
        ) {
            (Some(name), Some(value)) => {
                collected.insert(name.to_owned(), value.clone());
            }
            _ => {
                collected.insert(format!("output{}", collected.len()), inner.clone());
            }
        }
    }

    match collected.len() {
        0 => Value::Null,
        1 => collected.into_iter().next().map(|(_, value)| value).unwrap_or(Value::Null),
        _ => Value::Object(collected),
    }
}

/// Unwraps a single AAS submodel element response down to its `value`
/// field, discarding envelope metadata such as `idShort`/`modelType`.
fn unwrap_element_value(body: Value) -> Value {
    match body {
        Value::Object(mut map) => map.remove("value").unwrap_or(Value::Object(map)),
        other => other,
    }
}

/// Flattens a value-only submodel body into `path → value` entries, joining
/// nested object keys with `/`.
fn flatten_values(prefix: &str, value: &Value, out: &mut HashMap<String, Value>) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}/{key}")
                };
                flatten_values(&path, nested, out);
            }
        }
        leaf => {
            if !prefix.is_empty() {
                out.insert(prefix.to_owned(), leaf.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::MemoryIdempotencyStore;
    use std::num::NonZeroUsize;

    fn idempotency() -> Arc<dyn IdempotencyStore> {
        Arc::new(MemoryIdempotencyStore::new(
            NonZeroUsize::new(16).unwrap(),
            Duration::from_secs(300),
        ))
    }

    #[test]
    fn base_url_requires_scheme() {
        let err = TwinClientConfig::new("aas.plant.local").expect_err("missing scheme");
        assert!(matches!(err, ClientError::Configuration { .. }));
    }

    #[test]
    fn base_url_gains_trailing_slash() {
        let config = TwinClientConfig::new("http://aas.plant.local:8081/api/v3").unwrap();
        assert_eq!(config.base_url, "http://aas.plant.local:8081/api/v3/");
    }

    #[test]
    fn arguments_encode_per_field() {
        let encoded = encode_input_arguments(&json!({"rpm": 1200, "ramp": "soft"}));
        assert_eq!(encoded.len(), 2);
        assert_eq!(encoded[0]["value"]["idShort"], "ramp");
        assert_eq!(encoded[1]["value"]["value"], 1200);
        assert!(encode_input_arguments(&Value::Null).is_empty());
    }

    #[test]
    fn outputs_collapse_to_plain_values() {
        let single = json!({"outputArguments": [
            {"value": {"idShort": "state", "value": "Running"}}
        ]});
        assert_eq!(decode_output_arguments(&single), json!("Running"));

        let multiple = json!({"outputArguments": [
            {"value": {"idShort": "state", "value": "Running"}},
            {"value": {"idShort": "rpm", "value": 1200}}
        ]});
        assert_eq!(
            decode_output_arguments(&multiple),
            json!({"state": "Running", "rpm": 1200})
        );

        assert_eq!(
            decode_output_arguments(&json!({"outputArguments": []})),
            Value::Null
        );
    }

    #[test]
    fn flatten_joins_nested_paths() {
        let mut out = HashMap::new();
        flatten_values(
            "",
            &json!({"Motor": {"Temperature": 63.5, "Rpm": 1200}, "State": "Running"}),
            &mut out,
        );
        assert_eq!(out.get("Motor/Temperature"), Some(&json!(63.5)));
        assert_eq!(out.get("Motor/Rpm"), Some(&json!(1200)));
        assert_eq!(out.get("State"), Some(&json!("Running")));
    }

    #[tokio::test]
    async fn breaker_opens_after_unreachable_endpoint_failures() {
        // Port 9 (discard) is not listening; every connect fails fast.
        let config = TwinClientConfig::new("http://127.0.0.1:9")
            .unwrap()
            .with_retry(RetryPolicy::none())
            .with_breaker(BreakerConfig::new(2, Duration::from_secs(60)))
            .with_execution_timeout(Duration::from_secs(2));
        let client = TwinClient::new(config, idempotency());
        let operation = OperationRef::direct("Control", "StartPump");

        for _ in 0..2 {
            let err = client
                .invoke(&operation, &json!({}), false, None)
                .await
                .expect_err("endpoint is down");
            assert!(matches!(err, ClientError::Transport { .. }));
        }

        let err = client
            .invoke(&operation, &json!({}), false, None)
            .await
            .expect_err("breaker must trip");
        assert!(matches!(err, ClientError::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn exhausted_concurrency_slots_queue_until_the_deadline() {
        // With zero slots the call queues forever and the deadline fires,
        // so the bound is observable without reaching any endpoint.
        let config = TwinClientConfig::new("http://127.0.0.1:9")
            .unwrap()
            .with_retry(RetryPolicy::none())
            .with_max_concurrency(0)
            .with_execution_timeout(Duration::from_millis(50));
        let client = TwinClient::new(config, idempotency());
        let operation = OperationRef::direct("Control", "StartPump");

        let err = client
            .invoke(&operation, &json!({}), false, None)
            .await
            .expect_err("no slot ever frees");
        assert!(matches!(err, ClientError::Timeout { .. }));
    }

    #[tokio::test]
    async fn delegated_invoke_requires_opservice_url() {
        let config = TwinClientConfig::new("http://127.0.0.1:9")
            .unwrap()
            .with_retry(RetryPolicy::none());
        let client = TwinClient::new(config, idempotency());
        let operation = OperationRef::delegated("Control", "Calibrate");

        let err = client
            .invoke(&operation, &json!({}), false, None)
            .await
            .expect_err("no opservice configured");
        assert!(matches!(err, ClientError::Configuration { .. }));
    }
}
