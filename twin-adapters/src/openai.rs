//! OpenAI selector using the chat-completions function-calling API.

use std::{env, fmt, time::Duration};

use async_trait::async_trait;
use hyper::body::to_bytes;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::{Body, Request, Uri};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::timeout;

use twin_client::http::{HyperClient, build_client};
use twin_primitives::ToolSchema;

use crate::traits::{
    AdapterError, AdapterResult, SelectedCall, SelectorLimiter, SelectorMetadata, ToolSelector,
};

/// Environment variable used when loading configuration automatically.
pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Configuration for the OpenAI selector.
#[derive(Clone, Debug)]
pub struct OpenAiSelectorConfig {
    api_key: Option<String>,
    model: String,
    base_url: String,
    timeout: Duration,
}

impl OpenAiSelectorConfig {
    /// Creates a configuration using the supplied model identifier.
    #[must_use]
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            api_key: None,
            model: model.into(),
            base_url: "https://api.openai.com/".to_owned(),
            timeout: Duration::from_secs(60),
        }
    }

    /// Loads the API key from the `OPENAI_API_KEY` environment variable.
    #[must_use]
    pub fn from_env(model: impl Into<String>) -> Self {
        let mut cfg = Self::new(model);
        cfg.api_key = env::var(OPENAI_API_KEY_ENV).ok();
        cfg
    }

    /// Overrides the base URL used for API calls.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Configuration`] if the supplied URL is
    /// invalid.
    pub fn with_base_url(mut self, base_url: impl AsRef<str>) -> AdapterResult<Self> {
        let mut base = base_url.as_ref().trim().to_owned();
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(AdapterError::configuration(
                "OpenAI base URL must start with http:// or https://",
            ));
        }
        if !base.ends_with('/') {
            base.push('/');
        }
        base.parse::<Uri>()
            .map_err(|err| AdapterError::configuration(format!("invalid OpenAI base URL: {err}")))?;
        self.base_url = base;
        Ok(self)
    }

    /// Sets the HTTP request timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Supplies an explicit API key.
    #[must_use]
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }
}

/// OpenAI selector that calls the chat-completions API over HTTPS.
pub struct OpenAiSelector {
    client: HyperClient,
    endpoint: Uri,
    metadata: SelectorMetadata,
    api_key: String,
    timeout: Duration,
    limiter: SelectorLimiter,
}

impl fmt::Debug for OpenAiSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiSelector")
            .field("model", &self.metadata.model())
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl OpenAiSelector {
    /// Constructs a new selector with the provided configuration.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Configuration`] if the API key is missing.
    pub fn new(config: OpenAiSelectorConfig) -> AdapterResult<Self> {
        let api_key = config
            .api_key
            .ok_or_else(|| AdapterError::configuration("OpenAI selector requires an API key"))?;

        let metadata = SelectorMetadata::new("openai", config.model.clone());
        let endpoint = format!("{}v1/chat/completions", config.base_url)
            .parse::<Uri>()
            .map_err(|err| AdapterError::configuration(format!("invalid OpenAI endpoint: {err}")))?;

        Ok(Self {
            client: build_client(),
            endpoint,
            metadata,
            api_key,
            timeout: config.timeout,
            limiter: SelectorLimiter::default(),
        })
    }

    /// Shares a concurrency limiter with other hosted selectors so one
    /// semaphore bounds all in-flight LLM calls.
    #[must_use]
    pub fn with_limiter(mut self, limiter: SelectorLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    fn build_request(&self, message: &str, catalog: &[ToolSchema]) -> ChatRequest {
        ChatRequest {
            model: self.metadata.model().to_owned(),
            messages: vec![ChatMessage {
                role: "user".to_owned(),
                content: message.to_owned(),
            }],
            tools: catalog.iter().map(map_tool_schema).collect(),
            tool_choice: "auto".to_owned(),
        }
    }
}

#[async_trait]
impl ToolSelector for OpenAiSelector {
    fn metadata(&self) -> &SelectorMetadata {
        &self.metadata
    }

    async fn select(
        &self,
        message: &str,
        catalog: &[ToolSchema],
    ) -> AdapterResult<Vec<SelectedCall>> {
        let payload = self.build_request(message, catalog);
        let body = serde_json::to_vec(&payload).map_err(|err| AdapterError::InvalidRequest {
            reason: format!("failed to encode OpenAI request: {err}"),
        })?;

        let request = Request::post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
            .body(Body::from(body))
            .map_err(|err| {
                AdapterError::transport(format!("failed to build OpenAI request: {err}"))
            })?;

        let _permit = self.limiter.acquire().await;
        let response = timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| AdapterError::transport("OpenAI request timed out"))?
            .map_err(|err| AdapterError::transport(format!("OpenAI request failed: {err}")))?;

        let status = response.status();
        let bytes = to_bytes(response.into_body()).await.map_err(|err| {
            AdapterError::transport(format!("failed to read OpenAI response: {err}"))
        })?;

        if status.as_u16() == 429 {
            return Err(AdapterError::RateLimited { retry_after: None });
        }
        if !status.is_success() {
            let reason = String::from_utf8_lossy(&bytes).to_string();
            return Err(AdapterError::response(format!(
                "OpenAI returned {status}: {reason}"
            )));
        }

        let response: ChatResponse =
            serde_json::from_slice(&bytes).map_err(|err| AdapterError::Response {
                reason: format!("failed to decode OpenAI response: {err}"),
            })?;

        extract_calls(response)
    }
}

fn extract_calls(response: ChatResponse) -> AdapterResult<Vec<SelectedCall>> {
    let Some(choice) = response.choices.into_iter().next() else {
        return Ok(Vec::new());
    };

    choice
        .message
        .tool_calls
        .into_iter()
        .map(|tool_call| {
            let arguments: Value =
                serde_json::from_str(&tool_call.function.arguments).map_err(|err| {
                    AdapterError::Response {
                        reason: format!(
                            "tool call `{}` carries unparseable arguments: {err}",
                            tool_call.function.name
                        ),
                    }
                })?;
            Ok(SelectedCall::new(tool_call.function.name, arguments))
        })
        .collect()
}

fn map_tool_schema(schema: &ToolSchema) -> OpenAiTool {
    OpenAiTool {
        kind: "function".to_owned(),
        function: OpenAiFunction {
            name: schema.name().to_owned(),
            description: schema.description().to_owned(),
            parameters: schema.parameters().clone(),
        },
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OpenAiTool>,
    tool_choice: String,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct OpenAiTool {
    #[serde(rename = "type")]
    kind: String,
    function: OpenAiFunction,
}

#[derive(Debug, Serialize)]
struct OpenAiFunction {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    tool_calls: Vec<ToolCallPayload>,
}

#[derive(Debug, Deserialize)]
struct ToolCallPayload {
    function: FunctionPayload,
}

#[derive(Debug, Deserialize)]
struct FunctionPayload {
    name: String,
    arguments: String,
}
