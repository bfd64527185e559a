//! Anthropic Claude selector using the tool-use API.

use std::{env, fmt, time::Duration};

use async_trait::async_trait;
use hyper::body::to_bytes;
use hyper::header::{CONTENT_TYPE, HeaderValue};
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
pub const ANTHROPIC_API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Configuration for the Anthropic selector.
#[derive(Clone, Debug)]
pub struct AnthropicSelectorConfig {
    api_key: Option<String>,
    model: String,
    base_url: String,
    timeout: Duration,
    max_tokens: u32,
}

impl AnthropicSelectorConfig {
    /// Creates a configuration using the supplied model identifier.
    #[must_use]
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            api_key: None,
            model: model.into(),
            base_url: "https://api.anthropic.com/".to_owned(),
            timeout: Duration::from_secs(60),
            max_tokens: 1024,
        }
    }

    /// Loads the API key from the `ANTHROPIC_API_KEY` environment variable.
    #[must_use]
    pub fn from_env(model: impl Into<String>) -> Self {
        let mut cfg = Self::new(model);
        cfg.api_key = env::var(ANTHROPIC_API_KEY_ENV).ok();
        cfg
    }

    /// Overrides the base URL used for API calls.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Configuration`] if the supplied URL is
    /// invalid.
    pub fn with_base_url(mut self, base_url: impl AsRef<str>) -> AdapterResult<Self> {
        self.base_url = sanitize_base_url(base_url.as_ref())?;
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

/// Anthropic Claude selector that calls the official API over HTTPS.
pub struct AnthropicSelector {
    client: HyperClient,
    endpoint: Uri,
    metadata: SelectorMetadata,
    api_key: String,
    timeout: Duration,
    max_tokens: u32,
    limiter: SelectorLimiter,
}

impl fmt::Debug for AnthropicSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnthropicSelector")
            .field("model", &self.metadata.model())
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl AnthropicSelector {
    /// Constructs a new selector with the provided configuration.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Configuration`] if the API key is missing.
    pub fn new(config: AnthropicSelectorConfig) -> AdapterResult<Self> {
        let api_key = config
            .api_key
            .ok_or_else(|| AdapterError::configuration("Anthropic selector requires an API key"))?;

        let metadata = SelectorMetadata::new("anthropic", config.model.clone());
        let endpoint = format!("{}v1/messages", config.base_url)
            .parse::<Uri>()
            .map_err(|err| {
                AdapterError::configuration(format!("invalid Anthropic endpoint: {err}"))
            })?;

        Ok(Self {
            client: build_client(),
            endpoint,
            metadata,
            api_key,
            timeout: config.timeout,
            max_tokens: config.max_tokens,
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

    fn build_request(&self, message: &str, catalog: &[ToolSchema]) -> MessagesRequest {
        MessagesRequest {
            model: self.metadata.model().to_owned(),
            max_tokens: self.max_tokens,
            system: Some(
                "You mediate operator commands to an industrial asset. Use the provided tools; \
                 do not invent operations."
                    .to_owned(),
            ),
            messages: vec![AnthropicMessage {
                role: "user".to_owned(),
                content: message.to_owned(),
            }],
            tools: catalog.iter().map(map_tool_schema).collect(),
        }
    }
}

#[async_trait]
impl ToolSelector for AnthropicSelector {
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
            reason: format!("failed to encode Anthropic request: {err}"),
        })?;

        let request = Request::post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .header("x-api-key", &self.api_key)
            .header(
                "anthropic-version",
                HeaderValue::from_static(ANTHROPIC_VERSION),
            )
            .body(Body::from(body))
            .map_err(|err| {
                AdapterError::transport(format!("failed to build Anthropic request: {err}"))
            })?;

        let _permit = self.limiter.acquire().await;
        let response = timeout(self.timeout, self.client.request(request))
            .await
            .map_err(|_| AdapterError::transport("Anthropic request timed out"))?
            .map_err(|err| AdapterError::transport(format!("Anthropic request failed: {err}")))?;

        let status = response.status();
        let bytes = to_bytes(response.into_body()).await.map_err(|err| {
            AdapterError::transport(format!("failed to read Anthropic response: {err}"))
        })?;

        if status.as_u16() == 429 {
            return Err(AdapterError::RateLimited { retry_after: None });
        }
        if !status.is_success() {
            let reason = String::from_utf8_lossy(&bytes).to_string();
            return Err(AdapterError::response(format!(
                "Anthropic returned {status}: {reason}"
            )));
        }

        let response: MessagesResponse =
            serde_json::from_slice(&bytes).map_err(|err| AdapterError::Response {
                reason: format!("failed to decode Anthropic response: {err}"),
            })?;

        Ok(extract_calls(response))
    }
}

fn extract_calls(response: MessagesResponse) -> Vec<SelectedCall> {
    response
        .content
        .into_iter()
        .filter_map(|block| match block {
            ContentBlock::ToolUse { name, input, .. } => Some(SelectedCall::new(name, input)),
            ContentBlock::Text { .. } => None,
        })
        .collect()
}

fn map_tool_schema(schema: &ToolSchema) -> AnthropicTool {
    AnthropicTool {
        name: schema.name().to_owned(),
        description: schema.description().to_owned(),
        input_schema: schema.parameters().clone(),
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<AnthropicTool>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        #[allow(dead_code)]
        text: String,
    },
    ToolUse {
        #[allow(dead_code)]
        id: String,
        name: String,
        input: Value,
    },
}

fn sanitize_base_url(input: &str) -> AdapterResult<String> {
    let mut base = input.trim().to_owned();
    if !(base.starts_with("http://") || base.starts_with("https://")) {
        return Err(AdapterError::configuration(
            "Anthropic base URL must start with http:// or https://",
        ));
    }
    if !base.ends_with('/') {
        base.push('/');
    }
    base.parse::<Uri>()
        .map_err(|err| AdapterError::configuration(format!("invalid Anthropic base URL: {err}")))?;
    Ok(base)
}
