//! Vision model trait and provider implementations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::retry::{retry, RetryPolicy};

use super::repair::parse_model_json;
use super::types::{ProviderKind, VisionRequest};

/// Uniform vision+text chat call over pluggable providers. The response
/// is always a JSON value.
#[async_trait]
pub trait VisionModel: Send + Sync {
    async fn analyze(&self, request: VisionRequest) -> Result<Value>;

    fn provider(&self) -> ProviderKind;
}

/// Configuration shared by the HTTP-backed clients.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub model: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl ModelConfig {
    pub fn new(model: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            base_url: base_url.into(),
            api_key: None,
            timeout_secs: 180,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

fn build_http_client(timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| Error::Internal(format!("failed to create HTTP client: {e}")))
}

fn transport_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::LlmTransport(format!("request timed out: {e}"))
    } else {
        Error::LlmTransport(format!("HTTP request failed: {e}"))
    }
}

/// Map a non-success status to the error taxonomy: auth/quota is a
/// provider error, everything retryable is transport.
fn status_error(provider: ProviderKind, status: reqwest::StatusCode, body: &str) -> Error {
    let summary: String = body.chars().take(300).collect();
    if matches!(status.as_u16(), 401 | 403 | 402) {
        Error::llm_provider(provider.to_string(), format!("{status}: {summary}"))
    } else if status.as_u16() == 429 || status.is_server_error() {
        Error::LlmTransport(format!("{provider} returned {status}: {summary}"))
    } else {
        Error::llm_provider(provider.to_string(), format!("{status}: {summary}"))
    }
}

fn encode_png(png: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(png)
}

/// Ollama-style local HTTP client (`/api/chat`).
pub struct LocalClient {
    config: ModelConfig,
    http: Client,
}

#[derive(Debug, Serialize)]
struct OllamaMessage {
    role: String,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    images: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    format: String,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f64,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    message: OllamaResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OllamaResponseMessage {
    content: String,
}

impl LocalClient {
    pub fn new(config: ModelConfig) -> Result<Self> {
        let http = build_http_client(config.timeout_secs)?;
        Ok(Self { config, http })
    }
}

#[async_trait]
impl VisionModel for LocalClient {
    async fn analyze(&self, request: VisionRequest) -> Result<Value> {
        let api_request = OllamaRequest {
            model: self.config.model.clone(),
            messages: vec![OllamaMessage {
                role: "user".to_string(),
                content: request.prompt,
                images: request.image_png.as_deref().map(|png| vec![encode_png(png)]),
            }],
            stream: false,
            format: "json".to_string(),
            options: OllamaOptions {
                temperature: request.temperature,
            },
        };

        let url = format!("{}/api/chat", self.config.base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .json(&api_request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(status_error(ProviderKind::Local, status, &body));
        }

        let api_response: OllamaResponse = serde_json::from_str(&body)
            .map_err(|e| Error::LlmTransport(format!("malformed local response: {e}")))?;
        parse_model_json(&api_response.message.content)
    }

    fn provider(&self) -> ProviderKind {
        ProviderKind::Local
    }
}

/// OpenAI-compatible chat completions client.
pub struct OpenAiClient {
    config: ModelConfig,
    http: Client,
}

impl OpenAiClient {
    const DEFAULT_BASE_URL: &'static str = "https://api.openai.com";

    pub fn new(mut config: ModelConfig) -> Result<Self> {
        if config.base_url.is_empty() {
            config.base_url = Self::DEFAULT_BASE_URL.to_string();
        }
        let http = build_http_client(config.timeout_secs)?;
        Ok(Self { config, http })
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponseMessage {
    content: String,
}

#[async_trait]
impl VisionModel for OpenAiClient {
    async fn analyze(&self, request: VisionRequest) -> Result<Value> {
        let mut content = vec![serde_json::json!({"type": "text", "text": request.prompt})];
        if let Some(png) = &request.image_png {
            content.push(serde_json::json!({
                "type": "image_url",
                "image_url": {"url": format!("data:image/png;base64,{}", encode_png(png))}
            }));
        }

        let api_request = serde_json::json!({
            "model": self.config.model,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "response_format": {"type": "json_object"},
            "messages": [{"role": "user", "content": content}],
        });

        let url = format!(
            "{}/v1/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let api_key = self.config.api_key.as_deref().ok_or_else(|| {
            Error::llm_provider("openai", "no API key configured".to_string())
        })?;

        let response = self
            .http
            .post(&url)
            .bearer_auth(api_key)
            .json(&api_request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(status_error(ProviderKind::OpenAi, status, &body));
        }

        let api_response: OpenAiResponse = serde_json::from_str(&body)
            .map_err(|e| Error::LlmTransport(format!("malformed OpenAI response: {e}")))?;
        let choice = api_response
            .choices
            .first()
            .ok_or_else(|| Error::LlmContract("no choices in response".to_string()))?;
        parse_model_json(&choice.message.content)
    }

    fn provider(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }
}

/// Anthropic messages client.
pub struct AnthropicClient {
    config: ModelConfig,
    http: Client,
}

impl AnthropicClient {
    const DEFAULT_BASE_URL: &'static str = "https://api.anthropic.com";
    const API_VERSION: &'static str = "2023-06-01";

    pub fn new(mut config: ModelConfig) -> Result<Self> {
        if config.base_url.is_empty() {
            config.base_url = Self::DEFAULT_BASE_URL.to_string();
        }
        let http = build_http_client(config.timeout_secs)?;
        Ok(Self { config, http })
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    #[serde(default)]
    text: Option<String>,
}

#[async_trait]
impl VisionModel for AnthropicClient {
    async fn analyze(&self, request: VisionRequest) -> Result<Value> {
        let mut content = Vec::new();
        if let Some(png) = &request.image_png {
            content.push(serde_json::json!({
                "type": "image",
                "source": {
                    "type": "base64",
                    "media_type": "image/png",
                    "data": encode_png(png),
                }
            }));
        }
        content.push(serde_json::json!({"type": "text", "text": request.prompt}));

        let api_request = serde_json::json!({
            "model": self.config.model,
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "messages": [{"role": "user", "content": content}],
        });

        let url = format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'));
        let api_key = self.config.api_key.as_deref().ok_or_else(|| {
            Error::llm_provider("anthropic", "no API key configured".to_string())
        })?;

        let response = self
            .http
            .post(&url)
            .header("x-api-key", api_key)
            .header("anthropic-version", Self::API_VERSION)
            .json(&api_request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(status_error(ProviderKind::Anthropic, status, &body));
        }

        let api_response: AnthropicResponse = serde_json::from_str(&body)
            .map_err(|e| Error::LlmTransport(format!("malformed Anthropic response: {e}")))?;
        let text = api_response
            .content
            .iter()
            .filter_map(|c| c.text.as_deref())
            .collect::<Vec<_>>()
            .join("");
        parse_model_json(&text)
    }

    fn provider(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }
}

/// Ordered failover across several providers.
pub struct RouterModel {
    models: Vec<Arc<dyn VisionModel>>,
}

impl RouterModel {
    pub fn new(models: Vec<Arc<dyn VisionModel>>) -> Result<Self> {
        if models.is_empty() {
            return Err(Error::Config(
                "router provider requires at least one configured backend".to_string(),
            ));
        }
        Ok(Self { models })
    }
}

#[async_trait]
impl VisionModel for RouterModel {
    async fn analyze(&self, request: VisionRequest) -> Result<Value> {
        let mut last_error = None;
        for model in &self.models {
            match model.analyze(request.clone()).await {
                Ok(value) => return Ok(value),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    debug!(provider = %model.provider(), error = %e, "router backend failed");
                    last_error = Some(e);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| Error::Internal("router had no backends to try".to_string())))
    }

    fn provider(&self) -> ProviderKind {
        ProviderKind::Router
    }
}

/// Retry wrapper applying exponential backoff to transient failures and
/// surfacing the contract error when repair keeps failing.
pub struct RetryingModel {
    inner: Arc<dyn VisionModel>,
    policy: RetryPolicy,
}

impl RetryingModel {
    pub fn new(inner: Arc<dyn VisionModel>, max_retries: u32) -> Self {
        Self {
            inner,
            policy: RetryPolicy::exponential(max_retries.max(1), 1_000),
        }
    }
}

#[async_trait]
impl VisionModel for RetryingModel {
    async fn analyze(&self, request: VisionRequest) -> Result<Value> {
        retry(
            &self.policy,
            |e| e.is_transient() || matches!(e, Error::LlmContract(_)),
            || self.inner.analyze(request.clone()),
        )
        .await
    }

    fn provider(&self) -> ProviderKind {
        self.inner.provider()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyModel {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl VisionModel for FlakyModel {
        async fn analyze(&self, _request: VisionRequest) -> Result<Value> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(Error::LlmTransport("503".to_string()))
            } else {
                Ok(serde_json::json!({"ok": true}))
            }
        }

        fn provider(&self) -> ProviderKind {
            ProviderKind::Local
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retrying_model_recovers_from_transport_errors() {
        let inner = Arc::new(FlakyModel {
            calls: AtomicU32::new(0),
            fail_first: 2,
        });
        let model = RetryingModel::new(inner.clone(), 3);
        let value = model.analyze(VisionRequest::new("hi")).await.unwrap();
        assert_eq!(value["ok"], true);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn router_fails_over_in_order() {
        let dead = Arc::new(FlakyModel {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
        });
        let live = Arc::new(FlakyModel {
            calls: AtomicU32::new(0),
            fail_first: 0,
        });
        let router = RouterModel::new(vec![dead.clone(), live.clone()]).unwrap();
        let value = router.analyze(VisionRequest::new("hi")).await.unwrap();
        assert_eq!(value["ok"], true);
        assert_eq!(dead.calls.load(Ordering::SeqCst), 1);
        assert_eq!(live.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_router_is_a_config_error() {
        assert!(RouterModel::new(vec![]).is_err());
    }
}
