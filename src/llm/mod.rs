//! Vision-capable LLM adapter over pluggable providers.

mod client;
mod repair;
mod types;

pub use client::{
    AnthropicClient, LocalClient, ModelConfig, OpenAiClient, RetryingModel, RouterModel,
    VisionModel,
};
pub use repair::parse_model_json;
pub use types::{ProviderKind, VisionRequest};

use std::sync::Arc;

use crate::config::LlmConfig;
use crate::error::{Error, Result};

/// Build the configured model behind the retry wrapper. For `router`,
/// every backend with usable credentials joins the failover chain, local
/// first.
pub fn build_model(config: &LlmConfig) -> Result<Arc<dyn VisionModel>> {
    let inner: Arc<dyn VisionModel> = match config.provider {
        ProviderKind::Local => Arc::new(local_client(config)?),
        ProviderKind::OpenAi => Arc::new(openai_client(config)?),
        ProviderKind::Anthropic => Arc::new(anthropic_client(config)?),
        ProviderKind::Router => {
            let mut backends: Vec<Arc<dyn VisionModel>> = vec![Arc::new(local_client(config)?)];
            if config.openai_api_key.is_some() {
                backends.push(Arc::new(openai_client(config)?));
            }
            if config.anthropic_api_key.is_some() {
                backends.push(Arc::new(anthropic_client(config)?));
            }
            Arc::new(RouterModel::new(backends)?)
        }
    };
    Ok(Arc::new(RetryingModel::new(inner, config.max_retries)))
}

fn local_client(config: &LlmConfig) -> Result<LocalClient> {
    LocalClient::new(
        ModelConfig::new(&config.local_model, &config.local_host).with_timeout(config.timeout_secs),
    )
}

fn openai_client(config: &LlmConfig) -> Result<OpenAiClient> {
    let key = config
        .openai_api_key
        .as_deref()
        .ok_or_else(|| Error::Config("OPENAI_API_KEY is not set".to_string()))?;
    OpenAiClient::new(
        ModelConfig::new(
            &config.openai_model,
            config.openai_base_url.clone().unwrap_or_default(),
        )
        .with_api_key(key)
        .with_timeout(config.timeout_secs),
    )
}

fn anthropic_client(config: &LlmConfig) -> Result<AnthropicClient> {
    let key = config
        .anthropic_api_key
        .as_deref()
        .ok_or_else(|| Error::Config("ANTHROPIC_API_KEY is not set".to_string()))?;
    AnthropicClient::new(
        ModelConfig::new(&config.anthropic_model, String::new())
            .with_api_key(key)
            .with_timeout(config.timeout_secs),
    )
}

#[cfg(test)]
pub mod testing {
    //! Scripted model for deterministic offline tests.

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::Value;

    use crate::error::{Error, Result};

    use super::{ProviderKind, VisionModel, VisionRequest};

    /// Returns canned JSON responses keyed by a substring of the prompt
    /// (typically the fixture URL), in registration order on ties.
    pub struct ScriptedModel {
        responses: Mutex<HashMap<String, Vec<Value>>>,
        fallback: Option<Value>,
        pub calls: AtomicU32,
    }

    impl ScriptedModel {
        pub fn new() -> Self {
            Self {
                responses: Mutex::new(HashMap::new()),
                fallback: None,
                calls: AtomicU32::new(0),
            }
        }

        pub fn with_response(self, prompt_contains: &str, value: Value) -> Self {
            self.responses
                .lock()
                .unwrap()
                .entry(prompt_contains.to_string())
                .or_default()
                .push(value);
            self
        }

        pub fn with_fallback(mut self, value: Value) -> Self {
            self.fallback = Some(value);
            self
        }

        pub fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl VisionModel for ScriptedModel {
        async fn analyze(&self, request: VisionRequest) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            for (key, queue) in responses.iter_mut() {
                if request.prompt.contains(key.as_str()) && !queue.is_empty() {
                    return Ok(queue.remove(0));
                }
            }
            self.fallback
                .clone()
                .ok_or_else(|| Error::LlmContract("no scripted response for prompt".to_string()))
        }

        fn provider(&self) -> ProviderKind {
            ProviderKind::Local
        }
    }
}
