//! LLM request types and provider selection.

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Runtime-selectable provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Ollama-style local HTTP endpoint.
    Local,
    /// OpenAI or any /v1/chat/completions-compatible endpoint.
    OpenAi,
    Anthropic,
    /// Ordered failover across the configured providers.
    Router,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::OpenAi => write!(f, "openai"),
            Self::Anthropic => write!(f, "anthropic"),
            Self::Router => write!(f, "router"),
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" | "ollama" => Ok(Self::Local),
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "router" => Ok(Self::Router),
            other => Err(Error::Config(format!(
                "unknown LLM_PROVIDER '{other}' (expected local, openai, anthropic or router)"
            ))),
        }
    }
}

/// A single vision-plus-text analysis request. The response is always a
/// JSON value; providers without JSON mode are instructed and repaired.
#[derive(Debug, Clone)]
pub struct VisionRequest {
    pub prompt: String,
    /// PNG screenshot, attached when present.
    pub image_png: Option<Vec<u8>>,
    pub temperature: f64,
    pub max_tokens: u32,
}

impl VisionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            image_png: None,
            temperature: 0.0,
            max_tokens: 4096,
        }
    }

    pub fn with_image(mut self, png: Vec<u8>) -> Self {
        self.image_png = Some(png);
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_kind_parses_known_names() {
        assert_eq!("local".parse::<ProviderKind>().unwrap(), ProviderKind::Local);
        assert_eq!("ollama".parse::<ProviderKind>().unwrap(), ProviderKind::Local);
        assert_eq!("OpenAI".parse::<ProviderKind>().unwrap(), ProviderKind::OpenAi);
        assert_eq!("router".parse::<ProviderKind>().unwrap(), ProviderKind::Router);
        assert!("gemini".parse::<ProviderKind>().is_err());
    }
}
