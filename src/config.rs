//! Process-wide configuration, loaded once from the environment.
//!
//! The loaded value is immutable and passed by reference; tests construct
//! their own values via the `Default` impls.

use crate::error::{Error, Result};
use crate::llm::ProviderKind;

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env_opt(name).and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    match env_opt(name) {
        Some(v) => !matches!(v.to_lowercase().as_str(), "0" | "false" | "no" | "off"),
        None => default,
    }
}

/// Relational store connection parameters.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "retail".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
        }
    }
}

/// LLM provider selection and per-provider fields.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub provider: ProviderKind,
    pub local_host: String,
    pub local_model: String,
    pub openai_base_url: Option<String>,
    pub openai_model: String,
    pub openai_api_key: Option<String>,
    pub anthropic_model: String,
    pub anthropic_api_key: Option<String>,
    pub temperature: f64,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Local,
            local_host: "http://localhost:11434".to_string(),
            local_model: "llama3.2-vision".to_string(),
            openai_base_url: None,
            openai_model: "gpt-4o".to_string(),
            openai_api_key: None,
            anthropic_model: "claude-3-5-sonnet-20241022".to_string(),
            anthropic_api_key: None,
            temperature: 0.0,
            timeout_secs: 180,
            max_retries: 3,
        }
    }
}

/// Browser launch parameters.
#[derive(Debug, Clone)]
pub struct BrowserConfig {
    pub headless: bool,
    pub goto_timeout_ms: u64,
    pub wait_timeout_ms: u64,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub user_agent: Option<String>,
    pub locale: Option<String>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            goto_timeout_ms: 60_000,
            wait_timeout_ms: 30_000,
            viewport_width: 1440,
            viewport_height: 900,
            user_agent: None,
            locale: None,
        }
    }
}

/// Traversal and retry bounds.
#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    pub max_depth: u32,
    pub max_categories: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub max_reanalyses: u32,
    pub bot_backoff_ms: u64,
    pub blueprint_dir: String,
    pub dom_cap_bytes: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_depth: 5,
            max_categories: 10_000,
            max_retries: 3,
            retry_delay_ms: 1_000,
            max_reanalyses: 3,
            bot_backoff_ms: 15_000,
            blueprint_dir: "blueprints".to_string(),
            dom_cap_bytes: 48 * 1024,
        }
    }
}

/// Log sink parameters. The sink itself is set up by the binary.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
    pub file: Option<String>,
    pub rotate_bytes: u64,
    pub retain_days: u32,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            file: None,
            rotate_bytes: 10 * 1024 * 1024,
            retain_days: 7,
        }
    }
}

/// Flat configuration record for a run.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub store: StoreConfig,
    pub llm: LlmConfig,
    pub browser: BrowserConfig,
    pub extraction: ExtractionConfig,
    pub log: LogConfig,
}

impl Config {
    /// Load configuration from environment variables and validate it.
    pub fn from_env() -> Result<Self> {
        let provider = match env_opt("LLM_PROVIDER") {
            Some(v) => v.parse::<ProviderKind>()?,
            None => ProviderKind::Local,
        };

        let config = Self {
            store: StoreConfig {
                host: env_opt("DB_HOST").unwrap_or_else(|| "localhost".to_string()),
                port: env_parse("DB_PORT", 5432),
                database: env_opt("DB_NAME").unwrap_or_else(|| "retail".to_string()),
                user: env_opt("DB_USER").unwrap_or_else(|| "postgres".to_string()),
                password: env_opt("DB_PASSWORD").unwrap_or_default(),
            },
            llm: LlmConfig {
                provider,
                local_host: env_opt("OLLAMA_HOST")
                    .unwrap_or_else(|| "http://localhost:11434".to_string()),
                local_model: env_opt("OLLAMA_MODEL")
                    .unwrap_or_else(|| "llama3.2-vision".to_string()),
                openai_base_url: env_opt("OPENAI_BASE_URL"),
                openai_model: env_opt("OPENAI_MODEL").unwrap_or_else(|| "gpt-4o".to_string()),
                openai_api_key: env_opt("OPENAI_API_KEY"),
                anthropic_model: env_opt("ANTHROPIC_MODEL")
                    .unwrap_or_else(|| "claude-3-5-sonnet-20241022".to_string()),
                anthropic_api_key: env_opt("ANTHROPIC_API_KEY"),
                temperature: env_parse("MODEL_TEMPERATURE", 0.0),
                timeout_secs: env_parse("MODEL_TIMEOUT_S", 180),
                max_retries: env_parse("MAX_RETRIES", 3),
            },
            browser: BrowserConfig {
                headless: env_bool("BROWSER_HEADLESS", true),
                goto_timeout_ms: env_parse("BROWSER_TIMEOUT_MS", 60_000),
                wait_timeout_ms: env_parse("BROWSER_WAIT_TIMEOUT_MS", 30_000),
                viewport_width: env_parse("VIEWPORT_WIDTH", 1440),
                viewport_height: env_parse("VIEWPORT_HEIGHT", 900),
                user_agent: env_opt("BROWSER_USER_AGENT"),
                locale: env_opt("BROWSER_LOCALE"),
            },
            extraction: ExtractionConfig {
                max_depth: env_parse("MAX_DEPTH", 5),
                max_categories: env_parse("MAX_CATEGORIES", 10_000),
                max_retries: env_parse("MAX_RETRIES", 3),
                retry_delay_ms: env_parse("RETRY_DELAY_MS", 1_000),
                max_reanalyses: env_parse("MAX_REANALYSES", 3),
                bot_backoff_ms: env_parse("BOT_BACKOFF_MS", 15_000),
                blueprint_dir: env_opt("BLUEPRINT_DIR").unwrap_or_else(|| "blueprints".to_string()),
                dom_cap_bytes: env_parse("DOM_CAP_BYTES", 48 * 1024),
            },
            log: LogConfig {
                level: env_opt("LOG_LEVEL").unwrap_or_else(|| "INFO".to_string()),
                file: env_opt("LOG_FILE"),
                rotate_bytes: env_parse("LOG_ROTATE_BYTES", 10 * 1024 * 1024),
                retain_days: env_parse("LOG_RETAIN_DAYS", 7),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Fail fast on missing credentials for the selected services.
    pub fn validate(&self) -> Result<()> {
        if self.store.password.is_empty() {
            return Err(Error::Config(
                "DB_PASSWORD is required but not set".to_string(),
            ));
        }

        match self.llm.provider {
            ProviderKind::OpenAi if self.llm.openai_api_key.is_none() => Err(Error::Config(
                "OPENAI_API_KEY is required for LLM_PROVIDER=openai".to_string(),
            )),
            ProviderKind::Anthropic if self.llm.anthropic_api_key.is_none() => Err(Error::Config(
                "ANTHROPIC_API_KEY is required for LLM_PROVIDER=anthropic".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.store.password = "secret".to_string();
        config
    }

    #[test]
    fn missing_db_password_is_fatal() {
        let config = Config::default();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("DB_PASSWORD"));
    }

    #[test]
    fn provider_key_required_for_selected_provider() {
        let mut config = valid_config();
        config.llm.provider = ProviderKind::Anthropic;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ANTHROPIC_API_KEY"));

        config.llm.anthropic_api_key = Some("sk-test".to_string());
        config.validate().unwrap();
    }

    #[test]
    fn local_provider_needs_no_key() {
        valid_config().validate().unwrap();
    }
}
