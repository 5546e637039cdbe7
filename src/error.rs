//! Error types for catscout.

use thiserror::Error;

/// Result type alias using catscout's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during taxonomy discovery.
#[derive(Error, Debug)]
pub enum Error {
    /// Page navigation or wait failed
    #[error("Navigation error at {url}: {message}")]
    Navigation { url: String, message: String },

    /// Anti-bot challenge page detected
    #[error("Bot detection at {url}: {signal}")]
    BotDetection { url: String, signal: String },

    /// Browser driver failure (launch, CDP transport, element access)
    #[error("Browser error: {0}")]
    Browser(String),

    /// Page analysis failed (prompting, schema validation)
    #[error("Analysis error: {0}")]
    Analysis(String),

    /// Strategy could not be executed against the page
    #[error("Extraction error: {0}")]
    Extraction(String),

    /// Category or hierarchy invariant broken
    #[error("Validation error: {0}")]
    Validation(String),

    /// Store connection failed
    #[error("Store connection error: {0}")]
    StoreConnect(String),

    /// Store write failed for a record
    #[error("Store write error: {0}")]
    StoreWrite(String),

    /// Blueprint read/parse/validate failure
    #[error("Blueprint error: {0}")]
    Blueprint(String),

    /// Transient LLM transport failure (5xx, read timeout)
    #[error("LLM transport error: {0}")]
    LlmTransport(String),

    /// Model output was not valid JSON even after repair
    #[error("LLM contract error: {0}")]
    LlmContract(String),

    /// Provider-level failure (auth, quota)
    #[error("LLM provider error: {provider} - {message}")]
    LlmProvider { provider: String, message: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation timed out
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Run cancelled by the caller
    #[error("Run cancelled")]
    Cancelled,

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a navigation error.
    pub fn navigation(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Navigation {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Create a bot detection error.
    pub fn bot_detection(url: impl Into<String>, signal: impl Into<String>) -> Self {
        Self::BotDetection {
            url: url.into(),
            signal: signal.into(),
        }
    }

    /// Create an LLM provider error.
    pub fn llm_provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::LlmProvider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Whether a retry with backoff is worth attempting.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Navigation { .. }
                | Self::BotDetection { .. }
                | Self::LlmTransport(_)
                | Self::Timeout { .. }
        )
    }

    /// Short taxonomy tag for user-facing reporting.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Navigation { .. } => "navigation",
            Self::BotDetection { .. } => "bot_detection",
            Self::Browser(_) => "browser",
            Self::Analysis(_) => "analysis",
            Self::Extraction(_) => "extraction",
            Self::Validation(_) => "validation",
            Self::StoreConnect(_) => "store_connect",
            Self::StoreWrite(_) => "store_write",
            Self::Blueprint(_) => "blueprint",
            Self::LlmTransport(_) => "llm_transport",
            Self::LlmContract(_) => "llm_contract",
            Self::LlmProvider { .. } => "llm_provider",
            Self::Config(_) => "config",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
            Self::Serialization(_) => "serialization",
            Self::Internal(_) => "internal",
        }
    }

    /// Most likely cause, for the CLI's failure panel.
    pub fn hint(&self) -> &'static str {
        match self {
            Self::Navigation { .. } | Self::Timeout { .. } => {
                "network or slow page; check connectivity and BROWSER_TIMEOUT_MS"
            }
            Self::BotDetection { .. } => "anti-bot challenge; retry later or run headed",
            Self::Browser(_) => "browser install or sandbox; check the Chrome binary",
            Self::Analysis(_) | Self::LlmContract(_) => {
                "model output; try another LLM_PROVIDER or model"
            }
            Self::LlmTransport(_) => "LLM endpoint unreachable; check host and network",
            Self::LlmProvider { .. } => "credentials or quota for the selected provider",
            Self::StoreConnect(_) | Self::StoreWrite(_) => "database configuration (DB_* variables)",
            Self::Config(_) => "environment configuration; see the named variable",
            Self::Blueprint(_) => "blueprint file missing or corrupt; rerun without --blueprint",
            _ => "see the log file for details",
        }
    }
}
