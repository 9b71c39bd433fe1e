//! Inference layer: backend contract, ordered fallback, response parsing.
//!
//! Every generation call in Argus (scan, patch, exploit, attack graph, skill
//! rewrite) goes through a [`BackendChain`], which tries the configured
//! backends in order and stops at the first one that answers. Transient
//! failures (rate limits, server errors, dropped connections) are retried on
//! the same backend with exponential backoff before the chain moves on.

pub mod chain;
pub mod gemini;
pub mod parse;
pub mod usage;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use chain::{BackendChain, ChainResponse, FallbackPolicy, RetryPolicy};
pub use gemini::GeminiBackend;
pub use parse::{
    parse_structured, strip_markdown_fences, ExploitResult, GraphResult, PatchResult, ScanResult,
};
pub use usage::{ModelPricing, TokenUsage, UsageLedger, UsageTotals};

/// Shape of the answer a backend is asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    Json,
    Text,
}

impl ResponseFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Text => "text/plain",
        }
    }
}

/// Inference failure taxonomy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InferenceError {
    #[error("backend '{backend}' failed: {message}")]
    Backend { backend: String, message: String },

    /// Rate limit, server error or dropped connection; worth retrying.
    #[error("backend '{backend}' is temporarily unavailable: {message}")]
    Transient { backend: String, message: String },

    #[error("backend '{backend}' timed out after {timeout_ms}ms")]
    Timeout { backend: String, timeout_ms: u64 },

    #[error("all backends failed (tried {}): {last}", .attempted.join(", "))]
    BackendExhausted {
        attempted: Vec<String>,
        last: String,
    },

    #[error("malformed {operation} result: {detail}")]
    MalformedResult { operation: String, detail: String },

    #[error("no inference backends configured")]
    NoBackends,
}

impl InferenceError {
    pub fn malformed(operation: &str, detail: impl Into<String>) -> Self {
        Self::MalformedResult {
            operation: operation.to_string(),
            detail: detail.into(),
        }
    }

    /// Whether the failure came from the answer's shape rather than the backends.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::MalformedResult { .. })
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Text of one completion plus the tokens it cost, when the provider says.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

impl Completion {
    pub fn new(text: impl Into<String>, usage: Option<TokenUsage>) -> Self {
        Self {
            text: text.into(),
            usage,
        }
    }

    /// A completion without usage figures.
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(text, None)
    }
}

pub type Result<T> = std::result::Result<T, InferenceError>;

/// One generative model endpoint.
#[async_trait]
pub trait InferenceBackend: Send + Sync + 'static {
    /// Stable identifier, typically the model name.
    fn id(&self) -> &str;

    /// Produce a completion for `prompt` in the requested format.
    async fn generate(&self, prompt: &str, format: ResponseFormat) -> Result<Completion>;
}
