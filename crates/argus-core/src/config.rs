//! Run configuration: defaults, optional TOML file, environment overrides.
//!
//! Precedence, lowest first: built-in defaults, the TOML file, then
//! `ARGUS_PATCH_RETRIES`, `ARGUS_SCAN_RETRIES`, `ARGUS_MODEL_PRIMARY`,
//! `ARGUS_APPROVAL_MODE` and the `GOOGLE_API_KEY` credential from the
//! environment.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::approval::ApprovalMode;
use crate::inference::gemini::DEFAULT_API_BASE;
use crate::inference::{FallbackPolicy, ModelPricing, RetryPolicy};

pub const ENV_PATCH_RETRIES: &str = "ARGUS_PATCH_RETRIES";
pub const ENV_SCAN_RETRIES: &str = "ARGUS_SCAN_RETRIES";
pub const ENV_MODEL_PRIMARY: &str = "ARGUS_MODEL_PRIMARY";
pub const ENV_APPROVAL_MODE: &str = "ARGUS_APPROVAL_MODE";
pub const ENV_API_KEY: &str = "GOOGLE_API_KEY";

/// Placeholder replaced by the test file path in the verifier command.
pub const TEST_PLACEHOLDER: &str = "{test}";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {value:?}")]
    InvalidEnv { key: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Credential that never shows up in `Debug` output.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

/// Subprocess used to run reproduction tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// Program and arguments; `{test}` is replaced by the test file path.
    pub command: Vec<String>,
    pub timeout_ms: u64,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            command: ["python3", "-m", "pytest", TEST_PLACEHOLDER, "-v"]
                .into_iter()
                .map(String::from)
                .collect(),
            timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArgusConfig {
    /// Retries after the first attempt; each vulnerability gets `max_retries + 1` tries.
    pub max_retries: u32,
    /// Model ids in fallback order.
    pub backends: Vec<String>,
    pub api_base: String,
    pub request_timeout_ms: u64,
    /// Same-backend retries for rate limits and server errors.
    pub retry: RetryPolicy,
    /// USD per million tokens, for the run's cost estimate.
    pub pricing: ModelPricing,
    pub cache_path: PathBuf,
    pub reports_dir: PathBuf,
    pub skills_dir: PathBuf,
    pub approval: ApprovalMode,
    pub verifier: VerifierConfig,
    pub generate_exploits: bool,
    pub generate_attack_graphs: bool,
    /// Run the reproduction test against unpatched code before approval.
    pub advisory_check: bool,
    #[serde(skip)]
    pub api_key: Option<ApiKey>,
}

impl Default for ArgusConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backends: vec![
                "gemini-2.5-flash".to_string(),
                "gemini-flash-latest".to_string(),
                "gemini-pro-latest".to_string(),
            ],
            api_base: DEFAULT_API_BASE.to_string(),
            request_timeout_ms: 120_000,
            retry: RetryPolicy::default(),
            pricing: ModelPricing::default(),
            cache_path: PathBuf::from(".argus/scan_cache.json"),
            reports_dir: PathBuf::from("reports"),
            skills_dir: PathBuf::from("skills"),
            approval: ApprovalMode::Interactive,
            verifier: VerifierConfig::default(),
            generate_exploits: true,
            generate_attack_graphs: true,
            advisory_check: true,
            api_key: None,
        }
    }
}

impl ArgusConfig {
    /// Defaults, then `path` if given, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key/value source.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_PATCH_RETRIES) {
            self.max_retries = raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                key: ENV_PATCH_RETRIES.to_string(),
                value: raw.clone(),
            })?;
        }
        if let Some(raw) = lookup(ENV_SCAN_RETRIES) {
            self.retry.max_retries = raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                key: ENV_SCAN_RETRIES.to_string(),
                value: raw.clone(),
            })?;
        }
        if let Some(model) = lookup(ENV_MODEL_PRIMARY) {
            let model = model.trim().to_string();
            if !model.is_empty() {
                self.backends.retain(|b| b != &model);
                self.backends.insert(0, model);
            }
        }
        if let Some(raw) = lookup(ENV_APPROVAL_MODE) {
            self.approval = raw.parse().map_err(|_| ConfigError::InvalidEnv {
                key: ENV_APPROVAL_MODE.to_string(),
                value: raw.clone(),
            })?;
        }
        if let Some(key) = lookup(ENV_API_KEY) {
            if !key.trim().is_empty() {
                self.api_key = Some(ApiKey::new(key.trim()));
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.backends.is_empty() || self.backends.iter().any(|b| b.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "backends must list at least one model id".to_string(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "request_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.verifier.timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "verifier.timeout_ms must be > 0".to_string(),
            ));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(ConfigError::Invalid(
                "retry.initial_backoff_ms must not exceed retry.max_backoff_ms".to_string(),
            ));
        }
        if self.pricing.flash_input < 0.0
            || self.pricing.flash_output < 0.0
            || self.pricing.pro_input < 0.0
            || self.pricing.pro_output < 0.0
        {
            return Err(ConfigError::Invalid(
                "pricing must not be negative".to_string(),
            ));
        }
        if self.verifier.command.is_empty() {
            return Err(ConfigError::Invalid(
                "verifier.command must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn fallback_policy(&self) -> FallbackPolicy {
        FallbackPolicy::new(self.backends.iter().cloned(), self.request_timeout_ms)
            .with_retry(self.retry)
    }

    pub fn verifier_timeout(&self) -> Duration {
        Duration::from_millis(self.verifier.timeout_ms)
    }
}
