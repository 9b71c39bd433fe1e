//! Domain-level error taxonomy for Argus.

use std::path::PathBuf;

use super::status::RemediationStatus;

/// Argus domain errors.
///
/// Everything here except [`ArgusError::InvalidTransition`] is fatal for a run
/// and surfaces before any vulnerability is processed.
#[derive(Debug, thiserror::Error)]
pub enum ArgusError {
    #[error("target directory not found: {0}")]
    TargetNotFound(PathBuf),

    #[error("missing credentials: {0} is not set")]
    MissingCredentials(String),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: RemediationStatus,
        to: RemediationStatus,
    },

    #[error("scan failed: {0}")]
    Scan(#[from] crate::inference::InferenceError),

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for Argus domain operations.
pub type Result<T> = std::result::Result<T, ArgusError>;
