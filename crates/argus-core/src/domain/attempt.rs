//! Immutable record of one generate-apply-verify cycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::vulnerability::VulnerabilityId;

/// How the verification step of an attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationOutcome {
    Passed,
    Failed,
    /// The patch was rejected at the approval gate and never applied.
    Rejected,
}

/// Result of running the reproduction test against the unpatched file.
///
/// Informational only: a reproduction test that already passes against
/// vulnerable code is suspicious, but it does not change control flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvisoryCheck {
    /// `true` when the test failed against the vulnerable code, as intended.
    pub reproduced: bool,
    pub output: String,
}

/// One generate-apply-verify cycle. Retries create a new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchAttempt {
    pub vulnerability: VulnerabilityId,
    /// Zero-based attempt index, bounded by the configured retry budget.
    pub attempt: u32,
    pub reproduction_test_code: String,
    pub fixed_code: String,
    pub outcome: VerificationOutcome,
    pub diagnostics: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advisory: Option<AdvisoryCheck>,
    pub created_at: DateTime<Utc>,
}

impl PatchAttempt {
    pub fn new(
        vulnerability: VulnerabilityId,
        attempt: u32,
        reproduction_test_code: impl Into<String>,
        fixed_code: impl Into<String>,
        outcome: VerificationOutcome,
        diagnostics: impl Into<String>,
        advisory: Option<AdvisoryCheck>,
    ) -> Self {
        Self {
            vulnerability,
            attempt,
            reproduction_test_code: reproduction_test_code.into(),
            fixed_code: fixed_code.into(),
            outcome,
            diagnostics: diagnostics.into(),
            advisory,
            created_at: Utc::now(),
        }
    }

    pub fn passed(&self) -> bool {
        self.outcome == VerificationOutcome::Passed
    }
}
