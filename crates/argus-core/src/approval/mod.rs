//! Human approval before any file is mutated.
//!
//! The controller suspends at `AwaitingApproval` and asks an [`ApprovalGate`]
//! for a decision. Gates never fail: a gate that cannot reach its decision
//! source answers with a rejection, which leaves the target untouched.

pub mod channel;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::VulnerabilityRecord;

pub use channel::{ChannelApprovalGate, PendingApproval};

/// How approvals are obtained for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalMode {
    /// Every patch is applied without asking.
    Auto,
    /// Every patch waits for an explicit decision.
    Interactive,
}

impl FromStr for ApprovalMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "interactive" => Ok(Self::Interactive),
            other => Err(format!("unknown approval mode: {other}")),
        }
    }
}

impl fmt::Display for ApprovalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Auto => "auto",
            Self::Interactive => "interactive",
        })
    }
}

/// Everything a reviewer needs to decide on one proposed patch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub request_id: Uuid,
    pub vulnerability: VulnerabilityRecord,
    pub target: PathBuf,
    pub attempt: u32,
    pub reproduction_test_code: String,
    pub fixed_code: String,
    pub created_at: DateTime<Utc>,
}

impl ApprovalRequest {
    pub fn new(
        vulnerability: VulnerabilityRecord,
        target: PathBuf,
        attempt: u32,
        reproduction_test_code: impl Into<String>,
        fixed_code: impl Into<String>,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            vulnerability,
            target,
            attempt,
            reproduction_test_code: reproduction_test_code.into(),
            fixed_code: fixed_code.into(),
            created_at: Utc::now(),
        }
    }

    /// One-line prompt shown to a human reviewer.
    pub fn summary(&self) -> String {
        format!(
            "Apply patch for {} in {} (attempt {})?",
            self.vulnerability.category(),
            self.vulnerability.file,
            self.attempt + 1
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    Reject { reason: String },
}

impl ApprovalDecision {
    pub fn reject(reason: impl Into<String>) -> Self {
        Self::Reject {
            reason: reason.into(),
        }
    }

    pub fn is_approval(&self) -> bool {
        matches!(self, Self::Approve)
    }
}

/// Source of approve/reject decisions.
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn decide(&self, request: &ApprovalRequest) -> ApprovalDecision;
}

/// Approves everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

#[async_trait]
impl ApprovalGate for AutoApprove {
    async fn decide(&self, _request: &ApprovalRequest) -> ApprovalDecision {
        ApprovalDecision::Approve
    }
}
