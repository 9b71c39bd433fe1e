//! Per-vulnerability remediation status and its transition table.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::{ArgusError, Result};

/// Where a vulnerability currently sits in the remediation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationStatus {
    Detected,
    Analyzing,
    GeneratingExploit,
    PatchGenerating,
    /// Suspended until an external approve/reject decision arrives.
    AwaitingApproval,
    Patching,
    VerifyingPatch,
    RetryPending,
    Evolving,
    Fixed,
    SkillUpgraded,
    Failed,
    Skipped,
}

impl RemediationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Detected => "detected",
            Self::Analyzing => "analyzing",
            Self::GeneratingExploit => "generating_exploit",
            Self::PatchGenerating => "patch_generating",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Patching => "patching",
            Self::VerifyingPatch => "verifying_patch",
            Self::RetryPending => "retry_pending",
            Self::Evolving => "evolving",
            Self::Fixed => "fixed",
            Self::SkillUpgraded => "skill_upgraded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Whether this status ends the vulnerability's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Fixed | Self::SkillUpgraded | Self::Failed | Self::Skipped
        )
    }

    /// Whether `self -> next` is a legal edge.
    ///
    /// Every non-terminal state may fail. The only backward edge is
    /// `RetryPending -> PatchGenerating`.
    pub fn can_transition_to(&self, next: RemediationStatus) -> bool {
        use RemediationStatus::*;

        if self.is_terminal() {
            return false;
        }
        if next == Failed {
            return true;
        }
        matches!(
            (self, next),
            (Detected, Analyzing)
                | (Analyzing, GeneratingExploit)
                | (Analyzing, PatchGenerating)
                | (GeneratingExploit, PatchGenerating)
                | (PatchGenerating, AwaitingApproval)
                | (AwaitingApproval, Patching)
                | (AwaitingApproval, Skipped)
                | (Patching, VerifyingPatch)
                | (VerifyingPatch, Fixed)
                | (VerifyingPatch, RetryPending)
                | (VerifyingPatch, Evolving)
                | (RetryPending, PatchGenerating)
                | (Evolving, SkillUpgraded)
        )
    }
}

impl fmt::Display for RemediationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a vulnerability ended in [`RemediationStatus::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    /// Every inference backend failed while generating a patch.
    PatchGenerationFailed { message: String },
    /// The generator answered without a required field.
    InvalidPatch { message: String },
    /// Retries ran out and the skill rewrite was rejected or failed.
    SkillRewriteFailed { message: String },
    /// A filesystem operation on the target failed.
    Io { message: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PatchGenerationFailed { message } => {
                write!(f, "patch generation failed: {message}")
            }
            Self::InvalidPatch { message } => write!(f, "invalid patch: {message}"),
            Self::SkillRewriteFailed { message } => write!(f, "skill rewrite failed: {message}"),
            Self::Io { message } => write!(f, "io error: {message}"),
        }
    }
}

/// Mutable per-vulnerability state owned by the controller.
#[derive(Debug, Clone)]
pub struct RemediationState {
    status: RemediationStatus,
    retry_count: u32,
    backup: Option<Vec<u8>>,
}

impl Default for RemediationState {
    fn default() -> Self {
        Self::new()
    }
}

impl RemediationState {
    pub fn new() -> Self {
        Self {
            status: RemediationStatus::Detected,
            retry_count: 0,
            backup: None,
        }
    }

    pub fn status(&self) -> RemediationStatus {
        self.status
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Pre-patch content of the live attempt, if one is applied.
    pub fn backup(&self) -> Option<&[u8]> {
        self.backup.as_deref()
    }

    /// Move to `next`, returning the previous status.
    ///
    /// # Errors
    ///
    /// Returns `ArgusError::InvalidTransition` for edges outside the table.
    pub fn advance(&mut self, next: RemediationStatus) -> Result<RemediationStatus> {
        if !self.status.can_transition_to(next) {
            return Err(ArgusError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        let previous = self.status;
        self.status = next;
        if next == RemediationStatus::RetryPending {
            self.retry_count += 1;
        }
        Ok(previous)
    }

    pub fn set_backup(&mut self, content: Vec<u8>) {
        self.backup = Some(content);
    }

    /// Release the backup once the attempt is settled (kept or rolled back).
    pub fn take_backup(&mut self) -> Option<Vec<u8>> {
        self.backup.take()
    }
}
