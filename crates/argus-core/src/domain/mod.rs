//! Domain models for Argus.
//!
//! Canonical definitions for the core entities:
//! - `VulnerabilityRecord`: a finding reported by the scan
//! - `RemediationState`: per-vulnerability state machine
//! - `PatchAttempt`: one generate-apply-verify cycle
//! - `Report`: append-only record of a run

pub mod attempt;
pub mod error;
pub mod report;
pub mod status;
pub mod vulnerability;

// Re-export main types and errors
pub use attempt::{AdvisoryCheck, PatchAttempt, VerificationOutcome};
pub use error::{ArgusError, Result};
pub use report::{
    read_report_json, write_report_json, RemediationOutcome, Report, VerificationResult,
    REPORT_FILE_NAME,
};
pub use status::{FailureReason, RemediationState, RemediationStatus};
pub use vulnerability::{Severity, VulnerabilityId, VulnerabilityRecord, UNKNOWN_FILE};
