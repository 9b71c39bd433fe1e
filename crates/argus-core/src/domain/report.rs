//! Append-only run report, written once at the end of a run.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::attempt::PatchAttempt;
use super::error::Result;
use super::status::{FailureReason, RemediationStatus};
use super::vulnerability::{VulnerabilityId, VulnerabilityRecord};
use crate::inference::UsageTotals;

/// File name of the persisted report inside the reports directory.
pub const REPORT_FILE_NAME: &str = "final_report.json";

/// Final verification verdict for one vulnerability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub file: PathBuf,
    pub vulnerability: VulnerabilityId,
    pub status: RemediationStatus,
}

/// Terminal outcome of a vulnerability's remediation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemediationOutcome {
    pub vulnerability: VulnerabilityId,
    pub status: RemediationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    /// Patch-generator calls made for this vulnerability.
    pub attempts: u32,
}

/// Everything a run found and tried, in the order it happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub vulnerabilities_found: Vec<VulnerabilityRecord>,
    pub patches_attempted: Vec<PatchAttempt>,
    pub verification_results: Vec<VerificationResult>,
    pub outcomes: Vec<RemediationOutcome>,
    /// Tokens and approximate spend across every inference call of the run.
    #[serde(default)]
    pub usage: UsageTotals,
}

impl Default for Report {
    fn default() -> Self {
        Self::new()
    }
}

impl Report {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            vulnerabilities_found: Vec::new(),
            patches_attempted: Vec::new(),
            verification_results: Vec::new(),
            outcomes: Vec::new(),
            usage: UsageTotals::default(),
        }
    }

    pub fn record_found(&mut self, vulnerability: VulnerabilityRecord) {
        self.vulnerabilities_found.push(vulnerability);
    }

    pub fn record_attempt(&mut self, attempt: PatchAttempt) {
        self.patches_attempted.push(attempt);
    }

    pub fn record_verification(&mut self, result: VerificationResult) {
        self.verification_results.push(result);
    }

    pub fn record_outcome(&mut self, outcome: RemediationOutcome) {
        self.outcomes.push(outcome);
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    /// Count of outcomes that ended in `status`.
    pub fn count(&self, status: RemediationStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    /// Attempts recorded for one vulnerability, in order.
    pub fn attempts_for<'a>(
        &'a self,
        id: &'a VulnerabilityId,
    ) -> impl Iterator<Item = &'a PatchAttempt> + 'a {
        self.patches_attempted
            .iter()
            .filter(move |a| &a.vulnerability == id)
    }
}

/// Write `<dir>/final_report.json` in pretty JSON format.
pub fn write_report_json(report: &Report, dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(REPORT_FILE_NAME);
    let json = serde_json::to_vec_pretty(report)?;
    std::fs::write(&path, json)?;
    Ok(path)
}

/// Read a report previously written by [`write_report_json`].
pub fn read_report_json(dir: &Path) -> Result<Report> {
    let json = std::fs::read(dir.join(REPORT_FILE_NAME))?;
    Ok(serde_json::from_slice(&json)?)
}
