//! Structured observability hooks for the remediation run lifecycle.
//!
//! - `run_span` tagging everything inside a run with its id
//! - `emit_*` functions for run start/finish, scan batches, patch attempts
//!   and terminal outcomes
//!
//! Everything is emitted at `info!` except failures, which use `warn!`.

use tracing::info;

use crate::domain::{FailureReason, RemediationStatus, VerificationOutcome, VulnerabilityId};

/// Span tagging everything inside a run with its id.
///
/// ```ignore
/// pipeline.run(files).instrument(run_span("run-12345")).await
/// ```
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("argus.run", run_id = %run_id)
}

pub fn emit_run_started(run_id: &str, target: &std::path::Path, files: usize) {
    info!(
        event = "run.started",
        run_id = %run_id,
        target = %target.display(),
        files = files,
    );
}

pub fn emit_run_finished(run_id: &str, duration_ms: u64, found: usize, fixed: usize) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        found = found,
        fixed = fixed,
    );
}

/// A scan batch finished: how many files were requested, served from cache,
/// and sent for inference.
pub fn emit_scan_batch(requested: usize, cached: usize, scanned: usize, findings: usize) {
    info!(
        event = "scan.batch",
        requested = requested,
        cached = cached,
        scanned = scanned,
        findings = findings,
    );
}

pub fn emit_hallucinated_file(file: &str) {
    tracing::warn!(event = "scan.unknown_file", file = %file, "finding names a file outside the batch");
}

pub fn emit_attempt(vulnerability: &VulnerabilityId, attempt: u32, outcome: VerificationOutcome) {
    info!(
        event = "remediation.attempt",
        vulnerability = %vulnerability,
        attempt = attempt,
        outcome = ?outcome,
    );
}

pub fn emit_outcome(
    vulnerability: &VulnerabilityId,
    status: RemediationStatus,
    failure: Option<&FailureReason>,
) {
    match failure {
        Some(reason) => tracing::warn!(
            event = "remediation.finished",
            vulnerability = %vulnerability,
            status = %status,
            reason = %reason,
        ),
        None => info!(
            event = "remediation.finished",
            vulnerability = %vulnerability,
            status = %status,
        ),
    }
}

pub fn emit_skill_upgraded(version: u64, rules: usize) {
    info!(event = "skill.upgraded", version = version, rules = rules);
}

/// Non-fatal persistence failure (cache, trace, skill file).
pub fn emit_persist_error(what: &str, error: &dyn std::fmt::Display) {
    tracing::warn!(event = "persist.error", what = %what, error = %error);
}
