//! One end-to-end run: preflight, scan, remediate each finding, write the
//! report.
//!
//! Target and file paths are made absolute on entry. Findings are grouped by
//! the file label they carry and resolved back to the scanned path with that
//! label. Vulnerabilities are then remediated strictly one after another, so a
//! later finding in the same file sees any fix an earlier one applied.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::Instrument;
use uuid::Uuid;

use crate::approval::ApprovalGate;
use crate::cache::fs::FsCacheStore;
use crate::config::{ApiKey, ArgusConfig, ENV_API_KEY};
use crate::controller::{ControllerSettings, RemediationController, RemediationRun};
use crate::domain::{
    write_report_json, ArgusError, RemediationStatus, Report, Result, VulnerabilityRecord,
};
use crate::events::EventBus;
use crate::inference::gemini::build_chain;
use crate::inference::UsageLedger;
use crate::metrics::METRICS;
use crate::obs;
use crate::patch::PatchGenerator;
use crate::prompts::load_audit_instructions;
use crate::scan::{absolute_path, file_labels, ScanOrchestrator};
use crate::skill::{SkillImprover, SkillStore};
use crate::trace::TraceLog;
use crate::verify::SubprocessOracle;

/// What a finished run hands back to its caller.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: String,
    pub report: Report,
    pub report_path: PathBuf,
    /// Findings that could not be tied to exactly one scanned file.
    pub discarded: Vec<VulnerabilityRecord>,
}

impl RunSummary {
    pub fn found(&self) -> usize {
        self.report.vulnerabilities_found.len()
    }

    pub fn fixed(&self) -> usize {
        self.report.count(RemediationStatus::Fixed)
    }
}

/// Fails when `target` is missing or not a directory.
pub fn preflight_target(target: &Path) -> Result<()> {
    if target.is_dir() {
        Ok(())
    } else {
        Err(ArgusError::TargetNotFound(target.to_path_buf()))
    }
}

/// Fails when no inference credential is configured.
pub fn require_api_key(config: &ArgusConfig) -> Result<&ApiKey> {
    config
        .api_key
        .as_ref()
        .ok_or_else(|| ArgusError::MissingCredentials(ENV_API_KEY.to_string()))
}

/// Findings grouped by file label, in first-seen order, each resolved to the
/// path in `files` with that label. Unresolvable labels are dropped.
pub fn group_by_file(
    vulnerabilities: &[VulnerabilityRecord],
    files: &[PathBuf],
) -> Vec<(PathBuf, Vec<VulnerabilityRecord>)> {
    let mut groups: Vec<(String, Vec<VulnerabilityRecord>)> = Vec::new();
    for vulnerability in vulnerabilities {
        match groups.iter_mut().find(|(name, _)| *name == vulnerability.file) {
            Some((_, group)) => group.push(vulnerability.clone()),
            None => groups.push((vulnerability.file.clone(), vec![vulnerability.clone()])),
        }
    }

    let labels = file_labels(files);
    groups
        .into_iter()
        .filter_map(|(name, group)| {
            match labels.iter().position(|label| *label == name) {
                Some(idx) => Some((files[idx].clone(), group)),
                None => {
                    tracing::warn!(event = "pipeline.unresolved_file", file = %name, skipped = group.len());
                    None
                }
            }
        })
        .collect()
}

pub struct Pipeline {
    scanner: ScanOrchestrator,
    controller: RemediationController,
    trace: Arc<TraceLog>,
    usage: Arc<UsageLedger>,
    reports_dir: PathBuf,
}

impl Pipeline {
    pub fn new(
        scanner: ScanOrchestrator,
        controller: RemediationController,
        trace: Arc<TraceLog>,
        reports_dir: impl Into<PathBuf>,
    ) -> Self {
        let usage = scanner.usage_ledger();
        Self {
            scanner,
            controller,
            trace,
            usage,
            reports_dir: reports_dir.into(),
        }
    }

    /// Wire the production collaborators: Gemini backends, the on-disk scan
    /// cache and skill directory, and the subprocess verifier.
    ///
    /// # Errors
    ///
    /// `MissingCredentials` without an API key; `Scan` when the HTTP client
    /// cannot be built.
    pub fn from_config(
        config: &ArgusConfig,
        approval: Arc<dyn ApprovalGate>,
        events: EventBus,
    ) -> Result<Self> {
        let api_key = require_api_key(config)?;
        let chain = build_chain(&config.fallback_policy(), &config.api_base, api_key.expose())?
            .with_ledger(Arc::new(UsageLedger::new(config.pricing)));
        let trace = Arc::new(TraceLog::in_dir(&config.reports_dir));
        let skill = Arc::new(SkillStore::load(&config.skills_dir));

        let scanner = ScanOrchestrator::new(
            chain.clone(),
            Arc::new(FsCacheStore::new(&config.cache_path)),
            load_audit_instructions(&config.skills_dir),
            trace.clone(),
        );
        let controller = RemediationController::new(
            Arc::new(PatchGenerator::new(chain.clone(), skill.clone(), trace.clone())),
            Arc::new(SubprocessOracle::from_config(&config.verifier)),
            approval,
            Arc::new(SkillImprover::new(chain, trace.clone())),
            skill,
            events,
            ControllerSettings::from(config),
        );
        Ok(Self::new(scanner, controller, trace, &config.reports_dir))
    }

    pub fn reports_dir(&self) -> &Path {
        &self.reports_dir
    }

    /// Scan `files` under `target` and remediate every finding.
    ///
    /// # Errors
    ///
    /// Only fatal conditions: missing target, a failed scan, or a report that
    /// cannot be written. Individual vulnerabilities never fail the run.
    pub async fn run(&mut self, target: &Path, files: &[PathBuf]) -> Result<RunSummary> {
        let run_id = Uuid::new_v4().to_string();
        let span = obs::run_span(&run_id);
        self.run_inner(run_id, target, files).instrument(span).await
    }

    async fn run_inner(
        &mut self,
        run_id: String,
        target: &Path,
        files: &[PathBuf],
    ) -> Result<RunSummary> {
        let target = absolute_path(target);
        let files: Vec<PathBuf> = files.iter().map(|p| absolute_path(p)).collect();
        preflight_target(&target)?;
        let started = Instant::now();
        let usage_at_start = self.usage.snapshot();
        obs::emit_run_started(&run_id, &target, files.len());
        self.trace.reset();

        let mut report = Report::new();
        let scan = self.scanner.scan(&files).await?;
        for vulnerability in &scan.vulnerabilities {
            report.record_found(vulnerability.clone());
        }

        if scan.vulnerabilities.is_empty() {
            tracing::info!(event = "pipeline.clean", "no vulnerabilities found");
        }

        for (path, group) in group_by_file(&scan.vulnerabilities, &files) {
            for vulnerability in group {
                let run = self.controller.remediate(&vulnerability, &path).await;
                record_run(&mut report, run);
            }
        }

        report.usage = self.usage.snapshot().since(&usage_at_start);
        tracing::info!(
            event = "pipeline.usage",
            input_tokens = report.usage.input_tokens,
            output_tokens = report.usage.output_tokens,
            cost_usd = report.usage.cost_usd,
        );
        report.finish();
        let report_path = write_report_json(&report, &self.reports_dir)?;
        METRICS.flush();

        let summary = RunSummary {
            run_id,
            report,
            report_path,
            discarded: scan.discarded,
        };
        obs::emit_run_finished(
            &summary.run_id,
            started.elapsed().as_millis() as u64,
            summary.found(),
            summary.fixed(),
        );
        Ok(summary)
    }
}

fn record_run(report: &mut Report, run: RemediationRun) {
    for attempt in run.attempts {
        report.record_attempt(attempt);
    }
    if let Some(result) = run.verification {
        report.record_verification(result);
    }
    if run.vulnerability.attack_graph.is_some() {
        let id = run.vulnerability.id();
        if let Some(found) = report
            .vulnerabilities_found
            .iter_mut()
            .find(|found| found.id() == id)
        {
            *found = run.vulnerability;
        }
    }
    report.record_outcome(run.outcome);
}
