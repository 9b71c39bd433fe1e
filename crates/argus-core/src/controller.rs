//! Per-vulnerability remediation state machine.
//!
//! One vulnerability at a time, one attempt at a time:
//!
//! ```text
//! Detected → Analyzing → [GeneratingExploit] → PatchGenerating → AwaitingApproval
//!   → Patching → VerifyingPatch → Fixed
//!                               → RetryPending → PatchGenerating …
//!                               → Evolving → SkillUpgraded | Failed
//!   AwaitingApproval → Skipped
//! ```
//!
//! The target file is only written after approval, always after a `.bak`
//! copy, and restored to its exact pre-attempt bytes whenever verification
//! fails or an I/O step breaks. Every vulnerability ends in a terminal status;
//! nothing here returns an error.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::approval::{ApprovalDecision, ApprovalGate, ApprovalRequest};
use crate::config::ArgusConfig;
use crate::domain::{
    AdvisoryCheck, FailureReason, PatchAttempt, RemediationOutcome, RemediationState,
    RemediationStatus, VerificationOutcome, VerificationResult, VulnerabilityRecord,
};
use crate::events::{EventBus, StatusEvent};
use crate::metrics::METRICS;
use crate::obs;
use crate::patch::PatchGenerator;
use crate::scan::file_name_of;
use crate::skill::{SkillImprover, SkillStore};
use crate::verify::VerificationOracle;

/// Knobs the controller reads from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSettings {
    pub max_retries: u32,
    pub generate_exploits: bool,
    pub generate_attack_graphs: bool,
    pub advisory_check: bool,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            max_retries: 2,
            generate_exploits: false,
            generate_attack_graphs: false,
            advisory_check: false,
        }
    }
}

impl From<&ArgusConfig> for ControllerSettings {
    fn from(config: &ArgusConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            generate_exploits: config.generate_exploits,
            generate_attack_graphs: config.generate_attack_graphs,
            advisory_check: config.advisory_check,
        }
    }
}

/// Sibling reproduction test path: `<dir>/test_<file>`.
pub fn test_path_for(target: &Path) -> PathBuf {
    sibling(target, "test_", "")
}

/// Sibling exploit path: `<dir>/exploit_<file>`.
pub fn exploit_path_for(target: &Path) -> PathBuf {
    sibling(target, "exploit_", "")
}

/// Sibling backup path: `<dir>/<file>.bak`.
pub fn backup_path_for(target: &Path) -> PathBuf {
    sibling(target, "", ".bak")
}

fn sibling(target: &Path, prefix: &str, suffix: &str) -> PathBuf {
    let name = format!("{prefix}{}{suffix}", file_name_of(target));
    match target.parent() {
        Some(dir) => dir.join(name),
        None => PathBuf::from(name),
    }
}

/// Everything one remediation produced, for the report.
#[derive(Debug, Clone, PartialEq)]
pub struct RemediationRun {
    /// The record as remediated, including any attack graph.
    pub vulnerability: VulnerabilityRecord,
    pub outcome: RemediationOutcome,
    pub attempts: Vec<PatchAttempt>,
    /// Present when verification ran at least once.
    pub verification: Option<VerificationResult>,
}

impl RemediationRun {
    pub fn status(&self) -> RemediationStatus {
        self.outcome.status
    }
}

pub struct RemediationController {
    generator: Arc<PatchGenerator>,
    oracle: Arc<dyn VerificationOracle>,
    approval: Arc<dyn ApprovalGate>,
    improver: Arc<SkillImprover>,
    skill: Arc<SkillStore>,
    events: EventBus,
    settings: ControllerSettings,
}

/// Mutable bookkeeping for one `remediate` call.
struct Session<'a> {
    controller: &'a RemediationController,
    vulnerability: VulnerabilityRecord,
    category: String,
    target: &'a Path,
    state: RemediationState,
    attempts: Vec<PatchAttempt>,
    generator_calls: u32,
    verification: Option<VerificationResult>,
}

impl<'a> Session<'a> {
    fn transition(&mut self, to: RemediationStatus, attempt: Option<u32>) {
        match self.state.advance(to) {
            Ok(from) => {
                let event =
                    StatusEvent::new(self.vulnerability.id(), &self.category, from, to, attempt);
                self.controller.events.publish(&event);
            }
            Err(err) => {
                tracing::error!(
                    event = "remediation.bad_transition",
                    vulnerability = %self.vulnerability.id(),
                    error = %err,
                );
            }
        }
    }

    fn record_attempt(&mut self, attempt: PatchAttempt) {
        obs::emit_attempt(&attempt.vulnerability, attempt.attempt, attempt.outcome);
        self.attempts.push(attempt);
    }

    fn record_verification(&mut self, status: RemediationStatus) {
        self.verification = Some(VerificationResult {
            file: self.target.to_path_buf(),
            vulnerability: self.vulnerability.id(),
            status,
        });
    }

    /// Move to `status` if not already terminal and build the run.
    fn finish(mut self, status: RemediationStatus, failure: Option<FailureReason>) -> RemediationRun {
        if !self.state.status().is_terminal() {
            self.transition(status, None);
        }
        let outcome = RemediationOutcome {
            vulnerability: self.vulnerability.id(),
            status: self.state.status(),
            failure,
            attempts: self.generator_calls,
        };
        obs::emit_outcome(&outcome.vulnerability, outcome.status, outcome.failure.as_ref());
        RemediationRun {
            vulnerability: self.vulnerability,
            outcome,
            attempts: self.attempts,
            verification: self.verification,
        }
    }

    fn fail(self, failure: FailureReason) -> RemediationRun {
        self.finish(RemediationStatus::Failed, Some(failure))
    }

    /// Put the pre-attempt bytes back, if a backup is held.
    async fn restore(&mut self) -> std::io::Result<()> {
        if let Some(original) = self.state.take_backup() {
            tokio::fs::write(self.target, original).await?;
        }
        Ok(())
    }

    /// Restore after an I/O failure and end as `Failed { Io }`.
    async fn fail_io(mut self, context: &str, err: std::io::Error) -> RemediationRun {
        let mut message = format!("{context}: {err}");
        if let Err(restore_err) = self.restore().await {
            message.push_str(&format!("; restore failed: {restore_err}"));
        }
        self.fail(FailureReason::Io { message })
    }
}

impl RemediationController {
    pub fn new(
        generator: Arc<PatchGenerator>,
        oracle: Arc<dyn VerificationOracle>,
        approval: Arc<dyn ApprovalGate>,
        improver: Arc<SkillImprover>,
        skill: Arc<SkillStore>,
        events: EventBus,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            generator,
            oracle,
            approval,
            improver,
            skill,
            events,
            settings,
        }
    }

    pub fn settings(&self) -> ControllerSettings {
        self.settings
    }

    /// Drive one vulnerability in `target` to a terminal status.
    pub async fn remediate(
        &self,
        vulnerability: &VulnerabilityRecord,
        target: &Path,
    ) -> RemediationRun {
        let mut session = Session {
            controller: self,
            vulnerability: vulnerability.clone(),
            category: vulnerability.category(),
            target,
            state: RemediationState::new(),
            attempts: Vec::new(),
            generator_calls: 0,
            verification: None,
        };
        let file_name = file_name_of(target);

        session.transition(RemediationStatus::Analyzing, None);

        if self.settings.generate_attack_graphs {
            match self
                .generator
                .generate_attack_graph(&session.vulnerability, &file_name)
                .await
            {
                Ok(graph) => session.vulnerability.attack_graph = Some(graph.visualization_code),
                Err(err) => {
                    tracing::warn!(event = "remediation.attack_graph_failed", error = %err)
                }
            }
        }

        let original = match tokio::fs::read(target).await {
            Ok(bytes) => bytes,
            Err(err) => return session.fail_io("failed to read target", err).await,
        };
        let original_text = String::from_utf8_lossy(&original).into_owned();

        if self.settings.generate_exploits {
            session.transition(RemediationStatus::GeneratingExploit, None);
            self.write_exploit(&session.vulnerability, target, &file_name, &original_text)
                .await;
        }

        let test_path = test_path_for(target);
        let mut feedback: Option<String> = None;

        for attempt in 0..=self.settings.max_retries {
            session.transition(RemediationStatus::PatchGenerating, Some(attempt));
            session.generator_calls += 1;
            METRICS.inc_patch_attempts();

            let patch = match self
                .generator
                .generate_patch(
                    &session.vulnerability,
                    &file_name,
                    &original_text,
                    feedback.as_deref(),
                )
                .await
            {
                Ok(patch) => patch,
                Err(err) if err.is_malformed() => {
                    return session.fail(FailureReason::InvalidPatch {
                        message: err.to_string(),
                    })
                }
                Err(err) => {
                    return session.fail(FailureReason::PatchGenerationFailed {
                        message: err.to_string(),
                    })
                }
            };

            if let Err(err) = tokio::fs::write(&test_path, &patch.reproduction_test_code).await {
                return session.fail_io("failed to write reproduction test", err).await;
            }

            let advisory = if self.settings.advisory_check {
                let report = self.oracle.run_test(&test_path).await;
                Some(AdvisoryCheck {
                    reproduced: !report.passed,
                    output: report.output,
                })
            } else {
                None
            };

            session.transition(RemediationStatus::AwaitingApproval, Some(attempt));
            let request = ApprovalRequest::new(
                session.vulnerability.clone(),
                target.to_path_buf(),
                attempt,
                patch.reproduction_test_code.clone(),
                patch.fixed_code.clone(),
            );
            if let ApprovalDecision::Reject { reason } = self.approval.decide(&request).await {
                session.record_attempt(PatchAttempt::new(
                    session.vulnerability.id(),
                    attempt,
                    patch.reproduction_test_code,
                    patch.fixed_code,
                    VerificationOutcome::Rejected,
                    reason,
                    advisory,
                ));
                return session.finish(RemediationStatus::Skipped, None);
            }

            session.transition(RemediationStatus::Patching, Some(attempt));
            let current = match tokio::fs::read(target).await {
                Ok(bytes) => bytes,
                Err(err) => return session.fail_io("failed to read target", err).await,
            };
            if let Err(err) = tokio::fs::write(backup_path_for(target), &current).await {
                return session.fail_io("failed to write backup", err).await;
            }
            session.state.set_backup(current);
            if let Err(err) = tokio::fs::write(target, &patch.fixed_code).await {
                return session.fail_io("failed to apply patch", err).await;
            }

            session.transition(RemediationStatus::VerifyingPatch, Some(attempt));
            let report = self.oracle.run_test(&test_path).await;
            let outcome = if report.passed {
                VerificationOutcome::Passed
            } else {
                VerificationOutcome::Failed
            };
            session.record_attempt(PatchAttempt::new(
                session.vulnerability.id(),
                attempt,
                patch.reproduction_test_code,
                patch.fixed_code,
                outcome,
                report.output.clone(),
                advisory,
            ));

            if report.passed {
                session.state.take_backup();
                METRICS.inc_fixes();
                session.record_verification(RemediationStatus::Fixed);
                return session.finish(RemediationStatus::Fixed, None);
            }

            if let Err(err) = session.restore().await {
                return session.fail_io("failed to restore target", err).await;
            }

            if attempt < self.settings.max_retries {
                session.transition(RemediationStatus::RetryPending, Some(attempt));
                feedback = Some(report.output);
                continue;
            }

            session.transition(RemediationStatus::Evolving, Some(attempt));
            return match self.improver.improve(&self.skill, &report.output).await {
                Ok(_) => {
                    session.record_verification(RemediationStatus::SkillUpgraded);
                    session.finish(RemediationStatus::SkillUpgraded, None)
                }
                Err(err) => {
                    session.record_verification(RemediationStatus::Failed);
                    session.fail(FailureReason::SkillRewriteFailed {
                        message: err.to_string(),
                    })
                }
            };
        }

        // The loop always returns on its final iteration.
        session.fail(FailureReason::PatchGenerationFailed {
            message: "retry budget exhausted".to_string(),
        })
    }

    /// Best-effort exploit demo next to the target. Never gates remediation.
    async fn write_exploit(
        &self,
        vulnerability: &VulnerabilityRecord,
        target: &Path,
        file_name: &str,
        content: &str,
    ) {
        match self
            .generator
            .generate_exploit(vulnerability, file_name, content)
            .await
        {
            Ok(exploit) => {
                let path = exploit_path_for(target);
                if let Err(err) = tokio::fs::write(&path, exploit.exploit_code).await {
                    obs::emit_persist_error("exploit", &err);
                } else {
                    tracing::info!(event = "remediation.exploit_saved", path = %path.display());
                }
            }
            Err(err) => tracing::warn!(event = "remediation.exploit_failed", error = %err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sibling_paths() {
        let target = Path::new("/src/app/login.py");
        assert_eq!(test_path_for(target), Path::new("/src/app/test_login.py"));
        assert_eq!(exploit_path_for(target), Path::new("/src/app/exploit_login.py"));
        assert_eq!(backup_path_for(target), Path::new("/src/app/login.py.bak"));
    }

    #[test]
    fn settings_from_config() {
        let mut config = ArgusConfig::default();
        config.max_retries = 7;
        config.generate_exploits = false;
        let settings = ControllerSettings::from(&config);
        assert_eq!(settings.max_retries, 7);
        assert!(!settings.generate_exploits);
        assert!(settings.advisory_check);
    }
}
