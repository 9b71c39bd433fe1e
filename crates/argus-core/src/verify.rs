//! Verification oracle: runs a reproduction test in a subprocess.
//!
//! The oracle never returns an error. A timeout or a spawn failure is a failed
//! verification with an explanatory diagnostic, which the controller treats
//! like any other failing test.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::config::{VerifierConfig, TEST_PLACEHOLDER};

/// Pass/fail plus combined stdout and stderr.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub passed: bool,
    pub output: String,
}

impl VerificationReport {
    pub fn pass(output: impl Into<String>) -> Self {
        Self {
            passed: true,
            output: output.into(),
        }
    }

    pub fn fail(output: impl Into<String>) -> Self {
        Self {
            passed: false,
            output: output.into(),
        }
    }
}

#[async_trait]
pub trait VerificationOracle: Send + Sync {
    async fn run_test(&self, test_path: &Path) -> VerificationReport;
}

/// Runs a configured command (default `python3 -m pytest <test> -v`) with a
/// hard timeout. The child is killed if the timeout elapses.
///
/// The command runs inside the test's directory and is handed the bare file
/// name, so relative and absolute test paths behave the same.
#[derive(Debug, Clone)]
pub struct SubprocessOracle {
    command: Vec<String>,
    timeout: Duration,
}

impl SubprocessOracle {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self { command, timeout }
    }

    pub fn from_config(config: &VerifierConfig) -> Self {
        Self::new(config.command.clone(), Duration::from_millis(config.timeout_ms))
    }

    /// Substitute `{test}` or, if absent, append the test path.
    fn argv(&self, test_path: &Path) -> Vec<String> {
        let path = test_path.to_string_lossy();
        let mut argv: Vec<String> = self
            .command
            .iter()
            .map(|part| part.replace(TEST_PLACEHOLDER, &path))
            .collect();
        if !self.command.iter().any(|part| part.contains(TEST_PLACEHOLDER)) {
            argv.push(path.into_owned());
        }
        argv
    }

    fn timeout_message(&self) -> String {
        let secs = self.timeout.as_secs_f64();
        if secs.fract() == 0.0 {
            format!("Test timed out after {} seconds.", secs as u64)
        } else {
            format!("Test timed out after {secs:.1} seconds.")
        }
    }
}

#[async_trait]
impl VerificationOracle for SubprocessOracle {
    async fn run_test(&self, test_path: &Path) -> VerificationReport {
        let dir = test_path.parent().filter(|d| !d.as_os_str().is_empty());
        let file = match (dir, test_path.file_name()) {
            (Some(_), Some(name)) => Path::new(name),
            _ => test_path,
        };
        let argv = self.argv(file);
        let Some((program, args)) = argv.split_first() else {
            return VerificationReport::fail("verifier command is empty");
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = dir {
            command.current_dir(dir);
        }

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(event = "verify.spawn_failed", program = %program, error = %e);
                return VerificationReport::fail(format!("failed to start {program}: {e}"));
            }
        };

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return VerificationReport::fail(format!("verifier crashed: {e}")),
            Err(_) => {
                tracing::warn!(event = "verify.timeout", test = %test_path.display());
                return VerificationReport::fail(self.timeout_message());
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        VerificationReport {
            passed: output.status.success(),
            output: combined,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sh(script: &str, timeout: Duration) -> SubprocessOracle {
        SubprocessOracle::new(
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            timeout,
        )
    }

    #[test]
    fn default_command_substitutes_test_path() {
        let oracle = SubprocessOracle::from_config(&VerifierConfig::default());
        let argv = oracle.argv(Path::new("/src/test_app.py"));
        assert_eq!(argv, vec!["python3", "-m", "pytest", "/src/test_app.py", "-v"]);
    }

    #[test]
    fn path_is_appended_without_placeholder() {
        let oracle = SubprocessOracle::new(vec!["runner".into()], Duration::from_secs(1));
        assert_eq!(oracle.argv(Path::new("t.py")), vec!["runner", "t.py"]);
    }

    #[test]
    fn timeout_message_matches_whole_seconds() {
        let oracle = SubprocessOracle::from_config(&VerifierConfig::default());
        assert_eq!(oracle.timeout_message(), "Test timed out after 30 seconds.");
    }

    #[tokio::test]
    async fn passing_command_passes_with_combined_output() {
        let dir = tempfile::tempdir().unwrap();
        let test = dir.path().join("test_x.py");
        std::fs::write(&test, "").unwrap();

        let report = sh("echo out; echo err >&2", Duration::from_secs(10))
            .run_test(&test)
            .await;
        assert!(report.passed);
        assert!(report.output.contains("out"));
        assert!(report.output.contains("err"));
    }

    #[tokio::test]
    async fn relative_test_path_is_found() {
        let dir = tempfile::Builder::new()
            .prefix("argus-verify")
            .tempdir_in(".")
            .unwrap();
        let test = dir.path().join("test_x.py");
        std::fs::write(&test, "").unwrap();
        assert!(test.is_relative());

        let report = sh(r#"test -f "$0" && echo "found $0""#, Duration::from_secs(10))
            .run_test(&test)
            .await;
        assert!(report.passed, "{}", report.output);
        assert!(report.output.contains("found test_x.py"));
    }

    #[tokio::test]
    async fn failing_command_fails() {
        let dir = tempfile::tempdir().unwrap();
        let test = dir.path().join("test_x.py");
        let report = sh("echo boom; exit 1", Duration::from_secs(10))
            .run_test(&test)
            .await;
        assert!(!report.passed);
        assert!(report.output.contains("boom"));
    }

    #[tokio::test]
    async fn timeout_is_a_failure_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let test = dir.path().join("test_x.py");
        let report = sh("sleep 5", Duration::from_millis(200)).run_test(&test).await;
        assert!(!report.passed);
        assert!(report.output.starts_with("Test timed out after"));
    }

    #[tokio::test]
    async fn missing_program_is_a_failure() {
        let oracle = SubprocessOracle::new(
            vec!["definitely-not-a-real-binary-argus".into()],
            Duration::from_secs(1),
        );
        let report = oracle.run_test(&PathBuf::from("test_x.py")).await;
        assert!(!report.passed);
        assert!(report.output.contains("failed to start"));
    }
}
