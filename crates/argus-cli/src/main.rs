//! Argus - autonomous vulnerability remediation
//!
//! The `argus` command scans a source tree, proposes a patch per finding,
//! asks for approval, applies it, verifies it with a generated test and rolls
//! back anything that does not pass.
//!
//! ```text
//! argus ./vulnerable_app
//! argus ./vulnerable_app --auto-approve --json
//! argus ./vulnerable_app --config argus.toml
//! ```

use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, Level};
use walkdir::WalkDir;

use argus_core::pipeline::preflight_target;
use argus_core::{
    ApprovalGate, ApprovalMode, ArgusConfig, AutoApprove, ChannelApprovalGate, EventBus,
    PendingApproval, Pipeline, RemediationStatus, TracingSubscriber,
};

/// Source extension the default verifier and prompts target.
const SOURCE_EXTENSION: &str = "py";

/// Prefixes of files Argus itself writes next to a target.
const GENERATED_PREFIXES: &[&str] = &["test_", "exploit_"];

/// Longest a console reviewer may take before a patch counts as rejected.
const APPROVAL_TIMEOUT: Duration = Duration::from_secs(15 * 60);

#[derive(Parser)]
#[command(name = "argus")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Autonomous vulnerability remediation", long_about = None)]
struct Cli {
    /// Directory to scan and remediate
    #[arg(default_value = ".")]
    target: PathBuf,

    /// TOML configuration file
    #[arg(short, long, env = "ARGUS_CONFIG")]
    config: Option<PathBuf>,

    /// Apply patches without asking
    #[arg(long)]
    auto_approve: bool,

    /// Print the final report as JSON on stdout
    #[arg(long)]
    report_json: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    argus_core::init_tracing(cli.json, level);

    let mut config =
        ArgusConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if cli.auto_approve {
        config.approval = ApprovalMode::Auto;
    }

    preflight_target(&cli.target)?;
    let target = cli
        .target
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", cli.target.display()))?;
    let files = collect_sources(&target);
    info!(target = %target.display(), files = files.len(), "Collected source files");

    let approval: Arc<dyn ApprovalGate> = match config.approval {
        ApprovalMode::Auto => Arc::new(AutoApprove),
        ApprovalMode::Interactive => {
            let (gate, rx) = ChannelApprovalGate::new(1);
            tokio::spawn(console_approvals(rx));
            Arc::new(gate.with_timeout(APPROVAL_TIMEOUT))
        }
    };
    let events = EventBus::new().with(Arc::new(TracingSubscriber));

    let mut pipeline =
        Pipeline::from_config(&config, approval, events).context("Failed to start Argus")?;
    let summary = pipeline.run(&target, &files).await?;

    if cli.report_json {
        println!("{}", serde_json::to_string_pretty(&summary.report)?);
    } else {
        println!("Run {}", summary.run_id);
        println!("  Vulnerabilities found: {}", summary.found());
        for status in [
            RemediationStatus::Fixed,
            RemediationStatus::SkillUpgraded,
            RemediationStatus::Failed,
            RemediationStatus::Skipped,
        ] {
            println!("  {:<22} {}", format!("{status}:"), summary.report.count(status));
        }
        if !summary.discarded.is_empty() {
            println!("  Discarded findings:    {}", summary.discarded.len());
        }
        let usage = &summary.report.usage;
        println!(
            "  Inference cost:        ${:.5} ({} tokens)",
            usage.cost_usd,
            usage.total_tokens()
        );
        println!("  Report: {}", summary.report_path.display());
    }

    Ok(())
}

/// Source files under `root` in a stable order, excluding hidden
/// directories and files Argus generates.
fn collect_sources(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry.file_name()))
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| is_candidate(path))
        .collect()
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

fn is_candidate(path: &Path) -> bool {
    let has_extension = path
        .extension()
        .is_some_and(|ext| ext == SOURCE_EXTENSION);
    let generated = path
        .file_name()
        .map(|name| name.to_string_lossy())
        .is_some_and(|name| GENERATED_PREFIXES.iter().any(|p| name.starts_with(p)));
    has_extension && !generated
}

/// Ask on the terminal for each pending patch.
async fn console_approvals(mut rx: mpsc::Receiver<PendingApproval>) {
    while let Some(pending) = rx.recv().await {
        let prompt = format!(
            "\n{}\n--- proposed {} ---\n{}\n--- end ---\nApply? [y/N] ",
            pending.request.summary(),
            pending.request.target.display(),
            pending.request.fixed_code.trim_end(),
        );
        let answer = tokio::task::spawn_blocking(move || read_answer(&prompt)).await;
        match answer {
            Ok(Some(line)) if is_yes(&line) => pending.approve(),
            Ok(_) => pending.reject("declined by reviewer"),
            Err(err) => pending.reject(format!("approval prompt failed: {err}")),
        }
    }
}

fn read_answer(prompt: &str) -> Option<String> {
    let mut stdout = std::io::stdout().lock();
    write!(stdout, "{prompt}").ok()?;
    stdout.flush().ok()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line).ok()?;
    Some(line)
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn collects_python_sources_only() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("pkg")).unwrap();
        fs::create_dir_all(root.join(".venv")).unwrap();
        fs::write(root.join("app.py"), "x = 1\n").unwrap();
        fs::write(root.join("pkg/db.py"), "y = 2\n").unwrap();
        fs::write(root.join("test_app.py"), "").unwrap();
        fs::write(root.join("exploit_app.py"), "").unwrap();
        fs::write(root.join("app.py.bak"), "").unwrap();
        fs::write(root.join("README.md"), "").unwrap();
        fs::write(root.join(".venv/site.py"), "").unwrap();

        let files = collect_sources(root);
        assert_eq!(files, vec![root.join("app.py"), root.join("pkg/db.py")]);
    }

    #[test]
    fn yes_answers() {
        assert!(is_yes("y\n"));
        assert!(is_yes(" YES "));
        assert!(!is_yes(""));
        assert!(!is_yes("n"));
    }
}
