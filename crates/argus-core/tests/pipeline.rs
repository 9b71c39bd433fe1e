//! End-to-end runs over a temporary source tree with scripted collaborators.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use argus_core::fakes::{
    MemoryCacheStore, RecordingSubscriber, ScriptedApproval, ScriptedBackend, ScriptedOracle,
};
use argus_core::trace::TRACE_FILE_NAME;
use argus_core::{
    read_report_json, ArgusError, BackendChain, ControllerSettings, EventBus, PatchGenerator,
    Pipeline, RemediationController, RemediationStatus, ScanOrchestrator, SkillImprover,
    SkillStore, TokenUsage, TraceLog, VulnerabilityId,
};

const VULNERABLE: &str = "import os\n\ndef run(cmd):\n    os.system('ls ' + cmd)\n";
const FIXED: &str = "import subprocess\n\ndef run(cmd):\n    subprocess.run(['ls', cmd])\n";

fn scan_response(findings: serde_json::Value) -> String {
    serde_json::json!({ "vulnerabilities": findings }).to_string()
}

fn patch_json(fixed: &str) -> String {
    serde_json::json!({
        "reproduction_test_code": "def test_run():\n    assert True\n",
        "fixed_code": fixed,
    })
    .to_string()
}

struct Fixture {
    _dir: tempfile::TempDir,
    target: PathBuf,
    reports: PathBuf,
    events: Arc<RecordingSubscriber>,
    pipeline: Pipeline,
}

fn fixture(backend: ScriptedBackend, oracle: ScriptedOracle) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("app");
    fs::create_dir_all(&target).unwrap();
    let reports = dir.path().join("reports");

    let backend = Arc::new(backend);
    let chain = BackendChain::single(backend, Duration::from_secs(5));
    let trace = Arc::new(TraceLog::in_dir(&reports));
    let skill = Arc::new(SkillStore::in_memory("# Skill\n\n## Rules\n\n- Keep signatures.\n"));
    let events = RecordingSubscriber::new();

    let scanner = ScanOrchestrator::new(
        chain.clone(),
        Arc::new(MemoryCacheStore::new()),
        "Audit these files.",
        trace.clone(),
    );
    let controller = RemediationController::new(
        Arc::new(PatchGenerator::new(chain.clone(), skill.clone(), trace.clone())),
        Arc::new(oracle),
        Arc::new(ScriptedApproval::default()),
        Arc::new(SkillImprover::new(chain, trace.clone())),
        skill,
        EventBus::new().with(events.clone()),
        ControllerSettings::default(),
    );

    Fixture {
        _dir: dir,
        target,
        reports: reports.clone(),
        events,
        pipeline: Pipeline::new(scanner, controller, trace, reports),
    }
}

fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    path
}

#[tokio::test]
async fn run_scans_fixes_and_writes_report() {
    let mut f = fixture(
        ScriptedBackend::new(
            "m",
            [
                scan_response(serde_json::json!([
                    { "file": "tools.py", "line": 4, "type": "Command Injection", "severity": "Critical", "description": "os.system" },
                    { "file": "ghost.py", "line": 1, "type": "SSRF", "severity": "Low", "description": "hallucinated" },
                ])),
                patch_json(FIXED),
            ],
        ),
        ScriptedOracle::always_pass(),
    );
    let tools = write(&f.target, "tools.py", VULNERABLE);

    let summary = f.pipeline.run(&f.target, &[tools.clone()]).await.unwrap();

    assert_eq!(summary.found(), 1);
    assert_eq!(summary.fixed(), 1);
    assert_eq!(summary.discarded.len(), 1);
    assert_eq!(fs::read_to_string(&tools).unwrap(), FIXED);

    let report = read_report_json(&f.reports).unwrap();
    assert_eq!(summary.report_path, f.reports.join("final_report.json"));
    assert!(report.finished_at.is_some());
    assert_eq!(report.vulnerabilities_found.len(), 1);
    assert_eq!(report.patches_attempted.len(), 1);
    assert_eq!(report.verification_results.len(), 1);
    assert_eq!(report.outcomes[0].status, RemediationStatus::Fixed);

    let trace: Vec<serde_json::Value> =
        serde_json::from_slice(&fs::read(f.reports.join(TRACE_FILE_NAME)).unwrap()).unwrap();
    let agents: Vec<&str> = trace.iter().filter_map(|e| e["agent"].as_str()).collect();
    assert_eq!(agents, vec!["ScannerAgent", "PatcherAgent"]);

    assert_eq!(
        f.events.events().last().map(|e| e.to),
        Some(RemediationStatus::Fixed)
    );
}

#[tokio::test]
async fn every_finding_reaches_a_terminal_status() {
    let mut f = fixture(
        ScriptedBackend::new(
            "m",
            [
                scan_response(serde_json::json!([
                    { "file": "a.py", "line": 1, "type": "SQL Injection", "severity": "High", "description": "" },
                    { "file": "b.py", "line": 2, "type": "Path Traversal", "severity": "Medium", "description": "" },
                ])),
                patch_json("fixed a\n"),
                r#"{"fixed_code": "missing test"}"#.to_string(),
            ],
        ),
        ScriptedOracle::always_pass(),
    );
    let a = write(&f.target, "a.py", "a = 1\n");
    let b = write(&f.target, "b.py", "b = 2\n");

    let summary = f.pipeline.run(&f.target, &[a, b.clone()]).await.unwrap();

    assert_eq!(summary.report.outcomes.len(), 2);
    assert!(summary.report.outcomes.iter().all(|o| o.status.is_terminal()));
    assert_eq!(summary.fixed(), 1);
    assert_eq!(summary.report.count(RemediationStatus::Failed), 1);
    assert_eq!(fs::read_to_string(&b).unwrap(), "b = 2\n");
}

#[tokio::test]
async fn second_finding_in_a_file_sees_the_first_fix() {
    let mut f = fixture(
        ScriptedBackend::new(
            "m",
            [
                scan_response(serde_json::json!([
                    { "file": "svc.py", "line": 1, "type": "SQL Injection", "severity": "High", "description": "" },
                    { "file": "svc.py", "line": 7, "type": "SSRF", "severity": "High", "description": "" },
                ])),
                patch_json("after first\n"),
                patch_json("after second\n"),
            ],
        ),
        ScriptedOracle::always_pass(),
    );
    let svc = write(&f.target, "svc.py", "original\n");

    let summary = f.pipeline.run(&f.target, &[svc.clone()]).await.unwrap();

    assert_eq!(summary.fixed(), 2);
    assert_eq!(fs::read_to_string(&svc).unwrap(), "after second\n");
    // The second backup holds the first fix.
    assert_eq!(
        fs::read_to_string(f.target.join("svc.py.bak")).unwrap(),
        "after first\n"
    );
    let second = VulnerabilityId {
        file: "svc.py".to_string(),
        vuln_type: "SSRF".to_string(),
        line: 7,
    };
    assert_eq!(summary.report.attempts_for(&second).count(), 1);
}

#[tokio::test]
async fn same_named_files_are_fixed_separately() {
    let mut f = fixture(
        ScriptedBackend::new(
            "m",
            [
                scan_response(serde_json::json!([
                    { "file": "auth/login.py", "line": 3, "type": "SQL Injection", "severity": "High", "description": "" },
                    { "file": "legacy/login.py", "line": 5, "type": "Command Injection", "severity": "Critical", "description": "" },
                ])),
                patch_json("auth fixed\n"),
                patch_json("legacy fixed\n"),
            ],
        ),
        ScriptedOracle::always_pass(),
    );
    fs::create_dir_all(f.target.join("auth")).unwrap();
    fs::create_dir_all(f.target.join("legacy")).unwrap();
    let auth = write(&f.target.join("auth"), "login.py", "auth original\n");
    let legacy = write(&f.target.join("legacy"), "login.py", "legacy original\n");

    let summary = f
        .pipeline
        .run(&f.target, &[auth.clone(), legacy.clone()])
        .await
        .unwrap();

    assert_eq!(summary.fixed(), 2);
    assert_eq!(fs::read_to_string(&auth).unwrap(), "auth fixed\n");
    assert_eq!(fs::read_to_string(&legacy).unwrap(), "legacy fixed\n");
    assert!(f.target.join("auth/test_login.py").exists());
    assert!(f.target.join("legacy/test_login.py").exists());
}

#[tokio::test]
async fn report_carries_token_usage_for_the_run() {
    let mut f = fixture(
        ScriptedBackend::new(
            "gemini-2.5-flash",
            [
                scan_response(serde_json::json!([
                    { "file": "tools.py", "line": 4, "type": "Command Injection", "severity": "High", "description": "" },
                ])),
                patch_json(FIXED),
            ],
        )
        .with_usage(TokenUsage::new(1_000, 100)),
        ScriptedOracle::always_pass(),
    );
    let tools = write(&f.target, "tools.py", VULNERABLE);

    let summary = f.pipeline.run(&f.target, &[tools]).await.unwrap();

    let usage = summary.report.usage;
    assert_eq!(usage.completions, 2);
    assert_eq!(usage.input_tokens, 2_000);
    assert_eq!(usage.output_tokens, 200);
    let expected = 2.0 * (1_000.0 * 0.075 + 100.0 * 0.30) / 1_000_000.0;
    assert!((usage.cost_usd - expected).abs() < 1e-12);
    let stored = read_report_json(&f.reports).unwrap().usage;
    assert_eq!(stored.input_tokens, usage.input_tokens);
    assert!((stored.cost_usd - usage.cost_usd).abs() < 1e-12);
}

#[tokio::test]
async fn clean_scan_still_writes_a_report() {
    let mut f = fixture(
        ScriptedBackend::new("m", [scan_response(serde_json::json!([]))]),
        ScriptedOracle::always_pass(),
    );
    let file = write(&f.target, "ok.py", "print('hi')\n");

    let summary = f.pipeline.run(&f.target, &[file]).await.unwrap();

    assert_eq!(summary.found(), 0);
    assert!(summary.report.outcomes.is_empty());
    assert!(summary.report_path.exists());
}

#[tokio::test]
async fn missing_target_aborts_before_scanning() {
    let mut f = fixture(
        ScriptedBackend::new("m", Vec::<String>::new()),
        ScriptedOracle::always_pass(),
    );
    let missing = f.target.join("does-not-exist");

    let err = f.pipeline.run(&missing, &[]).await.unwrap_err();

    assert!(matches!(err, ArgusError::TargetNotFound(p) if p == missing));
    assert!(!f.reports.join("final_report.json").exists());
}

#[tokio::test]
async fn failed_scan_aborts_the_run() {
    let mut f = fixture(
        ScriptedBackend::failing("m", "401 unauthorized"),
        ScriptedOracle::always_pass(),
    );
    let file = write(&f.target, "x.py", "x = 1\n");

    let err = f.pipeline.run(&f.target, &[file]).await.unwrap_err();

    assert!(matches!(err, ArgusError::Scan(_)));
    assert!(!f.reports.join("final_report.json").exists());
}

#[tokio::test]
async fn each_run_starts_a_fresh_trace() {
    let mut f = fixture(
        ScriptedBackend::new(
            "m",
            [
                scan_response(serde_json::json!([])),
                scan_response(serde_json::json!([])),
            ],
        ),
        ScriptedOracle::always_pass(),
    );
    let one = write(&f.target, "one.py", "1\n");
    f.pipeline.run(&f.target, &[one]).await.unwrap();

    let two = write(&f.target, "two.py", "2\n");
    f.pipeline.run(&f.target, &[two]).await.unwrap();

    let trace: Vec<serde_json::Value> =
        serde_json::from_slice(&fs::read(f.reports.join(TRACE_FILE_NAME)).unwrap()).unwrap();
    assert_eq!(trace.len(), 1);
}
