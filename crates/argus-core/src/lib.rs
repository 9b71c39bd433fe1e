//! Argus Core Library
//!
//! Scan a source tree for vulnerabilities, generate and verify fixes, roll
//! back failed patches, and rewrite the repair instructions when retries run
//! out.

pub mod approval;
pub mod cache;
pub mod config;
pub mod controller;
pub mod domain;
pub mod events;
pub mod fakes;
pub mod inference;
pub mod metrics;
pub mod obs;
pub mod patch;
pub mod pipeline;
pub mod prompts;
pub mod redact;
pub mod scan;
pub mod skill;
pub mod telemetry;
pub mod trace;
pub mod verify;

pub use domain::{
    read_report_json, write_report_json, AdvisoryCheck, ArgusError, FailureReason, PatchAttempt,
    RemediationOutcome, RemediationState, RemediationStatus, Report, Result, Severity,
    VerificationOutcome, VerificationResult, VulnerabilityId, VulnerabilityRecord,
    REPORT_FILE_NAME, UNKNOWN_FILE,
};

pub use approval::{
    ApprovalDecision, ApprovalGate, ApprovalMode, ApprovalRequest, AutoApprove,
    ChannelApprovalGate, PendingApproval,
};
pub use cache::fs::FsCacheStore;
pub use cache::{CacheError, CacheStore, ContentHash, ScanCache, ScanCacheEntry};
pub use config::{ArgusConfig, ConfigError, VerifierConfig};
pub use controller::{ControllerSettings, RemediationController, RemediationRun};
pub use events::{narration_for, EventBus, StatusEvent, StatusSubscriber, TracingSubscriber};
pub use inference::{
    BackendChain, Completion, FallbackPolicy, InferenceBackend, InferenceError, ModelPricing,
    ResponseFormat, RetryPolicy, TokenUsage, UsageLedger, UsageTotals,
};
pub use patch::PatchGenerator;
pub use pipeline::{Pipeline, RunSummary};
pub use redact::redact_secrets;
pub use scan::{file_labels, ScanOrchestrator, ScanOutcome};
pub use skill::{SkillDocument, SkillError, SkillImprover, SkillStore};
pub use trace::{TraceEntry, TraceLog};
pub use verify::{SubprocessOracle, VerificationOracle, VerificationReport};

pub use metrics::METRICS;
pub use obs::{emit_run_finished, emit_run_started, run_span};
pub use telemetry::init_tracing;

/// Argus version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
