//! Scripted stand-ins for the pipeline's external seams.
//!
//! Used by unit and integration tests to drive the controller and scanner
//! deterministically: no network, no Python, no terminal.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::approval::{ApprovalDecision, ApprovalGate, ApprovalRequest};
use crate::cache::{CacheError, CacheStore, ScanCache};
use crate::events::{StatusEvent, StatusSubscriber};
use crate::inference::{
    Completion, InferenceBackend, InferenceError, ResponseFormat, Result, TokenUsage,
};
use crate::verify::{VerificationOracle, VerificationReport};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
enum Step {
    Answer(String),
    Fail(String),
    Transient(String),
}

/// Backend that replays a fixed list of responses, then fails.
#[derive(Debug)]
pub struct ScriptedBackend {
    id: String,
    responses: Mutex<VecDeque<Step>>,
    prompts: Mutex<Vec<String>>,
    delay: Option<Duration>,
    usage: Option<TokenUsage>,
    calls: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new<I, S>(id: &str, responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.to_string(),
            responses: Mutex::new(
                responses
                    .into_iter()
                    .map(|r| Step::Answer(r.into()))
                    .collect(),
            ),
            prompts: Mutex::new(Vec::new()),
            delay: None,
            usage: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Every call fails with `message`.
    pub fn failing(id: &str, message: &str) -> Self {
        let backend = Self::new(id, Vec::<String>::new());
        locked(&backend.responses).extend((0..64).map(|_| Step::Fail(message.to_string())));
        backend
    }

    /// Every call fails with a retryable `message`.
    pub fn transient(id: &str, message: &str) -> Self {
        let backend = Self::new(id, Vec::<String>::new());
        locked(&backend.responses).extend((0..64).map(|_| Step::Transient(message.to_string())));
        backend
    }

    /// Append a failure to the script.
    pub fn then_fail(self, message: &str) -> Self {
        locked(&self.responses).push_back(Step::Fail(message.to_string()));
        self
    }

    /// Append a retryable failure to the script.
    pub fn then_transient(self, message: &str) -> Self {
        locked(&self.responses).push_back(Step::Transient(message.to_string()));
        self
    }

    pub fn then_answer(self, text: impl Into<String>) -> Self {
        locked(&self.responses).push_back(Step::Answer(text.into()));
        self
    }

    /// Report `usage` with every answer.
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Sleep before answering; pair with a paused tokio clock.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        locked(&self.prompts).clone()
    }

    pub fn remaining(&self) -> usize {
        locked(&self.responses).len()
    }
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn generate(&self, prompt: &str, _format: ResponseFormat) -> Result<Completion> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        locked(&self.prompts).push(prompt.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = locked(&self.responses).pop_front();
        match next {
            Some(Step::Answer(text)) => Ok(Completion::new(text, self.usage)),
            Some(Step::Fail(message)) => Err(InferenceError::Backend {
                backend: self.id.clone(),
                message,
            }),
            Some(Step::Transient(message)) => Err(InferenceError::Transient {
                backend: self.id.clone(),
                message,
            }),
            None => Err(InferenceError::Backend {
                backend: self.id.clone(),
                message: "script exhausted".to_string(),
            }),
        }
    }
}

/// Oracle that returns queued reports; once the queue is empty it repeats
/// the fallback report.
#[derive(Debug)]
pub struct ScriptedOracle {
    reports: Mutex<VecDeque<VerificationReport>>,
    fallback: VerificationReport,
    runs: Mutex<Vec<PathBuf>>,
}

impl ScriptedOracle {
    pub fn new(reports: impl IntoIterator<Item = VerificationReport>) -> Self {
        Self {
            reports: Mutex::new(reports.into_iter().collect()),
            fallback: VerificationReport::fail("no scripted report"),
            runs: Mutex::new(Vec::new()),
        }
    }

    pub fn always_pass() -> Self {
        Self::new([]).with_fallback(VerificationReport::pass("1 passed"))
    }

    pub fn always_fail(output: &str) -> Self {
        Self::new([]).with_fallback(VerificationReport::fail(output))
    }

    pub fn with_fallback(mut self, report: VerificationReport) -> Self {
        self.fallback = report;
        self
    }

    /// Test paths in the order they were run.
    pub fn runs(&self) -> Vec<PathBuf> {
        locked(&self.runs).clone()
    }
}

#[async_trait]
impl VerificationOracle for ScriptedOracle {
    async fn run_test(&self, test_path: &Path) -> VerificationReport {
        locked(&self.runs).push(test_path.to_path_buf());
        let next = locked(&self.reports).pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

/// Approval gate that replays decisions, approving once they run out.
#[derive(Debug, Default)]
pub struct ScriptedApproval {
    decisions: Mutex<VecDeque<ApprovalDecision>>,
    requests: Mutex<Vec<ApprovalRequest>>,
}

impl ScriptedApproval {
    pub fn new(decisions: impl IntoIterator<Item = ApprovalDecision>) -> Self {
        Self {
            decisions: Mutex::new(decisions.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ApprovalRequest> {
        locked(&self.requests).clone()
    }
}

#[async_trait]
impl ApprovalGate for ScriptedApproval {
    async fn decide(&self, request: &ApprovalRequest) -> ApprovalDecision {
        locked(&self.requests).push(request.clone());
        let next = locked(&self.decisions).pop_front();
        next.unwrap_or(ApprovalDecision::Approve)
    }
}

/// Collects every status event it sees.
#[derive(Debug, Default)]
pub struct RecordingSubscriber {
    events: Mutex<Vec<StatusEvent>>,
}

impl RecordingSubscriber {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<StatusEvent> {
        locked(&self.events).clone()
    }
}

impl StatusSubscriber for RecordingSubscriber {
    fn on_status(&self, event: &StatusEvent) {
        locked(&self.events).push(event.clone());
    }
}

/// In-memory cache store; can be told to fail persistence.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    cache: Mutex<ScanCache>,
    persists: AtomicUsize,
    fail_persist: bool,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cache(cache: ScanCache) -> Self {
        Self {
            cache: Mutex::new(cache),
            ..Self::default()
        }
    }

    pub fn failing_persist() -> Self {
        Self {
            fail_persist: true,
            ..Self::default()
        }
    }

    pub fn snapshot(&self) -> ScanCache {
        locked(&self.cache).clone()
    }

    pub fn persists(&self) -> usize {
        self.persists.load(Ordering::SeqCst)
    }
}

impl CacheStore for MemoryCacheStore {
    fn try_load(&self) -> crate::cache::Result<ScanCache> {
        Ok(locked(&self.cache).clone())
    }

    fn persist(&self, cache: &ScanCache) -> crate::cache::Result<()> {
        self.persists.fetch_add(1, Ordering::SeqCst);
        if self.fail_persist {
            return Err(CacheError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only cache",
            )));
        }
        *locked(&self.cache) = cache.clone();
        Ok(())
    }
}
