//! Ordered backend fallback with bounded per-backend retry.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::usage::{TokenUsage, UsageLedger, UsageTotals};
use super::{Completion, InferenceBackend, InferenceError, ResponseFormat, Result};
use crate::metrics::METRICS;

/// How often one backend is retried after a transient failure.
///
/// Waits grow from `initial_backoff_ms` by `multiplier` per retry and are
/// capped at `max_backoff_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 2_000,
            multiplier: 2,
            max_backoff_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// No retries; a transient failure falls straight through.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Wait before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = self
            .multiplier
            .max(1)
            .saturating_pow(retry.saturating_sub(1));
        let ms = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Ordered backend ids plus the per-call time limit. First success wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackPolicy {
    pub order: Vec<String>,
    pub call_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl FallbackPolicy {
    pub fn new<I, S>(order: I, call_timeout_ms: u64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            order: order.into_iter().map(Into::into).collect(),
            call_timeout_ms,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Successful answer plus the backend that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainResponse {
    pub backend: String,
    pub text: String,
    pub usage: Option<TokenUsage>,
}

/// Backends tried in order until one answers.
///
/// Clones share the usage ledger.
#[derive(Clone)]
pub struct BackendChain {
    backends: Vec<Arc<dyn InferenceBackend>>,
    call_timeout: Duration,
    retry: RetryPolicy,
    ledger: Arc<UsageLedger>,
}

impl BackendChain {
    pub fn new(backends: Vec<Arc<dyn InferenceBackend>>, call_timeout: Duration) -> Self {
        Self {
            backends,
            call_timeout,
            retry: RetryPolicy::default(),
            ledger: Arc::new(UsageLedger::default()),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Replace the usage ledger, e.g. to apply configured pricing.
    pub fn with_ledger(mut self, ledger: Arc<UsageLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn ledger(&self) -> Arc<UsageLedger> {
        self.ledger.clone()
    }

    /// Usage recorded so far by this chain and all its clones.
    pub fn usage(&self) -> UsageTotals {
        self.ledger.snapshot()
    }

    /// Single-backend chain.
    pub fn single(backend: Arc<dyn InferenceBackend>, call_timeout: Duration) -> Self {
        Self::new(vec![backend], call_timeout)
    }

    /// The order this chain will try backends in.
    pub fn policy(&self) -> FallbackPolicy {
        FallbackPolicy {
            order: self.backends.iter().map(|b| b.id().to_string()).collect(),
            call_timeout_ms: self.call_timeout.as_millis() as u64,
            retry: self.retry,
        }
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Try each backend in order, retrying transient failures on the same
    /// backend before moving on.
    ///
    /// # Errors
    ///
    /// `NoBackends` for an empty chain, otherwise `BackendExhausted` carrying
    /// every backend tried and the last failure.
    pub async fn generate(&self, prompt: &str, format: ResponseFormat) -> Result<ChainResponse> {
        if self.backends.is_empty() {
            return Err(InferenceError::NoBackends);
        }

        let mut attempted = Vec::with_capacity(self.backends.len());
        let mut last = None;
        for backend in &self.backends {
            let id = backend.id().to_string();
            attempted.push(id.clone());

            match self.call_with_retry(backend.as_ref(), &id, prompt, format).await {
                Ok(Completion { text, usage }) => {
                    tracing::debug!(event = "inference.answered", backend = %id, chars = text.len());
                    if let Some(usage) = usage {
                        self.ledger.record(&id, usage);
                    }
                    return Ok(ChainResponse {
                        backend: id,
                        text,
                        usage,
                    });
                }
                Err(err) => {
                    tracing::warn!(event = "inference.backend_failed", backend = %id, error = %err);
                    last = Some(err);
                }
            }
        }

        Err(InferenceError::BackendExhausted {
            attempted,
            last: last.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    async fn call_with_retry(
        &self,
        backend: &dyn InferenceBackend,
        id: &str,
        prompt: &str,
        format: ResponseFormat,
    ) -> Result<Completion> {
        let mut retry = 0;
        loop {
            METRICS.inc_inference_calls();
            let outcome = tokio::time::timeout(self.call_timeout, backend.generate(prompt, format))
                .await
                .unwrap_or_else(|_| {
                    Err(InferenceError::Timeout {
                        backend: id.to_string(),
                        timeout_ms: self.call_timeout.as_millis() as u64,
                    })
                });

            match outcome {
                Err(err) if err.is_transient() && retry < self.retry.max_retries => {
                    retry += 1;
                    let wait = self.retry.backoff(retry);
                    tracing::warn!(
                        event = "inference.retry",
                        backend = %id,
                        retry,
                        wait_ms = wait.as_millis() as u64,
                        error = %err,
                    );
                    tokio::time::sleep(wait).await;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::ScriptedBackend;

    #[tokio::test]
    async fn first_success_wins() {
        let a = Arc::new(ScriptedBackend::failing("a", "quota exceeded"));
        let b = Arc::new(ScriptedBackend::new("b", ["from b"]));
        let c = Arc::new(ScriptedBackend::new("c", ["from c"]));
        let chain = BackendChain::new(
            vec![a.clone(), b.clone(), c.clone()],
            Duration::from_secs(5),
        );

        let resp = chain.generate("hi", ResponseFormat::Text).await.unwrap();
        assert_eq!(resp.backend, "b");
        assert_eq!(resp.text, "from b");
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 1);
        assert_eq!(c.calls(), 0);
    }

    #[tokio::test]
    async fn exhaustion_carries_last_failure() {
        let chain = BackendChain::new(
            vec![
                Arc::new(ScriptedBackend::failing("a", "first")),
                Arc::new(ScriptedBackend::failing("b", "second")),
            ],
            Duration::from_secs(5),
        );
        match chain.generate("hi", ResponseFormat::Json).await {
            Err(InferenceError::BackendExhausted { attempted, last }) => {
                assert_eq!(attempted, vec!["a".to_string(), "b".to_string()]);
                assert!(last.contains("second"));
            }
            other => panic!("expected BackendExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_chain_is_an_error() {
        let chain = BackendChain::new(vec![], Duration::from_secs(1));
        assert_eq!(
            chain.generate("hi", ResponseFormat::Text).await,
            Err(InferenceError::NoBackends)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_backend_times_out_and_falls_through() {
        let slow = Arc::new(ScriptedBackend::new("slow", ["late"]).with_delay(Duration::from_secs(60)));
        let fast = Arc::new(ScriptedBackend::new("fast", ["ok"]));
        let chain = BackendChain::new(vec![slow, fast], Duration::from_millis(100));

        let resp = chain.generate("hi", ResponseFormat::Text).await.unwrap();
        assert_eq!(resp.backend, "fast");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried_on_the_same_backend() {
        let flaky = Arc::new(
            ScriptedBackend::new("flaky", Vec::<String>::new())
                .then_transient("HTTP 429")
                .then_transient("HTTP 503")
                .then_answer("recovered"),
        );
        let spare = Arc::new(ScriptedBackend::new("spare", ["unused"]));
        let chain = BackendChain::new(vec![flaky.clone(), spare.clone()], Duration::from_secs(5));

        let started = tokio::time::Instant::now();
        let resp = chain.generate("hi", ResponseFormat::Text).await.unwrap();
        assert_eq!(resp.backend, "flaky");
        assert_eq!(resp.text, "recovered");
        assert_eq!(flaky.calls(), 3);
        assert_eq!(spare.calls(), 0);
        // 2s then 4s of backoff.
        assert!(started.elapsed() >= Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded_then_fall_through() {
        let flaky = Arc::new(ScriptedBackend::transient("flaky", "HTTP 500"));
        let spare = Arc::new(ScriptedBackend::new("spare", ["ok"]));
        let chain = BackendChain::new(vec![flaky.clone(), spare], Duration::from_secs(5))
            .with_retry(RetryPolicy {
                max_retries: 2,
                ..RetryPolicy::default()
            });

        let resp = chain.generate("hi", ResponseFormat::Text).await.unwrap();
        assert_eq!(resp.backend, "spare");
        assert_eq!(flaky.calls(), 3);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let broken = Arc::new(ScriptedBackend::failing("broken", "HTTP 401"));
        let chain = BackendChain::single(broken.clone(), Duration::from_secs(5));
        assert!(chain.generate("hi", ResponseFormat::Text).await.is_err());
        assert_eq!(broken.calls(), 1);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.backoff(1), Duration::from_secs(2));
        assert_eq!(retry.backoff(2), Duration::from_secs(4));
        assert_eq!(retry.backoff(3), Duration::from_secs(8));
        assert_eq!(retry.backoff(10), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn usage_is_shared_across_clones() {
        let backend = Arc::new(
            ScriptedBackend::new("gemini-2.5-flash", ["a", "b"])
                .with_usage(TokenUsage::new(1_000, 200)),
        );
        let chain = BackendChain::single(backend, Duration::from_secs(5));
        let clone = chain.clone();

        let resp = chain.generate("x", ResponseFormat::Text).await.unwrap();
        assert_eq!(resp.usage, Some(TokenUsage::new(1_000, 200)));
        clone.generate("y", ResponseFormat::Text).await.unwrap();

        let totals = chain.usage();
        assert_eq!(totals.completions, 2);
        assert_eq!(totals.input_tokens, 2_000);
        assert_eq!(totals.output_tokens, 400);
        assert!(totals.cost_usd > 0.0);
    }

    #[test]
    fn policy_reflects_order() {
        let chain = BackendChain::new(
            vec![
                Arc::new(ScriptedBackend::new("m1", Vec::<String>::new())),
                Arc::new(ScriptedBackend::new("m2", Vec::<String>::new())),
            ],
            Duration::from_millis(1500),
        );
        assert_eq!(chain.policy(), FallbackPolicy::new(["m1", "m2"], 1500));
    }
}
