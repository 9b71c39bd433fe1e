//! Global atomic counters for a remediation run.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] once at the end of a run to emit every value as a
//! single `tracing::info!` event.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    inference_calls: AtomicU64,
    cache_hits: AtomicU64,
    patch_attempts: AtomicU64,
    fixes: AtomicU64,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            inference_calls: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            patch_attempts: AtomicU64::new(0),
            fixes: AtomicU64::new(0),
            input_tokens: AtomicU64::new(0),
            output_tokens: AtomicU64::new(0),
        }
    }

    /// One request sent to one backend.
    pub fn inc_inference_calls(&self) {
        self.inference_calls.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "inference_calls", "counter incremented");
    }

    /// One file served from the scan cache.
    pub fn inc_cache_hits(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "cache_hits", "counter incremented");
    }

    pub fn inc_patch_attempts(&self) {
        self.patch_attempts.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "patch_attempts", "counter incremented");
    }

    pub fn inc_fixes(&self) {
        self.fixes.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "fixes", "counter incremented");
    }

    /// Tokens reported by one completion.
    pub fn add_tokens(&self, input: u64, output: u64) {
        self.input_tokens.fetch_add(input, Ordering::Relaxed);
        self.output_tokens.fetch_add(output, Ordering::Relaxed);
        tracing::trace!(metric = "tokens", input, output, "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            inference_calls = self.inference_calls(),
            cache_hits = self.cache_hits(),
            patch_attempts = self.patch_attempts(),
            fixes = self.fixes(),
            input_tokens = self.input_tokens(),
            output_tokens = self.output_tokens(),
        );
    }

    pub fn inference_calls(&self) -> u64 {
        self.inference_calls.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    pub fn patch_attempts(&self) -> u64 {
        self.patch_attempts.load(Ordering::Relaxed)
    }

    pub fn fixes(&self) -> u64 {
        self.fixes.load(Ordering::Relaxed)
    }

    pub fn input_tokens(&self) -> u64 {
        self.input_tokens.load(Ordering::Relaxed)
    }

    pub fn output_tokens(&self) -> u64 {
        self.output_tokens.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.inference_calls.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.patch_attempts.store(0, Ordering::Relaxed);
        self.fixes.store(0, Ordering::Relaxed);
        self.input_tokens.store(0, Ordering::Relaxed);
        self.output_tokens.store(0, Ordering::Relaxed);
    }
}
