//! Token usage and approximate spend.
//!
//! Backends report token counts when the provider returns them. Every clone of
//! a [`BackendChain`](super::BackendChain) shares one [`UsageLedger`], so the
//! scanner, patcher and improver all add to the same run total.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::metrics::METRICS;

const TOKENS_PER_PRICE_UNIT: f64 = 1_000_000.0;

/// Tokens consumed by one completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// USD per million tokens. Model ids containing `flash` use the flash rates,
/// everything else the pro rates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelPricing {
    pub flash_input: f64,
    pub flash_output: f64,
    pub pro_input: f64,
    pub pro_output: f64,
}

impl Default for ModelPricing {
    fn default() -> Self {
        Self {
            flash_input: 0.075,
            flash_output: 0.30,
            pro_input: 3.50,
            pro_output: 10.50,
        }
    }
}

impl ModelPricing {
    pub fn cost(&self, model: &str, usage: TokenUsage) -> f64 {
        let (input, output) = if model.to_lowercase().contains("flash") {
            (self.flash_input, self.flash_output)
        } else {
            (self.pro_input, self.pro_output)
        };
        (usage.input_tokens as f64 * input + usage.output_tokens as f64 * output)
            / TOKENS_PER_PRICE_UNIT
    }
}

/// Running totals, as written into the run report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageTotals {
    /// Completions that reported usage.
    pub completions: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

impl UsageTotals {
    /// What was added after `earlier` was taken.
    pub fn since(&self, earlier: &UsageTotals) -> UsageTotals {
        UsageTotals {
            completions: self.completions.saturating_sub(earlier.completions),
            input_tokens: self.input_tokens.saturating_sub(earlier.input_tokens),
            output_tokens: self.output_tokens.saturating_sub(earlier.output_tokens),
            cost_usd: (self.cost_usd - earlier.cost_usd).max(0.0),
        }
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Default)]
pub struct UsageLedger {
    pricing: ModelPricing,
    totals: Mutex<UsageTotals>,
}

impl UsageLedger {
    pub fn new(pricing: ModelPricing) -> Self {
        Self {
            pricing,
            totals: Mutex::new(UsageTotals::default()),
        }
    }

    pub fn pricing(&self) -> &ModelPricing {
        &self.pricing
    }

    /// Add one completion's usage, priced for `model`.
    pub fn record(&self, model: &str, usage: TokenUsage) {
        let cost = self.pricing.cost(model, usage);
        {
            let mut totals = self.totals.lock().unwrap_or_else(|p| p.into_inner());
            totals.completions += 1;
            totals.input_tokens += usage.input_tokens;
            totals.output_tokens += usage.output_tokens;
            totals.cost_usd += cost;
        }
        METRICS.add_tokens(usage.input_tokens, usage.output_tokens);
        tracing::debug!(
            event = "inference.usage",
            backend = %model,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            cost_usd = cost,
        );
    }

    pub fn snapshot(&self) -> UsageTotals {
        *self.totals.lock().unwrap_or_else(|p| p.into_inner())
    }
}
