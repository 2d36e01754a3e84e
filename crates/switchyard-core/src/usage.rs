//! Token usage, cost estimates and per-model pricing.

use serde::{Deserialize, Serialize};

/// Characters per token assumed when a backend reports no usage.
pub const CHARS_PER_TOKEN: usize = 4;

/// Token counters for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Prompt tokens.
    pub input_tokens: u64,
    /// Generated tokens.
    pub output_tokens: u64,
    /// Always `input_tokens + output_tokens`.
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Builds usage from input/output counts; the total is derived.
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }

    /// Estimates usage from prompt and completion text.
    pub fn estimate(prompt: &str, completion: &str) -> Self {
        Self::new(estimate_tokens(prompt), estimate_tokens(completion))
    }

    /// Whether both counters are zero.
    pub fn is_empty(&self) -> bool {
        self.total_tokens == 0
    }
}

/// Token estimate for `text` using [`CHARS_PER_TOKEN`].
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() / CHARS_PER_TOKEN) as u64
}

/// A priced view of a [`TokenUsage`], in `currency` units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    /// Cost of the prompt tokens.
    pub input_cost: f64,
    /// Cost of the generated tokens.
    pub output_cost: f64,
    /// `input_cost + output_cost`.
    pub total_cost: f64,
    /// ISO currency code.
    pub currency: String,
}

impl CostEstimate {
    /// Builds an estimate; the total is derived.
    pub fn new(input_cost: f64, output_cost: f64) -> Self {
        Self {
            input_cost,
            output_cost,
            total_cost: input_cost + output_cost,
            currency: "USD".to_string(),
        }
    }

    /// A zero-cost estimate (local and mock backends).
    pub fn zero() -> Self {
        Self::new(0.0, 0.0)
    }
}

impl Default for CostEstimate {
    fn default() -> Self {
        Self::zero()
    }
}

/// USD rates per million tokens for one model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    /// USD per million prompt tokens.
    pub input_per_million: f64,
    /// USD per million generated tokens.
    pub output_per_million: f64,
}

impl Pricing {
    /// Creates a pricing entry.
    pub const fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }

    /// Free usage.
    pub const fn free() -> Self {
        Self::new(0.0, 0.0)
    }

    /// Prices `usage` at these rates.
    pub fn estimate(&self, usage: &TokenUsage) -> CostEstimate {
        CostEstimate::new(
            usage.input_tokens as f64 * self.input_per_million / 1_000_000.0,
            usage.output_tokens as f64 * self.output_per_million / 1_000_000.0,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_is_derived() {
        let usage = TokenUsage::new(12, 30);
        assert_eq!(usage.total_tokens, 42);
    }

    #[test]
    fn test_estimate_uses_four_chars_per_token() {
        let usage = TokenUsage::estimate("abcdefgh", "abcd");
        assert_eq!(usage.input_tokens, 2);
        assert_eq!(usage.output_tokens, 1);
        assert_eq!(usage.total_tokens, 3);
    }

    #[test]
    fn test_pricing_estimate() {
        let pricing = Pricing::new(3.0, 15.0);
        let cost = pricing.estimate(&TokenUsage::new(1_000_000, 200_000));
        assert!((cost.input_cost - 3.0).abs() < 1e-9);
        assert!((cost.output_cost - 3.0).abs() < 1e-9);
        assert!((cost.total_cost - 6.0).abs() < 1e-9);
        assert_eq!(cost.currency, "USD");
    }
}
