//! Per-model USD rates.
//!
//! Lookup is by longest matching model-name prefix, so dated snapshots
//! (`claude-sonnet-4-20250514`) share their family's rate.

use switchyard_core::Pricing;

const ANTHROPIC: &[(&str, Pricing)] = &[
    ("claude-opus-4", Pricing::new(15.0, 75.0)),
    ("claude-sonnet-4", Pricing::new(3.0, 15.0)),
    ("claude-3-7-sonnet", Pricing::new(3.0, 15.0)),
    ("claude-3-5-sonnet", Pricing::new(3.0, 15.0)),
    ("claude-3-5-haiku", Pricing::new(0.8, 4.0)),
    ("claude-3-opus", Pricing::new(15.0, 75.0)),
    ("claude-3-haiku", Pricing::new(0.25, 1.25)),
];

const OPENAI: &[(&str, Pricing)] = &[
    ("gpt-4o-mini", Pricing::new(0.15, 0.6)),
    ("gpt-4o", Pricing::new(2.5, 10.0)),
    ("gpt-4.1-nano", Pricing::new(0.1, 0.4)),
    ("gpt-4.1-mini", Pricing::new(0.4, 1.6)),
    ("gpt-4.1", Pricing::new(2.0, 8.0)),
    ("gpt-4-turbo", Pricing::new(10.0, 30.0)),
    ("gpt-3.5-turbo", Pricing::new(0.5, 1.5)),
    ("o1-mini", Pricing::new(1.1, 4.4)),
    ("o1", Pricing::new(15.0, 60.0)),
    ("o3-mini", Pricing::new(1.1, 4.4)),
];

/// Rates for `model` on `provider`.
///
/// Unknown hosted models get their provider's mid-tier rate; local and mock
/// models are free.
pub fn pricing_for(provider: &str, model: &str) -> Pricing {
    let (table, fallback) = match provider {
        "anthropic" => (ANTHROPIC, Pricing::new(3.0, 15.0)),
        "openai" => (OPENAI, Pricing::new(2.5, 10.0)),
        _ => return Pricing::free(),
    };
    table
        .iter()
        .filter(|(prefix, _)| model.starts_with(prefix))
        .max_by_key(|(prefix, _)| prefix.len())
        .map_or(fallback, |(_, pricing)| *pricing)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_longest_prefix_wins() {
        assert_eq!(pricing_for("openai", "gpt-4o-mini-2024-07-18"), Pricing::new(0.15, 0.6));
        assert_eq!(pricing_for("openai", "gpt-4o-2024-08-06"), Pricing::new(2.5, 10.0));
        assert_eq!(
            pricing_for("anthropic", "claude-3-5-haiku-20241022"),
            Pricing::new(0.8, 4.0)
        );
    }

    #[test]
    fn test_unknown_models() {
        assert_eq!(pricing_for("anthropic", "claude-next"), Pricing::new(3.0, 15.0));
        assert_eq!(pricing_for("ollama", "llama3.1:70b"), Pricing::free());
        assert_eq!(pricing_for("mock", "mock-model"), Pricing::free());
    }
}
