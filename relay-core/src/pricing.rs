//! Per-model pricing and cost derivation.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use relay_types::TokenUsage;

const TOKENS_PER_MTOK: i64 = 1_000_000;

/// USD per million tokens for one model family.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRate {
    /// Prompt tokens.
    pub input_per_mtok: Decimal,
    /// Completion tokens.
    pub output_per_mtok: Decimal,
    /// Cache-read prompt tokens.
    pub cache_read_per_mtok: Decimal,
    /// Cache-write prompt tokens.
    pub cache_write_per_mtok: Decimal,
}

impl ModelRate {
    const fn new(input: Decimal, output: Decimal, cache_read: Decimal, cache_write: Decimal) -> Self {
        Self {
            input_per_mtok: input,
            output_per_mtok: output,
            cache_read_per_mtok: cache_read,
            cache_write_per_mtok: cache_write,
        }
    }

    /// Raw USD cost for a usage block at this rate (before the provider's
    /// cost multiplier).
    #[must_use]
    pub fn cost(&self, usage: &TokenUsage) -> Decimal {
        let per_mtok = |tokens: u64, rate: Decimal| {
            Decimal::from(tokens) * rate / Decimal::from(TOKENS_PER_MTOK)
        };
        per_mtok(usage.input_tokens, self.input_per_mtok)
            + per_mtok(usage.output_tokens, self.output_per_mtok)
            + per_mtok(usage.cache_read_input_tokens, self.cache_read_per_mtok)
            + per_mtok(usage.cache_creation_input_tokens, self.cache_write_per_mtok)
    }
}

/// Prefix-matched model → rate table with a default for unknown models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTable {
    entries: Vec<(String, ModelRate)>,
    default: ModelRate,
}

impl PriceTable {
    /// Build a table from `(prefix, rate)` pairs. Longer prefixes win, so
    /// insertion order does not matter.
    #[must_use]
    pub fn new(mut entries: Vec<(String, ModelRate)>, default: ModelRate) -> Self {
        entries.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self { entries, default }
    }

    /// Rate for `model`, by longest matching prefix.
    #[must_use]
    pub fn rate_for(&self, model: &str) -> &ModelRate {
        self.entries
            .iter()
            .find(|(prefix, _)| model.starts_with(prefix.as_str()))
            .map_or(&self.default, |(_, rate)| rate)
    }

    /// Raw USD cost for `usage` on `model` (before the cost multiplier).
    #[must_use]
    pub fn cost(&self, model: &str, usage: &TokenUsage) -> Decimal {
        self.rate_for(model).cost(usage)
    }
}

impl Default for PriceTable {
    fn default() -> Self {
        let d = |units: i64, scale: u32| Decimal::new(units, scale);
        Self::new(
            vec![
                ("claude-opus-4".into(), ModelRate::new(d(15, 0), d(75, 0), d(15, 1), d(1875, 2))),
                ("claude-sonnet-4".into(), ModelRate::new(d(3, 0), d(15, 0), d(3, 1), d(375, 2))),
                ("claude-3-5-haiku".into(), ModelRate::new(d(8, 1), d(4, 0), d(8, 2), d(1, 0))),
                ("claude-haiku-4".into(), ModelRate::new(d(1, 0), d(5, 0), d(1, 1), d(125, 2))),
                ("gpt-5".into(), ModelRate::new(d(125, 2), d(10, 0), d(125, 3), Decimal::ZERO)),
                ("gemini-2.5-pro".into(), ModelRate::new(d(125, 2), d(10, 0), d(3125, 4), Decimal::ZERO)),
            ],
            // Unknown models bill at a conservative mid-tier rate.
            ModelRate::new(d(3, 0), d(15, 0), d(3, 1), d(375, 2)),
        )
    }
}
