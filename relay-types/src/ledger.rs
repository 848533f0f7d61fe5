//! Ledger rows, request log records, and usage aggregates.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::chain::ProviderChainItem;

/// One append-only billing row. Rows with a non-null `blocked_by` are
/// excluded from every billing aggregation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    /// Database id; `0` before insert.
    pub id: i64,
    /// Insert instant; windows are computed against this.
    pub created_at: DateTime<Utc>,
    /// Billed user.
    pub user_id: i64,
    /// Billed key (hashed form).
    pub key_hash: String,
    /// Provider that served the request; `0` for locally answered rows.
    pub final_provider_id: i64,
    /// Billed cost. Zero for blocked rows.
    pub cost_usd: Decimal,
    /// End-to-end duration, milliseconds.
    pub duration_ms: u64,
    /// Whether the upstream response completed successfully.
    pub is_success: bool,
    /// Non-billing tag (e.g. the warmup tag); `None` for billable rows.
    #[serde(default)]
    pub blocked_by: Option<String>,
    /// Structured detail for blocked rows.
    #[serde(default)]
    pub blocked_reason: Option<serde_json::Value>,
}

/// Token counts extracted from an upstream `usage` block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenUsage {
    /// Prompt tokens.
    pub input_tokens: u64,
    /// Completion tokens.
    pub output_tokens: u64,
    /// Prompt tokens served from cache.
    pub cache_read_input_tokens: u64,
    /// Prompt tokens written to cache.
    pub cache_creation_input_tokens: u64,
}

impl TokenUsage {
    /// Fold a later usage block into this one, keeping the maximum of each
    /// cumulative counter. Streaming deltas re-report totals, so `max` is
    /// the correct merge.
    pub fn merge(&mut self, other: &Self) {
        self.input_tokens = self.input_tokens.max(other.input_tokens);
        self.output_tokens = self.output_tokens.max(other.output_tokens);
        self.cache_read_input_tokens = self
            .cache_read_input_tokens
            .max(other.cache_read_input_tokens);
        self.cache_creation_input_tokens = self
            .cache_creation_input_tokens
            .max(other.cache_creation_input_tokens);
    }
}

/// `(id, created_at, cost)` triple used to warm rolling windows.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostEntry {
    /// Ledger row id (the rolling-set member).
    pub id: i64,
    /// Row instant (the rolling-set score).
    pub created_at: DateTime<Utc>,
    /// Billed cost.
    pub cost_usd: Decimal,
}

/// The five-window cost tuple returned by a single aggregate query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaCostSums {
    /// Rolling 5h spend.
    pub five_hour: Decimal,
    /// Daily-window spend.
    pub daily: Decimal,
    /// Weekly-window spend.
    pub weekly: Decimal,
    /// Monthly-window spend.
    pub monthly: Decimal,
    /// Total spend (cutoff-bounded for user/key, unbounded for provider).
    pub total: Decimal,
}

/// Diagnostic request log row, including the full decision chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRequestRecord {
    /// Database id; `0` before insert.
    pub id: i64,
    /// Correlation id shared with the session store.
    pub session_id: String,
    /// Request instant.
    pub created_at: DateTime<Utc>,
    /// Authenticated user, when authentication got that far.
    pub user_id: Option<i64>,
    /// Authenticated key id.
    pub key_id: Option<i64>,
    /// Requested model.
    pub model: Option<String>,
    /// Ingress path (e.g. `/v1/messages`).
    pub endpoint: String,
    /// Whether the client asked for a streamed response.
    pub is_streaming: bool,
    /// Final status returned to the client.
    pub status_code: u16,
    /// Error payload surfaced to the client, if any.
    #[serde(default)]
    pub error_body: Option<serde_json::Value>,
    /// Token counts for the final attempt.
    #[serde(default)]
    pub usage: TokenUsage,
    /// Client user agent.
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Provider that ultimately served the request; `None` when no attempt
    /// succeeded, `Some(0)` for locally answered warmup rows.
    #[serde(default)]
    pub final_provider_id: Option<i64>,
    /// Ordered attempt trace.
    pub provider_chain: Vec<ProviderChainItem>,
    /// End-to-end duration, milliseconds.
    pub duration_ms: u64,
}
