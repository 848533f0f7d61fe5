//! Per-attempt decision trace attached to each proxied request.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Why a chain item was appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainReason {
    /// First pick of the selection loop.
    InitialSelection,
    /// A retry attempt that ended in success.
    RetrySuccess,
    /// A retry attempt that failed.
    RetryFailed,
    /// The (first) attempt succeeded.
    RequestSuccess,
    /// Upstream reported a concurrency limit.
    ConcurrentLimitFailed,
    /// An internal failure ended the loop.
    SystemError,
    /// A prior session's provider was reused.
    SessionReuse,
    /// A non-retryable client error ended the loop.
    ClientErrorNonRetryable,
    /// The guard answered the request locally.
    WarmupIntercepted,
}

/// How the selector arrived at a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectionMethod {
    /// Lowest-priority bucket, weighted random draw.
    #[serde(rename = "priority-weighted")]
    PriorityWeighted,
    /// Sticky reuse of the session's previous provider.
    #[serde(rename = "session_reuse")]
    SessionReuse,
}

/// Candidate-set sizes captured at selection time, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionContext {
    /// Enabled, in-schedule, group-matched providers.
    pub enabled_providers: u32,
    /// Of those, providers with a healthy endpoint and budget remaining.
    pub after_health_check: u32,
    /// Effective priority of the chosen bucket.
    pub selected_priority: u32,
}

/// One attempt in the provider chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderChainItem {
    /// Provider display name (or the warmup service tag).
    pub name: String,
    /// Why this item exists.
    pub reason: ChainReason,
    /// Upstream status, when a response was received.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Upstream or internal error message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Normalized error code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Structured error parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_params: Option<serde_json::Value>,
    /// How the provider was chosen; set on selection items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_method: Option<SelectionMethod>,
    /// Candidate-set sizes at selection time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_context: Option<DecisionContext>,
    /// Cost multiplier in force when this provider was chosen.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_multiplier: Option<Decimal>,
}

impl ProviderChainItem {
    /// A bare item with only a name and reason; callers fill the rest.
    #[must_use]
    pub fn new(name: impl Into<String>, reason: ChainReason) -> Self {
        Self {
            name: name.into(),
            reason,
            status_code: None,
            error_message: None,
            error_code: None,
            error_params: None,
            selection_method: None,
            decision_context: None,
            cost_multiplier: None,
        }
    }
}
