//! Admin-configured rules classifying upstream error text.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How an [`ErrorRule`] pattern is matched against upstream error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    /// Compiled regular expression.
    Regex,
    /// Case-insensitive substring.
    Contains,
    /// Exact string equality.
    Exact,
}

/// Normalized category a matched error reduces to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Transient; the dispatcher may retry and the breaker counts it.
    Retryable,
    /// Permanent; surfaced to the client, breaker unaffected.
    Fatal,
    /// Upstream concurrency pressure; retryable but never counted by the
    /// breaker.
    ConcurrentLimited,
}

/// One ordered classification rule. Rules apply in `(priority desc,
/// created_at asc)` order; the first match wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRule {
    /// Numeric identifier.
    #[serde(default)]
    pub id: i64,
    /// Pattern interpreted per `match_type`.
    pub pattern: String,
    /// Matching strategy.
    pub match_type: MatchType,
    /// Category the match reduces to.
    pub category: ErrorCategory,
    /// Higher priority rules are consulted first.
    pub priority: i32,
    /// Disabled rules are skipped.
    pub is_enabled: bool,
    /// Tie-break for equal priorities.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}
