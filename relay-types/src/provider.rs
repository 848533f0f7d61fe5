use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::key::split_groups;
use crate::quota::{QuotaCaps, ResetConfig, ResetTime};

/// Group name a provider implicitly belongs to when routing keyless traffic.
pub const DEFAULT_GROUP: &str = "default";

/// Upstream wire dialect spoken by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderType {
    /// Anthropic messages API with an API key credential.
    Claude,
    /// Anthropic messages API with an OAuth credential.
    ClaudeAuth,
    /// OpenAI responses API (Codex).
    Codex,
    /// Google Gemini generateContent API.
    Gemini,
    /// Generic OpenAI-compatible chat completions.
    OpenaiCompatible,
}

impl ProviderType {
    /// Whether the parameter-override engine applies to this dialect.
    #[must_use]
    pub const fn supports_overrides(self) -> bool {
        matches!(self, Self::Claude | Self::ClaudeAuth)
    }
}

/// The three upstream timeout knobs, in milliseconds. `0` disables the
/// corresponding timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderTimeouts {
    /// Send-complete to first response byte, streaming requests only.
    pub first_byte_timeout_streaming_ms: u64,
    /// Maximum gap between streamed chunks.
    pub streaming_idle_timeout_ms: u64,
    /// Whole-call budget for non-streaming requests.
    pub request_timeout_non_streaming_ms: u64,
}

impl Default for ProviderTimeouts {
    fn default() -> Self {
        Self {
            first_byte_timeout_streaming_ms: 30_000,
            streaming_idle_timeout_ms: 60_000,
            request_timeout_non_streaming_ms: 600_000,
        }
    }
}

/// Daily activity window for a provider, evaluated in its own timezone.
///
/// `start == end` is a zero-width window (never active); `start > end`
/// crosses midnight. The end boundary is exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleWindow {
    /// Inclusive local start, `HH:MM`.
    pub start: ResetTime,
    /// Exclusive local end, `HH:MM`.
    pub end: ResetTime,
    /// IANA timezone the window is evaluated in.
    pub timezone: String,
}

/// Reasoning effort forwarded when adaptive thinking matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdaptiveEffort {
    /// Minimal reasoning budget.
    Low,
    /// Moderate reasoning budget.
    Medium,
    /// Elevated reasoning budget.
    High,
    /// Maximum reasoning budget.
    Max,
}

impl AdaptiveEffort {
    /// Wire value for `output_config.effort`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Max => "max",
        }
    }
}

/// Which requests an adaptive-thinking preference applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelMatchMode {
    /// Every model.
    #[default]
    All,
    /// Only models whose name starts with one of the configured prefixes.
    Specific,
}

/// Configuration for the `"adaptive"` thinking-budget preference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdaptiveThinkingConfig {
    /// Effort level merged into `output_config`.
    pub effort: AdaptiveEffort,
    /// Match everything or only listed model prefixes.
    #[serde(default)]
    pub model_match_mode: ModelMatchMode,
    /// Model-name prefixes consulted in `specific` mode.
    #[serde(default)]
    pub models: Vec<String>,
}

/// Per-provider request override preferences. Raw strings so that admin
/// input like `"inherit"`, `""`, or a malformed number degrades to a no-op
/// instead of an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OverridePrefs {
    /// Forced `max_tokens`, as entered.
    pub max_tokens: Option<String>,
    /// Thinking budget: a number, or the literal `"adaptive"`.
    pub thinking_budget: Option<String>,
    /// Adaptive-mode configuration, consulted only when `thinking_budget`
    /// is `"adaptive"`.
    pub adaptive: Option<AdaptiveThinkingConfig>,
}

/// An upstream provider registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
    /// Numeric identifier. `0` is reserved as the warmup sentinel.
    #[serde(default)]
    pub id: i64,
    /// Display name, also recorded on chain items.
    pub name: String,
    /// Upstream base URL.
    pub base_url: String,
    /// Wire dialect.
    pub provider_type: ProviderType,
    /// Opaque credential forwarded upstream.
    #[serde(default)]
    pub credential: String,
    /// Selection priority; lower is preferred.
    pub priority: u32,
    /// Weighted-random weight within a priority bucket, `1..=10000`.
    pub weight: u32,
    /// Scalar applied to raw upstream cost at billing time.
    pub cost_multiplier: Decimal,
    /// Disabled providers never enter the candidate set.
    pub is_enabled: bool,
    /// Comma-separated routing groups.
    #[serde(default)]
    pub group_tag: Option<String>,
    /// Per-group priority overrides; the lowest matched value wins.
    #[serde(default)]
    pub group_priorities: HashMap<String, u32>,
    /// Spend caps for this provider.
    #[serde(default)]
    pub caps: QuotaCaps,
    /// Window boundary configuration (weekly day/time are honored here).
    #[serde(default)]
    pub reset: ResetConfig,
    /// Upstream timeout knobs.
    #[serde(default)]
    pub timeouts: ProviderTimeouts,
    /// Optional daily activity window.
    #[serde(default)]
    pub schedule: Option<ScheduleWindow>,
    /// Request override preferences.
    #[serde(default)]
    pub overrides: OverridePrefs,
    /// Soft-delete tombstone.
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    /// Creation instant.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Provider {
    /// The provider's routing groups; a provider with no tag belongs to
    /// [`DEFAULT_GROUP`].
    #[must_use]
    pub fn groups(&self) -> Vec<&str> {
        match self.group_tag.as_deref() {
            Some(raw) if !raw.trim().is_empty() => split_groups(raw),
            _ => vec![DEFAULT_GROUP],
        }
    }

    /// Effective priority for a key routed through `matched_groups`: the
    /// minimum `group_priorities` value among matched groups, else the base
    /// priority.
    #[must_use]
    pub fn effective_priority(&self, matched_groups: &[&str]) -> u32 {
        matched_groups
            .iter()
            .filter_map(|g| self.group_priorities.get(*g).copied())
            .min()
            .unwrap_or(self.priority)
    }

    /// Weight clamped into the documented `1..=10000` band.
    #[must_use]
    pub fn clamped_weight(&self) -> u32 {
        self.weight.clamp(1, 10_000)
    }
}

/// A physical URL behind a provider, carrying probe results and a breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderEndpoint {
    /// Numeric identifier.
    #[serde(default)]
    pub id: i64,
    /// Owning provider.
    pub provider_id: i64,
    /// Physical URL requests are sent to.
    pub url: String,
    /// Disabled endpoints are skipped by selection and probing.
    pub is_enabled: bool,
    /// Admin-configured ordering among a provider's endpoints.
    pub sort_order: i32,
    /// Last probe outcome; `None` until first probe.
    #[serde(default)]
    pub last_probe_ok: Option<bool>,
    /// Last probe round-trip, milliseconds.
    #[serde(default)]
    pub last_probe_latency_ms: Option<u64>,
}

impl ProviderEndpoint {
    /// Sort key implementing the endpoint preference order: probe-healthy
    /// first, then unprobed, then failing; then admin order, then observed
    /// latency, then id.
    #[must_use]
    pub fn preference_key(&self) -> (u8, i32, u64, i64) {
        let probe_rank = match self.last_probe_ok {
            Some(true) => 0,
            None => 1,
            Some(false) => 2,
        };
        (
            probe_rank,
            self.sort_order,
            self.last_probe_latency_ms.unwrap_or(u64::MAX),
            self.id,
        )
    }
}

