//! Persisted circuit-breaker state for provider endpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Breaker phase. The invariant `phase == Open ⇔ now < open_until` is
/// enforced by the registry on every read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerPhase {
    /// Healthy; outcomes are being recorded.
    #[default]
    Closed,
    /// Tripped; selection skips the endpoint until `open_until`.
    Open,
    /// Cooldown elapsed; exactly one probe request is admitted.
    HalfOpen,
}

/// Serialized breaker blob, written through the quota cache
/// (`circuit:{endpointId}`) so open breakers survive restarts.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerState {
    /// Current phase.
    pub phase: BreakerPhase,
    /// Failures since the last success while closed.
    pub consecutive_failures: u32,
    /// Most recent counted failure.
    #[serde(default)]
    pub last_failure_at: Option<DateTime<Utc>>,
    /// When an open breaker transitions to half-open.
    #[serde(default)]
    pub open_until: Option<DateTime<Utc>>,
    /// Cooldown applied at the most recent open, milliseconds.
    pub recovery_ms: u64,
    /// Successive opens without an intervening close; drives exponential
    /// backoff.
    pub open_count: u32,
    /// Whether the single half-open probe slot is taken.
    #[serde(default)]
    pub probe_inflight: bool,
}

impl BreakerState {
    /// Whether selection must skip the endpoint at `now`.
    #[must_use]
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.phase == BreakerPhase::Open && self.open_until.is_some_and(|until| now < until)
    }
}

/// Tunables for the breaker state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BreakerConfig {
    /// Consecutive failures that trip a closed breaker.
    pub failure_threshold: u32,
    /// First cooldown, milliseconds.
    pub recovery_ms: u64,
    /// Multiplier applied to the cooldown on each successive open.
    pub backoff_factor: u32,
    /// Upper bound for the cooldown, milliseconds.
    pub max_recovery_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_ms: 30_000,
            backoff_factor: 2,
            max_recovery_ms: 600_000,
        }
    }
}
