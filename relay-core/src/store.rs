//! Store trait seams and the canonical counter key layout.
//!
//! The engines depend on these traits, not on drivers: `relay-store`
//! provides the Redis/Postgres implementations and `relay-mock` the
//! in-memory ones used by tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use relay_types::{
    ActiveSession, BreakerState, CostEntry, LedgerEntry, MessageRequestRecord, QuotaCostSums,
    RelayError, ResetTime, Scope,
};

use crate::clock::Window;

/// Window bounds handed to [`LedgerStore::sum_quota_costs`] so the five sums
/// come back from one query.
#[derive(Debug, Clone, Copy)]
pub struct QuotaWindowSpec {
    /// Rolling 5h bounds.
    pub five_hour: Window,
    /// Daily bounds.
    pub daily: Window,
    /// Weekly bounds.
    pub weekly: Window,
    /// Monthly bounds.
    pub monthly: Window,
    /// Lower bound for the total leg; `None` means all-time. Must stay
    /// `None` for the provider scope, whose lifetime budget never expires.
    pub total_since: Option<DateTime<Utc>>,
}

/// Append-only usage ledger.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert an immutable row, returning its id.
    async fn append(&self, entry: &LedgerEntry) -> Result<i64, RelayError>;

    /// Billable spend inside `[start, end)`. Excludes blocked and
    /// soft-deleted rows.
    async fn sum_cost_in_range(
        &self,
        scope: Scope,
        id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Decimal, RelayError>;

    /// Lifetime billable spend, from `reset_at` onward when set.
    async fn sum_total_cost(
        &self,
        scope: Scope,
        id: &str,
        reset_at: Option<DateTime<Utc>>,
    ) -> Result<Decimal, RelayError>;

    /// The 5h/daily/weekly/monthly/total sums in a single query.
    async fn sum_quota_costs(
        &self,
        scope: Scope,
        id: &str,
        windows: &QuotaWindowSpec,
    ) -> Result<QuotaCostSums, RelayError>;

    /// `(id, created_at, cost)` triples for rolling-window warm-up.
    async fn find_cost_entries_in_range(
        &self,
        scope: Scope,
        id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CostEntry>, RelayError>;

    /// Billable request count inside `[start, end)`.
    async fn count_requests_in_range(
        &self,
        scope: Scope,
        id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64, RelayError>;

    /// Persist the diagnostic request log row with its decision chain.
    async fn record_message_request(
        &self,
        record: &MessageRequestRecord,
    ) -> Result<i64, RelayError>;
}

/// One fixed-bucket increment target.
#[derive(Debug, Clone)]
pub struct FixedBump {
    /// Counter key.
    pub key: String,
    /// Expiry: time to the bucket's next boundary.
    pub ttl: std::time::Duration,
}

/// One rolling-set increment target.
#[derive(Debug, Clone)]
pub struct RollingBump {
    /// Sorted-set key.
    pub key: String,
    /// Window length; doubles as the set's expiry.
    pub window: std::time::Duration,
}

/// A single logical cost increment, fanned out across every affected
/// counter in one atomic pipeline.
#[derive(Debug, Clone)]
pub struct CounterIncrement {
    /// Ledger row id; the idempotency token. Processing the same id twice
    /// must not double-count.
    pub ledger_id: i64,
    /// Row instant in epoch milliseconds (the rolling-set score).
    pub created_at_ms: i64,
    /// Billed cost.
    pub cost: Decimal,
    /// Fixed buckets to bump.
    pub fixed: Vec<FixedBump>,
    /// Rolling sets to insert into.
    pub rolling: Vec<RollingBump>,
}

/// Result of a concurrency-token acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyDecision {
    /// Whether a token was granted.
    pub allowed: bool,
    /// Sessions counted after the attempt.
    pub current: u32,
}

/// Atomic counter cache. Backed by Redis in production and by an
/// in-process map in tests; either way `increment` and reads on the same
/// scope serialize through the store's own atomicity.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Apply one logical increment, exactly once per `ledger_id`.
    async fn increment(&self, inc: &CounterIncrement) -> Result<(), RelayError>;

    /// Fixed-bucket value; `None` on miss.
    async fn read_fixed(&self, key: &str) -> Result<Option<Decimal>, RelayError>;

    /// Write-through a fixed bucket after a ledger fallback.
    async fn write_fixed(
        &self,
        key: &str,
        value: Decimal,
        ttl: std::time::Duration,
    ) -> Result<(), RelayError>;

    /// Trim a rolling set below `now - window` and return the remaining
    /// sum; `None` when the set does not exist.
    async fn read_rolling(
        &self,
        key: &str,
        window: std::time::Duration,
        now_ms: i64,
    ) -> Result<Option<Decimal>, RelayError>;

    /// Seed a rolling set from ledger rows.
    async fn warm_rolling(
        &self,
        key: &str,
        entries: &[CostEntry],
        window: std::time::Duration,
    ) -> Result<(), RelayError>;

    /// Cached total-cost value; `None` on miss or expiry.
    async fn read_total(&self, key: &str) -> Result<Option<Decimal>, RelayError>;

    /// Cache a total-cost value for a short interval (≤ 5 minutes).
    async fn write_total(&self, key: &str, value: Decimal) -> Result<(), RelayError>;

    /// Acquire a concurrency token under `capacity`.
    async fn acquire_session(
        &self,
        key: &str,
        capacity: u32,
    ) -> Result<ConcurrencyDecision, RelayError>;

    /// Release a previously acquired token.
    async fn release_session(&self, key: &str) -> Result<(), RelayError>;

    /// Load persisted breaker state for an endpoint.
    async fn breaker_get(&self, endpoint_id: i64) -> Result<Option<BreakerState>, RelayError>;

    /// Persist breaker state for an endpoint.
    async fn breaker_set(&self, endpoint_id: i64, state: &BreakerState)
    -> Result<(), RelayError>;

    /// Liveness check for the health endpoint.
    async fn ping(&self) -> Result<(), RelayError>;
}

/// Transient request/response capture.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Store or update a session capture.
    async fn put(&self, session: ActiveSession) -> Result<(), RelayError>;

    /// Fetch a capture by id.
    async fn get(&self, session_id: &str) -> Result<Option<ActiveSession>, RelayError>;

    /// Provider that served the session most recently, for sticky reuse.
    async fn provider_for(&self, session_id: &str) -> Result<Option<i64>, RelayError>;
}

// ---- Canonical counter key layout (spec'd; the namespace is enumerable) ----

/// `{scope}:{id}:cost_5h`
#[must_use]
pub fn five_hour_key(scope: Scope, id: &str) -> String {
    format!("{scope}:{id}:cost_5h")
}

/// `{scope}:{id}:cost_daily_{HHMM}`, the fixed daily bucket.
#[must_use]
pub fn fixed_daily_key(scope: Scope, id: &str, reset_time: ResetTime) -> String {
    format!("{scope}:{id}:cost_daily_{}", reset_time.hhmm())
}

/// `{scope}:{id}:cost_daily_rolling`, the rolling 24h set.
#[must_use]
pub fn rolling_daily_key(scope: Scope, id: &str) -> String {
    format!("{scope}:{id}:cost_daily_rolling")
}

/// `{scope}:{id}:cost_weekly[_{D}_{HHMM}]`. Only the provider scope carries
/// the day/time suffix; user and key weekly buckets reset Monday 00:00 and
/// stay unsuffixed.
#[must_use]
pub fn weekly_key(scope: Scope, id: &str, day: u8, reset_time: ResetTime) -> String {
    match scope {
        Scope::Provider => format!("{scope}:{id}:cost_weekly_{}_{}", day % 7, reset_time.hhmm()),
        _ => format!("{scope}:{id}:cost_weekly"),
    }
}

/// `{scope}:{id}:cost_monthly`
#[must_use]
pub fn monthly_key(scope: Scope, id: &str) -> String {
    format!("{scope}:{id}:cost_monthly")
}

/// `total_cost:{scope}:{id}:{resetAtMs|none}`
#[must_use]
pub fn total_cost_key(scope: Scope, id: &str, reset_at: Option<DateTime<Utc>>) -> String {
    match reset_at {
        Some(at) => format!("total_cost:{scope}:{id}:{}", at.timestamp_millis()),
        None => format!("total_cost:{scope}:{id}:none"),
    }
}

/// `sessions:{scope}:{id}`
#[must_use]
pub fn sessions_key(scope: Scope, id: &str) -> String {
    format!("sessions:{scope}:{id}")
}
