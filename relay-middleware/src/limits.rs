//! Layered cost and concurrency enforcement.
//!
//! The cache is the fast path; on miss or error the engine recomputes the
//! window from the ledger and writes through with the remaining TTL. Cost
//! caps fail open only for windowed limits when both stores are down.
//! Total limits never do: expiring a lifetime budget would silently
//! re-enable an exhausted tenant or provider.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use chrono_tz::Tz;
use rust_decimal::Decimal;

use relay_core::clock::{next_reset_info, ttl_for, window_for};
use relay_core::store::{
    CounterIncrement, CounterStore, FixedBump, LedgerStore, QuotaWindowSpec, RollingBump,
    fixed_daily_key, five_hour_key, monthly_key, rolling_daily_key, sessions_key, total_cost_key,
    weekly_key,
};
use relay_types::{
    LimitDecision, Period, QuotaCaps, RelayError, ResetConfig, ResetMode, ResetTime, Scope,
};

const FIVE_HOURS: Duration = Duration::from_secs(5 * 3600);
const ONE_DAY: Duration = Duration::from_secs(24 * 3600);

/// Ledger-scan lower bound for user/key total sums. The provider total is
/// never bounded: a provider that exhausted its lifetime budget must stay
/// exhausted.
const USER_TOTAL_CUTOFF_DAYS: i64 = 90;

/// One billed request fanned out to every affected counter.
#[derive(Debug, Clone)]
pub struct TrackedCost {
    /// Ledger row id (idempotency token).
    pub ledger_id: i64,
    /// Billing instant.
    pub created_at: DateTime<Utc>,
    /// Billed cost.
    pub cost: Decimal,
    /// Billed user and its window config.
    pub user_id: i64,
    /// User scope reset config.
    pub user_reset: ResetConfig,
    /// Billed key (hashed) and its window config.
    pub key_hash: String,
    /// Key scope reset config.
    pub key_reset: ResetConfig,
    /// Serving provider and its window config.
    pub provider_id: i64,
    /// Provider scope reset config.
    pub provider_reset: ResetConfig,
}

/// An acquired concurrency token.
///
/// Call [`release`](Self::release) on normal pipeline exits. Dropping an
/// unreleased token (a cancelled request future) spawns the release, and
/// the session key's idle expiry covers the case where no runtime is left
/// to run it.
pub struct ConcurrencyToken {
    key: String,
    counters: Arc<dyn CounterStore>,
    released: bool,
}

impl std::fmt::Debug for ConcurrencyToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyToken")
            .field("key", &self.key)
            .field("released", &self.released)
            .finish()
    }
}

impl ConcurrencyToken {
    /// Release the token. Errors are logged, not surfaced: a stuck release
    /// self-heals through the session key's idle expiry.
    pub async fn release(mut self) {
        self.released = true;
        if let Err(err) = self.counters.release_session(&self.key).await {
            tracing::warn!(key = %self.key, %err, "failed to release concurrency token");
        }
    }
}

impl Drop for ConcurrencyToken {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let key = std::mem::take(&mut self.key);
        let counters = Arc::clone(&self.counters);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = counters.release_session(&key).await {
                    tracing::warn!(%key, %err, "failed to release dropped concurrency token");
                }
            });
        }
    }
}

/// Composes quota checks across scopes and windows.
pub struct RateLimitEngine {
    counters: Arc<dyn CounterStore>,
    ledger: Arc<dyn LedgerStore>,
    tz: Tz,
}

impl RateLimitEngine {
    /// Build an engine over the given stores, with all window math in `tz`.
    pub fn new(counters: Arc<dyn CounterStore>, ledger: Arc<dyn LedgerStore>, tz: Tz) -> Self {
        Self {
            counters,
            ledger,
            tz,
        }
    }

    /// User and key weekly windows are hardcoded to Monday 00:00; only the
    /// provider scope honors the configured day/time.
    fn effective_reset(scope: Scope, reset: &ResetConfig) -> ResetConfig {
        match scope {
            Scope::Provider => reset.clone(),
            _ => ResetConfig {
                weekly_reset_day: 1,
                weekly_reset_time: ResetTime::MIDNIGHT,
                ..reset.clone()
            },
        }
    }

    fn deny_message(scope: Scope, period: Period, current: Decimal, limit: Decimal) -> String {
        let noun = match period {
            Period::FiveHour => "5小时",
            Period::Daily => "日",
            Period::Weekly => "周",
            Period::Monthly => "月",
            Period::Total => "总",
        };
        format!("{} {noun}消费上限已达到 ({current:.4}/{limit})", scope.label())
    }

    fn deny(
        scope: Scope,
        period: Period,
        reset: &ResetConfig,
        current: Decimal,
        limit: Decimal,
        now: DateTime<Utc>,
        tz: Tz,
    ) -> LimitDecision {
        let info = next_reset_info(period, reset, now, tz);
        LimitDecision {
            allowed: false,
            reason: Some(Self::deny_message(scope, period, current, limit)),
            current: Some(current),
            limit: Some(limit),
            period: Some(info.period_label.to_string()),
            reset_at: info.reset_at,
        }
    }

    /// Check every configured cost cap for one scope, in enforcement order:
    /// total first, then 5h, daily, weekly, monthly. Short-circuits on the
    /// first denial.
    pub async fn check_cost_limits(
        &self,
        scope_id: &str,
        scope: Scope,
        caps: &QuotaCaps,
        reset: &ResetConfig,
        now: DateTime<Utc>,
    ) -> Result<LimitDecision, RelayError> {
        let reset = Self::effective_reset(scope, reset);

        if let Some(limit) = caps.limit_total_usd {
            let decision = self
                .check_total_cost_limit(scope_id, scope, limit, reset.total_reset_at, now)
                .await?;
            if !decision.allowed {
                return Ok(decision);
            }
        }

        let windowed = [
            (Period::FiveHour, caps.limit_5h_usd),
            (Period::Daily, caps.limit_daily_usd),
            (Period::Weekly, caps.limit_weekly_usd),
            (Period::Monthly, caps.limit_monthly_usd),
        ];
        for (period, cap) in windowed {
            let Some(limit) = cap else { continue };
            let current = self.current_spend(scope, scope_id, period, &reset, now).await;
            if current >= limit {
                return Ok(Self::deny(scope, period, &reset, current, limit, now, self.tz));
            }
        }
        Ok(LimitDecision::allow())
    }

    /// Check the lifetime cap. The cached value lives at most five minutes;
    /// on miss the ledger is summed from `reset_at` (user/key scans are
    /// additionally bounded to [`USER_TOTAL_CUTOFF_DAYS`]). Never fails
    /// open: a store error here denies nothing but propagates.
    pub async fn check_total_cost_limit(
        &self,
        scope_id: &str,
        scope: Scope,
        limit: Decimal,
        reset_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<LimitDecision, RelayError> {
        let key = total_cost_key(scope, scope_id, reset_at);
        let current = match self.counters.read_total(&key).await {
            Ok(Some(value)) => value,
            Ok(None) => {
                let since = Self::total_since(scope, reset_at, now);
                let value = self.ledger.sum_total_cost(scope, scope_id, since).await?;
                if let Err(err) = self.counters.write_total(&key, value).await {
                    tracing::warn!(%key, %err, "failed to cache total cost");
                }
                value
            }
            Err(err) => {
                tracing::warn!(%key, %err, "counter store unavailable, total from ledger");
                let since = Self::total_since(scope, reset_at, now);
                self.ledger.sum_total_cost(scope, scope_id, since).await?
            }
        };
        if current >= limit {
            let reset = ResetConfig {
                total_reset_at: reset_at,
                ..ResetConfig::default()
            };
            return Ok(Self::deny(
                scope,
                Period::Total,
                &reset,
                current,
                limit,
                now,
                self.tz,
            ));
        }
        Ok(LimitDecision::allow())
    }

    fn total_since(
        scope: Scope,
        reset_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match scope {
            Scope::Provider => reset_at,
            _ => {
                let cutoff = now - ChronoDuration::days(USER_TOTAL_CUTOFF_DAYS);
                Some(reset_at.map_or(cutoff, |at| at.max(cutoff)))
            }
        }
    }

    /// Acquire a concurrency token. Denials surface as
    /// [`RelayError::ConcurrencyLimit`]; store failures as
    /// [`RelayError::Store`].
    pub async fn check_concurrency(
        &self,
        scope_id: &str,
        scope: Scope,
        cap: u32,
    ) -> Result<ConcurrencyToken, RelayError> {
        let key = sessions_key(scope, scope_id);
        let decision = self.counters.acquire_session(&key, cap).await?;
        if !decision.allowed {
            return Err(RelayError::ConcurrencyLimit {
                scope,
                current: decision.current,
                limit: cap,
            });
        }
        Ok(ConcurrencyToken {
            key,
            counters: Arc::clone(&self.counters),
            released: false,
        })
    }

    /// Fan one billed request out to the user, key, and provider counters
    /// in a single pipeline. Exactly-once per ledger id.
    pub async fn track_cost(&self, tracked: &TrackedCost) -> Result<(), RelayError> {
        let mut fixed = Vec::new();
        let mut rolling = Vec::new();
        let now = tracked.created_at;

        let scopes: [(Scope, String, ResetConfig); 3] = [
            (
                Scope::User,
                tracked.user_id.to_string(),
                Self::effective_reset(Scope::User, &tracked.user_reset),
            ),
            (
                Scope::Key,
                tracked.key_hash.clone(),
                Self::effective_reset(Scope::Key, &tracked.key_reset),
            ),
            (
                Scope::Provider,
                tracked.provider_id.to_string(),
                Self::effective_reset(Scope::Provider, &tracked.provider_reset),
            ),
        ];

        for (scope, id, reset) in &scopes {
            rolling.push(RollingBump {
                key: five_hour_key(*scope, id),
                window: FIVE_HOURS,
            });
            rolling.push(RollingBump {
                key: rolling_daily_key(*scope, id),
                window: ONE_DAY,
            });
            let fixed_daily = ResetConfig {
                daily_reset_mode: ResetMode::Fixed,
                ..reset.clone()
            };
            fixed.push(FixedBump {
                key: fixed_daily_key(*scope, id, reset.daily_reset_time),
                ttl: ttl_for(Period::Daily, &fixed_daily, now, self.tz),
            });
            fixed.push(FixedBump {
                key: weekly_key(
                    *scope,
                    id,
                    reset.weekly_reset_day_normalized(),
                    reset.weekly_reset_time,
                ),
                ttl: ttl_for(Period::Weekly, reset, now, self.tz),
            });
            fixed.push(FixedBump {
                key: monthly_key(*scope, id),
                ttl: ttl_for(Period::Monthly, reset, now, self.tz),
            });
        }

        self.counters
            .increment(&CounterIncrement {
                ledger_id: tracked.ledger_id,
                created_at_ms: tracked.created_at.timestamp_millis(),
                cost: tracked.cost,
                fixed,
                rolling,
            })
            .await
    }

    /// Current spend for one `(scope, period)` window: cache fast path,
    /// ledger fallback with write-through, last-resort zero with a
    /// degraded-mode warning.
    async fn current_spend(
        &self,
        scope: Scope,
        id: &str,
        period: Period,
        reset: &ResetConfig,
        now: DateTime<Utc>,
    ) -> Decimal {
        match self.read_spend(scope, id, period, reset, now).await {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(
                    scope = %scope,
                    id,
                    ?period,
                    %err,
                    "both counter cache and ledger unavailable, treating windowed spend as zero"
                );
                Decimal::ZERO
            }
        }
    }

    async fn read_spend(
        &self,
        scope: Scope,
        id: &str,
        period: Period,
        reset: &ResetConfig,
        now: DateTime<Utc>,
    ) -> Result<Decimal, RelayError> {
        let rolling_daily = period == Period::Daily && reset.daily_reset_mode == ResetMode::Rolling;
        if period == Period::FiveHour || rolling_daily {
            let (key, window) = if rolling_daily {
                (rolling_daily_key(scope, id), ONE_DAY)
            } else {
                (five_hour_key(scope, id), FIVE_HOURS)
            };
            return self.read_rolling_spend(scope, id, &key, window, now).await;
        }

        let key = match period {
            Period::Daily => fixed_daily_key(scope, id, reset.daily_reset_time),
            Period::Weekly => weekly_key(
                scope,
                id,
                reset.weekly_reset_day_normalized(),
                reset.weekly_reset_time,
            ),
            Period::Monthly => monthly_key(scope, id),
            Period::FiveHour | Period::Total => unreachable!("handled above"),
        };

        match self.counters.read_fixed(&key).await {
            Ok(Some(value)) => Ok(value),
            Ok(None) => {
                let window = window_for(period, reset, now, self.tz);
                let value = self
                    .ledger
                    .sum_cost_in_range(scope, id, window.start, window.end)
                    .await?;
                let ttl = ttl_for(period, reset, now, self.tz);
                if let Err(err) = self.counters.write_fixed(&key, value, ttl).await {
                    tracing::warn!(%key, %err, "failed to refill fixed counter");
                }
                Ok(value)
            }
            Err(err) => {
                tracing::warn!(%key, %err, "counter store unavailable, window from ledger");
                let window = window_for(period, reset, now, self.tz);
                self.ledger
                    .sum_cost_in_range(scope, id, window.start, window.end)
                    .await
            }
        }
    }

    async fn read_rolling_spend(
        &self,
        scope: Scope,
        id: &str,
        key: &str,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Decimal, RelayError> {
        let now_ms = now.timestamp_millis();
        match self.counters.read_rolling(key, window, now_ms).await {
            Ok(Some(sum)) => Ok(sum),
            Ok(None) => {
                // Warm the set from the ledger, then sum what we loaded.
                let start = now
                    - ChronoDuration::milliseconds(i64::try_from(window.as_millis()).unwrap_or(0));
                let entries = self
                    .ledger
                    .find_cost_entries_in_range(scope, id, start, now)
                    .await?;
                if let Err(err) = self.counters.warm_rolling(key, &entries, window).await {
                    tracing::warn!(%key, %err, "failed to warm rolling counter");
                }
                Ok(entries.iter().map(|e| e.cost_usd).sum())
            }
            Err(err) => {
                tracing::warn!(%key, %err, "counter store unavailable, rolling window from ledger");
                let start = now
                    - ChronoDuration::milliseconds(i64::try_from(window.as_millis()).unwrap_or(0));
                self.ledger.sum_cost_in_range(scope, id, start, now).await
            }
        }
    }

    /// Millisecond hint for `Retry-After` on a denial, derived from the
    /// window's reset info.
    #[must_use]
    pub fn retry_after_ms(&self, period: Period, reset: &ResetConfig, now: DateTime<Utc>) -> u64 {
        ttl_for(period, reset, now, self.tz).as_millis() as u64
    }

    /// One-query ledger sums across all five windows, used by the admin
    /// overview and by counter reconciliation.
    pub async fn ledger_sums(
        &self,
        scope: Scope,
        id: &str,
        reset: &ResetConfig,
        now: DateTime<Utc>,
    ) -> Result<relay_types::QuotaCostSums, RelayError> {
        let reset = Self::effective_reset(scope, reset);
        let spec = QuotaWindowSpec {
            five_hour: window_for(Period::FiveHour, &reset, now, self.tz),
            daily: window_for(Period::Daily, &reset, now, self.tz),
            weekly: window_for(Period::Weekly, &reset, now, self.tz),
            monthly: window_for(Period::Monthly, &reset, now, self.tz),
            total_since: Self::total_since(scope, reset.total_reset_at, now),
        };
        self.ledger.sum_quota_costs(scope, id, &spec).await
    }
}
