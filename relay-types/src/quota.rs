//! Quota vocabulary: scopes, periods, caps, and reset configuration.

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Accounting scope a counter or cap belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// Per-tenant (the owner of one or more keys).
    User,
    /// Per-issued API key.
    Key,
    /// Per-upstream provider.
    Provider,
}

impl Scope {
    /// Lowercase identifier used in cache key layout.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Key => "key",
            Self::Provider => "provider",
        }
    }

    /// Capitalized label used in denial messages.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::User => "User",
            Self::Key => "Key",
            Self::Provider => "Provider",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accounting window dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    /// Rolling five hours ending now.
    FiveHour,
    /// Calendar day (fixed at the configured reset time) or rolling 24h.
    Daily,
    /// Calendar week.
    Weekly,
    /// Calendar month.
    Monthly,
    /// Lifetime accumulation, optionally from a reset instant.
    Total,
}

impl Period {
    /// Window label surfaced in denial responses. Daily depends on the
    /// configured reset mode (`daily` fixed vs `24h` rolling).
    #[must_use]
    pub const fn label(self, mode: ResetMode) -> &'static str {
        match self {
            Self::FiveHour => "5h",
            Self::Daily => match mode {
                ResetMode::Fixed => "daily",
                ResetMode::Rolling => "24h",
            },
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Total => "total",
        }
    }
}

/// Whether the daily window resets at a wall-clock boundary or rolls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResetMode {
    /// Reset at `daily_reset_time` in the configured timezone.
    #[default]
    Fixed,
    /// Last 24 hours ending at the current instant.
    Rolling,
}

/// Wall-clock `HH:MM` reset boundary.
///
/// Construction normalizes malformed components individually: an hour outside
/// `0..=23` becomes `0`, a minute outside `0..=59` becomes `0` (`99:10` →
/// `00:10`, `12:70` → `12:00`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResetTime {
    hour: u8,
    minute: u8,
}

impl ResetTime {
    /// Midnight, the default boundary everywhere.
    pub const MIDNIGHT: Self = Self { hour: 0, minute: 0 };

    /// Build a reset time, normalizing out-of-range components to zero.
    #[must_use]
    pub const fn new(hour: u8, minute: u8) -> Self {
        Self {
            hour: if hour > 23 { 0 } else { hour },
            minute: if minute > 59 { 0 } else { minute },
        }
    }

    /// Parse `"HH:MM"`, normalizing each component independently.
    /// Unparseable input yields midnight.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let mut parts = raw.splitn(2, ':');
        let hour = parts.next().and_then(|p| p.trim().parse().ok()).unwrap_or(0);
        let minute = parts.next().and_then(|p| p.trim().parse().ok()).unwrap_or(0);
        Self::new(hour, minute)
    }

    /// Hour component, `0..=23`.
    #[must_use]
    pub const fn hour(self) -> u8 {
        self.hour
    }

    /// Minute component, `0..=59`.
    #[must_use]
    pub const fn minute(self) -> u8 {
        self.minute
    }

    /// Compact `HHMM` form used as a cache key suffix.
    #[must_use]
    pub fn hhmm(self) -> String {
        format!("{:02}{:02}", self.hour, self.minute)
    }
}

impl Default for ResetTime {
    fn default() -> Self {
        Self::MIDNIGHT
    }
}

impl fmt::Display for ResetTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl TryFrom<String> for ResetTime {
    type Error = std::convert::Infallible;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Ok(Self::parse(&value))
    }
}

impl From<ResetTime> for String {
    fn from(value: ResetTime) -> Self {
        value.to_string()
    }
}

/// Cost and concurrency caps attachable to users, keys, and providers.
///
/// `None` means uncapped for that dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaCaps {
    /// Rolling 5h spend cap in USD.
    pub limit_5h_usd: Option<Decimal>,
    /// Daily spend cap in USD (fixed or rolling per `ResetConfig`).
    pub limit_daily_usd: Option<Decimal>,
    /// Weekly spend cap in USD.
    pub limit_weekly_usd: Option<Decimal>,
    /// Monthly spend cap in USD.
    pub limit_monthly_usd: Option<Decimal>,
    /// Lifetime spend cap in USD.
    pub limit_total_usd: Option<Decimal>,
    /// Concurrent session cap.
    pub limit_concurrent_sessions: Option<u32>,
}

impl QuotaCaps {
    /// True when no dimension is capped.
    #[must_use]
    pub const fn is_unlimited(&self) -> bool {
        self.limit_5h_usd.is_none()
            && self.limit_daily_usd.is_none()
            && self.limit_weekly_usd.is_none()
            && self.limit_monthly_usd.is_none()
            && self.limit_total_usd.is_none()
            && self.limit_concurrent_sessions.is_none()
    }
}

/// Window boundary configuration for one accounting scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResetConfig {
    /// Fixed or rolling daily window.
    pub daily_reset_mode: ResetMode,
    /// Daily boundary when fixed.
    pub daily_reset_time: ResetTime,
    /// Weekly boundary day, `0`=Sunday … `6`=Saturday. Only honored for the
    /// provider scope; user/key windows reset Monday 00:00.
    pub weekly_reset_day: u8,
    /// Weekly boundary time. Provider scope only, as above.
    pub weekly_reset_time: ResetTime,
    /// Accumulation start for the total cap; `None` means all-time.
    pub total_reset_at: Option<DateTime<Utc>>,
}

impl Default for ResetConfig {
    fn default() -> Self {
        Self {
            daily_reset_mode: ResetMode::Fixed,
            daily_reset_time: ResetTime::MIDNIGHT,
            weekly_reset_day: 1,
            weekly_reset_time: ResetTime::MIDNIGHT,
            total_reset_at: None,
        }
    }
}

impl ResetConfig {
    /// Weekly reset day folded into `0..=6`.
    #[must_use]
    pub const fn weekly_reset_day_normalized(&self) -> u8 {
        self.weekly_reset_day % 7
    }
}

/// Outcome of a cost- or concurrency-limit check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Scope-qualified denial message; `None` when allowed.
    pub reason: Option<String>,
    /// Counted spend at check time.
    pub current: Option<Decimal>,
    /// Configured cap that was checked.
    pub limit: Option<Decimal>,
    /// Window label (`5h`, `daily`, `24h`, `weekly`, `monthly`, `total`).
    pub period: Option<String>,
    /// Next boundary for fixed windows.
    pub reset_at: Option<DateTime<Utc>>,
}

impl LimitDecision {
    /// An unconditional pass.
    #[must_use]
    pub const fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            current: None,
            limit: None,
            period: None,
            reset_at: None,
        }
    }
}

