//! Window boundary math for the quota engine.
//!
//! All boundaries are computed in a configured IANA timezone and returned as
//! UTC instants. For a given `(now, tz, reset_time, reset_day, mode)` the
//! `(start, end, ttl)` triple is a pure function. DST transitions never
//! double-count: window lengths are calendar units (the same wall-clock
//! boundary on the next day/week/month), not fixed millisecond spans.

use chrono::{
    DateTime, Datelike, Days, Duration as ChronoDuration, NaiveDate, NaiveTime, TimeZone, Utc,
};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use relay_types::{Period, ResetConfig, ResetMode, ResetTime};

/// A half-open accounting window `[start, end)` in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// Inclusive start.
    pub start: DateTime<Utc>,
    /// Exclusive end.
    pub end: DateTime<Utc>,
}

impl Window {
    /// Whether `t` falls inside the window.
    #[must_use]
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && t < self.end
    }
}

/// How the current window will end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResetKind {
    /// Resets at an admin-configured daily wall-clock boundary.
    Fixed,
    /// Rolling window; there is no boundary, old spend ages out.
    Rolling,
    /// Resets at a natural calendar boundary (Monday, first of month).
    Natural,
    /// Resets at an admin-configured weekly day/time.
    Custom,
}

/// Reset description surfaced in quota denials (`retry_after` derivation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetInfo {
    /// Boundary kind.
    pub kind: ResetKind,
    /// Next boundary instant; `None` for rolling windows.
    pub reset_at: Option<DateTime<Utc>>,
    /// Window label (`5h`, `daily`, `24h`, `weekly`, `monthly`, `total`).
    pub period_label: &'static str,
}

const FIVE_HOURS_SECS: i64 = 5 * 3600;
const DAY_SECS: i64 = 24 * 3600;

/// Resolve a local wall-clock instant in `tz` to UTC.
///
/// Ambiguous local times (DST fall-back) resolve to the earlier instant;
/// nonexistent local times (spring-forward gap) advance in 15-minute steps
/// until a valid instant is found.
fn resolve_local(tz: Tz, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    let mut naive = date.and_time(time);
    for _ in 0..12 {
        match tz.from_local_datetime(&naive) {
            chrono::LocalResult::Single(dt) => return dt.with_timezone(&Utc),
            chrono::LocalResult::Ambiguous(earliest, _) => return earliest.with_timezone(&Utc),
            chrono::LocalResult::None => {
                naive += ChronoDuration::minutes(15);
            }
        }
    }
    // Gaps are at most a couple of hours anywhere on Earth; interpret the
    // boundary as UTC if the walk somehow failed.
    DateTime::from_naive_utc_and_offset(naive, Utc)
}

fn naive_time(t: ResetTime) -> NaiveTime {
    NaiveTime::from_hms_opt(u32::from(t.hour()), u32::from(t.minute()), 0)
        .unwrap_or(NaiveTime::MIN)
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    NaiveDate::from_ymd_opt(date.year(), date.month(), 1).unwrap_or(date)
}

fn first_of_next_month(date: NaiveDate) -> NaiveDate {
    let (y, m) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(y, m, 1).unwrap_or(date)
}

fn first_of_prev_month(date: NaiveDate) -> NaiveDate {
    let (y, m) = if date.month() == 1 {
        (date.year() - 1, 12)
    } else {
        (date.year(), date.month() - 1)
    };
    NaiveDate::from_ymd_opt(y, m, 1).unwrap_or(date)
}

fn daily_window(cfg: &ResetConfig, now: DateTime<Utc>, tz: Tz) -> Window {
    match cfg.daily_reset_mode {
        ResetMode::Rolling => Window {
            start: now - ChronoDuration::seconds(DAY_SECS),
            end: now,
        },
        ResetMode::Fixed => {
            let time = naive_time(cfg.daily_reset_time);
            let today = now.with_timezone(&tz).date_naive();
            let boundary = resolve_local(tz, today, time);
            // At exactly the boundary a new bucket starts.
            if now >= boundary {
                Window {
                    start: boundary,
                    end: resolve_local(tz, today + Days::new(1), time),
                }
            } else {
                Window {
                    start: resolve_local(tz, today - Days::new(1), time),
                    end: boundary,
                }
            }
        }
    }
}

fn weekly_window(cfg: &ResetConfig, now: DateTime<Utc>, tz: Tz) -> Window {
    let target = i64::from(cfg.weekly_reset_day_normalized());
    let time = naive_time(cfg.weekly_reset_time);
    let today = now.with_timezone(&tz).date_naive();
    let days_back = (7 + i64::from(today.weekday().num_days_from_sunday()) - target) % 7;
    let candidate_date = today - Days::new(days_back.unsigned_abs());
    let candidate = resolve_local(tz, candidate_date, time);
    let start_date = if candidate <= now {
        candidate_date
    } else {
        candidate_date - Days::new(7)
    };
    Window {
        start: resolve_local(tz, start_date, time),
        end: resolve_local(tz, start_date + Days::new(7), time),
    }
}

fn monthly_window(now: DateTime<Utc>, tz: Tz) -> Window {
    let today = now.with_timezone(&tz).date_naive();
    let first = first_of_month(today);
    let boundary = resolve_local(tz, first, NaiveTime::MIN);
    if now >= boundary {
        Window {
            start: boundary,
            end: resolve_local(tz, first_of_next_month(today), NaiveTime::MIN),
        }
    } else {
        // Only reachable when midnight on the 1st fell into a DST gap and
        // resolved after `now`.
        Window {
            start: resolve_local(tz, first_of_prev_month(today), NaiveTime::MIN),
            end: boundary,
        }
    }
}

/// Compute the accounting window for `period` at `now`.
///
/// `Period::Total` has no boundary; it returns `[epoch, now)` and callers
/// apply the `total_reset_at` cutoff themselves.
#[must_use]
pub fn window_for(period: Period, cfg: &ResetConfig, now: DateTime<Utc>, tz: Tz) -> Window {
    match period {
        Period::FiveHour => Window {
            start: now - ChronoDuration::seconds(FIVE_HOURS_SECS),
            end: now,
        },
        Period::Daily => daily_window(cfg, now, tz),
        Period::Weekly => weekly_window(cfg, now, tz),
        Period::Monthly => monthly_window(now, tz),
        Period::Total => Window {
            start: DateTime::UNIX_EPOCH,
            end: now,
        },
    }
}

/// Seconds until the window moves: the distance to the next boundary for
/// fixed periods, the window length itself for rolling periods.
#[must_use]
pub fn ttl_for(period: Period, cfg: &ResetConfig, now: DateTime<Utc>, tz: Tz) -> std::time::Duration {
    let secs = match period {
        Period::FiveHour => FIVE_HOURS_SECS,
        Period::Daily if cfg.daily_reset_mode == ResetMode::Rolling => DAY_SECS,
        Period::Total => DAY_SECS,
        _ => {
            let window = window_for(period, cfg, now, tz);
            (window.end - now).num_seconds().max(1)
        }
    };
    std::time::Duration::from_secs(secs.unsigned_abs())
}

/// Describe when the current window resets, for denial responses.
#[must_use]
pub fn next_reset_info(period: Period, cfg: &ResetConfig, now: DateTime<Utc>, tz: Tz) -> ResetInfo {
    match period {
        Period::FiveHour => ResetInfo {
            kind: ResetKind::Rolling,
            reset_at: None,
            period_label: "5h",
        },
        Period::Daily => match cfg.daily_reset_mode {
            ResetMode::Rolling => ResetInfo {
                kind: ResetKind::Rolling,
                reset_at: None,
                period_label: "24h",
            },
            ResetMode::Fixed => ResetInfo {
                kind: ResetKind::Fixed,
                reset_at: Some(daily_window(cfg, now, tz).end),
                period_label: "daily",
            },
        },
        Period::Weekly => {
            let natural = cfg.weekly_reset_day_normalized() == 1
                && cfg.weekly_reset_time == ResetTime::MIDNIGHT;
            ResetInfo {
                kind: if natural {
                    ResetKind::Natural
                } else {
                    ResetKind::Custom
                },
                reset_at: Some(weekly_window(cfg, now, tz).end),
                period_label: "weekly",
            }
        }
        Period::Monthly => ResetInfo {
            kind: ResetKind::Natural,
            reset_at: Some(monthly_window(now, tz).end),
            period_label: "monthly",
        },
        Period::Total => ResetInfo {
            kind: ResetKind::Natural,
            reset_at: None,
            period_label: "total",
        },
    }
}
