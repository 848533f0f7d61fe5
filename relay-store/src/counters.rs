//! Redis-backed counter cache.
//!
//! Atomicity model: the rolling read/trim path and concurrency acquisition
//! run as Lua scripts; fixed-bucket bumps run in one pipeline guarded by a
//! `SET NX` dedup key per ledger id, so replaying an increment never
//! double-counts.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use rust_decimal::Decimal;

use relay_core::store::{ConcurrencyDecision, CounterIncrement, CounterStore};
use relay_types::{BreakerState, CostEntry, RelayError};

/// TTL for the cached total-cost value.
const TOTAL_TTL_SECS: u64 = 300;
/// Idle TTL for concurrency counters; a leaked token self-heals after this.
const SESSIONS_TTL_SECS: i64 = 3600;
/// TTL for increment dedup markers. Retries land well inside this.
const DEDUP_TTL_SECS: u64 = 3600;

/// Trim a rolling set below the cutoff and return the remaining cost sum.
/// Members are `{ledger_id}:{cost}`; returns nil when the set is absent so
/// the caller can warm it from the ledger.
const ROLLING_SUM: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return false
end
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', '(' .. ARGV[1])
local members = redis.call('ZRANGE', KEYS[1], 0, -1)
local sum = 0
for _, m in ipairs(members) do
  local sep = string.find(m, ':', 1, true)
  if sep then
    sum = sum + tonumber(string.sub(m, sep + 1))
  end
end
return tostring(sum)
";

/// Bounded increment of a session counter. Returns `{granted, current}`.
const SESSION_ACQUIRE: &str = r"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current >= tonumber(ARGV[1]) then
  return {0, current}
end
current = redis.call('INCR', KEYS[1])
redis.call('EXPIRE', KEYS[1], ARGV[2])
return {1, current}
";

/// Floor-at-zero release of a session counter.
const SESSION_RELEASE: &str = r"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current > 0 then
  redis.call('DECR', KEYS[1])
  redis.call('EXPIRE', KEYS[1], ARGV[1])
end
return 1
";

fn store_err(context: &str, err: impl std::fmt::Display) -> RelayError {
    RelayError::store(format!("{context}: {err}"))
}

fn parse_decimal(raw: &str) -> Result<Decimal, RelayError> {
    raw.parse::<Decimal>()
        .map_err(|err| store_err("non-decimal counter value", err))
}

/// Redis implementation of [`CounterStore`].
#[derive(Clone)]
pub struct RedisCounters {
    con: ConnectionManager,
    rolling_sum: Script,
    session_acquire: Script,
    session_release: Script,
}

impl RedisCounters {
    /// Connect to `url` (e.g. `redis://127.0.0.1/`).
    ///
    /// # Errors
    /// Returns a store error when the URL is invalid or the initial
    /// connection fails.
    pub async fn connect(url: &str) -> Result<Self, RelayError> {
        let client = redis::Client::open(url).map_err(|err| store_err("redis url", err))?;
        let con = client
            .get_connection_manager()
            .await
            .map_err(|err| store_err("redis connect", err))?;
        Ok(Self {
            con,
            rolling_sum: Script::new(ROLLING_SUM),
            session_acquire: Script::new(SESSION_ACQUIRE),
            session_release: Script::new(SESSION_RELEASE),
        })
    }

    fn rolling_member(ledger_id: i64, cost: Decimal) -> String {
        format!("{ledger_id}:{cost}")
    }
}

#[async_trait]
impl CounterStore for RedisCounters {
    async fn increment(&self, inc: &CounterIncrement) -> Result<(), RelayError> {
        let mut con = self.con.clone();

        // Dedup marker: replays of the same ledger row are no-ops.
        let marker = format!("billed:{}", inc.ledger_id);
        let fresh: bool = redis::cmd("SET")
            .arg(&marker)
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(DEDUP_TTL_SECS)
            .query_async(&mut con)
            .await
            .map(|v: Option<String>| v.is_some())
            .map_err(|err| store_err("increment dedup", err))?;
        if !fresh {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for bump in &inc.fixed {
            pipe.cmd("INCRBYFLOAT")
                .arg(&bump.key)
                .arg(inc.cost.to_string())
                .ignore();
            pipe.expire(&bump.key, bump.ttl.as_secs().max(1) as i64).ignore();
        }
        let member = Self::rolling_member(inc.ledger_id, inc.cost);
        for bump in &inc.rolling {
            pipe.zadd(&bump.key, &member, inc.created_at_ms).ignore();
            pipe.expire(&bump.key, bump.window.as_secs().max(1) as i64)
                .ignore();
        }
        pipe.query_async::<()>(&mut con)
            .await
            .map_err(|err| store_err("increment pipeline", err))
    }

    async fn read_fixed(&self, key: &str) -> Result<Option<Decimal>, RelayError> {
        let mut con = self.con.clone();
        let raw: Option<String> = con
            .get(key)
            .await
            .map_err(|err| store_err("read fixed counter", err))?;
        raw.as_deref().map(parse_decimal).transpose()
    }

    async fn write_fixed(
        &self,
        key: &str,
        value: Decimal,
        ttl: Duration,
    ) -> Result<(), RelayError> {
        let mut con = self.con.clone();
        con.set_ex::<_, _, ()>(key, value.to_string(), ttl.as_secs().max(1))
            .await
            .map_err(|err| store_err("write fixed counter", err))
    }

    async fn read_rolling(
        &self,
        key: &str,
        window: Duration,
        now_ms: i64,
    ) -> Result<Option<Decimal>, RelayError> {
        let mut con = self.con.clone();
        let cutoff = now_ms - i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        let raw: Option<String> = self
            .rolling_sum
            .key(key)
            .arg(cutoff)
            .invoke_async(&mut con)
            .await
            .map_err(|err| store_err("rolling sum", err))?;
        raw.as_deref().map(parse_decimal).transpose()
    }

    async fn warm_rolling(
        &self,
        key: &str,
        entries: &[CostEntry],
        window: Duration,
    ) -> Result<(), RelayError> {
        let mut con = self.con.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for entry in entries {
            pipe.zadd(
                key,
                Self::rolling_member(entry.id, entry.cost_usd),
                entry.created_at.timestamp_millis(),
            )
            .ignore();
        }
        pipe.expire(key, window.as_secs().max(1) as i64).ignore();
        pipe.query_async::<()>(&mut con)
            .await
            .map_err(|err| store_err("warm rolling", err))
    }

    async fn read_total(&self, key: &str) -> Result<Option<Decimal>, RelayError> {
        let mut con = self.con.clone();
        let raw: Option<String> = con
            .get(key)
            .await
            .map_err(|err| store_err("read total", err))?;
        raw.as_deref().map(parse_decimal).transpose()
    }

    async fn write_total(&self, key: &str, value: Decimal) -> Result<(), RelayError> {
        let mut con = self.con.clone();
        con.set_ex::<_, _, ()>(key, value.to_string(), TOTAL_TTL_SECS)
            .await
            .map_err(|err| store_err("write total", err))
    }

    async fn acquire_session(
        &self,
        key: &str,
        capacity: u32,
    ) -> Result<ConcurrencyDecision, RelayError> {
        let mut con = self.con.clone();
        let (granted, current): (i64, i64) = self
            .session_acquire
            .key(key)
            .arg(capacity)
            .arg(SESSIONS_TTL_SECS)
            .invoke_async(&mut con)
            .await
            .map_err(|err| store_err("session acquire", err))?;
        Ok(ConcurrencyDecision {
            allowed: granted == 1,
            current: u32::try_from(current.max(0)).unwrap_or(u32::MAX),
        })
    }

    async fn release_session(&self, key: &str) -> Result<(), RelayError> {
        let mut con = self.con.clone();
        let _: i64 = self
            .session_release
            .key(key)
            .arg(SESSIONS_TTL_SECS)
            .invoke_async(&mut con)
            .await
            .map_err(|err| store_err("session release", err))?;
        Ok(())
    }

    async fn breaker_get(&self, endpoint_id: i64) -> Result<Option<BreakerState>, RelayError> {
        let mut con = self.con.clone();
        let raw: Option<String> = con
            .get(format!("circuit:{endpoint_id}"))
            .await
            .map_err(|err| store_err("breaker get", err))?;
        raw.map(|blob| {
            serde_json::from_str(&blob).map_err(|err| store_err("breaker blob", err))
        })
        .transpose()
    }

    async fn breaker_set(
        &self,
        endpoint_id: i64,
        state: &BreakerState,
    ) -> Result<(), RelayError> {
        let mut con = self.con.clone();
        let blob =
            serde_json::to_string(state).map_err(|err| store_err("breaker serialize", err))?;
        con.set::<_, _, ()>(format!("circuit:{endpoint_id}"), blob)
            .await
            .map_err(|err| store_err("breaker set", err))
    }

    async fn ping(&self) -> Result<(), RelayError> {
        let mut con = self.con.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut con)
            .await
            .map(|_| ())
            .map_err(|err| store_err("ping", err))
    }
}
