use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;

use relay_core::store::{ConcurrencyDecision, CounterIncrement, CounterStore};
use relay_types::{BreakerState, CostEntry, RelayError};

#[derive(Default)]
struct Inner {
    fixed: HashMap<String, Decimal>,
    rolling: HashMap<String, HashMap<i64, (i64, Decimal)>>,
    totals: HashMap<String, Decimal>,
    sessions: HashMap<String, u32>,
    breakers: HashMap<i64, BreakerState>,
    applied: HashSet<i64>,
}

/// In-memory [`CounterStore`]. Single-process, mutex-serialized, idempotent
/// per ledger id like the scripted Redis path.
#[derive(Default)]
pub struct MemoryCounters {
    inner: Mutex<Inner>,
    failing: AtomicBool,
}

impl MemoryCounters {
    /// A fresh, empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle failing mode; every operation returns a store error while set.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), RelayError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RelayError::store("memory counters in failing mode"));
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("mutex poisoned")
    }

    /// Seed a fixed bucket directly (test setup).
    pub fn seed_fixed(&self, key: &str, value: Decimal) {
        self.lock().fixed.insert(key.to_string(), value);
    }

    /// Seed a rolling set directly (test setup).
    pub fn seed_rolling(&self, key: &str, entries: &[(i64, i64, Decimal)]) {
        let mut inner = self.lock();
        let set = inner.rolling.entry(key.to_string()).or_default();
        for (id, score, cost) in entries {
            set.insert(*id, (*score, *cost));
        }
    }

    /// Fixed-bucket value without going through the trait (test assertions).
    #[must_use]
    pub fn fixed_value(&self, key: &str) -> Option<Decimal> {
        self.lock().fixed.get(key).copied()
    }

    /// Current session count for a key (test assertions).
    #[must_use]
    pub fn session_count(&self, key: &str) -> u32 {
        self.lock().sessions.get(key).copied().unwrap_or(0)
    }
}

#[async_trait]
impl CounterStore for MemoryCounters {
    async fn increment(&self, inc: &CounterIncrement) -> Result<(), RelayError> {
        self.check()?;
        let mut inner = self.lock();
        if !inner.applied.insert(inc.ledger_id) {
            return Ok(());
        }
        for bump in &inc.fixed {
            *inner.fixed.entry(bump.key.clone()).or_default() += inc.cost;
        }
        for bump in &inc.rolling {
            inner
                .rolling
                .entry(bump.key.clone())
                .or_default()
                .insert(inc.ledger_id, (inc.created_at_ms, inc.cost));
        }
        Ok(())
    }

    async fn read_fixed(&self, key: &str) -> Result<Option<Decimal>, RelayError> {
        self.check()?;
        Ok(self.lock().fixed.get(key).copied())
    }

    async fn write_fixed(
        &self,
        key: &str,
        value: Decimal,
        _ttl: Duration,
    ) -> Result<(), RelayError> {
        self.check()?;
        self.lock().fixed.insert(key.to_string(), value);
        Ok(())
    }

    async fn read_rolling(
        &self,
        key: &str,
        window: Duration,
        now_ms: i64,
    ) -> Result<Option<Decimal>, RelayError> {
        self.check()?;
        let mut inner = self.lock();
        let Some(set) = inner.rolling.get_mut(key) else {
            return Ok(None);
        };
        let cutoff = now_ms - i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        set.retain(|_, (score, _)| *score >= cutoff);
        Ok(Some(set.values().map(|(_, cost)| *cost).sum()))
    }

    async fn warm_rolling(
        &self,
        key: &str,
        entries: &[CostEntry],
        _window: Duration,
    ) -> Result<(), RelayError> {
        self.check()?;
        let mut inner = self.lock();
        let set = inner.rolling.entry(key.to_string()).or_default();
        for entry in entries {
            set.insert(entry.id, (entry.created_at.timestamp_millis(), entry.cost_usd));
        }
        Ok(())
    }

    async fn read_total(&self, key: &str) -> Result<Option<Decimal>, RelayError> {
        self.check()?;
        Ok(self.lock().totals.get(key).copied())
    }

    async fn write_total(&self, key: &str, value: Decimal) -> Result<(), RelayError> {
        self.check()?;
        self.lock().totals.insert(key.to_string(), value);
        Ok(())
    }

    async fn acquire_session(
        &self,
        key: &str,
        capacity: u32,
    ) -> Result<ConcurrencyDecision, RelayError> {
        self.check()?;
        let mut inner = self.lock();
        let count = inner.sessions.entry(key.to_string()).or_default();
        if *count >= capacity {
            return Ok(ConcurrencyDecision {
                allowed: false,
                current: *count,
            });
        }
        *count += 1;
        Ok(ConcurrencyDecision {
            allowed: true,
            current: *count,
        })
    }

    async fn release_session(&self, key: &str) -> Result<(), RelayError> {
        self.check()?;
        let mut inner = self.lock();
        if let Some(count) = inner.sessions.get_mut(key) {
            *count = count.saturating_sub(1);
        }
        Ok(())
    }

    async fn breaker_get(&self, endpoint_id: i64) -> Result<Option<BreakerState>, RelayError> {
        self.check()?;
        Ok(self.lock().breakers.get(&endpoint_id).cloned())
    }

    async fn breaker_set(
        &self,
        endpoint_id: i64,
        state: &BreakerState,
    ) -> Result<(), RelayError> {
        self.check()?;
        self.lock().breakers.insert(endpoint_id, state.clone());
        Ok(())
    }

    async fn ping(&self) -> Result<(), RelayError> {
        self.check()
    }
}
