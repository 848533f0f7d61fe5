//! Per-endpoint circuit breaker registry.
//!
//! State lives in two places: an in-process mirror for fast reads during
//! selection, and the counter cache (`circuit:{endpointId}`) so open
//! breakers survive restarts. Every transition writes through.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::Mutex;

use relay_core::classify::Outcome;
use relay_core::store::CounterStore;
use relay_types::{BreakerConfig, BreakerPhase, BreakerState};

/// Whether a selection attempt may use an endpoint right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Closed breaker; traffic flows normally.
    Allowed,
    /// Half-open breaker; this caller holds the single probe slot.
    Probe,
    /// Open breaker (or the probe slot is taken); skip the endpoint.
    Skip,
}

/// Transition event emitted for logging and admin visibility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerEvent {
    /// Breaker tripped; selection skips the endpoint until `until`.
    Opened {
        /// Endpoint that tripped.
        endpoint_id: i64,
        /// Cooldown deadline.
        until: DateTime<Utc>,
        /// Failures that caused the trip.
        failures: u32,
    },
    /// Cooldown elapsed; one probe request is admitted.
    HalfOpened {
        /// Endpoint entering half-open.
        endpoint_id: i64,
    },
    /// Probe (or manual reset) closed the breaker.
    Closed {
        /// Endpoint back in rotation.
        endpoint_id: i64,
    },
}

/// Registry owning the per-endpoint state machines.
pub struct BreakerRegistry {
    counters: Arc<dyn CounterStore>,
    config: BreakerConfig,
    mirror: Mutex<HashMap<i64, BreakerState>>,
}

impl BreakerRegistry {
    /// Build a registry persisting through `counters`.
    pub fn new(counters: Arc<dyn CounterStore>, config: BreakerConfig) -> Self {
        Self {
            counters,
            config,
            mirror: Mutex::new(HashMap::new()),
        }
    }

    async fn load(&self, endpoint_id: i64) -> BreakerState {
        if let Some(state) = self.mirror.lock().await.get(&endpoint_id) {
            return state.clone();
        }
        // Cold mirror: hydrate from the cache so restarts honor open
        // breakers until their deadline.
        let state = match self.counters.breaker_get(endpoint_id).await {
            Ok(Some(state)) => state,
            Ok(None) => BreakerState {
                recovery_ms: self.config.recovery_ms,
                ..BreakerState::default()
            },
            Err(err) => {
                tracing::warn!(endpoint_id, %err, "breaker state unavailable, assuming closed");
                BreakerState {
                    recovery_ms: self.config.recovery_ms,
                    ..BreakerState::default()
                }
            }
        };
        self.mirror.lock().await.insert(endpoint_id, state.clone());
        state
    }

    async fn persist(&self, endpoint_id: i64, state: &BreakerState) {
        self.mirror
            .lock()
            .await
            .insert(endpoint_id, state.clone());
        if let Err(err) = self.counters.breaker_set(endpoint_id, state).await {
            tracing::warn!(endpoint_id, %err, "failed to persist breaker state");
        }
    }

    fn next_recovery_ms(&self, open_count: u32) -> u64 {
        let factor = u64::from(self.config.backoff_factor).max(1);
        let mut recovery = self.config.recovery_ms;
        for _ in 1..open_count {
            recovery = recovery.saturating_mul(factor);
            if recovery >= self.config.max_recovery_ms {
                return self.config.max_recovery_ms;
            }
        }
        recovery.min(self.config.max_recovery_ms)
    }

    /// Whether selection must skip this endpoint at `now`. Also performs
    /// the open → half-open transition when the cooldown elapsed.
    pub async fn is_open(&self, endpoint_id: i64, now: DateTime<Utc>) -> bool {
        let state = self.load(endpoint_id).await;
        match state.phase {
            BreakerPhase::Open => {
                if state.is_open(now) {
                    true
                } else {
                    let mut next = state;
                    next.phase = BreakerPhase::HalfOpen;
                    next.probe_inflight = false;
                    self.persist(endpoint_id, &next).await;
                    tracing::info!(endpoint_id, "breaker half-open");
                    false
                }
            }
            _ => false,
        }
    }

    /// Admission control for one attempt. In half-open exactly one caller
    /// receives [`Admission::Probe`]; everyone else skips.
    pub async fn admit(&self, endpoint_id: i64, now: DateTime<Utc>) -> Admission {
        if self.is_open(endpoint_id, now).await {
            return Admission::Skip;
        }
        let state = self.load(endpoint_id).await;
        match state.phase {
            BreakerPhase::HalfOpen => {
                if state.probe_inflight {
                    Admission::Skip
                } else {
                    let mut next = state;
                    next.probe_inflight = true;
                    self.persist(endpoint_id, &next).await;
                    Admission::Probe
                }
            }
            _ => Admission::Allowed,
        }
    }

    /// Record an attempt outcome and run the state machine.
    ///
    /// Only `RetryableFailure` counts toward the threshold: fatal upstream
    /// answers say nothing about endpoint health, and concurrency pressure
    /// is load, not failure.
    pub async fn record_outcome(
        &self,
        endpoint_id: i64,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Option<BreakerEvent> {
        let state = self.load(endpoint_id).await;
        match outcome {
            Outcome::Success => {
                let was_degraded =
                    state.phase != BreakerPhase::Closed || state.consecutive_failures > 0;
                if !was_degraded {
                    return None;
                }
                let next = BreakerState {
                    recovery_ms: self.config.recovery_ms,
                    ..BreakerState::default()
                };
                self.persist(endpoint_id, &next).await;
                tracing::info!(endpoint_id, "breaker closed");
                Some(BreakerEvent::Closed { endpoint_id })
            }
            Outcome::RetryableFailure => self.record_failure(endpoint_id, state, now).await,
            Outcome::FatalFailure | Outcome::ConcurrentLimited => {
                if state.phase == BreakerPhase::HalfOpen && state.probe_inflight {
                    // Free the probe slot without judging the endpoint.
                    let mut next = state;
                    next.probe_inflight = false;
                    self.persist(endpoint_id, &next).await;
                }
                None
            }
        }
    }

    async fn record_failure(
        &self,
        endpoint_id: i64,
        state: BreakerState,
        now: DateTime<Utc>,
    ) -> Option<BreakerEvent> {
        let mut next = state;
        next.last_failure_at = Some(now);
        match next.phase {
            BreakerPhase::HalfOpen => {
                // Failed probe: straight back to open with the next backoff
                // step.
                next.open_count = next.open_count.saturating_add(1);
                next.recovery_ms = self.next_recovery_ms(next.open_count);
                next.phase = BreakerPhase::Open;
                next.probe_inflight = false;
                let until = now + ChronoDuration::milliseconds(next.recovery_ms as i64);
                next.open_until = Some(until);
                let failures = next.consecutive_failures;
                self.persist(endpoint_id, &next).await;
                tracing::warn!(endpoint_id, %until, "breaker re-opened after failed probe");
                Some(BreakerEvent::Opened {
                    endpoint_id,
                    until,
                    failures,
                })
            }
            BreakerPhase::Closed => {
                next.consecutive_failures = next.consecutive_failures.saturating_add(1);
                if next.consecutive_failures < self.config.failure_threshold {
                    self.persist(endpoint_id, &next).await;
                    return None;
                }
                next.open_count = next.open_count.saturating_add(1);
                next.recovery_ms = self.next_recovery_ms(next.open_count);
                next.phase = BreakerPhase::Open;
                let until = now + ChronoDuration::milliseconds(next.recovery_ms as i64);
                next.open_until = Some(until);
                let failures = next.consecutive_failures;
                self.persist(endpoint_id, &next).await;
                tracing::warn!(endpoint_id, failures, %until, "breaker opened");
                Some(BreakerEvent::Opened {
                    endpoint_id,
                    until,
                    failures,
                })
            }
            BreakerPhase::Open => {
                self.persist(endpoint_id, &next).await;
                None
            }
        }
    }

    /// Force an endpoint closed and clear its counters (admin action).
    pub async fn manual_reset(&self, endpoint_id: i64) -> BreakerEvent {
        let next = BreakerState {
            recovery_ms: self.config.recovery_ms,
            ..BreakerState::default()
        };
        self.persist(endpoint_id, &next).await;
        tracing::info!(endpoint_id, "breaker manually reset");
        BreakerEvent::Closed { endpoint_id }
    }

    /// Snapshot of an endpoint's current state, for admin reads.
    pub async fn state(&self, endpoint_id: i64) -> BreakerState {
        self.load(endpoint_id).await
    }
}
