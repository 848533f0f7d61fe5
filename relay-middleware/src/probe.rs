//! Periodic endpoint liveness probing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;

use relay_core::classify::Outcome;
use relay_types::{ProviderEndpoint, RelayError};

use crate::breaker::BreakerRegistry;

/// Performs the cheap upstream check for one endpoint. The HTTP transport
/// lives with the orchestrator; the scheduler only needs the result.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Probe an endpoint, returning the round-trip in milliseconds.
    async fn probe(&self, endpoint: &ProviderEndpoint) -> Result<u64, RelayError>;
}

/// Read/write access to the endpoint snapshot the scheduler maintains.
#[async_trait]
pub trait EndpointDirectory: Send + Sync {
    /// Enabled endpoints to probe this round.
    fn enabled_endpoints(&self) -> Vec<ProviderEndpoint>;

    /// Publish a probe result onto the endpoint snapshot.
    async fn record_probe(&self, endpoint_id: i64, ok: bool, latency_ms: Option<u64>);
}

/// Apply uniform ±`jitter_percent`% jitter to a base interval, so many
/// relay instances do not probe in lockstep.
#[must_use]
pub fn jittered_interval(base: Duration, jitter_percent: u32) -> Duration {
    if jitter_percent == 0 {
        return base;
    }
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    let spread = (base_ms.saturating_mul(u64::from(jitter_percent))) / 100;
    if spread == 0 {
        return base;
    }
    let low = base_ms.saturating_sub(spread);
    let mut rng = rand::rng();
    Duration::from_millis(rng.random_range(low..=base_ms + spread))
}

/// Periodic probe loop: every interval (default 30 s, ±10 %), check each
/// enabled endpoint, publish `last_probe_ok`/`last_probe_latency_ms`, and
/// feed the outcome to the breaker registry.
pub struct ProbeScheduler {
    prober: Arc<dyn Prober>,
    directory: Arc<dyn EndpointDirectory>,
    breakers: Arc<BreakerRegistry>,
    interval: Duration,
    jitter_percent: u32,
}

impl ProbeScheduler {
    /// Build a scheduler with the default 30 s ± 10 % cadence.
    pub fn new(
        prober: Arc<dyn Prober>,
        directory: Arc<dyn EndpointDirectory>,
        breakers: Arc<BreakerRegistry>,
    ) -> Self {
        Self {
            prober,
            directory,
            breakers,
            interval: Duration::from_secs(30),
            jitter_percent: 10,
        }
    }

    /// Override the probe cadence.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// One probe round across every enabled endpoint.
    pub async fn run_once(&self) {
        for endpoint in self.directory.enabled_endpoints() {
            let outcome = match self.prober.probe(&endpoint).await {
                Ok(latency_ms) => {
                    self.directory
                        .record_probe(endpoint.id, true, Some(latency_ms))
                        .await;
                    Outcome::Success
                }
                Err(err) => {
                    tracing::debug!(endpoint_id = endpoint.id, %err, "probe failed");
                    self.directory.record_probe(endpoint.id, false, None).await;
                    Outcome::RetryableFailure
                }
            };
            self.breakers
                .record_outcome(endpoint.id, outcome, Utc::now())
                .await;
        }
    }

    /// Run until cancelled (the caller aborts the task on shutdown).
    pub async fn run(self) {
        loop {
            tokio::time::sleep(jittered_interval(self.interval, self.jitter_percent)).await;
            self.run_once().await;
        }
    }
}
