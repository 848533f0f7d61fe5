//! Shared application state threaded through the handlers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use arc_swap::ArcSwap;
use async_trait::async_trait;

use relay_core::pricing::PriceTable;
use relay_core::store::{CounterStore, LedgerStore, SessionStore};
use relay_middleware::{BreakerRegistry, RateLimitEngine, RulesCache};
use relay_store::LedgerWriter;
use relay_types::{ApiKey, RelayError, SystemSettings, User};

use crate::snapshot::SnapshotRegistry;

/// Authentication lookups, served by the catalog in production and by an
/// in-memory table in tests.
#[async_trait]
pub trait PrincipalSource: Send + Sync {
    /// Key by secret hash.
    async fn key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>, RelayError>;

    /// User by id.
    async fn user(&self, id: i64) -> Result<Option<User>, RelayError>;
}

#[async_trait]
impl PrincipalSource for relay_store::Catalog {
    async fn key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>, RelayError> {
        Self::key_by_hash(self, key_hash).await
    }

    async fn user(&self, id: i64) -> Result<Option<User>, RelayError> {
        Self::user(self, id).await
    }
}

/// Everything a request handler needs, cheap to clone.
#[derive(Clone)]
pub struct AppState {
    /// Provider/endpoint snapshots.
    pub registry: Arc<SnapshotRegistry>,
    /// Quota and concurrency enforcement.
    pub limits: Arc<RateLimitEngine>,
    /// Circuit breakers.
    pub breakers: Arc<BreakerRegistry>,
    /// Error-rule classification cache.
    pub rules: Arc<RulesCache>,
    /// Session captures.
    pub sessions: Arc<dyn SessionStore>,
    /// Usage ledger (reads).
    pub ledger: Arc<dyn LedgerStore>,
    /// Counter cache handle (health checks and admin reads).
    pub counters: Arc<dyn CounterStore>,
    /// Bounded billing queue (writes).
    pub writer: LedgerWriter,
    /// Authentication lookups.
    pub principals: Arc<dyn PrincipalSource>,
    /// Versioned system settings snapshot.
    pub settings: Arc<ArcSwap<SystemSettings>>,
    /// Model pricing.
    pub pricing: Arc<PriceTable>,
    /// Upstream HTTP client.
    pub http: reqwest::Client,
    /// In-flight request gauge for the admin overview.
    pub inflight: Arc<AtomicU32>,
    /// Timezone for window math (mirrors the limits engine).
    pub tz: chrono_tz::Tz,
}

impl AppState {
    /// Current settings snapshot.
    #[must_use]
    pub fn settings(&self) -> Arc<SystemSettings> {
        self.settings.load_full()
    }

    /// Publish a new settings version (admin writes bump `version`).
    pub fn publish_settings(&self, mut settings: SystemSettings) {
        settings.version = self.settings.load().version + 1;
        self.settings.store(Arc::new(settings));
    }

    /// Track one in-flight request; the guard decrements on drop.
    #[must_use]
    pub fn enter(&self) -> InflightGuard {
        self.inflight.fetch_add(1, Ordering::Relaxed);
        InflightGuard {
            gauge: Arc::clone(&self.inflight),
        }
    }
}

/// Decrements the in-flight gauge on drop.
pub struct InflightGuard {
    gauge: Arc<AtomicU32>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.gauge.fetch_sub(1, Ordering::Relaxed);
    }
}
