//! Short-TTL in-process caches for admin-editable configuration.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;

use relay_core::classify::RuleEngine;
use relay_types::{ErrorRule, RelayError};

/// Where the rule set comes from (the SQL store, in production).
#[async_trait]
pub trait RuleSource: Send + Sync {
    /// Load the full rule set.
    async fn load_rules(&self) -> Result<Vec<ErrorRule>, RelayError>;
}

/// Caches the compiled [`RuleEngine`] for a short interval so classification
/// stays off the database on the hot path. `invalidate` is called from the
/// admin write path for immediate refresh.
pub struct RulesCache {
    source: Arc<dyn RuleSource>,
    cache: Cache<(), Arc<RuleEngine>>,
}

impl RulesCache {
    /// Build a cache with the given TTL (30 s is the conventional value).
    pub fn new(source: Arc<dyn RuleSource>, ttl: Duration) -> Self {
        Self {
            source,
            cache: Cache::builder().max_capacity(1).time_to_live(ttl).build(),
        }
    }

    /// The current engine; loads and compiles on miss. A failing source
    /// degrades to an empty rule set (status-family classification still
    /// applies) rather than blocking traffic.
    pub async fn engine(&self) -> Arc<RuleEngine> {
        self.cache
            .get_with((), async {
                match self.source.load_rules().await {
                    Ok(rules) => Arc::new(RuleEngine::new(rules)),
                    Err(err) => {
                        tracing::warn!(%err, "error rules unavailable, classification falls back to status families");
                        Arc::new(RuleEngine::empty())
                    }
                }
            })
            .await
    }

    /// Drop the cached engine so the next read recompiles.
    pub fn invalidate(&self) {
        self.cache.invalidate_all();
    }
}
