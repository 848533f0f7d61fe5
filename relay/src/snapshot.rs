//! Immutable provider/endpoint snapshots.
//!
//! Selection reads a snapshot; admin writes publish a whole new one
//! atomically. Readers see either the old or the new snapshot, never a torn
//! view, and probe results republish rather than mutate in place.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;

use relay_middleware::EndpointDirectory;
use relay_types::{Provider, ProviderEndpoint};

/// One immutable view of the provider pool.
#[derive(Debug, Default, Clone)]
pub struct ProviderSnapshot {
    providers: Vec<Arc<Provider>>,
    endpoints: HashMap<i64, Vec<ProviderEndpoint>>,
}

impl ProviderSnapshot {
    /// Build a snapshot from catalog rows. Tombstoned entries are expected
    /// to be filtered upstream; endpoints are pre-sorted by preference.
    #[must_use]
    pub fn new(providers: Vec<Provider>, mut endpoints: Vec<ProviderEndpoint>) -> Self {
        endpoints.sort_by_key(ProviderEndpoint::preference_key);
        let mut by_provider: HashMap<i64, Vec<ProviderEndpoint>> = HashMap::new();
        for endpoint in endpoints {
            by_provider.entry(endpoint.provider_id).or_default().push(endpoint);
        }
        Self {
            providers: providers.into_iter().map(Arc::new).collect(),
            endpoints: by_provider,
        }
    }

    /// All providers in the snapshot.
    #[must_use]
    pub fn providers(&self) -> &[Arc<Provider>] {
        &self.providers
    }

    /// A provider by id.
    #[must_use]
    pub fn provider(&self, id: i64) -> Option<&Arc<Provider>> {
        self.providers.iter().find(|p| p.id == id)
    }

    /// Endpoints for a provider, in preference order.
    #[must_use]
    pub fn endpoints_for(&self, provider_id: i64) -> &[ProviderEndpoint] {
        self.endpoints
            .get(&provider_id)
            .map_or(&[], Vec::as_slice)
    }

    /// All endpoints across providers.
    #[must_use]
    pub fn all_endpoints(&self) -> Vec<ProviderEndpoint> {
        self.endpoints.values().flatten().cloned().collect()
    }
}

/// Hot-swappable holder for the current snapshot.
pub struct SnapshotRegistry {
    current: ArcSwap<ProviderSnapshot>,
}

impl Default for SnapshotRegistry {
    fn default() -> Self {
        Self::new(ProviderSnapshot::default())
    }
}

impl SnapshotRegistry {
    /// Start from an initial snapshot.
    #[must_use]
    pub fn new(initial: ProviderSnapshot) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
        }
    }

    /// The current snapshot.
    #[must_use]
    pub fn load(&self) -> Arc<ProviderSnapshot> {
        self.current.load_full()
    }

    /// Publish a replacement snapshot.
    pub fn publish(&self, snapshot: ProviderSnapshot) {
        self.current.store(Arc::new(snapshot));
    }
}

#[async_trait]
impl EndpointDirectory for SnapshotRegistry {
    fn enabled_endpoints(&self) -> Vec<ProviderEndpoint> {
        self.load()
            .all_endpoints()
            .into_iter()
            .filter(|e| e.is_enabled)
            .collect()
    }

    async fn record_probe(&self, endpoint_id: i64, ok: bool, latency_ms: Option<u64>) {
        let snapshot = self.load();
        let mut endpoints = snapshot.all_endpoints();
        let mut touched = false;
        for endpoint in &mut endpoints {
            if endpoint.id == endpoint_id {
                endpoint.last_probe_ok = Some(ok);
                endpoint.last_probe_latency_ms = latency_ms;
                touched = true;
            }
        }
        if !touched {
            return;
        }
        let providers = snapshot
            .providers()
            .iter()
            .map(|p| (**p).clone())
            .collect();
        self.publish(ProviderSnapshot::new(providers, endpoints));
    }
}
