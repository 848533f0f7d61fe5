//! Shared fixtures for orchestrator tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;

use relay::snapshot::{ProviderSnapshot, SnapshotRegistry};
use relay::state::{AppState, PrincipalSource};
use relay_core::pricing::PriceTable;
use relay_core::store::{CounterStore, LedgerStore, SessionStore};
use relay_middleware::{BreakerRegistry, RateLimitEngine, RuleSource, RulesCache};
use relay_mock::{MemoryCounters, MemoryLedger, MemorySessions};
use relay_store::LedgerWriter;
use relay_types::{
    ApiKey, BreakerConfig, CacheTtlPreference, ErrorRule, OverridePrefs, Provider,
    ProviderEndpoint, ProviderTimeouts, ProviderType, QuotaCaps, RelayError, ResetConfig,
    SystemSettings, User,
};

/// In-memory principal table.
#[derive(Default)]
pub struct TestPrincipals {
    pub users: std::sync::Mutex<HashMap<i64, User>>,
    pub keys: std::sync::Mutex<HashMap<String, ApiKey>>,
}

#[async_trait]
impl PrincipalSource for TestPrincipals {
    async fn key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>, RelayError> {
        Ok(self.keys.lock().unwrap().get(key_hash).cloned())
    }

    async fn user(&self, id: i64) -> Result<Option<User>, RelayError> {
        Ok(self.users.lock().unwrap().get(&id).cloned())
    }
}

/// Static rule source for the classification cache.
pub struct TestRules(pub Vec<ErrorRule>);

#[async_trait]
impl RuleSource for TestRules {
    async fn load_rules(&self) -> Result<Vec<ErrorRule>, RelayError> {
        Ok(self.0.clone())
    }
}

pub struct Harness {
    pub state: AppState,
    pub counters: Arc<MemoryCounters>,
    pub ledger: Arc<MemoryLedger>,
    pub principals: Arc<TestPrincipals>,
}

/// Build an [`AppState`] over the in-memory stores.
pub fn harness(providers: Vec<Provider>, endpoints: Vec<ProviderEndpoint>) -> Harness {
    let counters = Arc::new(MemoryCounters::new());
    let ledger = Arc::new(MemoryLedger::new());
    let principals = Arc::new(TestPrincipals::default());
    let ledger_dyn: Arc<dyn LedgerStore> = Arc::clone(&ledger) as Arc<dyn LedgerStore>;
    let (writer, _worker) = LedgerWriter::spawn(Arc::clone(&ledger_dyn), 64);

    let state = AppState {
        registry: Arc::new(SnapshotRegistry::new(ProviderSnapshot::new(
            providers, endpoints,
        ))),
        limits: Arc::new(RateLimitEngine::new(
            Arc::clone(&counters) as Arc<dyn CounterStore>,
            Arc::clone(&ledger_dyn),
            chrono_tz::UTC,
        )),
        breakers: Arc::new(BreakerRegistry::new(
            Arc::clone(&counters) as Arc<dyn CounterStore>,
            BreakerConfig::default(),
        )),
        rules: Arc::new(RulesCache::new(
            Arc::new(TestRules(Vec::new())),
            std::time::Duration::from_secs(30),
        )),
        sessions: Arc::new(MemorySessions::new()) as Arc<dyn SessionStore>,
        ledger: ledger_dyn,
        counters: Arc::clone(&counters) as Arc<dyn CounterStore>,
        writer,
        principals: Arc::clone(&principals) as Arc<dyn PrincipalSource>,
        settings: Arc::new(ArcSwap::from_pointee(SystemSettings::default())),
        pricing: Arc::new(PriceTable::default()),
        http: reqwest::Client::new(),
        inflight: Arc::new(AtomicU32::new(0)),
        tz: chrono_tz::UTC,
    };
    Harness {
        state,
        counters,
        ledger,
        principals,
    }
}

pub fn provider(id: i64, name: &str, priority: u32, weight: u32) -> Provider {
    Provider {
        id,
        name: name.to_string(),
        base_url: format!("https://{name}.example.com"),
        provider_type: ProviderType::Claude,
        credential: "sk-upstream".into(),
        priority,
        weight,
        cost_multiplier: Decimal::ONE,
        is_enabled: true,
        group_tag: None,
        group_priorities: HashMap::new(),
        caps: QuotaCaps::default(),
        reset: ResetConfig::default(),
        timeouts: ProviderTimeouts::default(),
        schedule: None,
        overrides: OverridePrefs::default(),
        deleted_at: None,
        created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    }
}

pub fn endpoint(id: i64, provider_id: i64, url: &str) -> ProviderEndpoint {
    ProviderEndpoint {
        id,
        provider_id,
        url: url.to_string(),
        is_enabled: true,
        sort_order: 0,
        last_probe_ok: Some(true),
        last_probe_latency_ms: Some(120),
    }
}

pub fn user(id: i64) -> User {
    User {
        id,
        name: format!("user-{id}"),
        note: None,
        tags: Vec::new(),
        is_enabled: true,
        expires_at: None,
        caps: QuotaCaps::default(),
        reset: ResetConfig::default(),
        deleted_at: None,
        created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    }
}

pub fn api_key(id: i64, user_id: i64, key_hash: &str) -> ApiKey {
    ApiKey {
        id,
        key_hash: key_hash.to_string(),
        masked: "sk-…mock".into(),
        user_id,
        expires_at: None,
        is_enabled: true,
        can_login_web_ui: false,
        provider_group: None,
        cache_ttl: CacheTtlPreference::Inherit,
        caps: QuotaCaps::default(),
        reset: ResetConfig::default(),
        deleted_at: None,
        created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    }
}

/// Register a user+key pair and return the plaintext secret to send as the
/// bearer token.
pub fn register_principal(harness: &Harness, user_id: i64, key_id: i64) -> String {
    let secret = format!("sk-test-{user_id}-{key_id}");
    let key_hash = relay::auth::hash_secret(&secret);
    harness
        .principals
        .users
        .lock()
        .unwrap()
        .insert(user_id, user(user_id));
    harness
        .principals
        .keys
        .lock()
        .unwrap()
        .insert(key_hash.clone(), api_key(key_id, user_id, &key_hash));
    secret
}
