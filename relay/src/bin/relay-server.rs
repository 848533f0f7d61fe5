//! Service entrypoint.
//!
//! Exit codes: 0 normal shutdown, 1 startup error, 2 migration required,
//! 3 configuration invalid.

use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::time::Duration;

use arc_swap::ArcSwap;
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

use relay::server::admin::AdminState;
use relay::{AppConfig, AppState, ProviderSnapshot, SnapshotRegistry, server};
use relay_core::pricing::PriceTable;
use relay_middleware::{BreakerRegistry, ProbeScheduler, RateLimitEngine, RulesCache};
use relay_store::{
    CapturedSessions, Catalog, LedgerWriter, PgLedger, RedisCounters, ensure_schema, schema_ready,
};
use relay_types::BreakerConfig;

#[derive(Debug, Parser)]
#[command(name = "relay-server", version, about = "Multi-tenant LLM reverse proxy")]
struct Args {
    /// Listen address for the HTTP server.
    #[arg(long, env = "RELAY_LISTEN", default_value = "127.0.0.1:8080")]
    listen: std::net::SocketAddr,

    /// Postgres connection URL.
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Redis connection URL.
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1/")]
    redis_url: String,

    /// IANA timezone used for all rate-limit window math.
    #[arg(long, env = "TZ", default_value = "UTC")]
    timezone: String,

    /// Comma-separated proxies whose X-Forwarded-For is trusted.
    #[arg(long, env = "RELAY_TRUSTED_PROXIES", default_value = "")]
    trusted_proxies: String,

    /// Create missing tables at startup instead of refusing to run.
    #[arg(long)]
    auto_migrate: bool,
}

fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(%err, "failed to start runtime");
            return std::process::ExitCode::from(1);
        }
    };
    std::process::ExitCode::from(runtime.block_on(run()))
}

async fn run() -> u8 {
    let args = Args::parse();

    let tz = match AppConfig::parse_timezone(&args.timezone) {
        Ok(tz) => tz,
        Err(err) => {
            tracing::error!(%err, "invalid configuration");
            return 3;
        }
    };
    let config = AppConfig {
        listen: args.listen,
        database_url: args.database_url,
        redis_url: args.redis_url,
        timezone: tz,
        trusted_proxies: args
            .trusted_proxies
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect(),
        auto_migrate: args.auto_migrate,
    };

    let pool = match PgPoolOptions::new()
        .max_connections(16)
        .connect(&config.database_url)
        .await
    {
        Ok(pool) => pool,
        Err(err) => {
            tracing::error!(%err, "database connection failed");
            return 1;
        }
    };

    match schema_ready(&pool).await {
        Ok(true) => {}
        Ok(false) if config.auto_migrate => {
            if let Err(err) = ensure_schema(&pool).await {
                tracing::error!(%err, "schema creation failed");
                return 1;
            }
            tracing::info!("schema created");
        }
        Ok(false) => {
            tracing::error!("schema incomplete; run with --auto-migrate");
            return 2;
        }
        Err(err) => {
            tracing::error!(%err, "schema check failed");
            return 1;
        }
    }

    let counters = match RedisCounters::connect(&config.redis_url).await {
        Ok(counters) => Arc::new(counters),
        Err(err) => {
            tracing::error!(%err, "redis connection failed");
            return 1;
        }
    };

    let catalog = Catalog::new(pool.clone());
    let pg = PgLedger::new(pool.clone());
    let ledger: Arc<dyn relay_core::LedgerStore> = Arc::new(pg.clone());

    let snapshot = match (catalog.providers().await, catalog.endpoints().await) {
        (Ok(providers), Ok(endpoints)) => ProviderSnapshot::new(providers, endpoints),
        (Err(err), _) | (_, Err(err)) => {
            tracing::error!(%err, "provider snapshot load failed");
            return 1;
        }
    };
    let registry = Arc::new(SnapshotRegistry::new(snapshot));

    let limits = Arc::new(RateLimitEngine::new(
        Arc::clone(&counters) as Arc<dyn relay_core::CounterStore>,
        Arc::clone(&ledger),
        config.timezone,
    ));
    let breakers = Arc::new(BreakerRegistry::new(
        Arc::clone(&counters) as Arc<dyn relay_core::CounterStore>,
        BreakerConfig::default(),
    ));
    let rules = Arc::new(RulesCache::new(
        Arc::new(catalog.clone()),
        Duration::from_secs(30),
    ));
    let (sessions, _session_worker) =
        CapturedSessions::spawn(1024, Duration::from_secs(600));
    let (writer, _writer_worker) = LedgerWriter::spawn(Arc::clone(&ledger), 4096);

    let settings = match catalog.system_settings().await {
        Ok(Some(settings)) => settings,
        Ok(None) => relay_types::SystemSettings::default(),
        Err(err) => {
            tracing::warn!(%err, "settings load failed, using defaults");
            relay_types::SystemSettings::default()
        }
    };

    let http = match reqwest::Client::builder().build() {
        Ok(http) => http,
        Err(err) => {
            tracing::error!(%err, "http client build failed");
            return 1;
        }
    };

    let state = AppState {
        registry: Arc::clone(&registry),
        limits,
        breakers: Arc::clone(&breakers),
        rules,
        sessions: sessions as Arc<dyn relay_core::SessionStore>,
        ledger,
        counters: Arc::clone(&counters) as Arc<dyn relay_core::CounterStore>,
        writer,
        principals: Arc::new(catalog.clone()),
        settings: Arc::new(ArcSwap::from_pointee(settings)),
        pricing: Arc::new(PriceTable::default()),
        http: http.clone(),
        inflight: Arc::new(AtomicU32::new(0)),
        tz: config.timezone,
    };

    let scheduler = ProbeScheduler::new(
        Arc::new(relay::probe::HttpProber::new(http)),
        Arc::clone(&registry) as Arc<dyn relay_middleware::EndpointDirectory>,
        breakers,
    );
    let probe_task = tokio::spawn(scheduler.run());

    let admin = AdminState {
        app: state.clone(),
        catalog,
        pg,
    };
    let app = server::app(state, Some(admin));

    let listener = match tokio::net::TcpListener::bind(config.listen).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(%err, listen = %config.listen, "bind failed");
            return 1;
        }
    };
    tracing::info!(listen = %config.listen, tz = %config.timezone, "relay listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;
    probe_task.abort();
    match served {
        Ok(()) => 0,
        Err(err) => {
            tracing::error!(%err, "server error");
            1
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut signal) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            signal.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    tracing::info!("shutdown signal received, draining");
}
