//! Relational layout and startup checks.
//!
//! Schema evolution tooling is out of scope; the service refuses to start
//! against an incomplete schema (exit code 2) unless asked to create it.

use sqlx::Row;
use sqlx::postgres::PgPool;

use relay_types::RelayError;

const TABLES: &[&str] = &[
    "users",
    "keys",
    "providers",
    "provider_endpoints",
    "error_rules",
    "usage_ledger",
    "message_request",
    "system_config",
];

const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id          BIGSERIAL PRIMARY KEY,
    data        JSONB NOT NULL,
    is_enabled  BOOLEAN NOT NULL DEFAULT TRUE,
    deleted_at  TIMESTAMPTZ,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS keys (
    id          BIGSERIAL PRIMARY KEY,
    key_hash    TEXT NOT NULL UNIQUE,
    user_id     BIGINT NOT NULL REFERENCES users (id),
    data        JSONB NOT NULL,
    is_enabled  BOOLEAN NOT NULL DEFAULT TRUE,
    deleted_at  TIMESTAMPTZ,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS providers (
    id          BIGSERIAL PRIMARY KEY,
    data        JSONB NOT NULL,
    is_enabled  BOOLEAN NOT NULL DEFAULT TRUE,
    deleted_at  TIMESTAMPTZ,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS provider_endpoints (
    id          BIGSERIAL PRIMARY KEY,
    provider_id BIGINT NOT NULL REFERENCES providers (id),
    data        JSONB NOT NULL,
    is_enabled  BOOLEAN NOT NULL DEFAULT TRUE,
    deleted_at  TIMESTAMPTZ,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS error_rules (
    id          BIGSERIAL PRIMARY KEY,
    data        JSONB NOT NULL,
    is_enabled  BOOLEAN NOT NULL DEFAULT TRUE,
    deleted_at  TIMESTAMPTZ,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS usage_ledger (
    id                 BIGSERIAL PRIMARY KEY,
    created_at         TIMESTAMPTZ NOT NULL,
    user_id            BIGINT NOT NULL,
    key_hash           TEXT NOT NULL,
    final_provider_id  BIGINT NOT NULL,
    cost_usd           NUMERIC(18, 8) NOT NULL,
    duration_ms        BIGINT NOT NULL,
    is_success         BOOLEAN NOT NULL,
    blocked_by         TEXT,
    blocked_reason     JSONB,
    deleted_at         TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS usage_ledger_user_created
    ON usage_ledger (user_id, created_at);
CREATE INDEX IF NOT EXISTS usage_ledger_key_created
    ON usage_ledger (key_hash, created_at);
CREATE INDEX IF NOT EXISTS usage_ledger_provider_created
    ON usage_ledger (final_provider_id, created_at);

CREATE TABLE IF NOT EXISTS message_request (
    id                    BIGSERIAL PRIMARY KEY,
    session_id            TEXT NOT NULL,
    created_at            TIMESTAMPTZ NOT NULL,
    user_id               BIGINT,
    key_id                BIGINT,
    model                 TEXT,
    endpoint              TEXT NOT NULL,
    is_streaming          BOOLEAN NOT NULL,
    status_code           INTEGER NOT NULL,
    error_body            JSONB,
    input_tokens          BIGINT NOT NULL DEFAULT 0,
    output_tokens         BIGINT NOT NULL DEFAULT 0,
    cache_read_tokens     BIGINT NOT NULL DEFAULT 0,
    cache_creation_tokens BIGINT NOT NULL DEFAULT 0,
    user_agent            TEXT,
    final_provider_id     BIGINT,
    provider_chain        JSONB NOT NULL,
    duration_ms           BIGINT NOT NULL
);

CREATE INDEX IF NOT EXISTS message_request_created
    ON message_request (created_at);
CREATE INDEX IF NOT EXISTS message_request_session
    ON message_request (session_id);

CREATE TABLE IF NOT EXISTS system_config (
    id          BIGSERIAL PRIMARY KEY,
    data        JSONB NOT NULL,
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT now()
);
"#;

/// Whether every expected table exists.
///
/// # Errors
/// Returns a store error when the catalog query itself fails.
pub async fn schema_ready(pool: &PgPool) -> Result<bool, RelayError> {
    let rows = sqlx::query(
        "SELECT tablename FROM pg_tables WHERE schemaname = 'public' AND tablename = ANY($1)",
    )
    .bind(TABLES.iter().map(|t| (*t).to_string()).collect::<Vec<_>>())
    .fetch_all(pool)
    .await
    .map_err(|err| RelayError::store(format!("schema check: {err}")))?;
    let found: Vec<String> = rows
        .into_iter()
        .filter_map(|row| row.try_get::<String, _>(0).ok())
        .collect();
    Ok(TABLES.iter().all(|t| found.iter().any(|f| f == t)))
}

/// Create every table and index that does not yet exist.
///
/// # Errors
/// Returns a store error when any DDL statement fails.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), RelayError> {
    for statement in DDL.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|err| RelayError::store(format!("schema apply: {err}")))?;
    }
    Ok(())
}
