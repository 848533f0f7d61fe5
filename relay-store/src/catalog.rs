//! Repository for admin-owned entities.
//!
//! Entities are stored as one JSONB document per row next to the hot
//! columns (id, enablement, tombstone). Soft-delete filtering lives here;
//! `deleted_at IS NULL` is never scattered across call sites.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::Row;
use sqlx::postgres::PgPool;

use relay_middleware::RuleSource;
use relay_types::{
    ApiKey, ErrorRule, Provider, ProviderEndpoint, RelayError, SystemSettings, User,
};

fn store_err(context: &str, err: impl std::fmt::Display) -> RelayError {
    RelayError::store(format!("{context}: {err}"))
}

fn to_doc<T: Serialize>(value: &T) -> Result<String, RelayError> {
    serde_json::to_string(value).map_err(|err| store_err("serialize entity", err))
}

fn from_doc<T: DeserializeOwned>(raw: &str) -> Result<T, RelayError> {
    serde_json::from_str(raw).map_err(|err| store_err("deserialize entity", err))
}

/// Postgres-backed entity repository.
#[derive(Clone)]
pub struct Catalog {
    pool: PgPool,
}

impl Catalog {
    /// Wrap an existing pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn list_docs<T: DeserializeOwned>(&self, table: &str) -> Result<Vec<T>, RelayError> {
        let sql =
            format!("SELECT data::text FROM {table} WHERE deleted_at IS NULL ORDER BY id");
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| store_err("list", err))?;
        rows.into_iter()
            .map(|row| {
                let raw: String = row.try_get(0).map_err(|err| store_err("doc decode", err))?;
                from_doc(&raw)
            })
            .collect()
    }

    async fn get_doc<T: DeserializeOwned>(
        &self,
        table: &str,
        id: i64,
    ) -> Result<Option<T>, RelayError> {
        let sql = format!("SELECT data::text FROM {table} WHERE id = $1 AND deleted_at IS NULL");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| store_err("get", err))?;
        row.map(|row| {
            let raw: String = row.try_get(0).map_err(|err| store_err("doc decode", err))?;
            from_doc(&raw)
        })
        .transpose()
    }

    /// Insert a document and stamp the assigned id back into it.
    async fn insert_doc<T: Serialize>(
        &self,
        table: &str,
        value: &T,
        is_enabled: bool,
    ) -> Result<i64, RelayError> {
        let sql = format!(
            "INSERT INTO {table} (data, is_enabled) VALUES ($1::jsonb, $2) RETURNING id"
        );
        let row = sqlx::query(&sql)
            .bind(to_doc(value)?)
            .bind(is_enabled)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| store_err("insert", err))?;
        let id: i64 = row.try_get(0).map_err(|err| store_err("insert id", err))?;
        let stamp = format!(
            "UPDATE {table} SET data = jsonb_set(data, '{{id}}', to_jsonb(id)) WHERE id = $1"
        );
        sqlx::query(&stamp)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|err| store_err("stamp id", err))?;
        Ok(id)
    }

    async fn replace_doc<T: Serialize>(
        &self,
        table: &str,
        id: i64,
        value: &T,
        is_enabled: bool,
    ) -> Result<(), RelayError> {
        let sql = format!(
            "UPDATE {table} SET data = $2::jsonb, is_enabled = $3 \
             WHERE id = $1 AND deleted_at IS NULL"
        );
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(to_doc(value)?)
            .bind(is_enabled)
            .execute(&self.pool)
            .await
            .map_err(|err| store_err("update", err))?;
        if result.rows_affected() == 0 {
            return Err(RelayError::store(format!("{table} row {id} not found")));
        }
        Ok(())
    }

    async fn tombstone(&self, table: &str, id: i64) -> Result<(), RelayError> {
        let sql = format!(
            "UPDATE {table} SET deleted_at = now() WHERE id = $1 AND deleted_at IS NULL"
        );
        sqlx::query(&sql)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|err| store_err("soft delete", err))?;
        Ok(())
    }

    // ---- users ----

    /// All live users.
    pub async fn users(&self) -> Result<Vec<User>, RelayError> {
        self.list_docs("users").await
    }

    /// One live user.
    pub async fn user(&self, id: i64) -> Result<Option<User>, RelayError> {
        self.get_doc("users", id).await
    }

    /// Create a user; returns it with the assigned id.
    pub async fn create_user(&self, mut user: User) -> Result<User, RelayError> {
        user.id = self.insert_doc("users", &user, user.is_enabled).await?;
        self.replace_doc("users", user.id, &user, user.is_enabled).await?;
        Ok(user)
    }

    /// Replace a user document.
    pub async fn update_user(&self, user: &User) -> Result<(), RelayError> {
        self.replace_doc("users", user.id, user, user.is_enabled).await
    }

    /// Tombstone a user and all of its keys.
    pub async fn delete_user(&self, id: i64) -> Result<(), RelayError> {
        self.tombstone("users", id).await?;
        sqlx::query("UPDATE keys SET deleted_at = now() WHERE user_id = $1 AND deleted_at IS NULL")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|err| store_err("cascade key delete", err))?;
        Ok(())
    }

    // ---- keys ----

    /// All live keys.
    pub async fn keys(&self) -> Result<Vec<ApiKey>, RelayError> {
        self.list_docs("keys").await
    }

    /// Authentication lookup by secret hash, via the indexed column.
    pub async fn key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>, RelayError> {
        let row = sqlx::query(
            "SELECT data::text FROM keys WHERE key_hash = $1 AND deleted_at IS NULL",
        )
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| store_err("key lookup", err))?;
        row.map(|row| {
            let raw: String = row.try_get(0).map_err(|err| store_err("doc decode", err))?;
            from_doc(&raw)
        })
        .transpose()
    }

    /// Create a key; the hash and owner land in their indexed columns.
    pub async fn create_key(&self, mut key: ApiKey) -> Result<ApiKey, RelayError> {
        let row = sqlx::query(
            "INSERT INTO keys (key_hash, user_id, data, is_enabled) \
             VALUES ($1, $2, $3::jsonb, $4) RETURNING id",
        )
        .bind(&key.key_hash)
        .bind(key.user_id)
        .bind(to_doc(&key)?)
        .bind(key.is_enabled)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| store_err("insert key", err))?;
        key.id = row.try_get(0).map_err(|err| store_err("insert id", err))?;
        self.replace_doc("keys", key.id, &key, key.is_enabled).await?;
        Ok(key)
    }

    /// Replace a key document.
    pub async fn update_key(&self, key: &ApiKey) -> Result<(), RelayError> {
        self.replace_doc("keys", key.id, key, key.is_enabled).await
    }

    /// Tombstone a key.
    pub async fn delete_key(&self, id: i64) -> Result<(), RelayError> {
        self.tombstone("keys", id).await
    }

    // ---- providers & endpoints ----

    /// All live providers.
    pub async fn providers(&self) -> Result<Vec<Provider>, RelayError> {
        self.list_docs("providers").await
    }

    /// One live provider.
    pub async fn provider(&self, id: i64) -> Result<Option<Provider>, RelayError> {
        self.get_doc("providers", id).await
    }

    /// Create a provider; returns it with the assigned id.
    pub async fn create_provider(&self, mut provider: Provider) -> Result<Provider, RelayError> {
        provider.id = self
            .insert_doc("providers", &provider, provider.is_enabled)
            .await?;
        self.replace_doc("providers", provider.id, &provider, provider.is_enabled)
            .await?;
        Ok(provider)
    }

    /// Replace a provider document.
    pub async fn update_provider(&self, provider: &Provider) -> Result<(), RelayError> {
        self.replace_doc("providers", provider.id, provider, provider.is_enabled)
            .await
    }

    /// Tombstone a provider.
    pub async fn delete_provider(&self, id: i64) -> Result<(), RelayError> {
        self.tombstone("providers", id).await
    }

    /// All live endpoints, across providers.
    pub async fn endpoints(&self) -> Result<Vec<ProviderEndpoint>, RelayError> {
        self.list_docs("provider_endpoints").await
    }

    /// Create an endpoint under a provider.
    pub async fn create_endpoint(
        &self,
        mut endpoint: ProviderEndpoint,
    ) -> Result<ProviderEndpoint, RelayError> {
        let row = sqlx::query(
            "INSERT INTO provider_endpoints (provider_id, data, is_enabled) \
             VALUES ($1, $2::jsonb, $3) RETURNING id",
        )
        .bind(endpoint.provider_id)
        .bind(to_doc(&endpoint)?)
        .bind(endpoint.is_enabled)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| store_err("insert endpoint", err))?;
        endpoint.id = row.try_get(0).map_err(|err| store_err("insert id", err))?;
        self.replace_doc(
            "provider_endpoints",
            endpoint.id,
            &endpoint,
            endpoint.is_enabled,
        )
        .await?;
        Ok(endpoint)
    }

    /// Replace an endpoint document.
    pub async fn update_endpoint(&self, endpoint: &ProviderEndpoint) -> Result<(), RelayError> {
        self.replace_doc(
            "provider_endpoints",
            endpoint.id,
            endpoint,
            endpoint.is_enabled,
        )
        .await
    }

    /// Tombstone an endpoint.
    pub async fn delete_endpoint(&self, id: i64) -> Result<(), RelayError> {
        self.tombstone("provider_endpoints", id).await
    }

    // ---- error rules ----

    /// All live rules (enabled and disabled; the engine filters).
    pub async fn error_rules(&self) -> Result<Vec<ErrorRule>, RelayError> {
        self.list_docs("error_rules").await
    }

    /// Create a rule; returns it with the assigned id.
    pub async fn create_error_rule(&self, mut rule: ErrorRule) -> Result<ErrorRule, RelayError> {
        rule.id = self.insert_doc("error_rules", &rule, rule.is_enabled).await?;
        self.replace_doc("error_rules", rule.id, &rule, rule.is_enabled)
            .await?;
        Ok(rule)
    }

    /// Replace a rule document.
    pub async fn update_error_rule(&self, rule: &ErrorRule) -> Result<(), RelayError> {
        self.replace_doc("error_rules", rule.id, rule, rule.is_enabled)
            .await
    }

    /// Tombstone a rule.
    pub async fn delete_error_rule(&self, id: i64) -> Result<(), RelayError> {
        self.tombstone("error_rules", id).await
    }

    // ---- system settings ----

    /// The persisted settings document, if any.
    pub async fn system_settings(&self) -> Result<Option<SystemSettings>, RelayError> {
        let row = sqlx::query("SELECT data::text FROM system_config ORDER BY id DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| store_err("settings load", err))?;
        row.map(|row| {
            let raw: String = row.try_get(0).map_err(|err| store_err("doc decode", err))?;
            from_doc(&raw)
        })
        .transpose()
    }

    /// Persist a new settings version.
    pub async fn put_system_settings(&self, settings: &SystemSettings) -> Result<(), RelayError> {
        sqlx::query("INSERT INTO system_config (data) VALUES ($1::jsonb)")
            .bind(to_doc(settings)?)
            .execute(&self.pool)
            .await
            .map_err(|err| store_err("settings store", err))?;
        Ok(())
    }
}

#[async_trait]
impl RuleSource for Catalog {
    async fn load_rules(&self) -> Result<Vec<ErrorRule>, RelayError> {
        self.error_rules().await
    }
}
