//! Admin read/write API.
//!
//! Writes go through the catalog and then republish the affected
//! process-global snapshot (providers/endpoints, error rules, settings),
//! so selection never sees a torn view. PATCH is a JSON merge onto the
//! stored document.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};

use relay_core::clock::window_for;
use relay_store::{Catalog, PgLedger, UsageLogFilter};
use relay_types::{
    ApiKey, ErrorRule, Period, Provider, ProviderEndpoint, RelayError, ResetConfig,
    SystemSettings, User, mask_secret,
};

use crate::auth::{bearer_token, hash_secret};
use crate::snapshot::ProviderSnapshot;
use crate::state::AppState;

use super::error::error_response;

/// State for the admin surface: the shared app state plus SQL handles.
#[derive(Clone)]
pub struct AdminState {
    /// Shared orchestrator state.
    pub app: AppState,
    /// Entity repository.
    pub catalog: Catalog,
    /// Request-log and overview queries.
    pub pg: PgLedger,
}

impl AdminState {
    /// Rebuild and publish the provider/endpoint snapshot from the catalog.
    pub async fn republish_snapshot(&self) -> Result<(), RelayError> {
        let providers = self.catalog.providers().await?;
        let endpoints = self.catalog.endpoints().await?;
        self.app
            .registry
            .publish(ProviderSnapshot::new(providers, endpoints));
        Ok(())
    }
}

/// Admin calls authenticate with a key whose `canLoginWebUi` flag is set.
async fn require_admin(
    State(state): State<AdminState>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    let authorization = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let Some(secret) = bearer_token(authorization, None) else {
        return error_response(&RelayError::unauthenticated("missing admin credential"));
    };
    let key = match state.app.principals.key_by_hash(&hash_secret(&secret)).await {
        Ok(Some(key)) => key,
        Ok(None) => {
            return error_response(&RelayError::unauthenticated("unknown admin credential"));
        }
        Err(err) => return error_response(&err),
    };
    if !key.is_active(Utc::now()) || !key.can_login_web_ui {
        return error_response(&RelayError::unauthenticated(
            "credential not permitted for admin access",
        ));
    }
    next.run(request).await
}

fn ok<T: serde::Serialize>(value: T) -> Response {
    Json(json!({ "data": value })).into_response()
}

fn handle<T: serde::Serialize>(result: Result<T, RelayError>) -> Response {
    match result {
        Ok(value) => ok(value),
        Err(err) => error_response(&err),
    }
}

/// RFC 7386-style merge: objects merge recursively, null removes, anything
/// else replaces.
fn merge_patch(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (k, v) in patch {
                if v.is_null() {
                    base.remove(k);
                } else {
                    merge_patch(base.entry(k.clone()).or_insert(Value::Null), v);
                }
            }
        }
        (base, patch) => *base = patch.clone(),
    }
}

fn apply_patch<T>(current: &T, patch: &Value) -> Result<T, RelayError>
where
    T: serde::Serialize + serde::de::DeserializeOwned,
{
    let mut doc = serde_json::to_value(current)
        .map_err(|err| RelayError::store(format!("entity serialize: {err}")))?;
    merge_patch(&mut doc, patch);
    serde_json::from_value(doc)
        .map_err(|err| RelayError::protocol(format!("invalid patch: {err}")))
}

// ---- providers ----

async fn list_providers(State(state): State<AdminState>) -> Response {
    handle(state.catalog.providers().await)
}

async fn create_provider(
    State(state): State<AdminState>,
    Json(provider): Json<Provider>,
) -> Response {
    match state.catalog.create_provider(provider).await {
        Ok(created) => {
            if let Err(err) = state.republish_snapshot().await {
                return error_response(&err);
            }
            ok(created)
        }
        Err(err) => error_response(&err),
    }
}

async fn patch_provider(
    State(state): State<AdminState>,
    Path(id): Path<i64>,
    Json(patch): Json<Value>,
) -> Response {
    let current = match state.catalog.provider(id).await {
        Ok(Some(provider)) => provider,
        Ok(None) => return error_response(&RelayError::store(format!("provider {id} not found"))),
        Err(err) => return error_response(&err),
    };
    let updated: Provider = match apply_patch(&current, &patch) {
        Ok(updated) => updated,
        Err(err) => return error_response(&err),
    };
    if let Err(err) = state.catalog.update_provider(&updated).await {
        return error_response(&err);
    }
    if let Err(err) = state.republish_snapshot().await {
        return error_response(&err);
    }
    ok(updated)
}

async fn delete_provider(State(state): State<AdminState>, Path(id): Path<i64>) -> Response {
    if let Err(err) = state.catalog.delete_provider(id).await {
        return error_response(&err);
    }
    if let Err(err) = state.republish_snapshot().await {
        return error_response(&err);
    }
    ok(json!({ "deleted": id }))
}

async fn list_endpoints(State(state): State<AdminState>, Path(id): Path<i64>) -> Response {
    match state.catalog.endpoints().await {
        Ok(endpoints) => ok(endpoints
            .into_iter()
            .filter(|e| e.provider_id == id)
            .collect::<Vec<_>>()),
        Err(err) => error_response(&err),
    }
}

async fn create_endpoint(
    State(state): State<AdminState>,
    Path(id): Path<i64>,
    Json(mut endpoint): Json<ProviderEndpoint>,
) -> Response {
    endpoint.provider_id = id;
    match state.catalog.create_endpoint(endpoint).await {
        Ok(created) => {
            if let Err(err) = state.republish_snapshot().await {
                return error_response(&err);
            }
            ok(created)
        }
        Err(err) => error_response(&err),
    }
}

async fn patch_endpoint(
    State(state): State<AdminState>,
    Path(id): Path<i64>,
    Json(patch): Json<Value>,
) -> Response {
    let current = match state.catalog.endpoints().await {
        Ok(endpoints) => match endpoints.into_iter().find(|e| e.id == id) {
            Some(endpoint) => endpoint,
            None => {
                return error_response(&RelayError::store(format!("endpoint {id} not found")));
            }
        },
        Err(err) => return error_response(&err),
    };
    let updated: ProviderEndpoint = match apply_patch(&current, &patch) {
        Ok(updated) => updated,
        Err(err) => return error_response(&err),
    };
    if let Err(err) = state.catalog.update_endpoint(&updated).await {
        return error_response(&err);
    }
    if let Err(err) = state.republish_snapshot().await {
        return error_response(&err);
    }
    ok(updated)
}

async fn delete_endpoint(State(state): State<AdminState>, Path(id): Path<i64>) -> Response {
    if let Err(err) = state.catalog.delete_endpoint(id).await {
        return error_response(&err);
    }
    if let Err(err) = state.republish_snapshot().await {
        return error_response(&err);
    }
    ok(json!({ "deleted": id }))
}

async fn reset_circuit(State(state): State<AdminState>, Path(id): Path<i64>) -> Response {
    let endpoints = state.app.registry.load().endpoints_for(id).to_vec();
    if endpoints.is_empty() {
        return error_response(&RelayError::store(format!(
            "provider {id} has no endpoints"
        )));
    }
    let mut reset = Vec::new();
    for endpoint in endpoints {
        state.app.breakers.manual_reset(endpoint.id).await;
        reset.push(endpoint.id);
    }
    ok(json!({ "reset": reset }))
}

async fn reset_total_usage(State(state): State<AdminState>, Path(id): Path<i64>) -> Response {
    let mut provider = match state.catalog.provider(id).await {
        Ok(Some(provider)) => provider,
        Ok(None) => return error_response(&RelayError::store(format!("provider {id} not found"))),
        Err(err) => return error_response(&err),
    };
    provider.reset.total_reset_at = Some(Utc::now());
    if let Err(err) = state.catalog.update_provider(&provider).await {
        return error_response(&err);
    }
    if let Err(err) = state.republish_snapshot().await {
        return error_response(&err);
    }
    ok(json!({ "totalResetAt": provider.reset.total_reset_at }))
}

// ---- users ----

async fn list_users(State(state): State<AdminState>) -> Response {
    handle(state.catalog.users().await)
}

async fn create_user(State(state): State<AdminState>, Json(user): Json<User>) -> Response {
    if let Err(msg) = User::validate_tags(&user.tags) {
        return error_response(&RelayError::protocol(msg));
    }
    handle(state.catalog.create_user(user).await)
}

async fn patch_user(
    State(state): State<AdminState>,
    Path(id): Path<i64>,
    Json(patch): Json<Value>,
) -> Response {
    let current = match state.catalog.user(id).await {
        Ok(Some(user)) => user,
        Ok(None) => return error_response(&RelayError::store(format!("user {id} not found"))),
        Err(err) => return error_response(&err),
    };
    let updated: User = match apply_patch(&current, &patch) {
        Ok(updated) => updated,
        Err(err) => return error_response(&err),
    };
    if let Err(msg) = User::validate_tags(&updated.tags) {
        return error_response(&RelayError::protocol(msg));
    }
    if let Err(err) = state.catalog.update_user(&updated).await {
        return error_response(&err);
    }
    ok(updated)
}

async fn delete_user(State(state): State<AdminState>, Path(id): Path<i64>) -> Response {
    handle(state.catalog.delete_user(id).await.map(|()| json!({ "deleted": id })))
}

// ---- keys ----

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateKeyBody {
    user_id: i64,
    #[serde(default)]
    secret: Option<String>,
    #[serde(flatten)]
    rest: Value,
}

async fn list_keys(State(state): State<AdminState>) -> Response {
    handle(state.catalog.keys().await)
}

async fn create_key(State(state): State<AdminState>, Json(body): Json<CreateKeyBody>) -> Response {
    let secret = body
        .secret
        .unwrap_or_else(|| format!("sk-relay-{}", uuid::Uuid::new_v4().simple()));
    let mut template = json!({
        "id": 0,
        "keyHash": hash_secret(&secret),
        "masked": mask_secret(&secret),
        "userId": body.user_id,
        "isEnabled": true,
        "createdAt": Utc::now(),
    });
    merge_patch(&mut template, &body.rest);
    let key: ApiKey = match serde_json::from_value(template) {
        Ok(key) => key,
        Err(err) => return error_response(&RelayError::protocol(format!("invalid key: {err}"))),
    };
    match state.catalog.create_key(key).await {
        // The plaintext secret is shown exactly once, at creation.
        Ok(created) => ok(json!({ "key": created, "secret": secret })),
        Err(err) => error_response(&err),
    }
}

async fn patch_key(
    State(state): State<AdminState>,
    Path(id): Path<i64>,
    Json(patch): Json<Value>,
) -> Response {
    let current = match state.catalog.keys().await {
        Ok(keys) => match keys.into_iter().find(|k| k.id == id) {
            Some(key) => key,
            None => return error_response(&RelayError::store(format!("key {id} not found"))),
        },
        Err(err) => return error_response(&err),
    };
    let updated: ApiKey = match apply_patch(&current, &patch) {
        Ok(updated) => updated,
        Err(err) => return error_response(&err),
    };
    if let Err(err) = state.catalog.update_key(&updated).await {
        return error_response(&err);
    }
    ok(updated)
}

async fn delete_key(State(state): State<AdminState>, Path(id): Path<i64>) -> Response {
    handle(state.catalog.delete_key(id).await.map(|()| json!({ "deleted": id })))
}

// ---- error rules ----

async fn list_error_rules(State(state): State<AdminState>) -> Response {
    handle(state.catalog.error_rules().await)
}

async fn create_error_rule(
    State(state): State<AdminState>,
    Json(rule): Json<ErrorRule>,
) -> Response {
    match state.catalog.create_error_rule(rule).await {
        Ok(created) => {
            state.app.rules.invalidate();
            ok(created)
        }
        Err(err) => error_response(&err),
    }
}

async fn patch_error_rule(
    State(state): State<AdminState>,
    Path(id): Path<i64>,
    Json(patch): Json<Value>,
) -> Response {
    let current = match state.catalog.error_rules().await {
        Ok(rules) => match rules.into_iter().find(|r| r.id == id) {
            Some(rule) => rule,
            None => return error_response(&RelayError::store(format!("rule {id} not found"))),
        },
        Err(err) => return error_response(&err),
    };
    let updated: ErrorRule = match apply_patch(&current, &patch) {
        Ok(updated) => updated,
        Err(err) => return error_response(&err),
    };
    if let Err(err) = state.catalog.update_error_rule(&updated).await {
        return error_response(&err);
    }
    state.app.rules.invalidate();
    ok(updated)
}

async fn delete_error_rule(State(state): State<AdminState>, Path(id): Path<i64>) -> Response {
    match state.catalog.delete_error_rule(id).await {
        Ok(()) => {
            state.app.rules.invalidate();
            ok(json!({ "deleted": id }))
        }
        Err(err) => error_response(&err),
    }
}

// ---- observability ----

async fn overview(State(state): State<AdminState>) -> Response {
    let now = Utc::now();
    let today = window_for(Period::Daily, &ResetConfig::default(), now, state.app.tz);
    let concurrent = state
        .app
        .inflight
        .load(std::sync::atomic::Ordering::Relaxed);
    handle(state.pg.overview(now, today.start, concurrent).await)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct UsageLogQuery {
    user_id: Option<i64>,
    key_id: Option<i64>,
    provider_id: Option<i64>,
    session_id: Option<String>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    status_code: Option<String>,
    model: Option<String>,
    endpoint: Option<String>,
    min_retry: Option<u32>,
    page: Option<u32>,
}

async fn usage_logs(
    State(state): State<AdminState>,
    Query(query): Query<UsageLogQuery>,
) -> Response {
    let filter = UsageLogFilter {
        user_id: query.user_id,
        key_id: query.key_id,
        provider_id: query.provider_id,
        session_id: query.session_id,
        start_time: query.start_time,
        end_time: query.end_time,
        status_code: query.status_code,
        model: query.model,
        endpoint: query.endpoint,
        min_retry: query.min_retry,
        page: query.page.unwrap_or(0),
    };
    handle(state.pg.usage_logs(&filter).await)
}

async fn get_system_settings(State(state): State<AdminState>) -> Response {
    ok(state.app.settings())
}

async fn put_system_settings(
    State(state): State<AdminState>,
    Json(settings): Json<SystemSettings>,
) -> Response {
    if let Err(err) = state.catalog.put_system_settings(&settings).await {
        return error_response(&err);
    }
    state.app.publish_settings(settings);
    ok(state.app.settings())
}

/// Assemble the `/admin` router.
#[must_use]
pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/providers", get(list_providers).post(create_provider))
        .route(
            "/admin/providers/{id}",
            patch(patch_provider).delete(delete_provider),
        )
        .route(
            "/admin/providers/{id}/endpoints",
            get(list_endpoints).post(create_endpoint),
        )
        .route("/admin/providers/{id}/circuit/reset", post(reset_circuit))
        .route(
            "/admin/providers/{id}/total-usage/reset",
            post(reset_total_usage),
        )
        .route(
            "/admin/endpoints/{id}",
            patch(patch_endpoint).delete(delete_endpoint),
        )
        .route("/admin/users", get(list_users).post(create_user))
        .route("/admin/users/{id}", patch(patch_user).delete(delete_user))
        .route("/admin/keys", get(list_keys).post(create_key))
        .route("/admin/keys/{id}", patch(patch_key).delete(delete_key))
        .route(
            "/admin/error-rules",
            get(list_error_rules).post(create_error_rule),
        )
        .route(
            "/admin/error-rules/{id}",
            patch(patch_error_rule).delete(delete_error_rule),
        )
        .route("/admin/overview", get(overview))
        .route("/admin/usage-logs", get(usage_logs))
        .route(
            "/admin/system-settings",
            get(get_system_settings).put(put_system_settings),
        )
        .layer(middleware::from_fn_with_state(state.clone(), require_admin))
        .with_state(state)
}
