//! HTTP surfaces: the `/v1/messages` ingress and the admin API.

pub mod admin;
pub mod error;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;

use relay_types::RelayError;

use crate::dispatch::{InboundRequest, dispatch};
use crate::state::AppState;
use error::error_response;

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let body: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(err) => {
            return error_response(&RelayError::protocol(format!("invalid JSON body: {err}")));
        }
    };
    let inbound = InboundRequest {
        body,
        accept: header_string(&headers, header::ACCEPT.as_str()),
        authorization: header_string(&headers, header::AUTHORIZATION.as_str()),
        x_api_key: header_string(&headers, "x-api-key"),
        user_agent: header_string(&headers, header::USER_AGENT.as_str()),
        session_id: header_string(&headers, "x-relay-session-id"),
        endpoint: "/v1/messages".to_string(),
    };
    dispatch(&state, inbound).await
}

async fn healthz(State(state): State<AppState>) -> Response {
    let cache_ok = state.counters.ping().await.is_ok();
    let body = json!({
        "status": if cache_ok { "ok" } else { "degraded" },
        "cache": cache_ok,
        "settingsVersion": state.settings().version,
    });
    axum::Json(body).into_response()
}

/// Build the ingress router; admin routes are merged in when an admin
/// state (catalog + SQL handles) is available.
#[must_use]
pub fn app(state: AppState, admin: Option<admin::AdminState>) -> Router {
    let mut router = Router::new()
        .route("/v1/messages", post(messages))
        .route("/healthz", get(healthz))
        .with_state(state);
    if let Some(admin_state) = admin {
        router = router.merge(admin::router(admin_state));
    }
    router.layer(TraceLayer::new_for_http())
}
