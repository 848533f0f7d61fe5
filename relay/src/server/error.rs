//! JSON error envelope for the ingress surface.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use relay_types::RelayError;

/// Render a [`RelayError`] as `{"error": {code, message, retryAfterMs?,
/// details?}}` with the mapped HTTP status.
#[must_use]
pub fn error_response(err: &RelayError) -> Response {
    let status = StatusCode::from_u16(err.status_code())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut error = json!({
        "code": err.code(),
        "message": err.to_string(),
    });
    match err {
        RelayError::QuotaExceeded {
            retry_after_ms,
            current,
            limit,
            period,
            reset_at,
            ..
        } => {
            if let Some(ms) = retry_after_ms {
                error["retryAfterMs"] = json!(ms);
            }
            error["details"] = json!({
                "current": current,
                "limit": limit,
                "period": period,
                "resetAt": reset_at,
            });
        }
        RelayError::ConcurrencyLimit { current, limit, .. } => {
            error["details"] = json!({ "current": current, "limit": limit });
        }
        _ => {}
    }
    (status, Json(json!({ "error": error }))).into_response()
}
