//! Transient per-request capture for replay and chain assembly.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a captured session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Request accepted, upstream exchange in flight.
    Active,
    /// Response fully delivered.
    Completed,
    /// Client disconnected or an error ended the exchange.
    Aborted,
}

/// Transient request/response capture. Lives for the request plus a short
/// retention window; feeds session-reuse and warmup replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveSession {
    /// Correlation id.
    pub session_id: String,
    /// Monotonic sequence within the session.
    pub request_sequence: u32,
    /// Capture start.
    pub started_at: DateTime<Utc>,
    /// Selected inbound headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Inbound body as received.
    #[serde(default)]
    pub request_body: Option<serde_json::Value>,
    /// Outbound body (or concatenated SSE frames).
    #[serde(default)]
    pub response_body: Option<String>,
    /// Selected outbound headers.
    #[serde(default)]
    pub response_headers: BTreeMap<String, String>,
    /// Current lifecycle state.
    pub status: SessionStatus,
    /// Provider that served this sequence, for sticky reuse.
    #[serde(default)]
    pub provider_id: Option<i64>,
}
