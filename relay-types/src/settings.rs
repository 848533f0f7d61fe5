//! Process-global system settings snapshot.

use serde::{Deserialize, Serialize};

/// Read-only settings snapshot, republished whole on admin update. Readers
/// hold an `Arc` to one version; no field mutates in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SystemSettings {
    /// Whether the warmup guard answers recognized probes locally.
    pub warmup_interception_enabled: bool,
    /// Service tag recorded on warmup ledger rows and chain items.
    pub service_tag: String,
    /// Maximum selection attempts per request.
    pub max_retry_attempts: u32,
    /// Global per-request deadline, milliseconds. `0` disables it.
    pub request_deadline_ms: u64,
    /// Monotonic snapshot version, bumped on every admin write.
    pub version: u64,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            warmup_interception_enabled: true,
            service_tag: "relay".to_string(),
            max_retry_attempts: 3,
            request_deadline_ms: 120_000,
            version: 0,
        }
    }
}
