use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::quota::{QuotaCaps, ResetConfig};

/// Prompt-cache TTL the key requests from upstream providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTtlPreference {
    /// Use whatever the provider defaults to.
    #[default]
    Inherit,
    /// Five-minute cache entries.
    FiveMinutes,
    /// One-hour cache entries.
    OneHour,
}

/// An issued API key. The opaque secret is persisted only as a hash; the
/// masked form is what admin surfaces display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKey {
    /// Numeric identifier.
    #[serde(default)]
    pub id: i64,
    /// Hex SHA-256 of the secret; the lookup handle for counters and the
    /// ledger (`key_hash` column).
    pub key_hash: String,
    /// User-facing masked secret, e.g. `sk-…a1b2`.
    pub masked: String,
    /// Owning user.
    pub user_id: i64,
    /// Optional expiry instant.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Disabled keys fail authentication.
    pub is_enabled: bool,
    /// Whether the key also grants admin web-UI login.
    #[serde(default)]
    pub can_login_web_ui: bool,
    /// Comma-separated routing groups; `None` routes to the `default` group.
    #[serde(default)]
    pub provider_group: Option<String>,
    /// Prompt-cache TTL preference forwarded upstream.
    #[serde(default)]
    pub cache_ttl: CacheTtlPreference,
    /// Spend and concurrency caps, enforced alongside the owner's.
    #[serde(default)]
    pub caps: QuotaCaps,
    /// Window boundary configuration.
    #[serde(default)]
    pub reset: ResetConfig,
    /// Soft-delete tombstone.
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    /// Creation instant.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl ApiKey {
    /// True when the key may authenticate at `now`.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.is_enabled
            && self.deleted_at.is_none()
            && self.expires_at.is_none_or(|exp| now < exp)
    }

    /// The key's effective routing groups, split on commas with whitespace
    /// trimmed and empties dropped. Empty means "route to `default`".
    #[must_use]
    pub fn groups(&self) -> Vec<&str> {
        self.provider_group
            .as_deref()
            .map(split_groups)
            .unwrap_or_default()
    }
}

/// Split a comma-separated multi-tag into trimmed, non-empty entries.
#[must_use]
pub(crate) fn split_groups(raw: &str) -> Vec<&str> {
    raw.split(',')
        .map(str::trim)
        .filter(|g| !g.is_empty())
        .collect()
}

/// Mask an opaque secret for display: keep a short prefix and the last four
/// characters. Short secrets are fully masked.
#[must_use]
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let prefix: String = chars.iter().take(3).collect();
    let suffix: String = chars[chars.len() - 4..].iter().collect();
    format!("{prefix}…{suffix}")
}

