use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::quota::{QuotaCaps, ResetConfig};

/// Maximum number of tags a user may carry.
pub const MAX_USER_TAGS: usize = 20;
/// Maximum length of a single user tag.
pub const MAX_TAG_LEN: usize = 32;

/// A tenant: owns zero or more API keys and carries its own quota caps.
///
/// Users are retired by soft delete; a tombstoned user's keys stop
/// authenticating and its counters stop being enforced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Numeric identifier.
    #[serde(default)]
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Free-form operator note.
    #[serde(default)]
    pub note: Option<String>,
    /// Classification tags, at most [`MAX_USER_TAGS`] entries of
    /// [`MAX_TAG_LEN`] characters each.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Disabled users fail authentication.
    pub is_enabled: bool,
    /// Optional hard expiry for the whole tenant.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Spend and concurrency caps.
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

impl User {
    /// True when the user may authenticate at `now`: enabled, not
    /// tombstoned, not expired.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.is_enabled
            && self.deleted_at.is_none()
            && self.expires_at.is_none_or(|exp| now < exp)
    }

    /// Validate the tag set against the documented bounds.
    ///
    /// # Errors
    /// Returns a description of the first violated bound.
    pub fn validate_tags(tags: &[String]) -> Result<(), String> {
        if tags.len() > MAX_USER_TAGS {
            return Err(format!("at most {MAX_USER_TAGS} tags allowed"));
        }
        for tag in tags {
            if tag.is_empty() {
                return Err("empty tag".to_string());
            }
            if tag.chars().count() > MAX_TAG_LEN {
                return Err(format!("tag '{tag}' exceeds {MAX_TAG_LEN} characters"));
            }
        }
        Ok(())
    }
}

