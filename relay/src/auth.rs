//! Bearer-key authentication.

use chrono::Utc;
use sha2::{Digest, Sha256};

use relay_types::{ApiKey, RelayError, User};

use crate::state::AppState;

/// Hex SHA-256 of a key secret; the persisted lookup handle.
#[must_use]
pub fn hash_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Extract the bearer token from an `Authorization` header value, also
/// accepting the provider-style `x-api-key` raw form.
#[must_use]
pub fn bearer_token(authorization: Option<&str>, x_api_key: Option<&str>) -> Option<String> {
    if let Some(value) = authorization {
        let value = value.trim();
        if let Some(token) = value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))
        {
            return Some(token.trim().to_string());
        }
    }
    x_api_key.map(|k| k.trim().to_string())
}

/// Resolve the principal for a secret: the key must exist, be enabled and
/// unexpired, and its owner must be active.
pub async fn authenticate(state: &AppState, secret: &str) -> Result<(User, ApiKey), RelayError> {
    let now = Utc::now();
    let key_hash = hash_secret(secret);
    let key = state
        .principals
        .key_by_hash(&key_hash)
        .await?
        .ok_or_else(|| RelayError::unauthenticated("unknown API key"))?;
    if !key.is_active(now) {
        return Err(RelayError::unauthenticated("API key disabled or expired"));
    }
    let user = state
        .principals
        .user(key.user_id)
        .await?
        .ok_or_else(|| RelayError::unauthenticated("key owner not found"))?;
    if !user.is_active(now) {
        return Err(RelayError::unauthenticated("user disabled or expired"));
    }
    Ok((user, key))
}
