use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::quota::Scope;

/// Unified error type for the relay workspace.
///
/// This covers protocol violations at the ingress, authentication failures,
/// quota and concurrency denials, upstream provider failures (tagged with the
/// provider name), breaker exhaustion, and internal store degradation.
#[derive(Debug, Error, Serialize, Deserialize, Clone, PartialEq)]
#[non_exhaustive]
pub enum RelayError {
    /// The inbound request body or headers violate the wire contract.
    #[error("protocol error: {msg}")]
    Protocol {
        /// Human-readable description of the malformation.
        msg: String,
    },

    /// The bearer key is unknown, expired, or disabled.
    #[error("unauthenticated: {msg}")]
    Unauthenticated {
        /// Which check rejected the principal.
        msg: String,
    },

    /// A cost cap was exceeded for the given scope and period.
    #[error("quota exceeded: {reason}")]
    QuotaExceeded {
        /// Scope whose cap was hit.
        scope: Scope,
        /// Scope-qualified denial message shown to the caller.
        reason: String,
        /// Counted spend at denial time.
        current: Decimal,
        /// Configured cap.
        limit: Decimal,
        /// Window label (`5h`, `daily`, `24h`, `weekly`, `monthly`, `total`).
        period: String,
        /// Next boundary for fixed windows; `None` for rolling windows.
        reset_at: Option<DateTime<Utc>>,
        /// Milliseconds until the counter moves, when derivable.
        retry_after_ms: Option<u64>,
    },

    /// A concurrent-session cap denied token acquisition.
    #[error("concurrency limit reached: {scope} ({current}/{limit})")]
    ConcurrencyLimit {
        /// Scope whose session cap was hit.
        scope: Scope,
        /// Sessions counted at denial time.
        current: u32,
        /// Configured cap.
        limit: u32,
    },

    /// An individual upstream attempt failed.
    #[error("{provider} failed: {msg}")]
    Upstream {
        /// Provider name that failed.
        provider: String,
        /// Upstream HTTP status, when one was received.
        status: Option<u16>,
        /// Human-readable error message.
        msg: String,
        /// Whether the dispatcher may retry on another candidate.
        retryable: bool,
    },

    /// An upstream attempt exceeded one of the configured timeouts.
    #[error("provider timed out: {provider} ({phase})")]
    ProviderTimeout {
        /// Provider name that timed out.
        provider: String,
        /// Which timer fired (`first_byte`, `idle`, `request`).
        phase: String,
    },

    /// The per-request global deadline elapsed before an attempt succeeded.
    #[error("request deadline exceeded")]
    RequestDeadline,

    /// All selection attempts failed; contains the individual failures.
    #[error("all providers failed: {0:?}")]
    AllProvidersFailed(Vec<RelayError>),

    /// No provider passed candidate filtering (disabled, off-schedule,
    /// budget-exhausted, or every endpoint breaker open).
    #[error("no available provider: {msg}")]
    NoCandidates {
        /// Why the candidate set came up empty.
        msg: String,
    },

    /// A cache or database operation failed.
    #[error("store error: {msg}")]
    Store {
        /// Driver-level failure description.
        msg: String,
    },

    /// Startup or admin-supplied configuration is invalid.
    #[error("invalid configuration: {msg}")]
    Config {
        /// What failed validation.
        msg: String,
    },
}

impl RelayError {
    /// Helper: build a `Protocol` error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol { msg: msg.into() }
    }

    /// Helper: build an `Unauthenticated` error.
    pub fn unauthenticated(msg: impl Into<String>) -> Self {
        Self::Unauthenticated { msg: msg.into() }
    }

    /// Helper: build an `Upstream` error tagged with the provider name.
    pub fn upstream(
        provider: impl Into<String>,
        status: Option<u16>,
        msg: impl Into<String>,
        retryable: bool,
    ) -> Self {
        Self::Upstream {
            provider: provider.into(),
            status,
            msg: msg.into(),
            retryable,
        }
    }

    /// Helper: build a `ProviderTimeout` error.
    pub fn provider_timeout(provider: impl Into<String>, phase: impl Into<String>) -> Self {
        Self::ProviderTimeout {
            provider: provider.into(),
            phase: phase.into(),
        }
    }

    /// Helper: build a `NoCandidates` error.
    pub fn no_candidates(msg: impl Into<String>) -> Self {
        Self::NoCandidates { msg: msg.into() }
    }

    /// Helper: build a `Store` error.
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store { msg: msg.into() }
    }

    /// Helper: build a `Config` error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config { msg: msg.into() }
    }

    /// Returns true when the dispatcher may re-enter selection after this
    /// failure. Quota, concurrency, protocol, and auth denials are final.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Upstream { retryable, .. } => *retryable,
            Self::ProviderTimeout { .. } | Self::Store { .. } => true,
            Self::AllProvidersFailed(inner) => inner.iter().any(Self::is_retryable),
            _ => false,
        }
    }

    /// HTTP status the ingress maps this error to.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Protocol { .. } => 400,
            Self::Unauthenticated { .. } => 401,
            Self::QuotaExceeded { .. } | Self::ConcurrencyLimit { .. } => 429,
            Self::Upstream { status, .. } => status.unwrap_or(502),
            Self::NoCandidates { .. } => 503,
            Self::ProviderTimeout { .. } | Self::RequestDeadline => 504,
            Self::AllProvidersFailed(inner) => {
                inner.last().map_or(502, RelayError::status_code)
            }
            Self::Store { .. } | Self::Config { .. } => 502,
        }
    }

    /// Stable machine-readable code for the client error envelope.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Protocol { .. } => "invalid_request",
            Self::Unauthenticated { .. } => "unauthenticated",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::ConcurrencyLimit { .. } => "concurrency_limit",
            Self::Upstream { .. } => "upstream_error",
            Self::ProviderTimeout { .. } => "upstream_timeout",
            Self::RequestDeadline => "deadline_exceeded",
            Self::AllProvidersFailed(_) => "all_providers_failed",
            Self::NoCandidates { .. } => "no_available_provider",
            Self::Store { .. } => "internal_error",
            Self::Config { .. } => "configuration_error",
        }
    }

    /// Flatten nested `AllProvidersFailed` structures into a plain vector.
    #[must_use]
    pub fn flatten(self) -> Vec<Self> {
        match self {
            Self::AllProvidersFailed(list) => list.into_iter().flat_map(Self::flatten).collect(),
            other => vec![other],
        }
    }
}
