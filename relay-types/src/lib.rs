//! Relay-specific data transfer objects shared across the workspace.
#![warn(missing_docs)]

mod breaker;
mod chain;
mod error;
mod key;
mod ledger;
mod provider;
mod quota;
mod rules;
mod session;
mod settings;
mod user;

pub use breaker::{BreakerConfig, BreakerPhase, BreakerState};
pub use chain::{ChainReason, DecisionContext, ProviderChainItem, SelectionMethod};
pub use error::RelayError;
pub use key::{ApiKey, CacheTtlPreference, mask_secret};
pub use ledger::{CostEntry, LedgerEntry, MessageRequestRecord, QuotaCostSums, TokenUsage};
pub use provider::{
    AdaptiveEffort, AdaptiveThinkingConfig, DEFAULT_GROUP, ModelMatchMode, OverridePrefs,
    Provider, ProviderEndpoint, ProviderTimeouts, ProviderType, ScheduleWindow,
};
pub use quota::{LimitDecision, Period, QuotaCaps, ResetConfig, ResetMode, ResetTime, Scope};
pub use rules::{ErrorCategory, ErrorRule, MatchType};
pub use session::{ActiveSession, SessionStatus};
pub use settings::SystemSettings;
pub use user::User;
