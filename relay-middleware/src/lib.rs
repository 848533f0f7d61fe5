//! Relay enforcement engines.
//!
//! The rate-limit engine composes the counter cache with the ledger
//! fallback; the breaker registry runs the per-endpoint state machine and
//! persists transitions through the cache; the probe scheduler keeps
//! endpoint health fresh. All three depend only on the `relay-core` store
//! traits.

pub mod breaker;
pub mod limits;
pub mod probe;
pub mod rules_cache;

pub use breaker::{Admission, BreakerEvent, BreakerRegistry};
pub use limits::{ConcurrencyToken, RateLimitEngine, TrackedCost};
pub use probe::{EndpointDirectory, ProbeScheduler, Prober, jittered_interval};
pub use rules_cache::{RuleSource, RulesCache};
