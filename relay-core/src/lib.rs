//! Core Relay logic shared by the engines and the orchestrator.
//!
//! Everything here is either a pure function (window math, override engine,
//! warmup fingerprint, pricing) or a trait seam the stores implement
//! (`LedgerStore`, `CounterStore`, `SessionStore`). Nothing in this crate
//! performs I/O.

pub mod classify;
pub mod clock;
pub mod overrides;
pub mod pricing;
pub mod schedule;
pub mod store;
pub mod warmup;

pub use classify::{Outcome, RuleEngine};
pub use clock::{ResetInfo, ResetKind, Window, next_reset_info, ttl_for, window_for};
pub use overrides::{OverrideAudit, OverrideChange, apply_overrides};
pub use pricing::{ModelRate, PriceTable};
pub use schedule::is_schedule_active;
pub use store::{
    ConcurrencyDecision, CounterIncrement, CounterStore, FixedBump, LedgerStore, QuotaWindowSpec,
    RollingBump, SessionStore,
};
pub use warmup::{WARMUP_TAG, WarmupProbe, match_warmup};
