//! Relay persistence drivers.
//!
//! `RedisCounters` implements the atomic counter cache with Lua scripts as
//! the canonical atomicity mechanism; `PgLedger` implements the append-only
//! usage ledger and request log over Postgres; `Catalog` is the repository
//! for admin-owned entities with centralized soft-delete filtering;
//! `CapturedSessions` holds transient request captures behind a bounded
//! writer queue.

mod catalog;
mod counters;
mod ledger;
mod schema;
mod sessions;

pub use catalog::Catalog;
pub use counters::RedisCounters;
pub use ledger::{LedgerWriter, OverviewStats, PgLedger, USAGE_LOG_PAGE_SIZE, UsageLogFilter};
pub use schema::{ensure_schema, schema_ready};
pub use sessions::CapturedSessions;
