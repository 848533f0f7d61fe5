//! In-memory store implementations for tests.
//!
//! These mirror the Redis/Postgres drivers closely enough to exercise the
//! engines: the counter store is idempotent per ledger id, the ledger store
//! filters blocked and soft-deleted rows, and both can be switched into a
//! failing mode to drive the degraded paths.

mod counters;
mod ledger;
mod sessions;

pub use counters::MemoryCounters;
pub use ledger::MemoryLedger;
pub use sessions::MemorySessions;
