use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use relay_core::store::{LedgerStore, QuotaWindowSpec};
use relay_types::{
    CostEntry, LedgerEntry, MessageRequestRecord, QuotaCostSums, RelayError, Scope,
};

/// In-memory [`LedgerStore`] with the same aggregation semantics as the SQL
/// driver: blocked rows never count, ranges are half-open, ids are assigned
/// on append.
#[derive(Default)]
pub struct MemoryLedger {
    rows: Mutex<Vec<LedgerEntry>>,
    requests: Mutex<Vec<MessageRequestRecord>>,
    next_id: AtomicI64,
    failing: AtomicBool,
}

impl MemoryLedger {
    /// A fresh, empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            ..Self::default()
        }
    }

    /// Toggle failing mode; every operation returns a store error while set.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), RelayError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RelayError::store("memory ledger in failing mode"));
        }
        Ok(())
    }

    fn matches(scope: Scope, id: &str, row: &LedgerEntry) -> bool {
        match scope {
            Scope::User => row.user_id.to_string() == id,
            Scope::Key => row.key_hash == id,
            Scope::Provider => row.final_provider_id.to_string() == id,
        }
    }

    fn billable(row: &LedgerEntry) -> bool {
        row.blocked_by.is_none()
    }

    /// All rows, for test assertions.
    #[must_use]
    pub fn rows(&self) -> Vec<LedgerEntry> {
        self.rows.lock().expect("mutex poisoned").clone()
    }

    /// All recorded request logs, for test assertions.
    #[must_use]
    pub fn requests(&self) -> Vec<MessageRequestRecord> {
        self.requests.lock().expect("mutex poisoned").clone()
    }

    fn sum_where(
        &self,
        scope: Scope,
        id: &str,
        pred: impl Fn(&LedgerEntry) -> bool,
    ) -> Decimal {
        self.rows
            .lock()
            .expect("mutex poisoned")
            .iter()
            .filter(|r| Self::matches(scope, id, r) && Self::billable(r) && pred(r))
            .map(|r| r.cost_usd)
            .sum()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn append(&self, entry: &LedgerEntry) -> Result<i64, RelayError> {
        self.check()?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut row = entry.clone();
        row.id = id;
        self.rows.lock().expect("mutex poisoned").push(row);
        Ok(id)
    }

    async fn sum_cost_in_range(
        &self,
        scope: Scope,
        id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Decimal, RelayError> {
        self.check()?;
        Ok(self.sum_where(scope, id, |r| start <= r.created_at && r.created_at < end))
    }

    async fn sum_total_cost(
        &self,
        scope: Scope,
        id: &str,
        reset_at: Option<DateTime<Utc>>,
    ) -> Result<Decimal, RelayError> {
        self.check()?;
        Ok(self.sum_where(scope, id, |r| reset_at.is_none_or(|at| r.created_at >= at)))
    }

    async fn sum_quota_costs(
        &self,
        scope: Scope,
        id: &str,
        windows: &QuotaWindowSpec,
    ) -> Result<QuotaCostSums, RelayError> {
        self.check()?;
        let in_window = |w: relay_core::Window, r: &LedgerEntry| w.contains(r.created_at);
        Ok(QuotaCostSums {
            five_hour: self.sum_where(scope, id, |r| in_window(windows.five_hour, r)),
            daily: self.sum_where(scope, id, |r| in_window(windows.daily, r)),
            weekly: self.sum_where(scope, id, |r| in_window(windows.weekly, r)),
            monthly: self.sum_where(scope, id, |r| in_window(windows.monthly, r)),
            total: self.sum_where(scope, id, |r| {
                windows.total_since.is_none_or(|at| r.created_at >= at)
            }),
        })
    }

    async fn find_cost_entries_in_range(
        &self,
        scope: Scope,
        id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CostEntry>, RelayError> {
        self.check()?;
        Ok(self
            .rows
            .lock()
            .expect("mutex poisoned")
            .iter()
            .filter(|r| {
                Self::matches(scope, id, r)
                    && Self::billable(r)
                    && start <= r.created_at
                    && r.created_at < end
            })
            .map(|r| CostEntry {
                id: r.id,
                created_at: r.created_at,
                cost_usd: r.cost_usd,
            })
            .collect())
    }

    async fn count_requests_in_range(
        &self,
        scope: Scope,
        id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64, RelayError> {
        self.check()?;
        Ok(self
            .rows
            .lock()
            .expect("mutex poisoned")
            .iter()
            .filter(|r| {
                Self::matches(scope, id, r)
                    && Self::billable(r)
                    && start <= r.created_at
                    && r.created_at < end
            })
            .count() as u64)
    }

    async fn record_message_request(
        &self,
        record: &MessageRequestRecord,
    ) -> Result<i64, RelayError> {
        self.check()?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut rec = record.clone();
        rec.id = id;
        self.requests.lock().expect("mutex poisoned").push(rec);
        Ok(id)
    }
}
