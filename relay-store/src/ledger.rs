//! Postgres usage ledger and request log.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgPool;
use sqlx::Row;
use tokio::sync::{mpsc, oneshot};

use relay_core::store::{LedgerStore, QuotaWindowSpec};
use relay_types::{
    CostEntry, LedgerEntry, MessageRequestRecord, QuotaCostSums, RelayError, Scope,
};

fn store_err(context: &str, err: impl std::fmt::Display) -> RelayError {
    RelayError::store(format!("{context}: {err}"))
}

const fn scope_column(scope: Scope) -> &'static str {
    match scope {
        Scope::User => "user_id",
        Scope::Key => "key_hash",
        Scope::Provider => "final_provider_id",
    }
}

fn parse_numeric_id(scope: Scope, id: &str) -> Result<i64, RelayError> {
    id.parse()
        .map_err(|_| RelayError::store(format!("non-numeric {scope} id: {id}")))
}

/// Bind the scope id with its native column type.
macro_rules! bind_scope {
    ($query:expr, $scope:expr, $id:expr) => {
        match $scope {
            Scope::Key => $query.bind($id.to_string()),
            _ => $query.bind(parse_numeric_id($scope, $id)?),
        }
    };
}

/// Postgres implementation of [`LedgerStore`].
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    /// Wrap an existing pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LedgerStore for PgLedger {
    async fn append(&self, entry: &LedgerEntry) -> Result<i64, RelayError> {
        let row = sqlx::query(
            "INSERT INTO usage_ledger \
             (created_at, user_id, key_hash, final_provider_id, cost_usd, duration_ms, \
              is_success, blocked_by, blocked_reason) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9::jsonb) \
             RETURNING id",
        )
        .bind(entry.created_at)
        .bind(entry.user_id)
        .bind(&entry.key_hash)
        .bind(entry.final_provider_id)
        .bind(entry.cost_usd)
        .bind(i64::try_from(entry.duration_ms).unwrap_or(i64::MAX))
        .bind(entry.is_success)
        .bind(entry.blocked_by.as_deref())
        .bind(entry.blocked_reason.as_ref().map(ToString::to_string))
        .fetch_one(&self.pool)
        .await
        .map_err(|err| store_err("ledger append", err))?;
        row.try_get(0).map_err(|err| store_err("ledger append id", err))
    }

    async fn sum_cost_in_range(
        &self,
        scope: Scope,
        id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Decimal, RelayError> {
        let sql = format!(
            "SELECT COALESCE(SUM(cost_usd), 0) FROM usage_ledger \
             WHERE {} = $1 AND created_at >= $2 AND created_at < $3 \
               AND blocked_by IS NULL AND deleted_at IS NULL",
            scope_column(scope)
        );
        let query = sqlx::query(&sql);
        let row = bind_scope!(query, scope, id)
            .bind(start)
            .bind(end)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| store_err("sum cost in range", err))?;
        row.try_get(0).map_err(|err| store_err("sum decode", err))
    }

    async fn sum_total_cost(
        &self,
        scope: Scope,
        id: &str,
        reset_at: Option<DateTime<Utc>>,
    ) -> Result<Decimal, RelayError> {
        let sql = format!(
            "SELECT COALESCE(SUM(cost_usd), 0) FROM usage_ledger \
             WHERE {} = $1 AND ($2::timestamptz IS NULL OR created_at >= $2) \
               AND blocked_by IS NULL AND deleted_at IS NULL",
            scope_column(scope)
        );
        let query = sqlx::query(&sql);
        let row = bind_scope!(query, scope, id)
            .bind(reset_at)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| store_err("sum total cost", err))?;
        row.try_get(0).map_err(|err| store_err("sum decode", err))
    }

    async fn sum_quota_costs(
        &self,
        scope: Scope,
        id: &str,
        windows: &QuotaWindowSpec,
    ) -> Result<QuotaCostSums, RelayError> {
        let sql = format!(
            "SELECT \
               COALESCE(SUM(cost_usd) FILTER (WHERE created_at >= $2 AND created_at < $3), 0), \
               COALESCE(SUM(cost_usd) FILTER (WHERE created_at >= $4 AND created_at < $5), 0), \
               COALESCE(SUM(cost_usd) FILTER (WHERE created_at >= $6 AND created_at < $7), 0), \
               COALESCE(SUM(cost_usd) FILTER (WHERE created_at >= $8 AND created_at < $9), 0), \
               COALESCE(SUM(cost_usd) FILTER (WHERE $10::timestamptz IS NULL OR created_at >= $10), 0) \
             FROM usage_ledger \
             WHERE {} = $1 AND blocked_by IS NULL AND deleted_at IS NULL",
            scope_column(scope)
        );
        let query = sqlx::query(&sql);
        let row = bind_scope!(query, scope, id)
            .bind(windows.five_hour.start)
            .bind(windows.five_hour.end)
            .bind(windows.daily.start)
            .bind(windows.daily.end)
            .bind(windows.weekly.start)
            .bind(windows.weekly.end)
            .bind(windows.monthly.start)
            .bind(windows.monthly.end)
            .bind(windows.total_since)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| store_err("sum quota costs", err))?;
        Ok(QuotaCostSums {
            five_hour: row.try_get(0).map_err(|err| store_err("sum decode", err))?,
            daily: row.try_get(1).map_err(|err| store_err("sum decode", err))?,
            weekly: row.try_get(2).map_err(|err| store_err("sum decode", err))?,
            monthly: row.try_get(3).map_err(|err| store_err("sum decode", err))?,
            total: row.try_get(4).map_err(|err| store_err("sum decode", err))?,
        })
    }

    async fn find_cost_entries_in_range(
        &self,
        scope: Scope,
        id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CostEntry>, RelayError> {
        let sql = format!(
            "SELECT id, created_at, cost_usd FROM usage_ledger \
             WHERE {} = $1 AND created_at >= $2 AND created_at < $3 \
               AND blocked_by IS NULL AND deleted_at IS NULL \
             ORDER BY created_at",
            scope_column(scope)
        );
        let query = sqlx::query(&sql);
        let rows = bind_scope!(query, scope, id)
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| store_err("find cost entries", err))?;
        rows.into_iter()
            .map(|row| {
                Ok(CostEntry {
                    id: row.try_get(0).map_err(|err| store_err("entry decode", err))?,
                    created_at: row.try_get(1).map_err(|err| store_err("entry decode", err))?,
                    cost_usd: row.try_get(2).map_err(|err| store_err("entry decode", err))?,
                })
            })
            .collect()
    }

    async fn count_requests_in_range(
        &self,
        scope: Scope,
        id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64, RelayError> {
        let sql = format!(
            "SELECT COUNT(*) FROM usage_ledger \
             WHERE {} = $1 AND created_at >= $2 AND created_at < $3 \
               AND blocked_by IS NULL AND deleted_at IS NULL",
            scope_column(scope)
        );
        let query = sqlx::query(&sql);
        let row = bind_scope!(query, scope, id)
            .bind(start)
            .bind(end)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| store_err("count requests", err))?;
        let count: i64 = row.try_get(0).map_err(|err| store_err("count decode", err))?;
        Ok(count.unsigned_abs())
    }

    async fn record_message_request(
        &self,
        record: &MessageRequestRecord,
    ) -> Result<i64, RelayError> {
        let chain = serde_json::to_string(&record.provider_chain)
            .map_err(|err| store_err("chain serialize", err))?;
        let row = sqlx::query(
            "INSERT INTO message_request \
             (session_id, created_at, user_id, key_id, model, endpoint, is_streaming, \
              status_code, error_body, input_tokens, output_tokens, cache_read_tokens, \
              cache_creation_tokens, user_agent, final_provider_id, provider_chain, \
              duration_ms) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9::jsonb, $10, $11, $12, $13, $14, \
                     $15, $16::jsonb, $17) \
             RETURNING id",
        )
        .bind(&record.session_id)
        .bind(record.created_at)
        .bind(record.user_id)
        .bind(record.key_id)
        .bind(record.model.as_deref())
        .bind(&record.endpoint)
        .bind(record.is_streaming)
        .bind(i32::from(record.status_code))
        .bind(record.error_body.as_ref().map(ToString::to_string))
        .bind(i64::try_from(record.usage.input_tokens).unwrap_or(i64::MAX))
        .bind(i64::try_from(record.usage.output_tokens).unwrap_or(i64::MAX))
        .bind(i64::try_from(record.usage.cache_read_input_tokens).unwrap_or(i64::MAX))
        .bind(i64::try_from(record.usage.cache_creation_input_tokens).unwrap_or(i64::MAX))
        .bind(record.user_agent.as_deref())
        .bind(record.final_provider_id)
        .bind(chain)
        .bind(i64::try_from(record.duration_ms).unwrap_or(i64::MAX))
        .fetch_one(&self.pool)
        .await
        .map_err(|err| store_err("record message request", err))?;
        row.try_get(0).map_err(|err| store_err("request id decode", err))
    }
}

struct AppendJob {
    entry: LedgerEntry,
    done: oneshot::Sender<Result<i64, RelayError>>,
}

/// Bounded async append queue in front of any [`LedgerStore`].
///
/// Backpressure comes from the channel bound; a failed insert is retried
/// once after a short pause and then reported to the waiter. The client
/// response never waits on this queue; only the billing task does.
#[derive(Clone)]
pub struct LedgerWriter {
    tx: mpsc::Sender<AppendJob>,
}

impl LedgerWriter {
    /// Spawn the writer worker. The handle is returned so shutdown can
    /// drain the queue.
    #[must_use]
    pub fn spawn(
        ledger: Arc<dyn LedgerStore>,
        capacity: usize,
    ) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<AppendJob>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let mut result = ledger.append(&job.entry).await;
                if let Err(err) = &result {
                    tracing::warn!(%err, "ledger append failed, retrying once");
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    result = ledger.append(&job.entry).await;
                }
                if let Err(err) = &result {
                    tracing::error!(%err, user_id = job.entry.user_id, "dropping ledger row after retry");
                }
                let _ = job.done.send(result);
            }
        });
        (Self { tx }, handle)
    }

    /// Enqueue a row and wait for its assigned id.
    pub async fn append(&self, entry: LedgerEntry) -> Result<i64, RelayError> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(AppendJob { entry, done })
            .await
            .map_err(|_| RelayError::store("ledger writer stopped"))?;
        rx.await
            .map_err(|_| RelayError::store("ledger writer dropped the job"))?
    }
}

/// Filters accepted by the admin usage-log listing. `status_code` supports
/// the `!200` exclusion form.
#[derive(Debug, Default, Clone)]
pub struct UsageLogFilter {
    /// Exact user match.
    pub user_id: Option<i64>,
    /// Exact key match.
    pub key_id: Option<i64>,
    /// Exact serving-provider match.
    pub provider_id: Option<i64>,
    /// Exact session match.
    pub session_id: Option<String>,
    /// Inclusive lower time bound.
    pub start_time: Option<DateTime<Utc>>,
    /// Exclusive upper time bound.
    pub end_time: Option<DateTime<Utc>>,
    /// `"404"` for equality, `"!200"` for exclusion.
    pub status_code: Option<String>,
    /// Exact model match.
    pub model: Option<String>,
    /// Exact ingress-path match.
    pub endpoint: Option<String>,
    /// Minimum number of retries (chain length beyond the first attempt).
    pub min_retry: Option<u32>,
    /// Zero-based page.
    pub page: u32,
}

/// Page size for the usage-log listing.
pub const USAGE_LOG_PAGE_SIZE: u32 = 20;

/// Aggregates for the admin overview card.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverviewStats {
    /// Requests logged since the local midnight.
    pub today_requests: i64,
    /// Billable spend since the local midnight.
    pub today_cost: Decimal,
    /// Mean end-to-end duration today, milliseconds.
    pub avg_response_time: f64,
    /// Fraction of today's requests with a 4xx/5xx status.
    pub today_error_rate: f64,
    /// Requests in the last 60 seconds.
    pub recent_minute_requests: i64,
    /// Requests yesterday up to the same time of day.
    pub yesterday_same_period_requests: i64,
    /// Spend yesterday up to the same time of day.
    pub yesterday_same_period_cost: Decimal,
    /// Mean duration yesterday up to the same time of day.
    pub yesterday_same_period_avg_response_time: f64,
    /// In-flight sessions right now.
    pub concurrent_sessions: u32,
}

impl PgLedger {
    /// One page of the request log, newest first.
    pub async fn usage_logs(
        &self,
        filter: &UsageLogFilter,
    ) -> Result<Vec<MessageRequestRecord>, RelayError> {
        let mut qb = sqlx::QueryBuilder::new(
            "SELECT id, session_id, created_at, user_id, key_id, model, endpoint, \
             is_streaming, status_code, error_body::text, input_tokens, output_tokens, \
             cache_read_tokens, cache_creation_tokens, user_agent, final_provider_id, \
             provider_chain::text, duration_ms \
             FROM message_request WHERE TRUE",
        );
        if let Some(user_id) = filter.user_id {
            qb.push(" AND user_id = ").push_bind(user_id);
        }
        if let Some(key_id) = filter.key_id {
            qb.push(" AND key_id = ").push_bind(key_id);
        }
        if let Some(provider_id) = filter.provider_id {
            qb.push(" AND final_provider_id = ").push_bind(provider_id);
        }
        if let Some(session_id) = &filter.session_id {
            qb.push(" AND session_id = ").push_bind(session_id.clone());
        }
        if let Some(start) = filter.start_time {
            qb.push(" AND created_at >= ").push_bind(start);
        }
        if let Some(end) = filter.end_time {
            qb.push(" AND created_at < ").push_bind(end);
        }
        if let Some(raw) = &filter.status_code {
            if let Some(excluded) = raw.strip_prefix('!') {
                if let Ok(code) = excluded.parse::<i32>() {
                    qb.push(" AND status_code <> ").push_bind(code);
                }
            } else if let Ok(code) = raw.parse::<i32>() {
                qb.push(" AND status_code = ").push_bind(code);
            }
        }
        if let Some(model) = &filter.model {
            qb.push(" AND model = ").push_bind(model.clone());
        }
        if let Some(endpoint) = &filter.endpoint {
            qb.push(" AND endpoint = ").push_bind(endpoint.clone());
        }
        if let Some(min_retry) = filter.min_retry {
            qb.push(" AND jsonb_array_length(provider_chain) - 1 >= ")
                .push_bind(i64::from(min_retry));
        }
        qb.push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(i64::from(USAGE_LOG_PAGE_SIZE))
            .push(" OFFSET ")
            .push_bind(i64::from(filter.page) * i64::from(USAGE_LOG_PAGE_SIZE));

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|err| store_err("usage logs", err))?;
        rows.into_iter().map(|row| decode_log_row(&row)).collect()
    }

    /// Dashboard aggregates: today vs the same period yesterday, plus the
    /// last minute. `today_start` is the local midnight resolved by the
    /// caller's clock; `concurrent` is the live in-flight gauge.
    pub async fn overview(
        &self,
        now: DateTime<Utc>,
        today_start: DateTime<Utc>,
        concurrent: u32,
    ) -> Result<OverviewStats, RelayError> {
        let yesterday_start = today_start - chrono::Duration::days(1);
        let yesterday_now = now - chrono::Duration::days(1);

        let today = sqlx::query(
            "SELECT COUNT(*), COALESCE(AVG(duration_ms), 0)::float8, \
             COALESCE(AVG((status_code >= 400)::int), 0)::float8 \
             FROM message_request WHERE created_at >= $1 AND created_at < $2",
        )
        .bind(today_start)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| store_err("overview today", err))?;

        let yesterday = sqlx::query(
            "SELECT COUNT(*), COALESCE(AVG(duration_ms), 0)::float8 \
             FROM message_request WHERE created_at >= $1 AND created_at < $2",
        )
        .bind(yesterday_start)
        .bind(yesterday_now)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| store_err("overview yesterday", err))?;

        let recent: i64 = sqlx::query(
            "SELECT COUNT(*) FROM message_request WHERE created_at >= $1",
        )
        .bind(now - chrono::Duration::seconds(60))
        .fetch_one(&self.pool)
        .await
        .map_err(|err| store_err("overview recent", err))?
        .try_get(0)
        .map_err(|err| store_err("overview decode", err))?;

        let today_cost: Decimal = sqlx::query(
            "SELECT COALESCE(SUM(cost_usd), 0) FROM usage_ledger \
             WHERE created_at >= $1 AND created_at < $2 \
               AND blocked_by IS NULL AND deleted_at IS NULL",
        )
        .bind(today_start)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| store_err("overview cost", err))?
        .try_get(0)
        .map_err(|err| store_err("overview decode", err))?;

        let yesterday_cost: Decimal = sqlx::query(
            "SELECT COALESCE(SUM(cost_usd), 0) FROM usage_ledger \
             WHERE created_at >= $1 AND created_at < $2 \
               AND blocked_by IS NULL AND deleted_at IS NULL",
        )
        .bind(yesterday_start)
        .bind(yesterday_now)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| store_err("overview cost", err))?
        .try_get(0)
        .map_err(|err| store_err("overview decode", err))?;

        Ok(OverviewStats {
            today_requests: today.try_get(0).map_err(|err| store_err("overview decode", err))?,
            today_cost,
            avg_response_time: today.try_get(1).map_err(|err| store_err("overview decode", err))?,
            today_error_rate: today.try_get(2).map_err(|err| store_err("overview decode", err))?,
            recent_minute_requests: recent,
            yesterday_same_period_requests: yesterday
                .try_get(0)
                .map_err(|err| store_err("overview decode", err))?,
            yesterday_same_period_cost: yesterday_cost,
            yesterday_same_period_avg_response_time: yesterday
                .try_get(1)
                .map_err(|err| store_err("overview decode", err))?,
            concurrent_sessions: concurrent,
        })
    }
}

fn decode_log_row(row: &sqlx::postgres::PgRow) -> Result<MessageRequestRecord, RelayError> {
    let error_body: Option<String> = row.try_get(9).map_err(|err| store_err("log decode", err))?;
    let chain_raw: String = row.try_get(16).map_err(|err| store_err("log decode", err))?;
    let status: i32 = row.try_get(8).map_err(|err| store_err("log decode", err))?;
    let to_u64 = |v: i64| v.unsigned_abs();
    Ok(MessageRequestRecord {
        id: row.try_get(0).map_err(|err| store_err("log decode", err))?,
        session_id: row.try_get(1).map_err(|err| store_err("log decode", err))?,
        created_at: row.try_get(2).map_err(|err| store_err("log decode", err))?,
        user_id: row.try_get(3).map_err(|err| store_err("log decode", err))?,
        key_id: row.try_get(4).map_err(|err| store_err("log decode", err))?,
        model: row.try_get(5).map_err(|err| store_err("log decode", err))?,
        endpoint: row.try_get(6).map_err(|err| store_err("log decode", err))?,
        is_streaming: row.try_get(7).map_err(|err| store_err("log decode", err))?,
        status_code: u16::try_from(status.max(0)).unwrap_or(u16::MAX),
        error_body: error_body.and_then(|raw| serde_json::from_str(&raw).ok()),
        usage: relay_types::TokenUsage {
            input_tokens: to_u64(row.try_get(10).map_err(|err| store_err("log decode", err))?),
            output_tokens: to_u64(row.try_get(11).map_err(|err| store_err("log decode", err))?),
            cache_read_input_tokens: to_u64(
                row.try_get(12).map_err(|err| store_err("log decode", err))?,
            ),
            cache_creation_input_tokens: to_u64(
                row.try_get(13).map_err(|err| store_err("log decode", err))?,
            ),
        },
        user_agent: row.try_get(14).map_err(|err| store_err("log decode", err))?,
        final_provider_id: row.try_get(15).map_err(|err| store_err("log decode", err))?,
        provider_chain: serde_json::from_str(&chain_raw)
            .map_err(|err| store_err("chain decode", err))?,
        duration_ms: to_u64(row.try_get(17).map_err(|err| store_err("log decode", err))?),
    })
}
