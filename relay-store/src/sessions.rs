//! Transient request/response capture.
//!
//! Writes go through an explicit bounded queue with backpressure and one
//! retry, never detached fire-and-forget tasks. Reads hit the retention map
//! directly, so session-reuse lookups see a capture as soon as the worker
//! has drained it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{RwLock, mpsc};

use relay_core::store::SessionStore;
use relay_types::{ActiveSession, RelayError};

type SessionMap = Arc<RwLock<HashMap<String, ActiveSession>>>;

/// In-process session capture store with bounded write queueing and
/// time-based retention.
pub struct CapturedSessions {
    tx: mpsc::Sender<ActiveSession>,
    map: SessionMap,
    retention: Duration,
}

impl CapturedSessions {
    /// Spawn the drain worker. `capacity` bounds the write queue;
    /// `retention` is how long a completed capture stays readable.
    #[must_use]
    pub fn spawn(
        capacity: usize,
        retention: Duration,
    ) -> (Arc<Self>, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<ActiveSession>(capacity.max(1));
        let map: SessionMap = Arc::new(RwLock::new(HashMap::new()));
        let worker_map = Arc::clone(&map);
        let handle = tokio::spawn(async move {
            while let Some(session) = rx.recv().await {
                let mut guard = worker_map.write().await;
                guard.insert(session.session_id.clone(), session);
                // Opportunistic eviction keeps the map bounded without a
                // separate timer task.
                let horizon = Utc::now()
                    - chrono::Duration::from_std(retention)
                        .unwrap_or_else(|_| chrono::Duration::seconds(600));
                guard.retain(|_, s| s.started_at >= horizon);
            }
        });
        (
            Arc::new(Self { tx, map, retention }),
            handle,
        )
    }

    /// Retention window for captures.
    #[must_use]
    pub const fn retention(&self) -> Duration {
        self.retention
    }
}

#[async_trait]
impl SessionStore for CapturedSessions {
    async fn put(&self, session: ActiveSession) -> Result<(), RelayError> {
        // Backpressured send; one retry after a short pause, then drop.
        // A lost capture costs diagnostics, not correctness.
        if let Err(err) = self.tx.try_send(session) {
            match err {
                mpsc::error::TrySendError::Full(session) => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    if let Err(err) = self.tx.try_send(session) {
                        tracing::warn!(%err, "session capture queue full, dropping capture");
                    }
                }
                mpsc::error::TrySendError::Closed(_) => {
                    return Err(RelayError::store("session capture worker stopped"));
                }
            }
        }
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<ActiveSession>, RelayError> {
        Ok(self.map.read().await.get(session_id).cloned())
    }

    async fn provider_for(&self, session_id: &str) -> Result<Option<i64>, RelayError> {
        Ok(self
            .map
            .read()
            .await
            .get(session_id)
            .and_then(|s| s.provider_id))
    }
}
