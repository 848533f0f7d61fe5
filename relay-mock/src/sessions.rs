use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use relay_core::store::SessionStore;
use relay_types::{ActiveSession, RelayError};

/// In-memory [`SessionStore`] keyed by session id.
#[derive(Default)]
pub struct MemorySessions {
    sessions: Mutex<HashMap<String, ActiveSession>>,
}

impl MemorySessions {
    /// A fresh, empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessions {
    async fn put(&self, session: ActiveSession) -> Result<(), RelayError> {
        self.sessions
            .lock()
            .expect("mutex poisoned")
            .insert(session.session_id.clone(), session);
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<ActiveSession>, RelayError> {
        Ok(self
            .sessions
            .lock()
            .expect("mutex poisoned")
            .get(session_id)
            .cloned())
    }

    async fn provider_for(&self, session_id: &str) -> Result<Option<i64>, RelayError> {
        Ok(self
            .sessions
            .lock()
            .expect("mutex poisoned")
            .get(session_id)
            .and_then(|s| s.provider_id))
    }
}
