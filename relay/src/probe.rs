//! HTTP transport for the endpoint probe scheduler.

use std::time::{Duration, Instant};

use async_trait::async_trait;

use relay_middleware::Prober;
use relay_types::{ProviderEndpoint, RelayError};

/// Cheap upstream liveness check: any HTTP answer below 500 counts as
/// alive. Auth failures (401/403) still prove the endpoint is reachable.
pub struct HttpProber {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpProber {
    /// Build a prober with a 5 s per-probe budget.
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, endpoint: &ProviderEndpoint) -> Result<u64, RelayError> {
        let started = Instant::now();
        let response = self
            .client
            .get(&endpoint.url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|err| RelayError::upstream("probe", None, err.to_string(), true))?;
        if response.status().is_server_error() {
            return Err(RelayError::upstream(
                "probe",
                Some(response.status().as_u16()),
                "probe got a server error",
                true,
            ));
        }
        Ok(started.elapsed().as_millis() as u64)
    }
}
