//! Process configuration.

use chrono_tz::Tz;

use relay_types::RelayError;

/// Runtime configuration assembled from CLI flags and the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Socket the HTTP server binds.
    pub listen: std::net::SocketAddr,
    /// Postgres connection URL.
    pub database_url: String,
    /// Redis connection URL.
    pub redis_url: String,
    /// IANA timezone for all rate-limit window math (`TZ`).
    pub timezone: Tz,
    /// Proxies whose `X-Forwarded-For` is trusted.
    pub trusted_proxies: Vec<String>,
    /// Create missing tables at startup instead of refusing to run.
    pub auto_migrate: bool,
}

impl AppConfig {
    /// Parse and validate the timezone name.
    ///
    /// # Errors
    /// Returns a config error for an unknown IANA name.
    pub fn parse_timezone(raw: &str) -> Result<Tz, RelayError> {
        raw.parse::<Tz>()
            .map_err(|_| RelayError::config(format!("unknown timezone: {raw}")))
    }
}
