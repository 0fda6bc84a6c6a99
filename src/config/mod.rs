//! Client configuration (code > env > defaults).

use std::time::Duration;

const DEFAULT_API_URL: &str = "https://api.lanewire.io";
const DEFAULT_REALTIME_URL: &str = "wss://realtime.lanewire.io";

/// Connection endpoints and timing knobs for one client instance.
///
/// Construct with [`ClientConfig::default`] or [`ClientConfig::from_env`],
/// then override individual fields with the `with_*` builders. Tests point
/// `api_url`/`realtime_url` at local mock servers.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL for the HTTP services, without a trailing slash.
    pub api_url: String,
    /// Explicit refresh endpoint; derived from `api_url` when `None`.
    pub refresh_url: Option<String>,
    /// Base URL for the realtime WebSocket endpoint.
    pub realtime_url: String,
    /// Default timeout for ordinary requests.
    pub request_timeout: Duration,
    /// Timeout for the token refresh call, independent of `request_timeout`.
    pub refresh_timeout: Duration,
    /// Keepalive ping cadence on the realtime socket.
    pub ping_interval: Duration,
    /// First reconnect delay; doubles per attempt.
    pub reconnect_base_delay: Duration,
    /// Reconnect delay ceiling.
    pub reconnect_max_delay: Duration,
    /// Access tokens within this window of expiry are refreshed eagerly.
    pub token_expiry_skew: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            refresh_url: None,
            realtime_url: DEFAULT_REALTIME_URL.to_string(),
            request_timeout: Duration::from_secs(30),
            refresh_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(25),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            token_expiry_skew: Duration::from_secs(60),
        }
    }
}

impl ClientConfig {
    /// Load overrides from the environment (`LANEWIRE_API_URL`,
    /// `LANEWIRE_REALTIME_URL`, `LANEWIRE_REFRESH_URL`), reading a `.env`
    /// file if one is present.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();
        if let Ok(url) = std::env::var("LANEWIRE_API_URL") {
            config.api_url = url;
        }
        if let Ok(url) = std::env::var("LANEWIRE_REALTIME_URL") {
            config.realtime_url = url;
        }
        if let Ok(url) = std::env::var("LANEWIRE_REFRESH_URL") {
            config.refresh_url = Some(url);
        }
        config
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = url.into();
        self
    }

    pub fn with_refresh_url(mut self, url: impl Into<String>) -> Self {
        self.refresh_url = Some(url.into());
        self
    }

    pub fn with_realtime_url(mut self, url: impl Into<String>) -> Self {
        self.realtime_url = url.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_reconnect_delays(mut self, base: Duration, max: Duration) -> Self {
        self.reconnect_base_delay = base;
        self.reconnect_max_delay = max;
        self
    }

    pub fn with_token_expiry_skew(mut self, skew: Duration) -> Self {
        self.token_expiry_skew = skew;
        self
    }

    /// The refresh endpoint: explicit override, or `{api_url}/auth/refresh`.
    pub fn refresh_url(&self) -> String {
        match &self.refresh_url {
            Some(url) => url.clone(),
            None => format!("{}/auth/refresh", self.api_url.trim_end_matches('/')),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_url_derived_from_api_url() {
        let config = ClientConfig::default().with_api_url("https://api.example.test/");
        assert_eq!(config.refresh_url(), "https://api.example.test/auth/refresh");
    }

    #[test]
    fn explicit_refresh_url_wins() {
        let config = ClientConfig::default()
            .with_api_url("https://api.example.test")
            .with_refresh_url("https://auth.example.test/refresh");
        assert_eq!(config.refresh_url(), "https://auth.example.test/refresh");
    }

    #[test]
    fn builders_override_defaults() {
        let config = ClientConfig::default()
            .with_realtime_url("ws://127.0.0.1:9000")
            .with_refresh_timeout(Duration::from_millis(250))
            .with_reconnect_delays(Duration::from_millis(10), Duration::from_millis(80));
        assert_eq!(config.realtime_url, "ws://127.0.0.1:9000");
        assert_eq!(config.refresh_timeout, Duration::from_millis(250));
        assert_eq!(config.reconnect_base_delay, Duration::from_millis(10));
        assert_eq!(config.reconnect_max_delay, Duration::from_millis(80));
    }
}
