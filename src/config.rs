//! Configuration for the occupancy sync client

use std::path::PathBuf;
use std::time::Duration;

/// Default REST API base URL
pub const DEFAULT_API_URL: &str = "https://dev.occupi.tech";

/// Default realtime (WebSocket) endpoint
pub const DEFAULT_REALTIME_URL: &str = "wss://dev.occupi.tech/connection";

/// Topic the backend publishes the occupancy counter on
pub const DEFAULT_COUNTER_TOPIC: &str = "occupi-counter";

/// Configuration for connecting to the occupancy backend
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// REST API base URL (e.g., "https://dev.occupi.tech")
    pub api_url: String,

    /// Realtime WebSocket URL
    pub realtime_url: String,

    /// Topic carrying counter publications
    pub topic: String,

    /// Session credential sent as the `Authorization` header on REST calls
    pub session_token: Option<String>,

    /// Where the realtime token is cached (platform config dir when unset)
    pub token_cache_path: Option<PathBuf>,

    /// Whether the transport reconnects on its own after a drop
    pub auto_reconnect: bool,

    /// Initial delay before reconnecting
    pub reconnect_delay: Duration,

    /// Maximum delay between reconnection attempts
    pub max_reconnect_delay: Duration,

    /// Timeout for REST calls and the snapshot read
    pub operation_timeout: Duration,

    /// Reconnect when the server has been silent (no ping) for this long
    pub ping_timeout: Duration,
}

impl SyncConfig {
    /// Create a new configuration with the given API and realtime URLs
    pub fn new(api_url: impl Into<String>, realtime_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            realtime_url: realtime_url.into(),
            topic: DEFAULT_COUNTER_TOPIC.to_string(),
            session_token: None,
            token_cache_path: None,
            auto_reconnect: true,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            operation_timeout: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(60),
        }
    }

    /// Build a configuration from `OCCUPI_*` environment variables,
    /// falling back to the public defaults
    pub fn from_env() -> Self {
        let api_url = std::env::var("OCCUPI_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string());
        let realtime_url =
            std::env::var("OCCUPI_RTC_URL").unwrap_or_else(|_| DEFAULT_REALTIME_URL.to_string());

        let mut config = Self::new(api_url, realtime_url);
        if let Ok(topic) = std::env::var("OCCUPI_RTC_TOPIC") {
            config.topic = topic;
        }
        config.session_token = std::env::var("OCCUPI_SESSION_TOKEN").ok();
        config.token_cache_path = std::env::var("OCCUPI_TOKEN_CACHE").ok().map(PathBuf::from);
        config
    }

    /// Set the counter topic
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// Set the session credential used for REST calls
    pub fn session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    /// Set an explicit token cache file
    pub fn token_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.token_cache_path = Some(path.into());
        self
    }

    /// Disable automatic reconnection
    pub fn no_reconnect(mut self) -> Self {
        self.auto_reconnect = false;
        self
    }

    /// Set the reconnection delay range
    pub fn reconnect_delay(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_delay = initial;
        self.max_reconnect_delay = max;
        self
    }

    /// Set the operation timeout
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Set the server silence timeout
    pub fn ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    /// Backoff delay before reconnect attempt `attempt` (0-based), doubling up to the max
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        std::cmp::min(
            self.reconnect_delay.saturating_mul(2u32.saturating_pow(attempt)),
            self.max_reconnect_delay,
        )
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new(DEFAULT_API_URL, DEFAULT_REALTIME_URL)
    }
}
