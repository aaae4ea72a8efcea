//! Configuration for the realtime client

use crate::credentials::RetryPolicy;
use crate::error::{RealtimeError, Result};
use std::time::Duration;

/// Host used when no API server is configured
pub const DEFAULT_API_SERVER: &str = "api.qminder.com";

/// Configuration for a realtime subscription session.
///
/// Built once per session and handed to [`RealtimeClient`](crate::RealtimeClient);
/// the client never mutates it afterwards.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Long-lived REST API key, exchanged for a connection key on every connect
    pub api_key: String,

    /// API host name, without scheme (e.g. "api.qminder.com")
    pub api_server: String,

    /// Use https/wss. Disabled only for local test servers.
    pub secure: bool,

    /// Interval between heartbeat pings while the connection is ready
    pub ping_interval: Duration,

    /// How long to wait for a pong before declaring the connection dead
    pub pong_timeout: Duration,

    /// Bound on opening the socket and on waiting for `connection_ack`
    pub connect_timeout: Duration,

    /// Base and minimum delay before a reconnect attempt
    pub reconnect_min_delay: Duration,

    /// Added to the reconnect delay for every ten consecutive failures
    pub reconnect_step: Duration,

    /// Ceiling for the reconnect delay
    pub reconnect_max_delay: Duration,

    /// Retry policy for fetching connection keys
    pub credential_retry: RetryPolicy,
}

impl RealtimeConfig {
    /// Create a new configuration with the given API key and default settings
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_server: DEFAULT_API_SERVER.to_string(),
            secure: true,
            ping_interval: Duration::from_secs(20),
            pong_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(10),
            reconnect_min_delay: Duration::from_secs(5),
            reconnect_step: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(60),
            credential_retry: RetryPolicy::default(),
        }
    }

    /// Read the configuration from `QMINDER_API_KEY` and `QMINDER_API_SERVER`
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("QMINDER_API_KEY")
            .map_err(|_| RealtimeError::Config("QMINDER_API_KEY not set".into()))?;
        if api_key.trim().is_empty() {
            return Err(RealtimeError::Config("QMINDER_API_KEY is empty".into()));
        }

        let mut config = Self::new(api_key);
        if let Ok(server) = std::env::var("QMINDER_API_SERVER") {
            if !server.trim().is_empty() {
                config.api_server = server;
            }
        }
        Ok(config)
    }

    /// Set the API host
    pub fn api_server(mut self, server: impl Into<String>) -> Self {
        self.api_server = server.into();
        self
    }

    /// Talk plain http/ws instead of https/wss
    pub fn insecure(mut self) -> Self {
        self.secure = false;
        self
    }

    /// Set the heartbeat ping interval
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set the heartbeat pong timeout
    pub fn pong_timeout(mut self, timeout: Duration) -> Self {
        self.pong_timeout = timeout;
        self
    }

    /// Set the connect and handshake timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the reconnect delay range and its growth step
    pub fn reconnect_delays(mut self, min: Duration, step: Duration, max: Duration) -> Self {
        self.reconnect_min_delay = min;
        self.reconnect_step = step;
        self.reconnect_max_delay = max;
        self
    }

    /// Set the retry policy for the connection-key exchange
    pub fn credential_retry(mut self, policy: RetryPolicy) -> Self {
        self.credential_retry = policy;
        self
    }

    /// Endpoint that exchanges the API key for a connection key
    pub fn connection_key_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}/graphql/connection-key", scheme, self.api_server)
    }

    /// WebSocket endpoint for the given connection key, percent-encoded
    pub fn subscription_url(&self, token: &str) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!(
            "{}://{}/graphql/subscription?rest-api-key={}",
            scheme,
            self.api_server,
            urlencoding::encode(token)
        )
    }
}
