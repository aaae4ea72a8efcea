//! Connection credential bootstrap
//!
//! The subscription socket does not accept the long-lived REST API key. Before
//! every connection attempt the key is exchanged for a short-lived connection
//! key via `POST /graphql/connection-key`.

use crate::config::RealtimeConfig;
use crate::error::CredentialError;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Header carrying the long-lived API key
pub const API_KEY_HEADER: &str = "X-Qminder-REST-API-Key";

/// Supplies the token used to authenticate the subscription socket.
///
/// Implementations retry transient failures themselves and only return an
/// error when no amount of retrying will help.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn fetch_token(&self) -> Result<String, CredentialError>;
}

/// A fixed token, for callers that manage connection keys themselves
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

#[async_trait]
impl CredentialProvider for StaticToken {
    async fn fetch_token(&self) -> Result<String, CredentialError> {
        Ok(self.0.clone())
    }
}

/// Backoff for the connection-key exchange: `clamp(2^attempt * 1s, min, max)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries forever
    pub max_retries: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            max_retries: None,
        }
    }
}

impl RetryPolicy {
    /// Set the delay bounds
    pub fn delays(mut self, min: Duration, max: Duration) -> Self {
        self.min_delay = min;
        self.max_delay = max;
        self
    }

    /// Give up after this many retries
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponential = Duration::from_secs(1).saturating_mul(2u32.saturating_pow(attempt));
        exponential.clamp(self.min_delay, self.max_delay.max(self.min_delay))
    }
}

#[derive(Debug, Deserialize)]
struct ConnectionKeyResponse {
    key: Option<String>,
}

/// Outcome of a single exchange attempt
#[derive(Debug)]
enum FetchFailure {
    Fatal(CredentialError),
    Retry(String),
}

/// Exchanges the API key for a temporary connection key over HTTP
#[derive(Debug, Clone)]
pub struct TemporaryKeyProvider {
    client: reqwest::Client,
    url: String,
    api_key: String,
    policy: RetryPolicy,
}

impl TemporaryKeyProvider {
    pub fn new(config: &RealtimeConfig) -> Self {
        Self::with_client(config, reqwest::Client::new())
    }

    pub fn with_client(config: &RealtimeConfig, client: reqwest::Client) -> Self {
        Self {
            client,
            url: config.connection_key_url(),
            api_key: config.api_key.clone(),
            policy: config.credential_retry,
        }
    }

    async fn fetch_once(&self) -> Result<String, FetchFailure> {
        let response = self
            .client
            .post(&self.url)
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await
            .map_err(|e| {
                warn!("Failed to fetch temporary API key: {}", e);
                FetchFailure::Retry(e.to_string())
            })?;

        let status = response.status();
        if status == StatusCode::FORBIDDEN {
            return Err(FetchFailure::Fatal(CredentialError::InvalidApiKey(
                format!("connection key request rejected with {}", status),
            )));
        }
        if status.is_server_error() {
            error!(status = %status, "Failed to fetch API key from the server");
            return Err(FetchFailure::Retry(format!("server responded {}", status)));
        }
        if !status.is_success() {
            warn!(status = %status, "Unexpected status fetching temporary API key");
            return Err(FetchFailure::Retry(format!("server responded {}", status)));
        }

        let body: ConnectionKeyResponse = response.json().await.map_err(|e| {
            error!("Failed to parse the temporary API key response: {}", e);
            FetchFailure::Retry(e.to_string())
        })?;

        body.key.ok_or_else(|| {
            error!("Temporary API key response does not contain key");
            FetchFailure::Retry("response does not contain key".into())
        })
    }
}

#[async_trait]
impl CredentialProvider for TemporaryKeyProvider {
    async fn fetch_token(&self) -> Result<String, CredentialError> {
        let mut attempt: u32 = 0;
        loop {
            match self.fetch_once().await {
                Ok(key) => {
                    debug!(attempt, "Fetched temporary API key");
                    return Ok(key);
                }
                Err(FetchFailure::Fatal(e)) => return Err(e),
                Err(FetchFailure::Retry(reason)) => {
                    attempt = attempt.saturating_add(1);
                    if let Some(max) = self.policy.max_retries {
                        if attempt > max {
                            return Err(CredentialError::RetriesExhausted(attempt));
                        }
                    }
                    let delay = self.policy.delay_for(attempt);
                    info!(attempt, delay = ?delay, reason = %reason, "Retrying to fetch API key");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
