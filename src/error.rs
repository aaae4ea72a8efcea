//! Error types for the realtime client

use thiserror::Error;

/// Fatal failures of the credential bootstrap.
///
/// Transient failures (network errors, 5xx responses, malformed bodies) are
/// retried inside the provider and never show up here.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    /// The server rejected the long-lived API key
    #[error("Provided API key is invalid: {0}")]
    InvalidApiKey(String),

    /// The caller's retry policy gave up
    #[error("Gave up fetching a connection key after {0} attempts")]
    RetriesExhausted(u32),
}

/// Errors surfaced to callers of the realtime client
#[derive(Error, Debug)]
pub enum RealtimeError {
    /// The subscription query was empty
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// The session could not obtain a connection credential
    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    /// Configuration is missing or malformed
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failed to serialize/deserialize a message
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The connection task is gone
    #[error("Client shut down")]
    Shutdown,
}

/// Result type for realtime client operations
pub type Result<T> = std::result::Result<T, RealtimeError>;
