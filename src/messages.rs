//! Operation messages exchanged over the subscription socket
//!
//! Every frame is a single JSON text frame of the shape
//! `{ "id"?: string, "type": string, "payload"?: any }`.

use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Opens the logical session; the payload is always null
    ConnectionInit { payload: Option<serde_json::Value> },

    /// Starts a subscription
    Start { id: String, payload: StartPayload },

    /// Stops a subscription; the payload is always null
    Stop {
        id: String,
        payload: Option<serde_json::Value>,
    },

    /// Heartbeat
    Ping,
}

/// Payload of a `start` message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartPayload {
    pub query: String,
}

impl ClientMessage {
    pub fn connection_init() -> Self {
        Self::ConnectionInit { payload: None }
    }

    /// Build a `start` message, wrapping bare selections in a subscription document
    pub fn start(id: impl Into<String>, query: &str) -> Self {
        Self::Start {
            id: id.into(),
            payload: StartPayload {
                query: wrap_subscription_query(query),
            },
        }
    }

    pub fn stop(id: impl Into<String>) -> Self {
        Self::Stop {
            id: id.into(),
            payload: None,
        }
    }
}

/// Messages received from server
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake accepted
    ConnectionAck {},

    /// Handshake or session rejected by the server
    ConnectionError {
        #[serde(default)]
        payload: Option<serde_json::Value>,
    },

    /// Subscription data
    Data {
        id: String,
        #[serde(default)]
        payload: DataPayload,
    },

    /// Server keep-alive
    Ka {},

    /// The server ended a subscription
    Complete {
        #[serde(default)]
        id: Option<String>,
    },

    /// Per-operation error
    Error {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        payload: Option<serde_json::Value>,
    },

    /// Heartbeat reply
    Pong {},
}

/// Payload of a `data` message
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct DataPayload {
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub errors: Option<serde_json::Value>,
}

/// Serialize a client message into the text of one frame
pub fn encode(msg: &ClientMessage) -> Result<String> {
    Ok(serde_json::to_string(msg)?)
}

/// Parse the text of one inbound frame
pub fn decode(text: &str) -> Result<ServerMessage> {
    Ok(serde_json::from_str(text)?)
}

/// Wrap a bare selection like `baba` into `subscription { baba }`.
///
/// Text that already starts with the `subscription` keyword is sent verbatim.
pub fn wrap_subscription_query(query: &str) -> String {
    if is_subscription_document(query.trim_start()) {
        query.to_string()
    } else {
        format!("subscription {{ {} }}", query.trim())
    }
}

fn is_subscription_document(text: &str) -> bool {
    match text.strip_prefix("subscription") {
        Some(rest) => rest
            .chars()
            .next()
            .map_or(true, |c| !(c.is_alphanumeric() || c == '_')),
        None => false,
    }
}
