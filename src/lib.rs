//! Qminder realtime client
//!
//! Streams GraphQL subscription data from the Qminder API over a WebSocket.
//! One socket is shared by every subscription of a client. It is opened on
//! the first subscribe, kept alive with heartbeats, and reconnected with
//! backoff when it drops. Active subscriptions are replayed after every
//! reconnect.
//!
//! # Example
//!
//! ```no_run
//! use futures::StreamExt;
//! use qminder_realtime::{RealtimeClient, RealtimeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RealtimeConfig::new("your-api-key");
//!     let client = RealtimeClient::new(config);
//!
//!     // Bare selections are wrapped in `subscription { ... }`
//!     let mut tickets = client
//!         .subscribe("createdTickets(locationId: 673) { id firstName }")
//!         .await?;
//!
//!     while let Some(data) = tickets.next().await {
//!         println!("Received: {:?}", data?);
//!     }
//!
//!     client.disconnect().await?;
//!     Ok(())
//! }
//! ```

mod backoff;
mod client;
mod config;
mod connection;
mod credentials;
mod error;
mod liveness;
mod messages;
mod registry;
mod timer;

pub use client::{RealtimeClient, Subscription};
pub use config::{RealtimeConfig, DEFAULT_API_SERVER};
pub use connection::ConnectionState;
pub use credentials::{
    CredentialProvider, RetryPolicy, StaticToken, TemporaryKeyProvider, API_KEY_HEADER,
};
pub use error::{CredentialError, RealtimeError, Result};
pub use messages::{ClientMessage, DataPayload, ServerMessage, StartPayload};
