//! Realtime client implementation

use crate::config::RealtimeConfig;
use crate::connection::{self, Command, ConnectionState, SessionShared};
use crate::credentials::{CredentialProvider, TemporaryKeyProvider};
use crate::error::{RealtimeError, Result};

use futures::Stream;
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

/// Internal client state
struct ClientInner {
    config: Arc<RealtimeConfig>,
    credentials: Arc<dyn CredentialProvider>,
    shared: Arc<SessionShared>,
    state_rx: watch::Receiver<ConnectionState>,

    // Command queue of the connection task, spawned on first subscribe
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
}

/// Qminder realtime subscription client
///
/// Opens the subscription socket lazily on the first [`subscribe`](Self::subscribe),
/// keeps it alive with heartbeats and reconnects with backoff when it drops.
/// Every active subscription is replayed after a reconnect.
///
/// This struct is cheaply cloneable as it uses an internal Arc.
#[derive(Clone)]
pub struct RealtimeClient {
    inner: Arc<ClientInner>,
}

impl RealtimeClient {
    /// Create a client that exchanges the configured API key for connection keys
    pub fn new(config: RealtimeConfig) -> Self {
        let credentials = Arc::new(TemporaryKeyProvider::new(&config));
        Self::with_credentials(config, credentials)
    }

    /// Create a client with a custom credential source
    pub fn with_credentials(
        config: RealtimeConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        let (shared, state_rx) = SessionShared::new();
        let inner = Arc::new(ClientInner {
            config: Arc::new(config),
            credentials,
            shared,
            state_rx,
            commands: Mutex::new(None),
        });
        Self { inner }
    }

    /// Get the configuration this client was built with
    pub fn config(&self) -> &RealtimeConfig {
        &self.inner.config
    }

    /// Get the current connection state
    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.state_rx.borrow()
    }

    /// Get a receiver for connection state changes
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_rx.clone()
    }

    /// Subscribe to a GraphQL subscription.
    ///
    /// `query` is either a full `subscription { ... }` document or just its
    /// selection set. The returned stream yields each `data` payload and ends
    /// with an error if the session can never authenticate.
    pub async fn subscribe(&self, query: &str) -> Result<Subscription> {
        if query.trim().is_empty() {
            return Err(RealtimeError::InvalidQuery("query is empty".into()));
        }

        let commands = self.inner.command_sender()?;
        let (sink, events) = mpsc::unbounded_channel();
        let (reply, id_rx) = oneshot::channel();

        commands
            .send(Command::Subscribe {
                query: query.to_string(),
                sink,
                reply,
            })
            .map_err(|_| self.inner.terminal_error())?;
        let id = id_rx.await.map_err(|_| self.inner.terminal_error())?;

        debug!(id = %id, "Subscribed");
        Ok(Subscription {
            id,
            query: query.to_string(),
            events,
            commands,
        })
    }

    /// Close the socket with a normal closure and stay disconnected.
    ///
    /// Subscriptions stay registered and are replayed when a later
    /// `subscribe` opens a new connection.
    pub async fn disconnect(&self) -> Result<()> {
        let commands = match self.inner.commands.lock().clone() {
            Some(tx) => tx,
            None => return Ok(()),
        };

        let (done, done_rx) = oneshot::channel();
        if commands.send(Command::Disconnect { done }).is_err() {
            // Task already gone, nothing left to close
            return Ok(());
        }
        let _ = done_rx.await;
        Ok(())
    }
}

impl ClientInner {
    fn command_sender(&self) -> Result<mpsc::UnboundedSender<Command>> {
        if let Some(error) = self.shared.fatal.lock().clone() {
            return Err(error.into());
        }

        let mut commands = self.commands.lock();
        if let Some(tx) = commands.as_ref() {
            if !tx.is_closed() {
                return Ok(tx.clone());
            }
        }

        let tx = connection::spawn(
            Arc::clone(&self.config),
            Arc::clone(&self.credentials),
            Arc::clone(&self.shared),
        );
        *commands = Some(tx.clone());
        Ok(tx)
    }

    /// Why the connection task stopped answering
    fn terminal_error(&self) -> RealtimeError {
        match self.shared.fatal.lock().clone() {
            Some(error) => error.into(),
            None => RealtimeError::Shutdown,
        }
    }
}

/// An active subscription.
///
/// Yields the `data` payload of every message for this subscription.
/// Dropping it unsubscribes.
///
/// The stream ends only after a fatal credential error. When the server
/// closes the socket normally (code 1000) the client stays disconnected and
/// the stream stays pending without ending; watch
/// [`RealtimeClient::state_receiver`] to notice that.
pub struct Subscription {
    id: String,
    query: String,
    events: mpsc::UnboundedReceiver<Result<serde_json::Value>>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Subscription {
    /// Get the subscription id used on the wire
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the query this subscription was created with
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Stop receiving data for this subscription
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Stream for Subscription {
    type Item = Result<serde_json::Value>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Unsubscribe {
            id: std::mem::take(&mut self.id),
        });
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("query", &self.query)
            .finish()
    }
}
