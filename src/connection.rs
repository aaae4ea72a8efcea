//! Connection state machine
//!
//! One task owns the socket, the subscription registry and every timer.
//! Caller commands, socket frames and timer expiries are turned into
//! [`Event`]s and handled one at a time by [`ConnectionActor::handle_event`],
//! so no state here is ever touched concurrently.

use crate::backoff::ReconnectController;
use crate::config::RealtimeConfig;
use crate::credentials::CredentialProvider;
use crate::error::CredentialError;
use crate::liveness::{LivenessEvent, LivenessMonitor};
use crate::messages::{self, ClientMessage, ServerMessage};
use crate::registry::{PayloadSink, SubscriptionRegistry};
use crate::timer::TimerSlot;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::future::{pending, Future};
use std::pin::Pin;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

/// Close code for a deliberate, client-initiated close
const NORMAL_CLOSURE: u16 = 1000;

/// Reported when the server closes without a status code
const NO_STATUS_RECEIVED: u16 = 1005;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

type ConnectFuture = Pin<Box<dyn Future<Output = Result<WsStream, ConnectFailure>> + Send>>;

/// Connection state of the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket, and none being opened
    Disconnected,
    /// Fetching a credential and opening the socket
    Connecting,
    /// Socket open, `connection_init` sent
    AwaitingAck,
    /// Handshake complete, subscriptions are live
    Ready,
}

/// State visible outside the connection task
#[derive(Debug)]
pub(crate) struct SessionShared {
    pub(crate) state: watch::Sender<ConnectionState>,
    pub(crate) fatal: Mutex<Option<CredentialError>>,
}

impl SessionShared {
    pub(crate) fn new() -> (Arc<Self>, watch::Receiver<ConnectionState>) {
        let (state, state_rx) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Self {
            state,
            fatal: Mutex::new(None),
        });
        (shared, state_rx)
    }
}

/// Requests from client handles to the connection task
#[derive(Debug)]
pub(crate) enum Command {
    Subscribe {
        query: String,
        sink: PayloadSink,
        reply: oneshot::Sender<String>,
    },
    Unsubscribe {
        id: String,
    },
    Disconnect {
        done: oneshot::Sender<()>,
    },
}

#[derive(Debug)]
enum ConnectFailure {
    Credential(CredentialError),
    Transport(String),
}

enum Event {
    Command(Command),
    HandlesDropped,
    Connected(Result<WsStream, ConnectFailure>),
    Frame(Option<Result<Message, WsError>>),
    AckTimeout,
    Liveness(LivenessEvent),
    ReconnectDue,
}

enum Flow {
    Continue,
    Stop,
}

/// Spawn the connection task and return its command queue
pub(crate) fn spawn(
    config: Arc<RealtimeConfig>,
    credentials: Arc<dyn CredentialProvider>,
    shared: Arc<SessionShared>,
) -> mpsc::UnboundedSender<Command> {
    let (tx, rx) = mpsc::unbounded_channel();
    let actor = ConnectionActor::new(config, credentials, shared, rx);
    tokio::spawn(actor.run());
    tx
}

pub(crate) struct ConnectionActor {
    config: Arc<RealtimeConfig>,
    credentials: Arc<dyn CredentialProvider>,
    shared: Arc<SessionShared>,
    commands: mpsc::UnboundedReceiver<Command>,
    state: ConnectionState,
    registry: SubscriptionRegistry,
    socket: Option<WsStream>,
    connecting: Option<ConnectFuture>,
    ack_timer: TimerSlot,
    liveness: LivenessMonitor,
    reconnect: ReconnectController,
}

impl ConnectionActor {
    fn new(
        config: Arc<RealtimeConfig>,
        credentials: Arc<dyn CredentialProvider>,
        shared: Arc<SessionShared>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let liveness = LivenessMonitor::new(config.ping_interval, config.pong_timeout);
        let reconnect = ReconnectController::from_config(&config);
        Self {
            config,
            credentials,
            shared,
            commands,
            state: ConnectionState::Disconnected,
            registry: SubscriptionRegistry::new(),
            socket: None,
            connecting: None,
            ack_timer: TimerSlot::new(),
            liveness,
            reconnect,
        }
    }

    async fn run(mut self) {
        loop {
            let event = tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => Event::Command(cmd),
                    None => Event::HandlesDropped,
                },
                result = wait_connect(&mut self.connecting) => Event::Connected(result),
                frame = next_frame(&mut self.socket) => Event::Frame(frame),
                _ = self.ack_timer.wait() => Event::AckTimeout,
                event = self.liveness.wait() => Event::Liveness(event),
                _ = self.reconnect.wait() => Event::ReconnectDue,
            };

            if let Flow::Stop = self.handle_event(event).await {
                break;
            }
        }
        debug!("Connection task stopped");
    }

    async fn handle_event(&mut self, event: Event) -> Flow {
        match event {
            Event::Command(Command::Subscribe { query, sink, reply }) => {
                self.on_subscribe(query, sink, reply).await;
            }
            Event::Command(Command::Unsubscribe { id }) => self.on_unsubscribe(&id).await,
            Event::Command(Command::Disconnect { done }) => {
                self.close("client disconnect").await;
                let _ = done.send(());
            }
            Event::HandlesDropped => {
                self.close("client dropped").await;
                return Flow::Stop;
            }
            Event::Connected(result) => {
                self.connecting = None;
                match result {
                    Ok(ws) => self.on_socket_open(ws).await,
                    Err(ConnectFailure::Credential(e)) => {
                        self.fail(e);
                        return Flow::Stop;
                    }
                    Err(ConnectFailure::Transport(reason)) => self.connection_lost(&reason),
                }
            }
            Event::Frame(frame) => self.on_frame(frame).await,
            Event::AckTimeout => self.connection_lost("timed out waiting for connection_ack"),
            Event::Liveness(LivenessEvent::PingDue) => self.send_ping().await,
            Event::Liveness(LivenessEvent::PongTimedOut) => {
                let since_keep_alive = self.liveness.last_keep_alive().map(|at| at.elapsed());
                debug!(since_keep_alive = ?since_keep_alive, "Heartbeat timed out");
                self.connection_lost("no pong received before heartbeat timeout");
            }
            Event::ReconnectDue => {
                self.reconnect.cancel();
                self.open();
            }
        }
        Flow::Continue
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "Connection state changed");
        }
        self.state = state;
        self.shared.state.send_replace(state);
    }

    /// Start a connection attempt unless one exists already
    fn open(&mut self) {
        if self.state != ConnectionState::Disconnected {
            return;
        }
        self.reconnect.cancel();
        self.set_state(ConnectionState::Connecting);

        let credentials = Arc::clone(&self.credentials);
        let config = Arc::clone(&self.config);
        self.connecting = Some(Box::pin(connect(credentials, config)));
    }

    async fn on_subscribe(&mut self, query: String, sink: PayloadSink, reply: oneshot::Sender<String>) {
        let id = self.registry.register(query.clone(), sink);
        if reply.send(id.clone()).is_err() {
            // Caller went away before learning the id
            self.registry.remove(&id);
            return;
        }
        debug!(id = %id, state = ?self.state, "Registered subscription");

        match self.state {
            ConnectionState::Ready => {
                if let Err(reason) = self.send(&ClientMessage::start(id, &query)).await {
                    self.connection_lost(&reason);
                }
            }
            ConnectionState::Disconnected => self.open(),
            ConnectionState::Connecting | ConnectionState::AwaitingAck => {}
        }
    }

    async fn on_unsubscribe(&mut self, id: &str) {
        if self.registry.remove(id).is_none() {
            debug!(id = %id, "Unsubscribe for unknown subscription ignored");
            return;
        }
        debug!(id = %id, "Removed subscription");

        if self.state == ConnectionState::Ready {
            if let Err(reason) = self.send(&ClientMessage::stop(id)).await {
                self.connection_lost(&reason);
            }
        }
    }

    async fn on_socket_open(&mut self, ws: WsStream) {
        info!("Subscription socket connected");
        self.socket = Some(ws);

        if let Err(reason) = self.send(&ClientMessage::connection_init()).await {
            self.connection_lost(&reason);
            return;
        }
        self.set_state(ConnectionState::AwaitingAck);
        self.ack_timer.arm_in(self.config.connect_timeout);
    }

    async fn on_frame(&mut self, frame: Option<Result<Message, WsError>>) {
        match frame {
            Some(Ok(Message::Text(text))) => match messages::decode(&text) {
                Ok(msg) => self.on_message(msg).await,
                Err(e) => warn!("Dropping malformed frame: {}", e),
            },
            Some(Ok(Message::Binary(_))) => debug!("Ignoring binary frame"),
            Some(Ok(Message::Close(frame))) => {
                let code = frame
                    .as_ref()
                    .map(|f| u16::from(f.code))
                    .unwrap_or(NO_STATUS_RECEIVED);
                if code == NORMAL_CLOSURE {
                    self.teardown();
                    info!("Server closed the connection normally");
                } else {
                    self.connection_lost(&format!("closed with code {}", code));
                }
            }
            // Control frames are answered by tungstenite itself
            Some(Ok(_)) => {}
            Some(Err(e)) => self.connection_lost(&e.to_string()),
            None => self.connection_lost("socket stream ended"),
        }
    }

    async fn on_message(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::ConnectionAck {} => self.on_ack().await,
            ServerMessage::Data { id, payload } => {
                if let Some(errors) = &payload.errors {
                    warn!(id = %id, errors = %errors, "Subscription data carried errors");
                }
                if !self.registry.dispatch(&id, payload.data) {
                    debug!(id = %id, "Dropping data for unknown subscription");
                }
            }
            ServerMessage::Ka {} => self.liveness.keep_alive_received(Instant::now()),
            ServerMessage::Pong {} => {
                if !self.liveness.pong_received(Instant::now()) {
                    debug!("Ignoring unsolicited pong");
                }
            }
            ServerMessage::Complete { id } => {
                debug!(id = ?id, "Server completed subscription");
            }
            ServerMessage::Error { id, payload } => {
                warn!(id = ?id, payload = ?payload, "Server reported an operation error");
            }
            ServerMessage::ConnectionError { payload } => {
                let detail = payload.map(|p| p.to_string()).unwrap_or_default();
                self.connection_lost(&format!("server rejected the connection {}", detail));
            }
        }
    }

    /// Handshake complete: go live and replay every registered subscription
    async fn on_ack(&mut self) {
        if self.state != ConnectionState::AwaitingAck {
            debug!(state = ?self.state, "Ignoring unexpected connection_ack");
            return;
        }
        self.ack_timer.cancel();
        self.reconnect.reset();
        self.set_state(ConnectionState::Ready);
        self.liveness.start(Instant::now());

        info!(subscriptions = self.registry.len(), "Connection acknowledged");

        let replay: Vec<ClientMessage> = self
            .registry
            .iter()
            .map(|entry| ClientMessage::start(entry.id.clone(), &entry.query))
            .collect();
        for msg in &replay {
            if let Err(reason) = self.send(msg).await {
                self.connection_lost(&reason);
                return;
            }
        }
    }

    async fn send_ping(&mut self) {
        if self.state != ConnectionState::Ready {
            self.liveness.stop();
            return;
        }
        match self.send(&ClientMessage::Ping).await {
            Ok(()) => self.liveness.ping_sent(Instant::now()),
            Err(reason) => self.connection_lost(&reason),
        }
    }

    async fn send(&mut self, msg: &ClientMessage) -> Result<(), String> {
        let text = messages::encode(msg).map_err(|e| e.to_string())?;
        let ws = self
            .socket
            .as_mut()
            .ok_or_else(|| "socket is not open".to_string())?;
        ws.send(Message::Text(text.into()))
            .await
            .map_err(|e| format!("failed to send frame: {}", e))
    }

    /// Drop the physical connection and everything tied to it
    fn teardown(&mut self) {
        self.liveness.stop();
        self.ack_timer.cancel();
        self.connecting = None;
        self.socket = None;
        self.set_state(ConnectionState::Disconnected);
    }

    /// Transport fault: tear down and schedule a reconnect
    fn connection_lost(&mut self, reason: &str) {
        self.teardown();
        let delay = self.reconnect.schedule(Instant::now());
        warn!(
            reason = %reason,
            attempt = self.reconnect.attempt_count(),
            delay = ?delay,
            "Connection lost, reconnecting"
        );
    }

    /// Client-initiated close; nothing is rescheduled
    async fn close(&mut self, reason: &str) {
        self.reconnect.cancel();
        let socket = self.socket.take();
        self.teardown();

        if let Some(mut ws) = socket {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: reason.to_string().into(),
            };
            if let Err(e) = ws.close(Some(frame)).await {
                debug!("Error while closing socket: {}", e);
            }
        }
        info!(reason = %reason, "Connection closed");
    }

    /// The credential can never be obtained: end every subscription
    fn fail(&mut self, error: CredentialError) {
        error!("Realtime session failed: {}", error);
        self.reconnect.cancel();
        self.teardown();
        *self.shared.fatal.lock() = Some(error.clone());
        self.registry.fail_all(&error);
    }
}

/// Fetch a credential, then open the socket
async fn connect(
    credentials: Arc<dyn CredentialProvider>,
    config: Arc<RealtimeConfig>,
) -> Result<WsStream, ConnectFailure> {
    let token = credentials
        .fetch_token()
        .await
        .map_err(ConnectFailure::Credential)?;

    debug!(server = %config.api_server, "Opening subscription socket");
    match timeout(config.connect_timeout, connect_async(config.subscription_url(&token))).await {
        Ok(Ok((ws, _response))) => Ok(ws),
        Ok(Err(e)) => Err(ConnectFailure::Transport(e.to_string())),
        Err(_) => Err(ConnectFailure::Transport(format!(
            "connect timed out after {:?}",
            config.connect_timeout
        ))),
    }
}

async fn wait_connect(connecting: &mut Option<ConnectFuture>) -> Result<WsStream, ConnectFailure> {
    match connecting {
        Some(fut) => fut.await,
        None => pending().await,
    }
}

async fn next_frame(socket: &mut Option<WsStream>) -> Option<Result<Message, WsError>> {
    match socket {
        Some(ws) => ws.next().await,
        None => pending().await,
    }
}
