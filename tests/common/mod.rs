//! Shared fixtures: an in-process subscription server and test configs

#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use qminder_realtime::RealtimeConfig;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Generous upper bound for anything that is expected to happen
pub const EXPECT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// Config pointing at a local server, with short timings
pub fn test_config(addr: SocketAddr) -> RealtimeConfig {
    RealtimeConfig::new("test-key")
        .api_server(addr.to_string())
        .insecure()
        .ping_interval(Duration::from_secs(60))
        .connect_timeout(Duration::from_secs(2))
        .reconnect_delays(
            Duration::from_millis(50),
            Duration::from_millis(10),
            Duration::from_millis(200),
        )
}

/// Accepts subscription sockets and hands them to the test
pub struct MockServer {
    pub addr: SocketAddr,
    connections: mpsc::UnboundedReceiver<ServerConnection>,
}

impl MockServer {
    pub async fn start() -> Self {
        init_tracing();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, connections) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let uri = Arc::new(Mutex::new(String::new()));
                let seen = uri.clone();
                let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                    *seen.lock() = req.uri().to_string();
                    Ok(resp)
                };
                let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
                    Ok(ws) => ws,
                    Err(_) => continue,
                };
                let uri = uri.lock().clone();
                if tx.send(ServerConnection { ws, uri }).is_err() {
                    break;
                }
            }
        });

        Self { addr, connections }
    }

    pub fn config(&self) -> RealtimeConfig {
        test_config(self.addr)
    }

    /// Wait for the client to open a socket
    pub async fn next_connection(&mut self) -> ServerConnection {
        timeout(EXPECT_TIMEOUT, self.connections.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("server stopped")
    }

    /// Wait for a socket and complete the handshake
    pub async fn accept_ready(&mut self) -> ServerConnection {
        let mut conn = self.next_connection().await;
        conn.expect_init().await;
        conn.send_ack().await;
        conn
    }

    pub async fn expect_no_connection(&mut self, wait: Duration) {
        if let Ok(Some(conn)) = timeout(wait, self.connections.recv()).await {
            panic!("unexpected connection to {}", conn.uri);
        }
    }
}

/// Server side of one subscription socket
pub struct ServerConnection {
    pub ws: WebSocketStream<TcpStream>,
    /// Request URI of the upgrade, including the query string
    pub uri: String,
}

impl ServerConnection {
    /// Next JSON text frame from the client
    pub async fn next_json(&mut self) -> Value {
        loop {
            let msg = timeout(EXPECT_TIMEOUT, self.ws.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("client closed the socket")
                .expect("socket error");
            match msg {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                Message::Close(frame) => panic!("expected a text frame, got close {:?}", frame),
                _ => continue,
            }
        }
    }

    /// Next JSON frame that is not a heartbeat ping
    pub async fn next_operation(&mut self) -> Value {
        loop {
            let msg = self.next_json().await;
            if msg["type"] != "ping" {
                return msg;
            }
        }
    }

    pub async fn expect_init(&mut self) {
        let msg = self.next_json().await;
        assert_eq!(msg, serde_json::json!({"type": "connection_init", "payload": null}));
    }

    pub async fn send_json(&mut self, value: Value) {
        self.ws
            .send(Message::Text(value.to_string().into()))
            .await
            .unwrap();
    }

    pub async fn send_text(&mut self, text: &str) {
        self.ws.send(Message::Text(text.to_string().into())).await.unwrap();
    }

    pub async fn send_ack(&mut self) {
        self.send_json(serde_json::json!({"type": "connection_ack"}))
            .await;
    }

    pub async fn send_data(&mut self, id: &str, data: Value) {
        self.send_json(serde_json::json!({
            "type": "data",
            "id": id,
            "payload": { "data": data }
        }))
        .await;
    }

    /// Close from the server side with the given code
    pub async fn close(mut self, code: CloseCode) {
        let frame = CloseFrame {
            code,
            reason: "".into(),
        };
        let _ = self.ws.close(Some(frame)).await;
    }

    /// Read until the client closes; returns the close code, if any
    pub async fn expect_close(&mut self) -> Option<u16> {
        loop {
            let msg = timeout(EXPECT_TIMEOUT, self.ws.next())
                .await
                .expect("timed out waiting for close");
            match msg {
                Some(Ok(Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => return None,
            }
        }
    }

    /// Assert the client sends nothing but heartbeats for a while
    pub async fn expect_silence(&mut self, wait: Duration) {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            match tokio::time::timeout_at(deadline, self.ws.next()).await {
                Err(_) => return,
                Ok(Some(Ok(Message::Text(text)))) => {
                    let value: Value = serde_json::from_str(&text).unwrap();
                    if value["type"] != "ping" {
                        panic!("unexpected frame {}", value);
                    }
                }
                Ok(Some(Ok(_))) => continue,
                Ok(other) => panic!("socket ended unexpectedly: {:?}", other),
            }
        }
    }
}

/// The `start` frame the client sends for a subscription
pub fn start_frame(id: &str, query: &str) -> Value {
    serde_json::json!({
        "type": "start",
        "id": id,
        "payload": { "query": query }
    })
}

pub fn stop_frame(id: &str) -> Value {
    serde_json::json!({"type": "stop", "id": id, "payload": null})
}
