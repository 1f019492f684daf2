//! In-process transport
//!
//! `loopback()` returns a connector for the session and a server handle for
//! whoever plays the service (tests, offline demos). Every `connect()` hands the
//! server a fresh `ServerEnd`.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::protocol::WireFrame;
use super::transport::{Connector, Transport};
use super::StreamingError;

type ToClient = mpsc::UnboundedSender<Result<WireFrame, StreamingError>>;

/// Client side of the loopback
pub struct LoopbackConnector {
    accept_tx: mpsc::UnboundedSender<ServerEnd>,
    scripted_failures: Mutex<VecDeque<StreamingError>>,
}

/// Server side: yields one `ServerEnd` per accepted connection
pub struct LoopbackServer {
    accept_rx: mpsc::UnboundedReceiver<ServerEnd>,
}

/// Create a connected connector/server pair.
pub fn loopback() -> (LoopbackConnector, LoopbackServer) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    (
        LoopbackConnector {
            accept_tx,
            scripted_failures: Mutex::new(VecDeque::new()),
        },
        LoopbackServer { accept_rx },
    )
}

impl LoopbackConnector {
    /// Make the next `connect()` fail with `err` instead of reaching the server.
    pub fn fail_next_connect(&self, err: StreamingError) {
        if let Ok(mut failures) = self.scripted_failures.lock() {
            failures.push_back(err);
        }
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self, token: &str) -> Result<Box<dyn Transport>, StreamingError> {
        let scripted = self
            .scripted_failures
            .lock()
            .ok()
            .and_then(|mut failures| failures.pop_front());
        if let Some(err) = scripted {
            return Err(err);
        }

        let (to_client, from_server) = mpsc::unbounded_channel();
        let (to_server, from_client) = mpsc::unbounded_channel();

        let server_end = ServerEnd {
            token: token.to_string(),
            to_client,
            from_client,
        };
        self.accept_tx
            .send(server_end)
            .map_err(|_| StreamingError::Transport("loopback server is gone".to_string()))?;

        Ok(Box::new(LoopbackTransport {
            to_server,
            from_server,
        }))
    }
}

impl LoopbackServer {
    /// Wait for the next client connection.
    pub async fn accept(&mut self) -> Option<ServerEnd> {
        self.accept_rx.recv().await
    }
}

/// One accepted connection, seen from the server
pub struct ServerEnd {
    /// Credential the client presented
    pub token: String,
    to_client: ToClient,
    from_client: mpsc::UnboundedReceiver<WireFrame>,
}

impl ServerEnd {
    pub fn send(&self, frame: WireFrame) -> bool {
        self.to_client.send(Ok(frame)).is_ok()
    }

    pub fn send_json(&self, value: serde_json::Value) -> bool {
        self.send(WireFrame::Text(value.to_string()))
    }

    /// Complete the client's handshake.
    pub fn ready(&self, session_id: &str) -> bool {
        self.send_json(serde_json::json!({
            "type": "control",
            "seq": 0,
            "data": { "kind": "session_ready", "session_id": session_id }
        }))
    }

    /// Make the client's transport report `err`.
    pub fn fail(&self, err: StreamingError) -> bool {
        self.to_client.send(Err(err)).is_ok()
    }

    /// Next frame the client sent; `None` once the client closed.
    pub async fn recv(&mut self) -> Option<WireFrame> {
        self.from_client.recv().await
    }

    pub fn try_recv(&mut self) -> Option<WireFrame> {
        self.from_client.try_recv().ok()
    }
}

struct LoopbackTransport {
    to_server: mpsc::UnboundedSender<WireFrame>,
    from_server: mpsc::UnboundedReceiver<Result<WireFrame, StreamingError>>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&mut self, frame: WireFrame) -> Result<(), StreamingError> {
        self.to_server
            .send(frame)
            .map_err(|_| StreamingError::Transport("loopback peer closed".to_string()))
    }

    async fn recv(&mut self) -> Option<Result<WireFrame, StreamingError>> {
        self.from_server.recv().await
    }

    async fn close(&mut self) {
        self.from_server.close();
    }
}
