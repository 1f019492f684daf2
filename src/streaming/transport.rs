//! Transport seam between the connection manager and the network
//!
//! `WsConnector` speaks WebSocket through tokio-tungstenite. Tests and offline
//! runs use the in-process loopback transport instead.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        self,
        client::IntoClientRequest,
        http::HeaderValue,
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};

use super::protocol::WireFrame;
use super::StreamingError;

/// An established, bidirectional frame transport
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, frame: WireFrame) -> Result<(), StreamingError>;

    /// Next inbound frame; `None` once the peer closed cleanly.
    ///
    /// Must be cancel-safe: the driver polls it inside `select!`.
    async fn recv(&mut self) -> Option<Result<WireFrame, StreamingError>>;

    async fn close(&mut self);
}

/// Opens transports to the service
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, token: &str) -> Result<Box<dyn Transport>, StreamingError>;
}

/// Connects over WebSocket with a bearer token
pub struct WsConnector {
    url: String,
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, token: &str) -> Result<Box<dyn Transport>, StreamingError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| StreamingError::Transport(e.to_string()))?;

        request.headers_mut().insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| StreamingError::Auth(e.to_string()))?,
        );

        log::info!("Transport: connecting to {}", self.url);

        let (ws, _response) = timeout(
            self.connect_timeout,
            connect_async_with_config(request, None, true), // disable Nagle for latency
        )
        .await
        .map_err(|_| StreamingError::Transport("connection timeout".to_string()))?
        .map_err(classify_ws_error)?;

        log::info!("Transport: WebSocket connected");

        Ok(Box::new(WsTransport { ws }))
    }
}

/// Upgrade rejections with 401/403 mean the credentials are bad; everything
/// else is worth retrying.
fn classify_ws_error(err: tungstenite::Error) -> StreamingError {
    match err {
        tungstenite::Error::Http(response)
            if response.status().as_u16() == 401 || response.status().as_u16() == 403 =>
        {
            StreamingError::Auth(format!("server rejected credentials ({})", response.status()))
        }
        other => StreamingError::Transport(other.to_string()),
    }
}

struct WsTransport {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, frame: WireFrame) -> Result<(), StreamingError> {
        let message = match frame {
            WireFrame::Text(text) => Message::Text(text),
            WireFrame::Binary(bytes) => Message::Binary(bytes),
            WireFrame::Ping(payload) => Message::Ping(payload),
            WireFrame::Pong(payload) => Message::Pong(payload),
        };
        self.ws
            .send(message)
            .await
            .map_err(|e| StreamingError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<WireFrame, StreamingError>> {
        loop {
            let message = match self.ws.next().await? {
                Ok(message) => message,
                Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                    return None
                }
                Err(e) => return Some(Err(StreamingError::Transport(e.to_string()))),
            };

            return match message {
                Message::Text(text) => Some(Ok(WireFrame::Text(text))),
                Message::Binary(bytes) => Some(Ok(WireFrame::Binary(bytes))),
                // tungstenite answers pings on its own
                Message::Ping(payload) => Some(Ok(WireFrame::Ping(payload))),
                Message::Pong(payload) => Some(Ok(WireFrame::Pong(payload))),
                Message::Close(frame) => close_outcome(frame),
                Message::Frame(_) => continue,
            };
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.ws.close(None).await {
            log::debug!("Transport: error closing WebSocket: {}", e);
        }
    }
}

/// A normal close ends the session; any other close code is a dropped
/// connection that should be retried.
fn close_outcome(frame: Option<CloseFrame<'static>>) -> Option<Result<WireFrame, StreamingError>> {
    match frame {
        None => {
            log::info!("Transport: closed by server");
            None
        }
        Some(frame) if frame.code == CloseCode::Normal => {
            log::info!("Transport: closed by server ({})", frame.reason);
            None
        }
        Some(frame) => Some(Err(StreamingError::Transport(format!(
            "closed by server: {} {}",
            u16::from(frame.code),
            frame.reason
        )))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::http::Response;

    #[test]
    fn test_http_401_is_auth() {
        let response = Response::builder().status(401).body(None).unwrap();
        let err = classify_ws_error(tungstenite::Error::Http(response));
        assert!(matches!(err, StreamingError::Auth(_)));
    }

    #[test]
    fn test_http_503_is_transport() {
        let response = Response::builder().status(503).body(None).unwrap();
        let err = classify_ws_error(tungstenite::Error::Http(response));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_close_codes() {
        assert!(close_outcome(None).is_none());

        let normal = CloseFrame {
            code: CloseCode::Normal,
            reason: "bye".into(),
        };
        assert!(close_outcome(Some(normal)).is_none());

        let away = CloseFrame {
            code: CloseCode::Away,
            reason: "restarting".into(),
        };
        assert!(matches!(
            close_outcome(Some(away)),
            Some(Err(StreamingError::Transport(_)))
        ));
    }
}
