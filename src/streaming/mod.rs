//! Streaming connection to the remote voice service
//!
//! # Architecture
//!
//! ```text
//!  converted PCM16 ──▶ OutboundFramer ──▶ FrameSender ──▶ ConnectionManager ──▶ Transport
//!                                          (bounded)        (driver task)        (WebSocket)
//!                                                                │
//!                                                                ▼
//!  audio sink ◀── PlaybackBuffer ◀── InboundDecoder ◀──── inbound frames
//! ```
//!
//! # Failure handling
//!
//! - Transport errors are retried with exponential backoff and jitter
//! - Authentication failures are fatal and never retried
//! - Malformed inbound frames are counted and dropped; the session continues

mod connection;
mod decoder;
mod framer;
mod loopback;
mod playback_buffer;
mod protocol;
mod transcript_aggregator;
mod transport;

pub use connection::{BackoffPolicy, ConnectionConfig, ConnectionManager, ConnectionState, FrameSender};
pub use decoder::{
    AudioResponseChunk, ControlSignal, EmotionInference, EmotionScore, InboundDecoder, InboundEvent,
    TranscriptDelta,
};
pub use framer::{ControlSequence, OutboundFramer};
pub use loopback::{loopback, LoopbackConnector, LoopbackServer, ServerEnd};
pub use playback_buffer::{PlaybackBuffer, PlaybackConfig, PlaybackItem, PushOutcome};
pub use protocol::{
    decode_audio_header, is_auth_error_code, AudioHeader, Codec, ControlFrame, ControlKind,
    EncodedChunk, OutboundFrame, Role, ServerMessage, WireFrame, AUDIO_HEADER_LEN,
};
pub use transcript_aggregator::{CompletedUtterance, TranscriptAggregator};
pub use transport::{Connector, Transport, WsConnector};

use thiserror::Error;

/// Errors from the streaming layer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamingError {
    /// Network or protocol failure; worth reconnecting
    #[error("transport error: {0}")]
    Transport(String),
    /// Credentials rejected; reconnecting will not help
    #[error("authentication failed: {0}")]
    Auth(String),
    /// Inbound frame could not be decoded
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    /// The connection was closed locally or the session ended
    #[error("connection closed")]
    Closed,
}

impl StreamingError {
    /// Whether reconnecting could recover from this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, StreamingError::Transport(_))
    }
}

impl From<crate::credentials::CredentialError> for StreamingError {
    fn from(err: crate::credentials::CredentialError) -> Self {
        StreamingError::Auth(err.to_string())
    }
}
