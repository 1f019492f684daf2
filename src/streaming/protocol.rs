//! Wire protocol for the voice service
//!
//! # Frame layout
//!
//! - Text frames carry JSON. Outbound control messages look like
//!   `{"type":"control","seq":3,"payload":{"kind":"interruption"}}`; inbound
//!   events look like `{"type":"transcript","seq":12,"data":{...}}`.
//! - Binary frames carry audio behind a 12-byte big-endian header:
//!
//! ```text
//! [kind u8][codec u8][duration_ms u16][seq u64][payload ...]
//! ```
//!
//! `kind` is 1 for client audio and 2 for server audio. Audio and control
//! travel on separate channels (binary vs text), each with its own sequence
//! counter.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::StreamingError;
use crate::audio::AudioFormat;

/// Size of the binary audio header
pub const AUDIO_HEADER_LEN: usize = 12;

/// Header `kind` for audio sent by the client
pub const KIND_CLIENT_AUDIO: u8 = 1;

/// Header `kind` for audio sent by the server
pub const KIND_SERVER_AUDIO: u8 = 2;

/// A frame as it travels over the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
}

/// Audio payload encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    /// Raw PCM16, little-endian, interleaved
    Linear16,
    /// RIFF/WAV container
    Wav,
}

impl Codec {
    pub fn id(self) -> u8 {
        match self {
            Codec::Linear16 => 1,
            Codec::Wav => 2,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(Codec::Linear16),
            2 => Some(Codec::Wav),
            _ => None,
        }
    }
}

/// Speaker a transcript belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

// ============================================================================
// Outbound (sent TO the service)
// ============================================================================

/// One chunk of outbound audio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    pub seq: u64,
    pub codec: Codec,
    pub duration_ms: u32,
    pub payload: Vec<u8>,
}

impl EncodedChunk {
    /// Encode PCM16 samples as a Linear16 chunk.
    pub fn linear16(seq: u64, samples: &[i16], format: AudioFormat) -> Self {
        let payload: Vec<u8> = samples.iter().flat_map(|&s| s.to_le_bytes()).collect();
        Self {
            seq,
            codec: Codec::Linear16,
            duration_ms: format.duration_ms(samples.len()) as u32,
            payload,
        }
    }

    /// Header plus payload, ready for a binary frame
    pub fn to_binary(&self) -> Vec<u8> {
        let header = encode_audio_header(&AudioHeader {
            kind: KIND_CLIENT_AUDIO,
            codec: self.codec,
            duration_ms: u16::try_from(self.duration_ms).unwrap_or(u16::MAX),
            seq: self.seq,
        });
        let mut bytes = Vec::with_capacity(AUDIO_HEADER_LEN + self.payload.len());
        bytes.extend_from_slice(&header);
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

/// Control message kinds sent by the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlKind {
    /// Opens the conversation and announces the outbound audio format
    SessionStart {
        sample_rate: u32,
        channels: u16,
        codec: Codec,
    },
    /// Sent after a reconnect; `next_seq` is the first audio chunk the
    /// client will send on the new connection
    SessionResume {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        next_seq: u64,
    },
    SessionEnd,
    /// The local side believes the user finished an utterance
    TurnBoundary,
    /// The user barged in; the service should stop the current response
    Interruption,
}

/// A sequenced control message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlFrame {
    pub seq: u64,
    pub kind: ControlKind,
}

#[derive(Serialize)]
struct OutboundControl<'a> {
    #[serde(rename = "type")]
    message_type: &'static str,
    seq: u64,
    payload: &'a ControlKind,
}

impl ControlFrame {
    pub fn to_json(&self) -> Result<String, StreamingError> {
        serde_json::to_string(&OutboundControl {
            message_type: "control",
            seq: self.seq,
            payload: &self.kind,
        })
        .map_err(|e| StreamingError::MalformedFrame(e.to_string()))
    }
}

/// Anything the connection sends on behalf of the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Audio(EncodedChunk),
    Control(ControlFrame),
}

impl OutboundFrame {
    pub fn seq(&self) -> u64 {
        match self {
            OutboundFrame::Audio(chunk) => chunk.seq,
            OutboundFrame::Control(control) => control.seq,
        }
    }

    pub fn is_audio(&self) -> bool {
        matches!(self, OutboundFrame::Audio(_))
    }

    pub fn to_wire(&self) -> Result<WireFrame, StreamingError> {
        match self {
            OutboundFrame::Audio(chunk) => Ok(WireFrame::Binary(chunk.to_binary())),
            OutboundFrame::Control(control) => control.to_json().map(WireFrame::Text),
        }
    }
}

/// Decoded binary audio header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioHeader {
    pub kind: u8,
    pub codec: Codec,
    pub duration_ms: u16,
    pub seq: u64,
}

pub fn encode_audio_header(header: &AudioHeader) -> [u8; AUDIO_HEADER_LEN] {
    let mut bytes = [0u8; AUDIO_HEADER_LEN];
    bytes[0] = header.kind;
    bytes[1] = header.codec.id();
    bytes[2..4].copy_from_slice(&header.duration_ms.to_be_bytes());
    bytes[4..12].copy_from_slice(&header.seq.to_be_bytes());
    bytes
}

/// Split a binary frame into its header and payload.
pub fn decode_audio_header(bytes: &[u8]) -> Result<(AudioHeader, &[u8]), StreamingError> {
    if bytes.len() < AUDIO_HEADER_LEN {
        return Err(StreamingError::MalformedFrame(format!(
            "binary frame of {} bytes is shorter than the header",
            bytes.len()
        )));
    }

    let codec = Codec::from_id(bytes[1])
        .ok_or_else(|| StreamingError::MalformedFrame(format!("unknown codec id {}", bytes[1])))?;

    let mut seq = [0u8; 8];
    seq.copy_from_slice(&bytes[4..12]);

    let header = AudioHeader {
        kind: bytes[0],
        codec,
        duration_ms: u16::from_be_bytes([bytes[2], bytes[3]]),
        seq: u64::from_be_bytes(seq),
    };
    Ok((header, &bytes[AUDIO_HEADER_LEN..]))
}

// ============================================================================
// Inbound (received FROM the service)
// ============================================================================

/// Text messages received from the service
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Transcript { seq: u64, data: TranscriptData },

    Emotion { seq: u64, data: EmotionData },

    AudioChunk { seq: u64, data: AudioChunkData },

    Control { seq: u64, data: ControlData },

    /// Catch-all for message types we don't handle
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptData {
    pub role: Role,
    pub text: String,
    #[serde(rename = "final", default)]
    pub is_final: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmotionData {
    #[serde(default = "default_emotion_role")]
    pub role: Role,
    /// Emotion name to score in `0.0..=1.0`
    pub scores: BTreeMap<String, f32>,
}

fn default_emotion_role() -> Role {
    Role::User
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioChunkData {
    pub codec: Codec,
    #[serde(default)]
    pub sample_rate: Option<u32>,
    #[serde(default)]
    pub channels: Option<u16>,
    #[serde(default)]
    pub turn_id: Option<String>,
    /// Base64 payload
    pub audio: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlData {
    SessionReady {
        session_id: String,
    },
    SpeechStarted,
    SpeechEnded,
    AssistantEnd {
        #[serde(default)]
        turn_id: Option<String>,
    },
    Error {
        #[serde(default)]
        code: Option<String>,
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Unknown,
}

/// Error codes the service uses for rejected credentials
pub fn is_auth_error_code(code: &str) -> bool {
    matches!(
        code,
        "unauthorized" | "forbidden" | "invalid_api_key" | "invalid_credentials" | "token_expired"
    )
}
