//! Inbound frame decoding
//!
//! Turns raw transport frames into typed events. Undecodable frames are counted
//! and reported as `MalformedFrame`; the caller logs and drops them.

use std::io::Cursor;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::protocol::{
    decode_audio_header, AudioChunkData, Codec, ControlData, Role, ServerMessage, WireFrame,
    KIND_SERVER_AUDIO,
};
use super::StreamingError;
use crate::audio::{sample_to_i16, AudioFormat};
use crate::metrics::SessionMetrics;

/// Partial or final transcript text
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptDelta {
    pub seq: u64,
    pub role: Role,
    pub text: String,
    pub is_final: bool,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmotionScore {
    pub name: String,
    pub score: f32,
}

/// Emotion scores for a stretch of speech, strongest first
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmotionInference {
    pub seq: u64,
    pub role: Role,
    pub scores: Vec<EmotionScore>,
}

impl EmotionInference {
    pub fn top(&self) -> Option<&EmotionScore> {
        self.scores.first()
    }
}

/// Decoded assistant audio
#[derive(Debug, Clone, PartialEq)]
pub struct AudioResponseChunk {
    pub seq: u64,
    pub turn_id: Option<String>,
    pub format: AudioFormat,
    /// Interleaved PCM16
    pub samples: Vec<i16>,
}

impl AudioResponseChunk {
    pub fn duration_ms(&self) -> u64 {
        self.format.duration_ms(self.samples.len())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlSignal {
    SessionReady { session_id: String },
    SpeechStarted,
    SpeechEnded,
    AssistantEnd { turn_id: Option<String> },
    Error { code: Option<String>, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    TranscriptDelta(TranscriptDelta),
    EmotionInference(EmotionInference),
    AudioResponseChunk(AudioResponseChunk),
    ControlSignal(ControlSignal),
}

pub struct InboundDecoder {
    /// Format assumed for Linear16 audio that does not name one
    default_format: AudioFormat,
    metrics: Arc<SessionMetrics>,
}

impl InboundDecoder {
    pub fn new(default_format: AudioFormat, metrics: Arc<SessionMetrics>) -> Self {
        Self {
            default_format,
            metrics,
        }
    }

    /// Decode one frame. `Ok(None)` means the frame carries no event
    /// (keepalives, message types this client does not handle).
    pub fn decode(&self, frame: WireFrame) -> Result<Option<InboundEvent>, StreamingError> {
        let result = match frame {
            WireFrame::Text(text) => self.decode_text(&text),
            WireFrame::Binary(bytes) => self.decode_binary(&bytes).map(Some),
            WireFrame::Ping(_) | WireFrame::Pong(_) => Ok(None),
        };
        if let Err(e) = &result {
            self.metrics.record_malformed(e.to_string());
        }
        result
    }

    fn decode_text(&self, text: &str) -> Result<Option<InboundEvent>, StreamingError> {
        let message: ServerMessage = serde_json::from_str(text)
            .map_err(|e| StreamingError::MalformedFrame(format!("invalid JSON: {}", e)))?;

        let event = match message {
            ServerMessage::Transcript { seq, data } => InboundEvent::TranscriptDelta(TranscriptDelta {
                seq,
                role: data.role,
                text: data.text,
                is_final: data.is_final,
                received_at: Utc::now(),
            }),
            ServerMessage::Emotion { seq, data } => {
                let mut scores: Vec<EmotionScore> = data
                    .scores
                    .into_iter()
                    .map(|(name, score)| EmotionScore { name, score })
                    .collect();
                scores.sort_by(|a, b| b.score.total_cmp(&a.score));
                InboundEvent::EmotionInference(EmotionInference {
                    seq,
                    role: data.role,
                    scores,
                })
            }
            ServerMessage::AudioChunk { seq, data } => {
                InboundEvent::AudioResponseChunk(self.decode_audio_chunk(seq, data)?)
            }
            ServerMessage::Control { data, .. } => match control_signal(data) {
                Some(signal) => InboundEvent::ControlSignal(signal),
                None => {
                    log::debug!("Decoder: ignoring unknown control kind");
                    return Ok(None);
                }
            },
            ServerMessage::Unknown => {
                log::debug!("Decoder: ignoring unknown message type");
                return Ok(None);
            }
        };
        Ok(Some(event))
    }

    fn decode_audio_chunk(
        &self,
        seq: u64,
        data: AudioChunkData,
    ) -> Result<AudioResponseChunk, StreamingError> {
        let bytes = STANDARD
            .decode(data.audio.as_bytes())
            .map_err(|e| StreamingError::MalformedFrame(format!("invalid base64 audio: {}", e)))?;

        let declared = AudioFormat::new(
            data.sample_rate.unwrap_or(self.default_format.sample_rate),
            data.channels.unwrap_or(self.default_format.channels),
        );
        let (format, samples) = decode_payload(data.codec, &bytes, declared)?;

        Ok(AudioResponseChunk {
            seq,
            turn_id: data.turn_id,
            format,
            samples,
        })
    }

    fn decode_binary(&self, bytes: &[u8]) -> Result<InboundEvent, StreamingError> {
        let (header, payload) = decode_audio_header(bytes)?;
        if header.kind != KIND_SERVER_AUDIO {
            return Err(StreamingError::MalformedFrame(format!(
                "unexpected binary frame kind {}",
                header.kind
            )));
        }

        let (format, samples) = decode_payload(header.codec, payload, self.default_format)?;
        Ok(InboundEvent::AudioResponseChunk(AudioResponseChunk {
            seq: header.seq,
            turn_id: None,
            format,
            samples,
        }))
    }
}

fn control_signal(data: ControlData) -> Option<ControlSignal> {
    Some(match data {
        ControlData::SessionReady { session_id } => ControlSignal::SessionReady { session_id },
        ControlData::SpeechStarted => ControlSignal::SpeechStarted,
        ControlData::SpeechEnded => ControlSignal::SpeechEnded,
        ControlData::AssistantEnd { turn_id } => ControlSignal::AssistantEnd { turn_id },
        ControlData::Error { code, message } => ControlSignal::Error { code, message },
        ControlData::Unknown => return None,
    })
}

/// Decode an audio payload. WAV carries its own format; Linear16 uses `declared`.
fn decode_payload(
    codec: Codec,
    bytes: &[u8],
    declared: AudioFormat,
) -> Result<(AudioFormat, Vec<i16>), StreamingError> {
    match codec {
        Codec::Linear16 => {
            if bytes.len() % 2 != 0 {
                return Err(StreamingError::MalformedFrame(format!(
                    "odd PCM16 payload length {}",
                    bytes.len()
                )));
            }
            let samples = bytes
                .chunks_exact(2)
                .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            Ok((declared, samples))
        }
        Codec::Wav => decode_wav(bytes),
    }
}

fn decode_wav(bytes: &[u8]) -> Result<(AudioFormat, Vec<i16>), StreamingError> {
    let malformed = |e: hound::Error| StreamingError::MalformedFrame(format!("invalid WAV: {}", e));

    let reader = hound::WavReader::new(Cursor::new(bytes)).map_err(malformed)?;
    let spec = reader.spec();
    let format = AudioFormat::new(spec.sample_rate, spec.channels);

    let samples = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Int, 16) => reader
            .into_samples::<i16>()
            .collect::<Result<Vec<_>, _>>()
            .map_err(malformed)?,
        (hound::SampleFormat::Float, 32) => reader
            .into_samples::<f32>()
            .map(|s| s.map(sample_to_i16))
            .collect::<Result<Vec<_>, _>>()
            .map_err(malformed)?,
        (sample_format, bits) => {
            return Err(StreamingError::MalformedFrame(format!(
                "unsupported WAV encoding {:?}/{} bits",
                sample_format, bits
            )))
        }
    };

    Ok((format, samples))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::protocol::{encode_audio_header, AudioHeader};

    fn decoder() -> (InboundDecoder, Arc<SessionMetrics>) {
        let metrics = Arc::new(SessionMetrics::new());
        (
            InboundDecoder::new(AudioFormat::new(24000, 1), metrics.clone()),
            metrics,
        )
    }

    fn wav_bytes(samples: &[i16], sample_rate: u32) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for &s in samples {
                writer.write_sample(s).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn test_transcript_event() {
        let (decoder, _) = decoder();
        let frame = WireFrame::Text(
            r#"{"type":"transcript","seq":2,"data":{"role":"assistant","text":"Hi there"}}"#.into(),
        );

        match decoder.decode(frame).unwrap() {
            Some(InboundEvent::TranscriptDelta(delta)) => {
                assert_eq!(delta.seq, 2);
                assert_eq!(delta.role, Role::Assistant);
                assert_eq!(delta.text, "Hi there");
                assert!(!delta.is_final);
            }
            other => panic!("expected transcript, got {:?}", other),
        }
    }

    #[test]
    fn test_emotion_scores_sorted() {
        let (decoder, _) = decoder();
        let frame = WireFrame::Text(
            r#"{"type":"emotion","seq":5,"data":{"scores":{"calm":0.2,"joy":0.7,"doubt":0.1}}}"#
                .into(),
        );

        match decoder.decode(frame).unwrap() {
            Some(InboundEvent::EmotionInference(emotion)) => {
                assert_eq!(emotion.role, Role::User);
                assert_eq!(emotion.top().unwrap().name, "joy");
                assert_eq!(emotion.scores.len(), 3);
            }
            other => panic!("expected emotion, got {:?}", other),
        }
    }

    #[test]
    fn test_json_audio_chunk_linear16() {
        let (decoder, _) = decoder();
        let payload = STANDARD.encode([0x34u8, 0x12, 0x78, 0x56]);
        let frame = WireFrame::Text(
            serde_json::json!({
                "type": "audio_chunk",
                "seq": 9,
                "data": {"codec": "linear16", "sample_rate": 16000, "turn_id": "t1", "audio": payload}
            })
            .to_string(),
        );

        match decoder.decode(frame).unwrap() {
            Some(InboundEvent::AudioResponseChunk(chunk)) => {
                assert_eq!(chunk.seq, 9);
                assert_eq!(chunk.turn_id.as_deref(), Some("t1"));
                assert_eq!(chunk.format, AudioFormat::new(16000, 1));
                assert_eq!(chunk.samples, vec![0x1234, 0x5678]);
            }
            other => panic!("expected audio, got {:?}", other),
        }
    }

    #[test]
    fn test_json_audio_chunk_wav() {
        let (decoder, _) = decoder();
        let payload = STANDARD.encode(wav_bytes(&[1, -2, 3], 44100));
        let frame = WireFrame::Text(
            serde_json::json!({
                "type": "audio_chunk",
                "seq": 0,
                "data": {"codec": "wav", "audio": payload}
            })
            .to_string(),
        );

        match decoder.decode(frame).unwrap() {
            Some(InboundEvent::AudioResponseChunk(chunk)) => {
                assert_eq!(chunk.format, AudioFormat::new(44100, 1));
                assert_eq!(chunk.samples, vec![1, -2, 3]);
            }
            other => panic!("expected audio, got {:?}", other),
        }
    }

    #[test]
    fn test_binary_audio_frame() {
        let (decoder, _) = decoder();
        let mut bytes = encode_audio_header(&AudioHeader {
            kind: KIND_SERVER_AUDIO,
            codec: Codec::Linear16,
            duration_ms: 0,
            seq: 42,
        })
        .to_vec();
        bytes.extend_from_slice(&[0x01, 0x00, 0xff, 0xff]);

        match decoder.decode(WireFrame::Binary(bytes)).unwrap() {
            Some(InboundEvent::AudioResponseChunk(chunk)) => {
                assert_eq!(chunk.seq, 42);
                assert_eq!(chunk.samples, vec![1, -1]);
                assert_eq!(chunk.format, AudioFormat::new(24000, 1));
            }
            other => panic!("expected audio, got {:?}", other),
        }
    }

    #[test]
    fn test_control_signals() {
        let (decoder, _) = decoder();
        let frame = WireFrame::Text(
            r#"{"type":"control","seq":3,"data":{"kind":"assistant_end","turn_id":"t7"}}"#.into(),
        );
        assert_eq!(
            decoder.decode(frame).unwrap(),
            Some(InboundEvent::ControlSignal(ControlSignal::AssistantEnd {
                turn_id: Some("t7".into())
            }))
        );
    }

    #[test]
    fn test_malformed_frames_are_counted() {
        let (decoder, metrics) = decoder();

        assert!(decoder.decode(WireFrame::Text("{not json".into())).is_err());
        assert!(decoder.decode(WireFrame::Binary(vec![2, 1])).is_err());

        let odd = STANDARD.encode([1u8, 2, 3]);
        let frame = WireFrame::Text(
            serde_json::json!({"type":"audio_chunk","seq":1,"data":{"codec":"linear16","audio":odd}})
                .to_string(),
        );
        assert!(matches!(
            decoder.decode(frame),
            Err(StreamingError::MalformedFrame(_))
        ));

        assert_eq!(metrics.malformed_frames(), 3);
    }

    #[test]
    fn test_keepalives_and_unknown_types_produce_nothing() {
        let (decoder, metrics) = decoder();
        assert_eq!(decoder.decode(WireFrame::Ping(vec![])).unwrap(), None);
        assert_eq!(
            decoder
                .decode(WireFrame::Text(r#"{"type":"future","seq":1}"#.into()))
                .unwrap(),
            None
        );
        assert_eq!(metrics.malformed_frames(), 0);
    }
}
