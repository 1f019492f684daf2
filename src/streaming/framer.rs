//! Outbound framing
//!
//! Accumulates converted PCM16 samples and cuts them into fixed-duration chunks,
//! each stamped with the next audio sequence number.
//!
//! # Sizing
//!
//! At 24kHz mono PCM16 with 100ms chunks:
//! - Chunk size: 2400 samples × 2 bytes = 4,800 bytes
//! - 50 queued chunks ≈ 240 KB of outbound audio

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::protocol::{ControlFrame, ControlKind, EncodedChunk};
use crate::audio::AudioFormat;

/// Control channel counter, shared by the framer and the connection driver so
/// `session_resume` and framer controls draw from one sequence.
#[derive(Debug, Clone, Default)]
pub struct ControlSequence(Arc<AtomicU64>);

impl ControlSequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next number
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// Number the next control frame will carry
    pub fn peek(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Cuts a continuous sample stream into sequenced chunks
#[derive(Debug)]
pub struct OutboundFramer {
    format: AudioFormat,
    samples_per_chunk: usize,
    pending: Vec<i16>,
    next_audio_seq: u64,
    control_seq: ControlSequence,
}

impl OutboundFramer {
    /// Create a framer for `format` audio cut into `chunk_duration_ms` chunks
    pub fn new(format: AudioFormat, chunk_duration_ms: u32) -> Self {
        let samples_per_chunk = format.samples_for_ms(chunk_duration_ms).max(1);
        Self {
            format,
            samples_per_chunk,
            pending: Vec::with_capacity(samples_per_chunk),
            next_audio_seq: 0,
            control_seq: ControlSequence::new(),
        }
    }

    /// Number control frames from `control_seq` instead of a private counter.
    pub fn with_control_sequence(mut self, control_seq: ControlSequence) -> Self {
        self.control_seq = control_seq;
        self
    }

    /// Add converted samples; returns every chunk that is now complete.
    pub fn push_audio(&mut self, samples: &[i16]) -> Vec<EncodedChunk> {
        self.pending.extend_from_slice(samples);

        let mut chunks = Vec::new();
        while self.pending.len() >= self.samples_per_chunk {
            let rest = self.pending.split_off(self.samples_per_chunk);
            let full = std::mem::replace(&mut self.pending, rest);
            chunks.push(self.stamp(&full));
        }
        chunks
    }

    /// Emit whatever is buffered as a short final chunk.
    pub fn flush_partial(&mut self) -> Option<EncodedChunk> {
        if self.pending.is_empty() {
            return None;
        }
        let partial = std::mem::take(&mut self.pending);
        Some(self.stamp(&partial))
    }

    /// Sequence a control message on the control channel.
    pub fn control(&mut self, kind: ControlKind) -> ControlFrame {
        ControlFrame {
            seq: self.control_seq.next(),
            kind,
        }
    }

    /// Drop buffered samples without consuming a sequence number.
    ///
    /// Returns the number of samples discarded.
    pub fn discard_pending(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    /// Sequence number the next audio chunk will carry
    pub fn next_sequence(&self) -> u64 {
        self.next_audio_seq
    }

    pub fn buffered_samples(&self) -> usize {
        self.pending.len()
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    fn stamp(&mut self, samples: &[i16]) -> EncodedChunk {
        let seq = self.next_audio_seq;
        self.next_audio_seq += 1;
        EncodedChunk::linear16(seq, samples, self.format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framer() -> OutboundFramer {
        OutboundFramer::new(AudioFormat::new(24000, 1), 100)
    }

    #[test]
    fn test_exact_chunks_get_consecutive_sequences() {
        let mut framer = framer();
        let mut seqs = Vec::new();
        for _ in 0..10 {
            let chunks = framer.push_audio(&vec![0i16; 2400]);
            assert_eq!(chunks.len(), 1);
            assert_eq!(chunks[0].duration_ms, 100);
            assert_eq!(chunks[0].payload.len(), 4800);
            seqs.push(chunks[0].seq);
        }
        assert_eq!(seqs, (0..10).collect::<Vec<u64>>());
    }

    #[test]
    fn test_accumulates_partial_input() {
        let mut framer = framer();
        assert!(framer.push_audio(&vec![1i16; 1000]).is_empty());
        assert!(framer.push_audio(&vec![1i16; 1000]).is_empty());

        let chunks = framer.push_audio(&vec![1i16; 3000]);
        assert_eq!(chunks.len(), 2);
        assert_eq!(framer.buffered_samples(), 200);

        let tail = framer.flush_partial().unwrap();
        assert_eq!(tail.seq, 2);
        assert_eq!(tail.payload.len(), 400);
        assert!(framer.flush_partial().is_none());
    }

    #[test]
    fn test_discard_does_not_consume_sequence() {
        let mut framer = framer();
        framer.push_audio(&vec![0i16; 2400]);
        framer.push_audio(&vec![0i16; 1200]);

        assert_eq!(framer.discard_pending(), 1200);
        assert_eq!(framer.next_sequence(), 1);

        let chunks = framer.push_audio(&vec![0i16; 2400]);
        assert_eq!(chunks[0].seq, 1);
    }

    #[test]
    fn test_control_frames_do_not_disturb_audio_numbering() {
        let mut framer = framer();
        let start = framer.control(ControlKind::SessionEnd);
        let a = framer.push_audio(&vec![0i16; 2400]);
        let boundary = framer.control(ControlKind::TurnBoundary);
        let b = framer.push_audio(&vec![0i16; 2400]);

        assert_eq!(start.seq, 0);
        assert_eq!(boundary.seq, 1);
        assert_eq!(a[0].seq, 0);
        assert_eq!(b[0].seq, 1);
    }

    #[test]
    fn test_shared_control_sequence_is_continued() {
        let shared = ControlSequence::new();
        let mut framer = framer().with_control_sequence(shared.clone());

        assert_eq!(framer.control(ControlKind::SessionEnd).seq, 0);
        // Another holder of the counter takes 1
        assert_eq!(shared.next(), 1);
        assert_eq!(framer.control(ControlKind::TurnBoundary).seq, 2);
        assert_eq!(shared.peek(), 3);
    }

    #[test]
    fn test_sequence_strictly_increasing_with_uneven_input() {
        let mut framer = framer();
        let mut last = None;
        for size in [100usize, 5000, 17, 2383, 9600, 1] {
            for chunk in framer.push_audio(&vec![0i16; size]) {
                if let Some(prev) = last {
                    assert_eq!(chunk.seq, prev + 1);
                }
                last = Some(chunk.seq);
            }
        }
        assert!(last.is_some());
    }
}
