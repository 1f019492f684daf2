//! Diagnostics counters for a voice session
//!
//! Counters are lock-free atomics so the audio and network tasks can bump them
//! without coordinating. Recent errors are kept in a short bounded history.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Maximum number of errors to retain in history
const MAX_ERROR_HISTORY: usize = 20;

/// Sentinel for "nothing sent yet"
const NO_SEQ: u64 = u64::MAX;

/// Record of an error that occurred during a session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorRecord {
    /// Unix timestamp when error occurred (seconds)
    pub timestamp: u64,
    /// Category of error (e.g., "audio", "transport", "decode")
    pub error_type: String,
    /// Human-readable error message
    pub message: String,
}

/// Point-in-time copy of every counter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub session_id: String,
    pub frames_sent: u64,
    /// Sequence number of the last audio chunk handed to the transport
    pub last_sent_seq: Option<u64>,
    pub reconnects: u64,
    pub malformed_frames: u64,
    pub late_chunks: u64,
    pub duplicate_chunks: u64,
    /// Assistant chunks refused for being too far ahead of playback
    pub out_of_window_chunks: u64,
    pub gaps_skipped: u64,
    /// Capture frames dropped while outbound audio was paused
    pub paused_frames_dropped: u64,
    pub backpressure_events: u64,
    /// Assistant chunks discarded because their turn was interrupted
    pub discarded_chunks: u64,
    pub last_error: Option<ErrorRecord>,
}

/// Shared counters for one session
pub struct SessionMetrics {
    session_id: Uuid,
    frames_sent: AtomicU64,
    last_sent_seq: AtomicU64,
    reconnects: AtomicU64,
    malformed_frames: AtomicU64,
    late_chunks: AtomicU64,
    duplicate_chunks: AtomicU64,
    out_of_window_chunks: AtomicU64,
    gaps_skipped: AtomicU64,
    paused_frames_dropped: AtomicU64,
    backpressure_events: AtomicU64,
    discarded_chunks: AtomicU64,
    /// Newest first
    errors: Mutex<VecDeque<ErrorRecord>>,
}

impl SessionMetrics {
    pub fn new() -> Self {
        Self {
            session_id: Uuid::new_v4(),
            frames_sent: AtomicU64::new(0),
            last_sent_seq: AtomicU64::new(NO_SEQ),
            reconnects: AtomicU64::new(0),
            malformed_frames: AtomicU64::new(0),
            late_chunks: AtomicU64::new(0),
            duplicate_chunks: AtomicU64::new(0),
            out_of_window_chunks: AtomicU64::new(0),
            gaps_skipped: AtomicU64::new(0),
            paused_frames_dropped: AtomicU64::new(0),
            backpressure_events: AtomicU64::new(0),
            discarded_chunks: AtomicU64::new(0),
            errors: Mutex::new(VecDeque::with_capacity(MAX_ERROR_HISTORY)),
        }
    }

    /// Local identifier used to correlate log lines for one session
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// A frame reached the transport. Only audio frames move `last_sent_seq`.
    pub fn record_sent(&self, audio_seq: Option<u64>) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        if let Some(seq) = audio_seq {
            self.last_sent_seq.store(seq, Ordering::Relaxed);
        }
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn last_sent_seq(&self) -> Option<u64> {
        match self.last_sent_seq.load(Ordering::Relaxed) {
            NO_SEQ => None,
            seq => Some(seq),
        }
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub fn record_malformed(&self, message: String) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
        self.record_error("decode", message);
    }

    pub fn malformed_frames(&self) -> u64 {
        self.malformed_frames.load(Ordering::Relaxed)
    }

    pub fn record_late_chunk(&self) {
        self.late_chunks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate_chunk(&self) {
        self.duplicate_chunks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_out_of_window_chunk(&self) {
        self.out_of_window_chunks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_gap(&self, missing: u64) {
        self.gaps_skipped.fetch_add(missing, Ordering::Relaxed);
    }

    pub fn gaps_skipped(&self) -> u64 {
        self.gaps_skipped.load(Ordering::Relaxed)
    }

    pub fn record_paused_drop(&self) {
        self.paused_frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_backpressure(&self) {
        self.backpressure_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discarded_chunk(&self) {
        self.discarded_chunks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn discarded_chunks(&self) -> u64 {
        self.discarded_chunks.load(Ordering::Relaxed)
    }

    /// Record an error (keeps last MAX_ERROR_HISTORY errors)
    pub fn record_error(&self, error_type: &str, message: String) {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        log::debug!("Metrics: recording {} error: {}", error_type, message);

        let record = ErrorRecord {
            timestamp,
            error_type: error_type.to_string(),
            message,
        };

        if let Ok(mut errors) = self.errors.lock() {
            errors.push_front(record);
            errors.truncate(MAX_ERROR_HISTORY);
        }
    }

    /// Recent errors, newest first
    pub fn errors(&self) -> Vec<ErrorRecord> {
        self.errors
            .lock()
            .map(|errors| errors.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            session_id: self.session_id.to_string(),
            frames_sent: self.frames_sent(),
            last_sent_seq: self.last_sent_seq(),
            reconnects: self.reconnects(),
            malformed_frames: self.malformed_frames(),
            late_chunks: self.late_chunks.load(Ordering::Relaxed),
            duplicate_chunks: self.duplicate_chunks.load(Ordering::Relaxed),
            out_of_window_chunks: self.out_of_window_chunks.load(Ordering::Relaxed),
            gaps_skipped: self.gaps_skipped(),
            paused_frames_dropped: self.paused_frames_dropped.load(Ordering::Relaxed),
            backpressure_events: self.backpressure_events.load(Ordering::Relaxed),
            discarded_chunks: self.discarded_chunks(),
            last_error: self.errors.lock().ok().and_then(|e| e.front().cloned()),
        }
    }
}

impl Default for SessionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_metrics_are_empty() {
        let metrics = SessionMetrics::new();
        let summary = metrics.summary();

        assert_eq!(summary.frames_sent, 0);
        assert_eq!(summary.last_sent_seq, None);
        assert_eq!(summary.reconnects, 0);
        assert!(summary.last_error.is_none());
    }

    #[test]
    fn test_control_frames_do_not_move_last_sent_seq() {
        let metrics = SessionMetrics::new();
        metrics.record_sent(Some(4));
        metrics.record_sent(None);

        assert_eq!(metrics.frames_sent(), 2);
        assert_eq!(metrics.last_sent_seq(), Some(4));
    }

    #[test]
    fn test_malformed_frames_are_counted_and_recorded() {
        let metrics = SessionMetrics::new();
        metrics.record_malformed("bad json".to_string());

        assert_eq!(metrics.malformed_frames(), 1);
        let last = metrics.summary().last_error.unwrap();
        assert_eq!(last.error_type, "decode");
        assert_eq!(last.message, "bad json");
    }

    #[test]
    fn test_error_history_limit() {
        let metrics = SessionMetrics::new();
        for i in 0..(MAX_ERROR_HISTORY + 5) {
            metrics.record_error("transport", format!("error {}", i));
        }

        let errors = metrics.errors();
        assert_eq!(errors.len(), MAX_ERROR_HISTORY);
        // Newest first
        assert_eq!(errors[0].message, format!("error {}", MAX_ERROR_HISTORY + 4));
    }

    #[test]
    fn test_summary_serializes() {
        let metrics = SessionMetrics::new();
        metrics.record_gap(3);
        let json = serde_json::to_string(&metrics.summary()).unwrap();
        assert!(json.contains("\"gaps_skipped\":3"));
    }
}
