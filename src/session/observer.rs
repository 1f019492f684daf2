//! Persistence hooks
//!
//! Callbacks run on the session supervisor, so implementations must return
//! quickly. Hand work off to a channel or a blocking task if it touches disk.

use super::SessionState;
use crate::state_machine::TurnState;
use crate::streaming::{EmotionInference, Role, TranscriptDelta};

pub trait SessionObserver: Send + Sync {
    /// Every transcript delta, partial or final
    fn on_transcript(&self, _delta: &TranscriptDelta) {}

    /// A speaker finished an utterance
    fn on_utterance(&self, _role: Role, _text: &str) {}

    fn on_emotion(&self, _inference: &EmotionInference) {}

    fn on_turn_changed(&self, _turn: TurnState) {}

    /// `reason` is set when the session failed
    fn on_session_state(&self, _state: SessionState, _reason: Option<&str>) {}
}

/// Observer that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl SessionObserver for NoopObserver {}
