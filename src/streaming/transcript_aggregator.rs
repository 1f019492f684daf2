//! Transcript aggregation per speaker
//!
//! The service streams transcripts as non-final deltas followed by a final
//! message for each utterance.
//!
//! # Aggregation Strategy
//!
//! - **Deltas**: Appended to the speaker's current utterance
//! - **Final**: Replaces the accumulated text (authoritative from the service)
//!   and closes the utterance

use super::decoder::TranscriptDelta;
use super::protocol::Role;

/// A finished utterance, ready to hand to persistence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedUtterance {
    pub role: Role,
    pub text: String,
}

#[derive(Debug, Clone, Default)]
struct Utterance {
    partial_text: String,
    delta_count: u64,
}

/// Aggregates transcript deltas into utterances, one in flight per speaker
#[derive(Debug, Clone, Default)]
pub struct TranscriptAggregator {
    user: Utterance,
    assistant: Utterance,
    completed: u64,
}

impl TranscriptAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in one delta. Returns the utterance it completed, if any.
    pub fn process(&mut self, delta: &TranscriptDelta) -> Option<CompletedUtterance> {
        let utterance = self.utterance_mut(delta.role);

        if !delta.is_final {
            if !delta.text.is_empty() {
                utterance.partial_text.push_str(&delta.text);
                utterance.delta_count += 1;
            }
            return None;
        }

        let finished = std::mem::take(utterance);
        let text = if delta.text.is_empty() {
            finished.partial_text
        } else {
            delta.text.clone()
        };

        log::debug!(
            "TranscriptAggregator: {:?} utterance completed with {} chars ({} deltas)",
            delta.role,
            text.len(),
            finished.delta_count
        );
        self.completed += 1;

        let text = text.trim().to_string();
        if text.is_empty() {
            return None;
        }
        Some(CompletedUtterance {
            role: delta.role,
            text,
        })
    }

    /// Text of the speaker's utterance in progress
    pub fn current_text(&self, role: Role) -> &str {
        match role {
            Role::User => &self.user.partial_text,
            Role::Assistant => &self.assistant.partial_text,
        }
    }

    /// Drop the speaker's utterance in progress (e.g. an interrupted reply).
    pub fn discard(&mut self, role: Role) {
        *self.utterance_mut(role) = Utterance::default();
    }

    /// Utterances completed so far
    pub fn completed_count(&self) -> u64 {
        self.completed
    }

    fn utterance_mut(&mut self, role: Role) -> &mut Utterance {
        match role {
            Role::User => &mut self.user,
            Role::Assistant => &mut self.assistant,
        }
    }
}
