//! Turn-taking state machine for duplex-voice
//!
//! This module decides who holds the floor, the user or the assistant, using a
//! single-writer pattern. All transitions go through the `reduce()` function,
//! which returns a new state and a list of effects to execute.
//!
//! Barge-in: user speech while the assistant is speaking moves through
//! `Interrupted` and lands in `UserSpeaking` within the same processing step
//! (see `advance()`). The interrupted reply's turn id is remembered so late
//! audio from that reply is discarded instead of restarting playback.
//!
//! The assistant keeps the floor after the service finishes sending a reply
//! until its audio has drained from the playback buffer and the device, so
//! speech during that tail still interrupts it.

use serde::Serialize;

/// Who holds the floor, as observed by the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Idle,
    UserSpeaking,
    AssistantSpeaking,
    Interrupted,
    Closed,
}

/// Internal state of the turn machine.
/// This is the authoritative state - all transitions go through the reducer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    Idle {
        /// Reply the user cut off; its remaining audio is dropped
        cancelled_turn: Option<String>,
    },
    UserSpeaking {
        cancelled_turn: Option<String>,
    },
    AssistantSpeaking {
        turn_id: Option<String>,
        /// The service finished sending; waiting for playback to drain
        reply_sent: bool,
    },
    /// Transient: always resolved to `UserSpeaking` in the same step
    Interrupted {
        turn_id: Option<String>,
    },
    Closed,
}

impl Default for State {
    fn default() -> Self {
        State::Idle {
            cancelled_turn: None,
        }
    }
}

impl State {
    pub fn turn_state(&self) -> TurnState {
        match self {
            State::Idle { .. } => TurnState::Idle,
            State::UserSpeaking { .. } => TurnState::UserSpeaking,
            State::AssistantSpeaking { .. } => TurnState::AssistantSpeaking,
            State::Interrupted { .. } => TurnState::Interrupted,
            State::Closed => TurnState::Closed,
        }
    }
}

/// Events that can trigger turn transitions.
/// Sent by the session supervisor from decoded server events and user commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Remote VAD onset, or the first user transcript delta
    UserSpeechStarted,
    /// Remote end-of-utterance, or a final user transcript
    UserUtteranceEnded,
    /// An assistant audio chunk arrived
    AssistantAudio { turn_id: Option<String> },
    /// The service finished sending its reply
    AssistantTurnEnded { turn_id: Option<String> },
    /// Nothing is left to play, buffered or queued on the device
    PlaybackDrained,
    /// The local user asked to interrupt the assistant
    InterruptRequested,
    /// Internal: completes a barge-in
    InterruptionResolved,
    /// Session is stopping or the connection failed
    Close,
}

/// Effects to be executed after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Hand the chunk that triggered this event to the playback buffer
    EnqueuePlayback,
    /// Drop the chunk that triggered this event
    DiscardAudio,
    /// Clear the playback buffer and the output device queue
    FlushPlayback,
    /// Tell the service the user barged in
    SendInterruption,
    /// Tell the service the user finished speaking
    SendTurnBoundary,
    /// Publish the new turn state
    EmitState,
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - UserSpeaking and AssistantSpeaking are never both true
/// - Always emit EmitState after the turn state changes
pub fn reduce(state: &State, event: Event) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;
    use State::*;

    match (state, event) {
        // -----------------
        // Closed absorbs everything
        // -----------------
        (Closed, AssistantAudio { .. }) => (Closed, vec![DiscardAudio]),
        (Closed, _) => (Closed, vec![]),
        (_, Close) => (Closed, vec![FlushPlayback, EmitState]),

        // -----------------
        // Idle
        // -----------------
        (Idle { cancelled_turn }, UserSpeechStarted) => (
            UserSpeaking {
                cancelled_turn: cancelled_turn.clone(),
            },
            vec![EmitState],
        ),

        // -----------------
        // UserSpeaking
        // -----------------
        (UserSpeaking { .. }, UserSpeechStarted) => (state.clone(), vec![]),
        (UserSpeaking { cancelled_turn }, UserUtteranceEnded) => (
            Idle {
                cancelled_turn: cancelled_turn.clone(),
            },
            vec![SendTurnBoundary, EmitState],
        ),

        // -----------------
        // Assistant audio while the floor is free or the user holds it
        // -----------------
        (
            Idle { cancelled_turn } | UserSpeaking { cancelled_turn },
            AssistantAudio { turn_id },
        ) => {
            if turn_id.is_some() && turn_id == *cancelled_turn {
                (state.clone(), vec![DiscardAudio])
            } else {
                (
                    AssistantSpeaking {
                        turn_id,
                        reply_sent: false,
                    },
                    vec![EnqueuePlayback, EmitState],
                )
            }
        }

        // -----------------
        // AssistantSpeaking
        // -----------------
        (
            AssistantSpeaking {
                turn_id: current,
                reply_sent,
            },
            AssistantAudio { turn_id },
        ) => {
            let next = match (current, turn_id) {
                // Audio naming another turn starts the next reply
                (Some(current), Some(id)) if *current != id => AssistantSpeaking {
                    turn_id: Some(id),
                    reply_sent: false,
                },
                (current, id) => AssistantSpeaking {
                    turn_id: current.clone().or(id),
                    reply_sent: *reply_sent,
                },
            };
            (next, vec![EnqueuePlayback])
        }
        (AssistantSpeaking { turn_id, .. }, UserSpeechStarted | InterruptRequested) => (
            Interrupted {
                turn_id: turn_id.clone(),
            },
            vec![FlushPlayback, SendInterruption, EmitState],
        ),
        (AssistantSpeaking { turn_id: current, .. }, AssistantTurnEnded { turn_id })
            if turn_id.is_none() || current.is_none() || turn_id == *current =>
        {
            (
                AssistantSpeaking {
                    turn_id: current.clone(),
                    reply_sent: true,
                },
                vec![],
            )
        }
        (
            AssistantSpeaking {
                reply_sent: true, ..
            },
            PlaybackDrained,
        ) => (
            Idle {
                cancelled_turn: None,
            },
            vec![EmitState],
        ),

        // -----------------
        // Interrupted
        // -----------------
        (Interrupted { turn_id }, InterruptionResolved) => (
            UserSpeaking {
                cancelled_turn: turn_id.clone(),
            },
            vec![EmitState],
        ),
        (Interrupted { .. }, AssistantAudio { .. }) => (state.clone(), vec![DiscardAudio]),

        // -----------------
        // Unhandled: no transition
        // -----------------
        _ => (state.clone(), vec![]),
    }
}

/// Apply `event` and resolve transient states.
///
/// Returns every state visited, in order, with the effects of reaching it.
pub fn advance(state: &State, event: Event) -> Vec<(State, Vec<Effect>)> {
    let (next, effects) = reduce(state, event);
    let interrupted = matches!(next, State::Interrupted { .. });
    let mut steps = vec![(next, effects)];

    if interrupted {
        let (resolved, effects) = reduce(&steps[0].0, Event::InterruptionResolved);
        steps.push((resolved, effects));
    }
    steps
}

#[cfg(test)]
mod tests {
    use super::*;

    fn speaking(turn: &str) -> State {
        State::AssistantSpeaking {
            turn_id: Some(turn.to_string()),
            reply_sent: false,
        }
    }

    fn reply_sent(turn: &str) -> State {
        State::AssistantSpeaking {
            turn_id: Some(turn.to_string()),
            reply_sent: true,
        }
    }

    fn audio(turn: &str) -> Event {
        Event::AssistantAudio {
            turn_id: Some(turn.to_string()),
        }
    }

    #[test]
    fn idle_speech_onset_transitions_to_user_speaking() {
        let (next, effects) = reduce(&State::default(), Event::UserSpeechStarted);
        assert_eq!(next.turn_state(), TurnState::UserSpeaking);
        assert_eq!(effects, vec![Effect::EmitState]);
    }

    #[test]
    fn end_of_utterance_sends_turn_boundary() {
        let state = State::UserSpeaking {
            cancelled_turn: None,
        };
        let (next, effects) = reduce(&state, Event::UserUtteranceEnded);
        assert_eq!(next.turn_state(), TurnState::Idle);
        assert!(effects.contains(&Effect::SendTurnBoundary));
    }

    #[test]
    fn first_assistant_audio_starts_assistant_turn() {
        let (next, effects) = reduce(&State::default(), audio("t1"));
        assert_eq!(next, speaking("t1"));
        assert_eq!(effects, vec![Effect::EnqueuePlayback, Effect::EmitState]);
    }

    #[test]
    fn barge_in_flushes_and_resolves_to_user_speaking() {
        let steps = advance(&speaking("t1"), Event::UserSpeechStarted);
        assert_eq!(steps.len(), 2);

        let (interrupted, effects) = &steps[0];
        assert_eq!(interrupted.turn_state(), TurnState::Interrupted);
        assert!(effects.contains(&Effect::FlushPlayback));
        assert!(effects.contains(&Effect::SendInterruption));

        let (resolved, _) = &steps[1];
        assert_eq!(
            resolved,
            &State::UserSpeaking {
                cancelled_turn: Some("t1".to_string())
            }
        );
    }

    #[test]
    fn user_interrupt_takes_the_barge_in_path() {
        let steps = advance(&speaking("t1"), Event::InterruptRequested);
        assert_eq!(steps.last().unwrap().0.turn_state(), TurnState::UserSpeaking);
        assert!(steps[0].1.contains(&Effect::FlushPlayback));
    }

    #[test]
    fn late_audio_from_interrupted_turn_is_discarded() {
        let state = State::UserSpeaking {
            cancelled_turn: Some("t1".to_string()),
        };
        let (next, effects) = reduce(&state, audio("t1"));
        assert_eq!(next, state);
        assert_eq!(effects, vec![Effect::DiscardAudio]);

        // Still discarded after the user finishes speaking
        let (idle, _) = reduce(&state, Event::UserUtteranceEnded);
        let (_, effects) = reduce(&idle, audio("t1"));
        assert_eq!(effects, vec![Effect::DiscardAudio]);

        // A new reply plays
        let (next, _) = reduce(&idle, audio("t2"));
        assert_eq!(next, speaking("t2"));
    }

    #[test]
    fn assistant_keeps_the_floor_until_playback_drains() {
        let (sent, effects) = reduce(
            &speaking("t1"),
            Event::AssistantTurnEnded {
                turn_id: Some("t1".to_string()),
            },
        );
        assert_eq!(sent, reply_sent("t1"));
        assert_eq!(sent.turn_state(), TurnState::AssistantSpeaking);
        assert!(effects.is_empty());

        let (next, effects) = reduce(&sent, Event::PlaybackDrained);
        assert_eq!(next, State::default());
        assert_eq!(effects, vec![Effect::EmitState]);
    }

    #[test]
    fn drain_before_reply_end_keeps_speaking() {
        let (next, effects) = reduce(&speaking("t1"), Event::PlaybackDrained);
        assert_eq!(next, speaking("t1"));
        assert!(effects.is_empty());
    }

    #[test]
    fn speech_during_reply_tail_still_barges_in() {
        let steps = advance(&reply_sent("t1"), Event::UserSpeechStarted);
        assert_eq!(steps[0].0.turn_state(), TurnState::Interrupted);
        assert!(steps[0].1.contains(&Effect::FlushPlayback));
        assert!(steps[0].1.contains(&Effect::SendInterruption));
        assert_eq!(
            steps[1].0,
            State::UserSpeaking {
                cancelled_turn: Some("t1".to_string())
            }
        );
    }

    #[test]
    fn audio_of_a_new_turn_reopens_the_reply() {
        let (next, effects) = reduce(&reply_sent("t1"), audio("t2"));
        assert_eq!(next, speaking("t2"));
        assert_eq!(effects, vec![Effect::EnqueuePlayback]);

        // Late audio of the same reply does not
        let (next, _) = reduce(&reply_sent("t1"), audio("t1"));
        assert_eq!(next, reply_sent("t1"));
    }

    #[test]
    fn stale_turn_end_is_ignored() {
        let (next, effects) = reduce(
            &speaking("t2"),
            Event::AssistantTurnEnded {
                turn_id: Some("t1".to_string()),
            },
        );
        assert_eq!(next, speaking("t2"));
        assert!(effects.is_empty());
    }

    #[test]
    fn user_and_assistant_never_speak_at_once() {
        let events = [
            Event::UserSpeechStarted,
            audio("t1"),
            Event::UserSpeechStarted,
            audio("t1"),
            Event::UserUtteranceEnded,
            audio("t2"),
            Event::InterruptRequested,
            audio("t3"),
            Event::AssistantTurnEnded { turn_id: None },
            Event::UserSpeechStarted,
            Event::PlaybackDrained,
        ];
        let mut state = State::default();
        for event in events {
            for (next, _) in advance(&state, event) {
                state = next;
            }
            assert_ne!(state.turn_state(), TurnState::Interrupted);
        }
    }

    #[test]
    fn close_is_absorbing() {
        let (closed, effects) = reduce(&speaking("t1"), Event::Close);
        assert_eq!(closed, State::Closed);
        assert!(effects.contains(&Effect::FlushPlayback));

        let (next, effects) = reduce(&closed, audio("t3"));
        assert_eq!(next, State::Closed);
        assert_eq!(effects, vec![Effect::DiscardAudio]);

        let (next, effects) = reduce(&closed, Event::UserSpeechStarted);
        assert_eq!(next, State::Closed);
        assert!(effects.is_empty());
    }
}
