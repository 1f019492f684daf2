//! Live conversation sessions
//!
//! A session wires capture, the connection and playback together and applies
//! turn-taking policy. `SessionOrchestrator` is the entry point; UI code reads
//! `SessionSnapshot`s from the state stream, persistence hooks in through
//! `SessionObserver`.

pub mod observer;
pub mod orchestrator;
pub(crate) mod pipeline;
pub mod state_stream;

use serde::Serialize;
use thiserror::Error;

use crate::audio::AudioError;
use crate::state_machine::TurnState;
use crate::streaming::{StreamingError, TranscriptDelta};

pub use observer::{NoopObserver, SessionObserver};
pub use orchestrator::{SessionCapabilities, SessionOrchestrator};
pub use state_stream::StateStream;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error(transparent)]
    Audio(#[from] AudioError),
    #[error(transparent)]
    Streaming(#[from] StreamingError),
    #[error("session already started")]
    AlreadyStarted,
    #[error("session not started")]
    NotStarted,
}

/// Lifecycle of a session as a whole
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Reconnecting,
    Draining,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

/// What the UI needs to render a session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub session: SessionState,
    pub turn: TurnState,
    pub last_transcript: Option<TranscriptDelta>,
    /// Why the session failed, once it has
    pub failure: Option<String>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            session: SessionState::Idle,
            turn: TurnState::Idle,
            last_transcript: None,
            failure: None,
        }
    }
}
