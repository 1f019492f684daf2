//! Realtime duplex voice conversations
//!
//! Connects a microphone and speaker to a remote conversational voice service
//! over one persistent streaming connection. Build a `SessionOrchestrator`
//! with `SessionCapabilities`, call `start()`, and read `SessionSnapshot`s
//! from `subscribe()` or `watch()`.

pub mod audio;
pub mod credentials;
pub mod effects;
pub mod metrics;
pub mod session;
pub mod settings;
pub mod state_machine;
pub mod streaming;

pub use audio::{AudioCaptureSource, AudioError, AudioFormat, AudioFrame, AudioSink};
pub use credentials::{CredentialError, CredentialProvider};
pub use metrics::{MetricsSummary, SessionMetrics};
pub use session::{
    SessionCapabilities, SessionError, SessionObserver, SessionOrchestrator, SessionSnapshot,
    SessionState,
};
pub use settings::SessionSettings;
pub use state_machine::TurnState;
pub use streaming::{ConnectionState, StreamingError};
