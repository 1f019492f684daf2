//! Effect runner for duplex-voice
//!
//! This module executes the side effects produced by the turn state machine.
//! `EnqueuePlayback`, `DiscardAudio` and `EmitState` concern the chunk or the
//! snapshot the supervisor is holding, so the supervisor handles those itself.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::audio::AudioSink;
use crate::session::pipeline::OutboundCommand;
use crate::state_machine::Effect;
use crate::streaming::{ControlKind, PlaybackBuffer};

/// Trait for running effects.
/// Implementations must not block: they run inside the supervisor loop.
pub trait EffectRunner: Send + Sync + 'static {
    fn run(&self, effect: Effect);
}

/// Runs effects against the live session pipeline.
pub(crate) struct PipelineEffects {
    playback: Arc<Mutex<PlaybackBuffer>>,
    sink: Arc<dyn AudioSink>,
    outbound: mpsc::UnboundedSender<OutboundCommand>,
}

impl PipelineEffects {
    pub(crate) fn new(
        playback: Arc<Mutex<PlaybackBuffer>>,
        sink: Arc<dyn AudioSink>,
        outbound: mpsc::UnboundedSender<OutboundCommand>,
    ) -> Self {
        Self {
            playback,
            sink,
            outbound,
        }
    }

    fn send_control(&self, kind: ControlKind) {
        if self.outbound.send(OutboundCommand::Control(kind)).is_err() {
            log::debug!("Effects: outbound task gone, control dropped");
        }
    }
}

impl EffectRunner for PipelineEffects {
    fn run(&self, effect: Effect) {
        match effect {
            Effect::FlushPlayback => {
                let discarded = match self.playback.lock() {
                    Ok(mut buffer) => {
                        let discarded = buffer.flush();
                        // The player writes under the same lock
                        self.sink.clear();
                        discarded
                    }
                    Err(_) => {
                        log::error!("Effects: playback buffer poisoned");
                        self.sink.clear();
                        0
                    }
                };
                log::info!("Effects: playback flushed ({} chunks discarded)", discarded);
            }
            Effect::SendInterruption => self.send_control(ControlKind::Interruption),
            Effect::SendTurnBoundary => self.send_control(ControlKind::TurnBoundary),
            Effect::EnqueuePlayback | Effect::DiscardAudio | Effect::EmitState => {
                log::debug!("Effects: {:?} is handled by the supervisor", effect);
            }
        }
    }
}
