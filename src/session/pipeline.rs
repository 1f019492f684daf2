//! Session pipeline tasks
//!
//! ```text
//! Audio Thread (sync)          Tokio Runtime (async)
//! ┌───────────────┐            ┌────────────────────────────┐
//! │ CPAL callback │──channel──▶│ OutboundPump               │
//! └───────────────┘            │   convert → frame → send   │──▶ ConnectionManager
//!                              └────────────────────────────┘
//!                              ┌────────────────────────────┐
//!  ConnectionManager ─────────▶│ InboundPump                │
//!                              │   decode → supervisor      │
//!                              └────────────────────────────┘
//!                              ┌────────────────────────────┐
//!  PlaybackBuffer ────────────▶│ Player                     │──▶ AudioSink
//!                              └────────────────────────────┘
//! ```
//!
//! Every task stops when the session's cancellation token fires.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio_util::sync::CancellationToken;

use crate::audio::{AudioError, AudioFormatConverter, AudioSink, CaptureReceiver};
use crate::metrics::SessionMetrics;
use crate::streaming::{
    Codec, ControlKind, FrameSender, InboundDecoder, InboundEvent, OutboundFrame, OutboundFramer,
    PlaybackBuffer, PlaybackItem, WireFrame,
};

/// Most silence written for a single gap, in chunks
const MAX_SILENT_CHUNKS: u64 = 10;

/// Requests from the supervisor to the outbound pump
pub(crate) enum OutboundCommand {
    Control(ControlKind),
    /// Stop reading capture, send the partial chunk and `SessionEnd`, then reply.
    Finish { done: oneshot::Sender<()> },
}

/// Faults a pipeline task cannot recover from
#[derive(Debug)]
pub(crate) enum Fault {
    Capture(AudioError),
    Playback(AudioError),
}

impl Fault {
    pub(crate) fn reason(&self) -> String {
        match self {
            Fault::Capture(e) => format!("capture: {}", e),
            Fault::Playback(e) => format!("playback: {}", e),
        }
    }
}

/// capture → convert → frame → send
pub(crate) struct OutboundPump {
    pub capture: CaptureReceiver,
    pub converter: AudioFormatConverter,
    pub framer: OutboundFramer,
    pub sender: FrameSender,
    /// `false` while capture is paused for backpressure
    pub gate: watch::Receiver<bool>,
    pub commands: mpsc::UnboundedReceiver<OutboundCommand>,
    pub faults: mpsc::UnboundedSender<Fault>,
    pub metrics: Arc<SessionMetrics>,
    pub cancel: CancellationToken,
}

impl OutboundPump {
    pub async fn run(mut self) {
        let wire = self.framer.format();
        let start = self.framer.control(ControlKind::SessionStart {
            sample_rate: wire.sample_rate,
            channels: wire.channels,
            codec: Codec::Linear16,
        });
        if !self.send(OutboundFrame::Control(start)).await {
            return;
        }

        let mut capturing = true;
        let mut paused_frames = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(OutboundCommand::Control(kind)) => {
                        let frame = self.framer.control(kind);
                        if !self.send(OutboundFrame::Control(frame)).await {
                            break;
                        }
                    }
                    Some(OutboundCommand::Finish { done }) => {
                        capturing = false;
                        self.finish().await;
                        let _ = done.send(());
                    }
                    None => break,
                },
                item = self.capture.recv(), if capturing => match item {
                    Some(Ok(frame)) => {
                        if !*self.gate.borrow() {
                            // Paused: drop audio rather than queue it
                            self.framer.discard_pending();
                            self.metrics.record_paused_drop();
                            paused_frames += 1;
                            continue;
                        }
                        if paused_frames > 0 {
                            log::info!("Outbound: resumed after dropping {} frames", paused_frames);
                            paused_frames = 0;
                        }

                        let samples = match self.converter.to_wire(&frame) {
                            Ok(samples) => samples,
                            Err(e) => {
                                log::warn!("Outbound: dropping frame: {}", e);
                                self.metrics.record_error("convert", e.to_string());
                                continue;
                            }
                        };
                        let mut open = true;
                        for chunk in self.framer.push_audio(&samples) {
                            if !self.send(OutboundFrame::Audio(chunk)).await {
                                open = false;
                                break;
                            }
                        }
                        if !open {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        log::error!("Outbound: capture failed: {}", e);
                        capturing = false;
                        let _ = self.faults.send(Fault::Capture(e));
                    }
                    None => {
                        capturing = false;
                        let _ = self.faults.send(Fault::Capture(AudioError::DeviceLost(
                            "capture stream ended".to_string(),
                        )));
                    }
                },
            }
        }

        log::debug!(
            "Outbound: stopped at seq {} ({} samples unsent)",
            self.framer.next_sequence(),
            self.framer.buffered_samples()
        );
    }

    async fn finish(&mut self) {
        if let Some(chunk) = self.framer.flush_partial() {
            log::debug!("Outbound: sending final partial chunk {}", chunk.seq);
            if !self.send(OutboundFrame::Audio(chunk)).await {
                return;
            }
        }
        let end = self.framer.control(ControlKind::SessionEnd);
        self.send(OutboundFrame::Control(end)).await;
    }

    /// Queue a frame. Returns `false` once the session is going away.
    async fn send(&self, frame: OutboundFrame) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            result = self.sender.send(frame) => match result {
                Ok(()) => true,
                Err(e) => {
                    log::debug!("Outbound: connection gone: {}", e);
                    false
                }
            },
        }
    }
}

/// receive → decode → supervisor
pub(crate) struct InboundPump {
    pub frames: mpsc::Receiver<WireFrame>,
    pub decoder: InboundDecoder,
    pub events: mpsc::Sender<InboundEvent>,
    pub cancel: CancellationToken,
}

impl InboundPump {
    pub async fn run(mut self) {
        loop {
            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                frame = self.frames.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            match self.decoder.decode(frame) {
                Ok(Some(event)) => {
                    if self.events.send(event).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => log::warn!("Inbound: dropping frame: {}", e),
            }
        }
        log::debug!("Inbound: stopped");
    }
}

/// PlaybackBuffer → AudioSink, in sequence order
pub(crate) struct Player {
    pub buffer: Arc<Mutex<PlaybackBuffer>>,
    /// Signalled whenever a chunk is pushed
    pub wake: Arc<Notify>,
    pub sink: Arc<dyn AudioSink>,
    pub converter: AudioFormatConverter,
    pub substitute_silence: bool,
    pub faults: mpsc::UnboundedSender<Fault>,
    pub metrics: Arc<SessionMetrics>,
    pub cancel: CancellationToken,
}

impl Player {
    pub async fn run(self) {
        // Gaps are filled with this much silence per missing chunk
        let mut last_chunk_samples = 0usize;

        loop {
            let deadline = match self.buffer.lock() {
                Ok(mut buffer) => {
                    // Written under the lock: a flush cannot land between
                    // release and write
                    let items = buffer.poll(Instant::now());
                    if !self.play(items, &mut last_chunk_samples) {
                        return;
                    }
                    buffer.next_deadline()
                }
                Err(_) => {
                    log::error!("Player: playback buffer poisoned");
                    let _ = self.faults.send(Fault::Playback(AudioError::Playback(
                        "playback buffer poisoned".to_string(),
                    )));
                    break;
                }
            };

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = sleep_until(deadline) => {}
            }
        }
        log::debug!("Player: stopped");
    }

    /// Returns `false` once the output device is gone.
    fn play(&self, items: Vec<PlaybackItem>, last_chunk_samples: &mut usize) -> bool {
        for item in items {
            match item {
                PlaybackItem::Chunk(chunk) => {
                    let samples = match self.converter.to_playback(&chunk.samples, chunk.format) {
                        Ok(samples) => samples,
                        Err(e) => {
                            log::warn!("Player: dropping chunk {}: {}", chunk.seq, e);
                            self.metrics.record_error("playback", e.to_string());
                            continue;
                        }
                    };
                    *last_chunk_samples = samples.len();
                    if !self.write(&samples) {
                        return false;
                    }
                }
                PlaybackItem::Gap { from, to } => {
                    let missing = (to - from).saturating_add(1);
                    log::warn!("Player: skipped {} missing chunk(s) {}..={}", missing, from, to);
                    self.metrics.record_gap(missing);
                    if self.substitute_silence && *last_chunk_samples > 0 {
                        let chunks = missing.min(MAX_SILENT_CHUNKS) as usize;
                        let silence = vec![0i16; *last_chunk_samples * chunks];
                        if !self.write(&silence) {
                            return false;
                        }
                    }
                }
            }
        }
        true
    }

    /// Returns `false` if the output device is gone.
    fn write(&self, samples: &[i16]) -> bool {
        match self.sink.write(samples) {
            Ok(()) => true,
            Err(e @ AudioError::DeviceLost(_)) => {
                log::error!("Player: output device lost");
                let _ = self.faults.send(Fault::Playback(e));
                false
            }
            Err(e) => {
                log::warn!("Player: write failed: {}", e);
                self.metrics.record_error("playback", e.to_string());
                true
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}
