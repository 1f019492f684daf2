//! Session orchestration
//!
//! # Lifecycle
//!
//! ```text
//! Idle → Connecting → Active ⇄ Reconnecting
//!                       │
//!                       ├─ stop() ──▶ Draining → Closed
//!                       └─ fault ───▶ Failed
//! ```
//!
//! `start()` connects and spawns the pipeline tasks plus a supervisor. The
//! supervisor owns the connection, the capture source and the turn state
//! machine, and is the only writer of session state once the session is
//! running. The orchestrator talks to it over a command channel.
//!
//! A session runs once. Build a new orchestrator for the next conversation.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::observer::{NoopObserver, SessionObserver};
use super::pipeline::{Fault, InboundPump, OutboundCommand, OutboundPump, Player};
use super::state_stream::StateStream;
use super::{SessionError, SessionSnapshot, SessionState};
use crate::audio::{AudioCaptureSource, AudioFormatConverter, AudioSink};
use crate::credentials::CredentialProvider;
use crate::effects::{EffectRunner, PipelineEffects};
use crate::metrics::SessionMetrics;
use crate::settings::SessionSettings;
use crate::state_machine::{advance, Effect, Event, State, TurnState};
use crate::streaming::{
    is_auth_error_code, AudioResponseChunk, ConnectionManager, ConnectionState, Connector,
    ControlSignal, FrameSender, InboundDecoder, InboundEvent, OutboundFramer, PlaybackBuffer,
    PushOutcome, Role, StreamingError, TranscriptAggregator, TranscriptDelta,
};

/// Decoded events buffered between the inbound pump and the supervisor
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How often the supervisor rechecks a paused capture and a draining reply
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_millis(50);

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Grace period for a cancelled task before it is aborted
const TASK_JOIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Everything a session needs from the outside world
pub struct SessionCapabilities {
    pub capture: Box<dyn AudioCaptureSource>,
    pub sink: Arc<dyn AudioSink>,
    pub connector: Arc<dyn Connector>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub observer: Arc<dyn SessionObserver>,
}

impl SessionCapabilities {
    pub fn new(
        capture: Box<dyn AudioCaptureSource>,
        sink: Arc<dyn AudioSink>,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        Self {
            capture,
            sink,
            connector,
            credentials,
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observer = observer;
        self
    }
}

enum Command {
    Interrupt,
    Stop { done: oneshot::Sender<()> },
}

struct Running {
    commands: mpsc::UnboundedSender<Command>,
    supervisor: JoinHandle<()>,
    cancel: CancellationToken,
}

pub struct SessionOrchestrator {
    settings: SessionSettings,
    /// Taken by `start()`
    capture: Option<Box<dyn AudioCaptureSource>>,
    sink: Arc<dyn AudioSink>,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialProvider>,
    observer: Arc<dyn SessionObserver>,
    stream: Arc<StateStream>,
    metrics: Arc<SessionMetrics>,
    running: Option<Running>,
}

impl SessionOrchestrator {
    pub fn new(settings: SessionSettings, capabilities: SessionCapabilities) -> Self {
        Self {
            settings,
            capture: Some(capabilities.capture),
            sink: capabilities.sink,
            connector: capabilities.connector,
            credentials: capabilities.credentials,
            observer: capabilities.observer,
            stream: Arc::new(StateStream::new()),
            metrics: Arc::new(SessionMetrics::new()),
            running: None,
        }
    }

    /// Connect, start capture and begin streaming.
    ///
    /// On error the session ends up `Failed` and everything acquired so far
    /// is released.
    pub async fn start(&mut self) -> Result<(), SessionError> {
        let Some(capture) = self.capture.take() else {
            return Err(SessionError::AlreadyStarted);
        };

        log::info!("Session: starting {}", self.metrics.session_id());
        publish_session(&self.stream, self.observer.as_ref(), SessionState::Connecting, None);

        match self.launch(capture).await {
            Ok(running) => {
                self.running = Some(running);
                Ok(())
            }
            Err(e) => {
                log::error!("Session: failed to start: {}", e);
                self.metrics.record_error("start", e.to_string());
                publish_session(
                    &self.stream,
                    self.observer.as_ref(),
                    SessionState::Failed,
                    Some(e.to_string()),
                );
                Err(e)
            }
        }
    }

    async fn launch(
        &mut self,
        mut capture: Box<dyn AudioCaptureSource>,
    ) -> Result<Running, SessionError> {
        let wire = self.settings.wire_format();
        let converter = AudioFormatConverter::new(capture.format(), wire, self.sink.format())?;

        let mut manager = ConnectionManager::new(
            self.settings.connection_config(),
            self.connector.clone(),
            self.credentials.clone(),
            self.metrics.clone(),
        );
        manager.connect().await?;

        let capture_rx = match capture.start() {
            Ok(rx) => rx,
            Err(e) => {
                manager.close().await;
                return Err(e.into());
            }
        };
        let Some(inbound_frames) = manager.take_receiver() else {
            capture.stop();
            manager.close().await;
            return Err(StreamingError::Closed.into());
        };

        let cancel = CancellationToken::new();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();
        let (gate_tx, gate_rx) = watch::channel(true);
        let buffer = Arc::new(Mutex::new(PlaybackBuffer::new(
            self.settings.playback_config(),
        )));
        let wake = Arc::new(Notify::new());
        let sender = manager.sender();

        let tasks = vec![
            tokio::spawn(
                OutboundPump {
                    capture: capture_rx,
                    converter: converter.clone(),
                    framer: OutboundFramer::new(wire, self.settings.chunk_duration_ms)
                        .with_control_sequence(manager.control_sequence()),
                    sender: sender.clone(),
                    gate: gate_rx,
                    commands: outbound_rx,
                    faults: faults_tx.clone(),
                    metrics: self.metrics.clone(),
                    cancel: cancel.clone(),
                }
                .run(),
            ),
            tokio::spawn(
                InboundPump {
                    frames: inbound_frames,
                    decoder: InboundDecoder::new(wire, self.metrics.clone()),
                    events: events_tx,
                    cancel: cancel.clone(),
                }
                .run(),
            ),
            tokio::spawn(
                Player {
                    buffer: buffer.clone(),
                    wake: wake.clone(),
                    sink: self.sink.clone(),
                    converter,
                    substitute_silence: self.settings.substitute_silence,
                    faults: faults_tx,
                    metrics: self.metrics.clone(),
                    cancel: cancel.clone(),
                }
                .run(),
            ),
        ];

        publish_session(&self.stream, self.observer.as_ref(), SessionState::Active, None);

        let supervisor = Supervisor {
            settings: self.settings.clone(),
            manager,
            capture: Some(capture),
            sink: self.sink.clone(),
            observer: self.observer.clone(),
            stream: self.stream.clone(),
            metrics: self.metrics.clone(),
            effects: PipelineEffects::new(buffer.clone(), self.sink.clone(), outbound_tx.clone()),
            outbound: outbound_tx,
            buffer,
            wake,
            sender,
            gate: gate_tx,
            turn: State::default(),
            aggregator: TranscriptAggregator::new(),
            tasks,
            cancel: cancel.clone(),
        };
        let supervisor = tokio::spawn(supervisor.run(commands_rx, events_rx, faults_rx));

        log::info!("Session: active");
        Ok(Running {
            commands: commands_tx,
            supervisor,
            cancel,
        })
    }

    /// Drain outbound audio, close the connection and release the devices.
    ///
    /// Bounded by the shutdown timeout; past it, tasks are aborted. Stopping a
    /// session that already ended is a no-op.
    pub async fn stop(&mut self) -> Result<(), SessionError> {
        let Some(mut running) = self.running.take() else {
            return if self.capture.is_some() {
                Err(SessionError::NotStarted)
            } else {
                Ok(())
            };
        };

        log::info!("Session: stopping");
        let (done_tx, done_rx) = oneshot::channel();
        let stopped = match running.commands.send(Command::Stop { done: done_tx }) {
            // A dropped reply means the supervisor already shut down on its own
            Ok(()) => timeout(self.settings.shutdown_timeout(), done_rx).await.is_ok(),
            Err(_) => true,
        };

        if stopped {
            if timeout(TASK_JOIN_TIMEOUT, &mut running.supervisor)
                .await
                .is_err()
            {
                running.supervisor.abort();
            }
            return Ok(());
        }

        log::warn!("Session: shutdown timed out, aborting");
        running.cancel.cancel();
        running.supervisor.abort();
        let sink = self.sink.clone();
        if tokio::task::spawn_blocking(move || sink.close()).await.is_err() {
            log::error!("Session: sink close panicked");
        }
        self.stream.publish(|s| s.turn = TurnState::Closed);
        if !self.stream.snapshot().session.is_terminal() {
            publish_session(&self.stream, self.observer.as_ref(), SessionState::Closed, None);
        }
        Ok(())
    }

    /// Cut the assistant off, exactly as if the user had started speaking.
    pub fn interrupt(&self) -> Result<(), SessionError> {
        match &self.running {
            Some(running) => running
                .commands
                .send(Command::Interrupt)
                .map_err(|_| StreamingError::Closed.into()),
            None if self.capture.is_some() => Err(SessionError::NotStarted),
            None => Err(StreamingError::Closed.into()),
        }
    }

    /// Every snapshot change from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SessionSnapshot> {
        self.stream.subscribe()
    }

    /// Latest snapshot, with change notification
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.stream.watch()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.stream.snapshot()
    }

    pub fn metrics(&self) -> Arc<SessionMetrics> {
        self.metrics.clone()
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }
}

impl Drop for SessionOrchestrator {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.cancel.cancel();
            running.supervisor.abort();
            self.sink.close();
        }
    }
}

fn publish_session(
    stream: &StateStream,
    observer: &dyn SessionObserver,
    state: SessionState,
    failure: Option<String>,
) {
    let reason = failure.clone();
    let changed = stream.publish(|snapshot| {
        snapshot.session = state;
        if failure.is_some() {
            snapshot.failure = failure;
        }
    });
    if changed {
        log::info!("Session: -> {:?}", state);
        observer.on_session_state(state, reason.as_deref());
    }
}

/// Why the supervisor loop ended
enum Outcome {
    Stop(oneshot::Sender<()>),
    /// The service ended the session
    RemoteClosed,
    Failed(String),
    /// The orchestrator went away without stopping
    Abandoned,
}

struct Supervisor {
    settings: SessionSettings,
    manager: ConnectionManager,
    capture: Option<Box<dyn AudioCaptureSource>>,
    sink: Arc<dyn AudioSink>,
    observer: Arc<dyn SessionObserver>,
    stream: Arc<StateStream>,
    metrics: Arc<SessionMetrics>,
    effects: PipelineEffects,
    outbound: mpsc::UnboundedSender<OutboundCommand>,
    buffer: Arc<Mutex<PlaybackBuffer>>,
    wake: Arc<Notify>,
    sender: FrameSender,
    /// Open unless capture is paused for backpressure
    gate: watch::Sender<bool>,
    turn: State,
    aggregator: TranscriptAggregator,
    tasks: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Supervisor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::Receiver<InboundEvent>,
        mut faults: mpsc::UnboundedReceiver<Fault>,
    ) {
        let mut connection = self.manager.state();
        let mut backpressure = self.manager.backpressure();
        let mut housekeeping = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break Outcome::Abandoned,
                Some(fault) = faults.recv() => {
                    log::error!("Session: {}", fault.reason());
                    break Outcome::Failed(fault.reason());
                }
                command = commands.recv() => match command {
                    Some(Command::Interrupt) => {
                        log::info!("Session: interrupt requested");
                        self.apply(Event::InterruptRequested, None);
                    }
                    Some(Command::Stop { done }) => break Outcome::Stop(done),
                    None => break Outcome::Abandoned,
                },
                Ok(()) = connection.changed() => {
                    let state = connection.borrow_and_update().clone();
                    if let Some(outcome) = self.on_connection_state(state) {
                        break outcome;
                    }
                }
                Some(event) = events.recv() => {
                    if let Some(outcome) = self.on_inbound(event) {
                        break outcome;
                    }
                }
                Ok(()) = backpressure.changed() => {
                    if *backpressure.borrow_and_update() {
                        self.pause_capture();
                    }
                }
                _ = housekeeping.tick() => {
                    self.check_gate(*backpressure.borrow());
                    self.check_drained();
                }
            }
        };

        match outcome {
            Outcome::Stop(done) => {
                self.shutdown(true).await;
                self.set_session(SessionState::Closed, None);
                let _ = done.send(());
            }
            Outcome::RemoteClosed | Outcome::Abandoned => {
                self.shutdown(false).await;
                self.set_session(SessionState::Closed, None);
            }
            Outcome::Failed(reason) => {
                self.metrics.record_error("session", reason.clone());
                self.shutdown(false).await;
                self.set_session(SessionState::Failed, Some(reason));
            }
        }
        log::info!(
            "Session: {} ended after {} frames sent, {} reconnects",
            self.metrics.session_id(),
            self.metrics.frames_sent(),
            self.metrics.reconnects()
        );
    }

    fn set_session(&self, state: SessionState, failure: Option<String>) {
        publish_session(&self.stream, self.observer.as_ref(), state, failure);
    }

    fn on_connection_state(&mut self, state: ConnectionState) -> Option<Outcome> {
        match state {
            ConnectionState::Open => self.set_session(SessionState::Active, None),
            ConnectionState::Reconnecting { attempt } => {
                log::warn!("Session: connection lost, reconnect attempt {}", attempt);
                self.set_session(SessionState::Reconnecting, None);
            }
            ConnectionState::Disconnected | ConnectionState::Handshaking => {
                self.set_session(SessionState::Reconnecting, None)
            }
            ConnectionState::Closing => {}
            ConnectionState::Closed => {
                log::info!("Session: service closed the connection");
                return Some(Outcome::RemoteClosed);
            }
            ConnectionState::Failed { reason } => return Some(Outcome::Failed(reason)),
        }
        None
    }

    fn on_inbound(&mut self, event: InboundEvent) -> Option<Outcome> {
        match event {
            InboundEvent::TranscriptDelta(delta) => self.on_transcript(delta),
            InboundEvent::EmotionInference(inference) => {
                if let Some(top) = inference.top() {
                    log::debug!(
                        "Session: {:?} emotion {} ({:.2})",
                        inference.role,
                        top.name,
                        top.score
                    );
                }
                self.observer.on_emotion(&inference);
            }
            InboundEvent::AudioResponseChunk(chunk) => {
                let admission = match self.buffer.lock() {
                    Ok(buffer) => buffer.check(chunk.seq),
                    Err(_) => {
                        log::error!("Session: playback buffer poisoned");
                        return None;
                    }
                };
                // Only playable audio counts as the assistant speaking
                if admission == PushOutcome::Accepted {
                    let turn_id = chunk.turn_id.clone();
                    self.apply(Event::AssistantAudio { turn_id }, Some(chunk));
                } else {
                    self.enqueue(chunk);
                }
            }
            InboundEvent::ControlSignal(signal) => return self.on_control(signal),
        }
        None
    }

    fn on_transcript(&mut self, delta: TranscriptDelta) {
        self.observer.on_transcript(&delta);
        if let Some(done) = self.aggregator.process(&delta) {
            self.observer.on_utterance(done.role, &done.text);
        }

        let user_spoke =
            delta.role == Role::User && (delta.is_final || !delta.text.trim().is_empty());
        let is_final = delta.is_final;
        self.stream.publish(|s| s.last_transcript = Some(delta));

        if user_spoke {
            self.apply(Event::UserSpeechStarted, None);
            if is_final {
                self.apply(Event::UserUtteranceEnded, None);
            }
        }
    }

    fn on_control(&mut self, signal: ControlSignal) -> Option<Outcome> {
        match signal {
            ControlSignal::SessionReady { session_id } => {
                log::debug!("Session: service session {}", session_id)
            }
            ControlSignal::SpeechStarted => self.apply(Event::UserSpeechStarted, None),
            ControlSignal::SpeechEnded => self.apply(Event::UserUtteranceEnded, None),
            ControlSignal::AssistantEnd { turn_id } => {
                self.apply(Event::AssistantTurnEnded { turn_id }, None);
                self.check_drained();
            }
            ControlSignal::Error { code, message } => {
                let code = code.unwrap_or_default();
                log::warn!("Session: service error {}: {}", code, message);
                self.metrics
                    .record_error("service", format!("{}: {}", code, message));
                if is_auth_error_code(&code) {
                    return Some(Outcome::Failed(
                        StreamingError::Auth(message).to_string(),
                    ));
                }
            }
        }
        None
    }

    /// Run `event` through the turn machine and carry out the effects.
    ///
    /// `chunk` is the assistant audio that triggered the event, if any.
    fn apply(&mut self, event: Event, mut chunk: Option<AudioResponseChunk>) {
        for (next, effects) in advance(&self.turn, event) {
            self.turn = next;
            for effect in effects {
                match effect {
                    Effect::EnqueuePlayback => {
                        if let Some(chunk) = chunk.take() {
                            self.enqueue(chunk);
                        }
                    }
                    Effect::DiscardAudio => {
                        if let Some(chunk) = chunk.take() {
                            log::debug!("Session: discarding assistant chunk {}", chunk.seq);
                            self.metrics.record_discarded_chunk();
                            if let Ok(mut buffer) = self.buffer.lock() {
                                buffer.discard(chunk.seq);
                            }
                            self.wake.notify_one();
                        }
                    }
                    Effect::EmitState => {
                        let turn = self.turn.turn_state();
                        log::info!("Session: turn -> {:?}", turn);
                        self.stream.publish(|s| s.turn = turn);
                        self.observer.on_turn_changed(turn);
                    }
                    Effect::SendInterruption => {
                        self.aggregator.discard(Role::Assistant);
                        self.effects.run(effect);
                    }
                    Effect::FlushPlayback | Effect::SendTurnBoundary => self.effects.run(effect),
                }
            }
        }
    }

    fn enqueue(&mut self, chunk: AudioResponseChunk) {
        let outcome = match self.buffer.lock() {
            Ok(mut buffer) => buffer.push(chunk, std::time::Instant::now()),
            Err(_) => {
                log::error!("Session: playback buffer poisoned");
                return;
            }
        };
        match outcome {
            PushOutcome::Accepted => self.wake.notify_one(),
            PushOutcome::Late => self.metrics.record_late_chunk(),
            PushOutcome::Duplicate => self.metrics.record_duplicate_chunk(),
            PushOutcome::OutOfWindow => self.metrics.record_out_of_window_chunk(),
        }
    }

    /// Hand the floor back once a finished reply has played out.
    fn check_drained(&mut self) {
        if !matches!(
            self.turn,
            State::AssistantSpeaking {
                reply_sent: true,
                ..
            }
        ) {
            return;
        }
        // The player writes under the buffer lock, so nothing is in flight
        // between the two checks
        let buffered = self.buffer.lock().map(|b| b.pending_len()).unwrap_or(0);
        if buffered == 0 && self.sink.queued_samples() == 0 {
            self.apply(Event::PlaybackDrained, None);
        }
    }

    fn pause_capture(&mut self) {
        if *self.gate.borrow() {
            log::warn!("Session: outbound backlog, pausing capture");
            self.gate.send_replace(false);
        }
    }

    /// Reopen capture once the outbound queue is down to half its depth.
    fn check_gate(&mut self, backpressure: bool) {
        if *self.gate.borrow() || backpressure {
            return;
        }
        if self.sender.queued() <= self.settings.outbound_queue_depth / 2 {
            log::info!("Session: outbound backlog cleared, resuming capture");
            self.gate.send_replace(true);
        }
    }

    /// Release everything. With `drain`, queued audio gets a bounded chance to
    /// reach the service first.
    async fn shutdown(&mut self, drain: bool) {
        if drain {
            self.set_session(SessionState::Draining, None);
            let deadline = tokio::time::Instant::now() + self.settings.drain_timeout();

            let (done_tx, done_rx) = oneshot::channel();
            if self
                .outbound
                .send(OutboundCommand::Finish { done: done_tx })
                .is_ok()
                && timeout_at(deadline, done_rx).await.is_err()
            {
                log::warn!("Session: outbound did not finish before the drain deadline");
            }
            self.stop_capture().await;

            let sender = &self.sender;
            let drained = timeout_at(deadline, async {
                while sender.queued() > 0 {
                    tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
                }
            })
            .await
            .is_ok();
            if !drained {
                log::warn!(
                    "Session: drain timed out with {} frames queued",
                    self.sender.queued()
                );
            }
        } else {
            self.stop_capture().await;
        }

        self.apply(Event::Close, None);
        self.cancel.cancel();
        for mut task in self.tasks.drain(..) {
            if timeout(TASK_JOIN_TIMEOUT, &mut task).await.is_err() {
                task.abort();
            }
        }
        self.manager.close().await;

        let sink = self.sink.clone();
        if tokio::task::spawn_blocking(move || sink.close()).await.is_err() {
            log::error!("Session: sink close panicked");
        }
    }

    async fn stop_capture(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            if tokio::task::spawn_blocking(move || capture.stop())
                .await
                .is_err()
            {
                log::error!("Session: capture stop panicked");
            }
        }
    }
}
