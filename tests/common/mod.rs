//! Shared fixtures for session tests: scripted devices and a loopback service.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, watch};

use duplex_voice::audio::{
    AudioCaptureSource, AudioError, AudioFormat, AudioFrame, AudioSink, CaptureItem,
    CaptureReceiver,
};
use duplex_voice::credentials::StaticCredentials;
use duplex_voice::session::{
    SessionCapabilities, SessionObserver, SessionOrchestrator, SessionSnapshot, SessionState,
};
use duplex_voice::settings::SessionSettings;
use duplex_voice::state_machine::TurnState;
use duplex_voice::streaming::{
    decode_audio_header, loopback, LoopbackConnector, LoopbackServer, Role, ServerEnd, WireFrame,
};

pub const FORMAT: AudioFormat = AudioFormat::new(24000, 1);

/// Samples in one 100ms chunk at `FORMAT`
pub const CHUNK_SAMPLES: usize = 2400;

const WAIT: Duration = Duration::from_secs(5);

pub fn test_settings() -> SessionSettings {
    SessionSettings {
        endpoint: "loopback".to_string(),
        wire_sample_rate: FORMAT.sample_rate,
        wire_channels: FORMAT.channels,
        chunk_duration_ms: 100,
        outbound_queue_depth: 16,
        reorder_window: 8,
        chunk_timeout_ms: 100,
        substitute_silence: false,
        backoff_base_ms: 10,
        backoff_cap_ms: 40,
        backoff_jitter: 0.0,
        max_reconnect_attempts: 3,
        heartbeat_interval_ms: 60_000,
        heartbeat_timeout_ms: 120_000,
        connect_timeout_ms: 1_000,
        handshake_timeout_ms: 1_000,
        drain_timeout_ms: 500,
        shutdown_timeout_ms: 2_000,
    }
}

// ============================================================================
// Devices
// ============================================================================

/// Test-side control of a `ScriptedCapture`
#[derive(Clone)]
pub struct CaptureHandle {
    tx: Arc<Mutex<Option<mpsc::Sender<CaptureItem>>>>,
    stopped: Arc<AtomicBool>,
}

impl CaptureHandle {
    /// Feed `chunks` chunks of speech to the session.
    pub fn speak(&self, chunks: usize) {
        for _ in 0..chunks {
            self.push(Ok(AudioFrame::new(vec![0.25; CHUNK_SAMPLES], FORMAT)));
        }
    }

    pub fn push(&self, item: CaptureItem) {
        let tx = self.tx.lock().unwrap();
        tx.as_ref()
            .expect("capture started and not stopped")
            .try_send(item)
            .expect("capture channel has room");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Capture source whose frames come from the test
pub struct ScriptedCapture {
    handle: CaptureHandle,
    started: bool,
}

impl ScriptedCapture {
    pub fn new() -> (Self, CaptureHandle) {
        let handle = CaptureHandle {
            tx: Arc::new(Mutex::new(None)),
            stopped: Arc::new(AtomicBool::new(false)),
        };
        (
            Self {
                handle: handle.clone(),
                started: false,
            },
            handle,
        )
    }
}

impl AudioCaptureSource for ScriptedCapture {
    fn format(&self) -> AudioFormat {
        FORMAT
    }

    fn start(&mut self) -> Result<CaptureReceiver, AudioError> {
        if self.started {
            return Err(AudioError::CaptureFinished);
        }
        self.started = true;
        let (tx, rx) = mpsc::channel(1024);
        *self.handle.tx.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    fn stop(&mut self) {
        self.handle.tx.lock().unwrap().take();
        self.handle.stopped.store(true, Ordering::SeqCst);
    }
}

/// Sink that keeps everything written to it
#[derive(Default)]
pub struct RecordingSink {
    written: Mutex<Vec<i16>>,
    clears: AtomicUsize,
    closed: AtomicBool,
}

impl RecordingSink {
    pub fn written(&self) -> Vec<i16> {
        self.written.lock().unwrap().clone()
    }

    pub fn clears(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl AudioSink for RecordingSink {
    fn format(&self) -> AudioFormat {
        FORMAT
    }

    fn write(&self, samples: &[i16]) -> Result<(), AudioError> {
        self.written.lock().unwrap().extend_from_slice(samples);
        Ok(())
    }

    fn clear(&self) {
        self.clears.fetch_add(1, Ordering::SeqCst);
    }

    fn queued_samples(&self) -> usize {
        0
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Observer that remembers finished utterances
#[derive(Default)]
pub struct RecordingObserver {
    pub utterances: Mutex<Vec<(Role, String)>>,
    pub turns: Mutex<Vec<TurnState>>,
}

impl SessionObserver for RecordingObserver {
    fn on_utterance(&self, role: Role, text: &str) {
        self.utterances.lock().unwrap().push((role, text.to_string()));
    }

    fn on_turn_changed(&self, turn: TurnState) {
        self.turns.lock().unwrap().push(turn);
    }
}

// ============================================================================
// Session harness
// ============================================================================

pub struct Harness {
    pub session: SessionOrchestrator,
    pub server: LoopbackServer,
    pub end: ServerEnd,
    pub connector: Arc<LoopbackConnector>,
    pub capture: CaptureHandle,
    pub sink: Arc<RecordingSink>,
    pub observer: Arc<RecordingObserver>,
    pub changes: broadcast::Receiver<SessionSnapshot>,
}

/// Build a session over a loopback service without starting it.
pub fn build(
    settings: SessionSettings,
) -> (
    SessionOrchestrator,
    LoopbackServer,
    Arc<LoopbackConnector>,
    CaptureHandle,
    Arc<RecordingSink>,
    Arc<RecordingObserver>,
) {
    let (connector, server) = loopback();
    let connector = Arc::new(connector);
    let (capture, handle) = ScriptedCapture::new();
    let sink = Arc::new(RecordingSink::default());
    let observer = Arc::new(RecordingObserver::default());

    let capabilities = SessionCapabilities::new(
        Box::new(capture),
        sink.clone(),
        connector.clone(),
        Arc::new(StaticCredentials::new("test-token")),
    )
    .with_observer(observer.clone());

    let session = SessionOrchestrator::new(settings, capabilities);
    (session, server, connector, handle, sink, observer)
}

/// Start a session and complete its handshake. The returned `end` has already
/// yielded the `session_start` control.
pub async fn start(settings: SessionSettings) -> Harness {
    let (mut session, mut server, connector, capture, sink, observer) = build(settings);
    let changes = session.subscribe();

    let accept = tokio::spawn(async move {
        let end = server.accept().await.expect("client connects");
        end.ready("session-1");
        (server, end)
    });
    session.start().await.expect("session starts");
    let (server, mut end) = accept.await.unwrap();

    match next_frame(&mut end).await {
        ClientFrame::Control { kind, .. } => assert_eq!(kind, "session_start"),
        other => panic!("expected session_start, got {:?}", other),
    }

    Harness {
        session,
        server,
        end,
        connector,
        capture,
        sink,
        observer,
        changes,
    }
}

// ============================================================================
// Wire helpers
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    Audio { seq: u64, samples: usize },
    Control { seq: u64, kind: String, payload: Value },
}

pub fn parse(frame: WireFrame) -> ClientFrame {
    match frame {
        WireFrame::Binary(bytes) => {
            let (header, payload) = decode_audio_header(&bytes).expect("valid audio header");
            ClientFrame::Audio {
                seq: header.seq,
                samples: payload.len() / 2,
            }
        }
        WireFrame::Text(text) => {
            let value: Value = serde_json::from_str(&text).expect("valid JSON");
            assert_eq!(value["type"], "control");
            ClientFrame::Control {
                seq: value["seq"].as_u64().expect("seq"),
                kind: value["payload"]["kind"].as_str().expect("kind").to_string(),
                payload: value["payload"].clone(),
            }
        }
        other => panic!("unexpected frame {:?}", other),
    }
}

/// Next frame the client sent
pub async fn next_frame(end: &mut ServerEnd) -> ClientFrame {
    let frame = tokio::time::timeout(WAIT, end.recv())
        .await
        .expect("client frame within timeout")
        .expect("client still connected");
    parse(frame)
}

/// Next control frame, skipping audio
pub async fn next_control(end: &mut ServerEnd) -> (String, Value) {
    loop {
        if let ClientFrame::Control { kind, payload, .. } = next_frame(end).await {
            return (kind, payload);
        }
    }
}

/// Sequence number and kind of the next control frame, skipping audio
pub async fn next_numbered_control(end: &mut ServerEnd) -> (u64, String) {
    loop {
        if let ClientFrame::Control { seq, kind, .. } = next_frame(end).await {
            return (seq, kind);
        }
    }
}

/// Sequence numbers of the next `count` audio frames
pub async fn audio_seqs(end: &mut ServerEnd, count: usize) -> Vec<u64> {
    let mut seqs = Vec::new();
    while seqs.len() < count {
        if let ClientFrame::Audio { seq, .. } = next_frame(end).await {
            seqs.push(seq);
        }
    }
    seqs
}

/// Server-to-client binary audio
pub fn server_audio(seq: u64, samples: &[i16]) -> WireFrame {
    let mut bytes = vec![2u8, 1];
    bytes.extend_from_slice(&(100u16).to_be_bytes());
    bytes.extend_from_slice(&seq.to_be_bytes());
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    WireFrame::Binary(bytes)
}

/// Server-to-client JSON audio belonging to `turn_id`
pub fn server_turn_audio(seq: u64, turn_id: &str, samples: &[i16]) -> Value {
    let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    json!({
        "type": "audio_chunk",
        "seq": seq,
        "data": {
            "codec": "linear16",
            "turn_id": turn_id,
            "audio": STANDARD.encode(bytes),
        }
    })
}

pub fn server_control(seq: u64, data: Value) -> Value {
    json!({ "type": "control", "seq": seq, "data": data })
}

pub fn server_transcript(seq: u64, role: &str, text: &str, is_final: bool) -> Value {
    json!({
        "type": "transcript",
        "seq": seq,
        "data": { "role": role, "text": text, "final": is_final }
    })
}

// ============================================================================
// Waiting
// ============================================================================

pub async fn wait_for_snapshot(
    session: &SessionOrchestrator,
    predicate: impl FnMut(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    let mut rx: watch::Receiver<SessionSnapshot> = session.watch();
    let snapshot = tokio::time::timeout(WAIT, rx.wait_for(predicate))
        .await
        .expect("snapshot within timeout")
        .expect("state stream open")
        .clone();
    snapshot
}

pub async fn wait_for_session(session: &SessionOrchestrator, state: SessionState) -> SessionSnapshot {
    wait_for_snapshot(session, |s| s.session == state).await
}

/// Poll `condition` until it holds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition within timeout");
}

/// Turn states seen on the change stream so far
pub fn drain_turns(changes: &mut broadcast::Receiver<SessionSnapshot>) -> Vec<TurnState> {
    let mut turns: Vec<TurnState> = Vec::new();
    while let Ok(snapshot) = changes.try_recv() {
        if turns.last() != Some(&snapshot.turn) {
            turns.push(snapshot.turn);
        }
    }
    turns
}
