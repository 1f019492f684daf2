//! Connection lifecycle to the voice service
//!
//! # Connection Flow
//!
//! 1. `connect()` - fetch a token, open the transport, wait for `session_ready`
//! 2. `sender()` - queue outbound frames (bounded; raises backpressure when full)
//! 3. `take_receiver()` - inbound frames, in arrival order
//! 4. `close()` - graceful shutdown within `close_timeout`
//!
//! # Retry Strategy
//!
//! Transport errors are retried with exponential backoff plus jitter, up to
//! `max_attempts` per outage. On reconnect the driver sends `session_resume`
//! naming the next audio sequence number and keeps draining the same queue.
//! Frames already written to the old transport are never sent again. Control
//! frames share one counter with the framer (`control_sequence()`), and the
//! driver keeps their numbers increasing on the wire across a resume.
//! Authentication failures get one credential refresh, then fail for good.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::framer::ControlSequence;
use super::protocol::{
    is_auth_error_code, ControlData, ControlFrame, ControlKind, OutboundFrame, ServerMessage,
    WireFrame,
};
use super::transport::{Connector, Transport};
use super::StreamingError;
use crate::credentials::CredentialProvider;
use crate::metrics::SessionMetrics;

/// Inbound frames buffered between the driver and the decoder
const INBOUND_CHANNEL_CAPACITY: usize = 256;

/// Lower bound for the heartbeat timer
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(10);

/// Lifecycle of the connection to the service
///
/// `Disconnected` is the idle state before (and between) attempts;
/// `Handshaking` covers connecting plus the `session_ready` exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Handshaking,
    Open,
    Reconnecting { attempt: u32 },
    Closing,
    Closed,
    Failed { reason: String },
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed { .. })
    }
}

/// Exponential backoff with jitter
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Up to this fraction of the delay is added at random
    pub jitter_ratio: f64,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    /// `min(cap, base * 2^(attempt-1))` for a 1-based attempt, without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.cap)
            .min(self.cap)
    }

    /// Delay before retry `attempt`, jitter included
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt);
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        if ratio == 0.0 {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0.0..=ratio);
        delay + delay.mul_f64(jitter)
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub outbound_queue_depth: usize,
    pub handshake_timeout: Duration,
    /// Ping after this long without inbound traffic
    pub heartbeat_interval: Duration,
    /// Treat the link as dead after this long without inbound traffic
    pub heartbeat_timeout: Duration,
    pub close_timeout: Duration,
    pub backoff: BackoffPolicy,
}

/// Handle for queueing outbound frames
#[derive(Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<OutboundFrame>,
    backpressure: Arc<watch::Sender<bool>>,
    metrics: Arc<SessionMetrics>,
}

impl FrameSender {
    /// Queue a frame, waiting for space if the queue is full.
    ///
    /// While waiting, the backpressure signal is raised.
    pub async fn send(&self, frame: OutboundFrame) -> Result<(), StreamingError> {
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(_)) => Err(StreamingError::Closed),
            Err(TrySendError::Full(frame)) => {
                log::warn!(
                    "Connection: outbound queue full at seq {}, applying backpressure",
                    frame.seq()
                );
                self.metrics.record_backpressure();
                self.backpressure.send_replace(true);
                let result = self.tx.send(frame).await.map_err(|_| StreamingError::Closed);
                self.backpressure.send_replace(false);
                result
            }
        }
    }

    /// Frames queued but not yet taken by the driver
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

/// Owns the connection to the service and the task that drives it
pub struct ConnectionManager {
    link: Link,
    outbound_tx: mpsc::Sender<OutboundFrame>,
    outbound_rx: Option<mpsc::Receiver<OutboundFrame>>,
    inbound_tx: Option<mpsc::Sender<WireFrame>>,
    inbound_rx: Option<mpsc::Receiver<WireFrame>>,
    backpressure: Arc<watch::Sender<bool>>,
    driver: Option<JoinHandle<()>>,
    session_id: Option<String>,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialProvider>,
        metrics: Arc<SessionMetrics>,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue_depth.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (backpressure_tx, _) = watch::channel(false);

        Self {
            link: Link {
                config,
                connector,
                credentials,
                metrics,
                state: Arc::new(state_tx),
                control_seq: ControlSequence::new(),
                cancel: CancellationToken::new(),
            },
            outbound_tx,
            outbound_rx: Some(outbound_rx),
            inbound_tx: Some(inbound_tx),
            inbound_rx: Some(inbound_rx),
            backpressure: Arc::new(backpressure_tx),
            driver: None,
            session_id: None,
        }
    }

    /// Connect and complete the handshake, retrying transport errors.
    pub async fn connect(&mut self) -> Result<(), StreamingError> {
        if self.driver.is_some() {
            log::warn!("Connection: connect() called while already connected");
            return Ok(());
        }
        if self.link.state.borrow().is_terminal() {
            return Err(StreamingError::Closed);
        }

        let established = match self.link.establish_with_retry(false).await {
            Ok(established) => established,
            Err(e) => {
                if e != StreamingError::Closed {
                    self.link.metrics.record_error("connect", e.to_string());
                    self.link.set_state(ConnectionState::Failed {
                        reason: e.to_string(),
                    });
                }
                return Err(e);
            }
        };

        let (Some(outbound_rx), Some(inbound_tx)) = (self.outbound_rx.take(), self.inbound_tx.take())
        else {
            return Err(StreamingError::Closed);
        };

        log::info!("Connection: session {} ready", established.session_id);
        self.session_id = Some(established.session_id.clone());
        self.link.set_state(ConnectionState::Open);

        let driver = Driver {
            link: self.link.clone(),
            transport: established.transport,
            session_id: established.session_id,
            outbound_rx,
            inbound_tx,
            last_control_seq: None,
        };
        self.driver = Some(tokio::spawn(driver.run()));
        Ok(())
    }

    /// Counter the outbound framer must number control frames from
    pub fn control_sequence(&self) -> ControlSequence {
        self.link.control_seq.clone()
    }

    pub fn sender(&self) -> FrameSender {
        FrameSender {
            tx: self.outbound_tx.clone(),
            backpressure: self.backpressure.clone(),
            metrics: self.link.metrics.clone(),
        }
    }

    /// Take the inbound frame sequence. It ends when the connection closes or
    /// fails. Returns `None` if already taken.
    pub fn take_receiver(&mut self) -> Option<mpsc::Receiver<WireFrame>> {
        self.inbound_rx.take()
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.link.state.subscribe()
    }

    pub fn current_state(&self) -> ConnectionState {
        self.link.state.borrow().clone()
    }

    /// `true` while a sender is blocked on a full outbound queue
    pub fn backpressure(&self) -> watch::Receiver<bool> {
        self.backpressure.subscribe()
    }

    /// Server-assigned id of the current session
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Close the connection gracefully, aborting the driver if it does not
    /// finish within the close timeout.
    pub async fn close(&mut self) {
        log::info!("Connection: closing");
        self.link.cancel.cancel();

        if let Some(mut driver) = self.driver.take() {
            if timeout(self.link.config.close_timeout, &mut driver)
                .await
                .is_err()
            {
                log::warn!("Connection: driver did not stop in time, aborting");
                driver.abort();
            }
        }

        if !self.link.state.borrow().is_terminal() {
            self.link.set_state(ConnectionState::Closed);
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.link.cancel.cancel();
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

/// Everything needed to (re)establish a transport
#[derive(Clone)]
struct Link {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialProvider>,
    metrics: Arc<SessionMetrics>,
    state: Arc<watch::Sender<ConnectionState>>,
    control_seq: ControlSequence,
    cancel: CancellationToken,
}

struct Established {
    transport: Box<dyn Transport>,
    session_id: String,
}

impl Link {
    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next.clone());
        if previous != next {
            log::info!("Connection: {:?} -> {:?}", previous, next);
        }
    }

    /// Attempt to establish a transport, backing off between attempts.
    ///
    /// A first connect tries immediately; a reconnect backs off before every
    /// attempt. Returns `Closed` if cancelled.
    async fn establish_with_retry(&self, resuming: bool) -> Result<Established, StreamingError> {
        let max_attempts = self.config.backoff.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..=max_attempts {
            let retry = if resuming { attempt + 1 } else { attempt };
            if retry > max_attempts {
                break;
            }

            if retry > 0 {
                if resuming {
                    self.set_state(ConnectionState::Reconnecting { attempt: retry });
                }
                let delay = self.config.backoff.delay(retry);
                log::info!(
                    "Connection: retrying in {:?} (attempt {}/{})",
                    delay,
                    retry,
                    max_attempts
                );
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(StreamingError::Closed),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            self.set_state(ConnectionState::Disconnected);
            self.set_state(ConnectionState::Handshaking);

            let result = tokio::select! {
                _ = self.cancel.cancelled() => return Err(StreamingError::Closed),
                result = self.establish() => result,
            };

            match result {
                Ok(established) => return Ok(established),
                Err(e @ StreamingError::Auth(_)) => {
                    log::error!("Connection: authentication failed: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    log::warn!("Connection: attempt failed: {}", e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| StreamingError::Transport("max attempts exceeded".to_string())))
    }

    /// One attempt, with a single credential refresh if the token is rejected.
    async fn establish(&self) -> Result<Established, StreamingError> {
        let token = self.credentials.token().await?;
        match self.open(&token).await {
            Err(StreamingError::Auth(reason)) => {
                log::warn!("Connection: credentials rejected ({}), refreshing", reason);
                let token = self.credentials.refresh().await?;
                self.open(&token).await
            }
            other => other,
        }
    }

    async fn open(&self, token: &str) -> Result<Established, StreamingError> {
        let mut transport = self.connector.connect(token).await?;

        match timeout(self.config.handshake_timeout, wait_for_ready(transport.as_mut())).await {
            Ok(Ok(session_id)) => Ok(Established {
                transport,
                session_id,
            }),
            Ok(Err(e)) => {
                transport.close().await;
                Err(e)
            }
            Err(_) => {
                transport.close().await;
                Err(StreamingError::Transport("handshake timeout".to_string()))
            }
        }
    }
}

/// Wait for the server's `session_ready`, ignoring anything else.
async fn wait_for_ready(transport: &mut dyn Transport) -> Result<String, StreamingError> {
    while let Some(received) = transport.recv().await {
        let text = match received? {
            WireFrame::Text(text) => text,
            _ => continue, // audio and keepalives before ready are irrelevant
        };
        match serde_json::from_str::<ServerMessage>(&text) {
            Ok(ServerMessage::Control {
                data: ControlData::SessionReady { session_id },
                ..
            }) => return Ok(session_id),
            Ok(ServerMessage::Control {
                data: ControlData::Error { code, message },
                ..
            }) => {
                let code = code.unwrap_or_default();
                return Err(if is_auth_error_code(&code) {
                    StreamingError::Auth(message)
                } else {
                    StreamingError::Transport(format!("server error {}: {}", code, message))
                });
            }
            Ok(_) => log::debug!("Connection: ignoring message during handshake"),
            Err(e) => log::warn!("Connection: unparseable handshake message: {}", e),
        }
    }
    Err(StreamingError::Transport(
        "connection closed during handshake".to_string(),
    ))
}

/// Why the pump loop stopped
enum Exit {
    /// Local close, or the session side went away
    Cancelled,
    /// The server closed the connection normally
    RemoteClosed,
    /// The transport failed; reconnect
    Dropped(StreamingError),
}

/// Background task moving frames between the queues and the transport
struct Driver {
    link: Link,
    transport: Box<dyn Transport>,
    session_id: String,
    outbound_rx: mpsc::Receiver<OutboundFrame>,
    inbound_tx: mpsc::Sender<WireFrame>,
    /// Highest control sequence number written to a transport
    last_control_seq: Option<u64>,
}

impl Driver {
    async fn run(mut self) {
        let mut exit = self.pump().await;
        loop {
            match exit {
                Exit::Cancelled => {
                    self.link.set_state(ConnectionState::Closing);
                    let _ = timeout(self.link.config.close_timeout, self.transport.close()).await;
                    self.link.set_state(ConnectionState::Closed);
                    break;
                }
                Exit::RemoteClosed => {
                    log::info!("Connection: server ended session {}", self.session_id);
                    self.link.set_state(ConnectionState::Closed);
                    break;
                }
                Exit::Dropped(err) => {
                    log::warn!("Connection: transport dropped: {}", err);
                    self.link.metrics.record_error("transport", err.to_string());
                    let _ = timeout(self.link.config.close_timeout, self.transport.close()).await;

                    match self.link.establish_with_retry(true).await {
                        Ok(established) => {
                            exit = match self.resume(established).await {
                                Ok(()) => self.pump().await,
                                Err(e) => Exit::Dropped(e),
                            };
                        }
                        Err(StreamingError::Closed) => {
                            self.link.set_state(ConnectionState::Closed);
                            break;
                        }
                        Err(e) => {
                            log::error!("Connection: giving up: {}", e);
                            self.link.metrics.record_error("connection", e.to_string());
                            self.link.set_state(ConnectionState::Failed {
                                reason: e.to_string(),
                            });
                            break;
                        }
                    }
                }
            }
        }
        log::debug!("Connection: driver exiting");
    }

    /// Swap in the new transport and tell the server where audio resumes.
    async fn resume(&mut self, established: Established) -> Result<(), StreamingError> {
        let next_seq = self
            .link
            .metrics
            .last_sent_seq()
            .map_or(0, |seq| seq.saturating_add(1));
        let previous = std::mem::replace(&mut self.session_id, established.session_id);
        self.transport = established.transport;

        let resume = ControlFrame {
            seq: self.link.control_seq.next(),
            kind: ControlKind::SessionResume {
                session_id: Some(previous),
                next_seq,
            },
        };
        self.transport.send(WireFrame::Text(resume.to_json()?)).await?;
        self.last_control_seq = Some(resume.seq);

        log::info!(
            "Connection: resumed as session {} at seq {}",
            self.session_id,
            next_seq
        );
        self.link.metrics.record_reconnect();
        self.link.set_state(ConnectionState::Open);
        Ok(())
    }

    /// Renumber a control frame that was queued before a `session_resume`
    /// took a higher number, so control numbers never go backwards.
    fn order_control(&mut self, frame: &mut OutboundFrame) {
        let OutboundFrame::Control(control) = frame else {
            return;
        };
        if self.last_control_seq.is_some_and(|last| control.seq <= last) {
            let seq = self.link.control_seq.next();
            log::debug!("Connection: renumbering control {} as {}", control.seq, seq);
            control.seq = seq;
        }
        self.last_control_seq = Some(control.seq);
    }

    async fn pump(&mut self) -> Exit {
        let interval = self.link.config.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL);
        let mut heartbeat = tokio::time::interval_at(Instant::now() + interval, interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = self.link.cancel.cancelled() => return Exit::Cancelled,
                received = self.transport.recv() => {
                    let frame = match received {
                        None => return Exit::RemoteClosed,
                        Some(Err(e)) => return Exit::Dropped(e),
                        Some(Ok(frame)) => frame,
                    };
                    last_inbound = Instant::now();
                    if matches!(frame, WireFrame::Ping(_) | WireFrame::Pong(_)) {
                        continue;
                    }
                    if self.inbound_tx.send(frame).await.is_err() {
                        log::debug!("Connection: inbound receiver dropped");
                        return Exit::Cancelled;
                    }
                }
                next = self.outbound_rx.recv() => {
                    let Some(mut frame) = next else {
                        return Exit::Cancelled;
                    };
                    self.order_control(&mut frame);
                    let wire = match frame.to_wire() {
                        Ok(wire) => wire,
                        Err(e) => {
                            log::error!("Connection: failed to encode frame {}: {}", frame.seq(), e);
                            continue;
                        }
                    };
                    if let Err(e) = self.transport.send(wire).await {
                        // The frame is lost with the connection; it is not retried
                        log::warn!("Connection: send of frame {} failed", frame.seq());
                        return Exit::Dropped(e);
                    }
                    self.link
                        .metrics
                        .record_sent(frame.is_audio().then(|| frame.seq()));
                }
                _ = heartbeat.tick() => {
                    let silent_for = last_inbound.elapsed();
                    if silent_for >= self.link.config.heartbeat_timeout {
                        return Exit::Dropped(StreamingError::Transport(format!(
                            "no inbound traffic for {:?}",
                            silent_for
                        )));
                    }
                    if silent_for >= interval {
                        if let Err(e) = self.transport.send(WireFrame::Ping(Vec::new())).await {
                            return Exit::Dropped(e);
                        }
                    }
                }
            }
        }
    }
}
