//! Session configuration
//!
//! Settings live in `<config dir>/duplex-voice/settings.json`. Missing fields
//! take their defaults, so old files keep working as options are added.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::audio::AudioFormat;
use crate::streaming::{BackoffPolicy, ConnectionConfig, PlaybackConfig};

const APP_DIR_NAME: &str = "duplex-voice";
const SETTINGS_FILE_NAME: &str = "settings.json";

/// Environment variable that overrides `endpoint`
pub const ENDPOINT_ENV: &str = "VOICE_ENDPOINT";

pub const DEFAULT_ENDPOINT: &str = "wss://localhost:8443/v1/voice";
pub const DEFAULT_CHUNK_MS: u32 = 100;
pub const DEFAULT_WIRE_SAMPLE_RATE: u32 = 24_000;
pub const DEFAULT_WIRE_CHANNELS: u16 = 1;
pub const DEFAULT_OUTBOUND_QUEUE_DEPTH: usize = 50;
pub const DEFAULT_REORDER_WINDOW: usize = 32;
pub const DEFAULT_CHUNK_TIMEOUT_MS: u64 = 200;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("could not determine config directory")]
    NoConfigDir,
    #[error("settings I/O on {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("settings serialization: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// WebSocket URL of the voice service
    pub endpoint: String,

    /// Outbound audio format sent to the service
    pub wire_sample_rate: u32,
    pub wire_channels: u16,

    /// Duration of each outbound audio chunk.
    pub chunk_duration_ms: u32,

    /// Outbound chunks that may wait for the transport before backpressure kicks in.
    pub outbound_queue_depth: usize,

    /// Assistant chunks held ahead of a missing one before it is skipped.
    pub reorder_window: usize,

    /// How long playback waits for a missing assistant chunk.
    pub chunk_timeout_ms: u64,

    /// Play silence in place of skipped chunks instead of closing the gap.
    pub substitute_silence: bool,

    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Random extra delay, as a fraction of the backoff delay.
    pub backoff_jitter: f64,
    pub max_reconnect_attempts: u32,

    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub handshake_timeout_ms: u64,

    /// How long `stop()` waits for queued audio to reach the service.
    pub drain_timeout_ms: u64,
    /// Upper bound on the whole of `stop()`.
    pub shutdown_timeout_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            wire_sample_rate: DEFAULT_WIRE_SAMPLE_RATE,
            wire_channels: DEFAULT_WIRE_CHANNELS,
            chunk_duration_ms: DEFAULT_CHUNK_MS,
            outbound_queue_depth: DEFAULT_OUTBOUND_QUEUE_DEPTH,
            reorder_window: DEFAULT_REORDER_WINDOW,
            chunk_timeout_ms: DEFAULT_CHUNK_TIMEOUT_MS,
            substitute_silence: false,
            backoff_base_ms: 500,
            backoff_cap_ms: 10_000,
            backoff_jitter: 0.2,
            max_reconnect_attempts: 6,
            heartbeat_interval_ms: 5_000,
            heartbeat_timeout_ms: 15_000,
            connect_timeout_ms: 10_000,
            handshake_timeout_ms: 10_000,
            drain_timeout_ms: 2_000,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl SessionSettings {
    pub fn wire_format(&self) -> AudioFormat {
        AudioFormat::new(self.wire_sample_rate, self.wire_channels)
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            outbound_queue_depth: self.outbound_queue_depth,
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
            close_timeout: Duration::from_millis(self.drain_timeout_ms),
            backoff: BackoffPolicy {
                base: Duration::from_millis(self.backoff_base_ms),
                cap: Duration::from_millis(self.backoff_cap_ms),
                jitter_ratio: self.backoff_jitter,
                max_attempts: self.max_reconnect_attempts,
            },
        }
    }

    pub fn playback_config(&self) -> PlaybackConfig {
        PlaybackConfig {
            reorder_window: self.reorder_window.max(1),
            chunk_timeout: Duration::from_millis(self.chunk_timeout_ms),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Apply `VOICE_ENDPOINT` if set.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(endpoint) = std::env::var(ENDPOINT_ENV) {
            if !endpoint.is_empty() {
                log::info!("Settings: endpoint overridden by {}", ENDPOINT_ENV);
                self.endpoint = endpoint;
            }
        }
    }
}

/// Default location of the settings file
pub fn settings_path() -> Result<PathBuf, SettingsError> {
    let dir = dirs::config_dir().ok_or(SettingsError::NoConfigDir)?;
    Ok(dir.join(APP_DIR_NAME).join(SETTINGS_FILE_NAME))
}

/// Load settings, falling back to defaults on any problem (logged).
pub fn load_settings(path: &Path) -> SessionSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<SessionSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                SessionSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => SessionSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            SessionSettings::default()
        }
    }
}

pub fn save_settings(path: &Path, settings: &SessionSettings) -> Result<(), SettingsError> {
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| SettingsError::Io { path, source }
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err(parent))?;
    }

    let contents = serde_json::to_string_pretty(settings)?;

    // Write to a temp file in the same directory, then rename over the target
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents).map_err(io_err(&tmp_path))?;

    // On Windows, rename fails if the destination exists
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(io_err(path)(e));
            }
        }
    }

    std::fs::rename(&tmp_path, path).map_err(io_err(path))?;
    Ok(())
}
