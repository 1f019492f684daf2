//! Audio device and format handling for duplex-voice
//!
//! Capture pulls frames from the microphone, the converter reshapes them into the
//! wire format, and the playback sink writes decoded assistant audio to the speaker.
//! Uses CPAL for both device directions.

pub mod capture;
pub mod convert;
pub mod playback;

use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use capture::{AudioCaptureSource, CaptureItem, CaptureReceiver, CpalCapture};
pub use convert::{sample_to_i16, AudioFormatConverter};
pub use playback::{AudioSink, CpalSink};

/// Errors that can occur on the audio side of a session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AudioError {
    /// The device could not be opened
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),
    /// The device disappeared while in use (e.g. unplugged)
    #[error("audio device lost: {0}")]
    DeviceLost(String),
    /// Source and target format parameters are incompatible
    #[error("unsupported audio format: {0}")]
    UnsupportedFormat(String),
    /// Capture sequences cannot be restarted once started
    #[error("capture source already started")]
    CaptureFinished,
    /// Writing to the output sink failed
    #[error("playback failed: {0}")]
    Playback(String),
}

/// Sample rate and channel layout of a PCM stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    pub const fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// Interleaved samples needed to cover `duration_ms`.
    pub fn samples_for_ms(&self, duration_ms: u32) -> usize {
        (self.sample_rate as u64 * duration_ms as u64 / 1000) as usize * self.channels as usize
    }

    /// Duration in milliseconds of `samples` interleaved samples.
    pub fn duration_ms(&self, samples: usize) -> u64 {
        let frames = samples as u64 / self.channels.max(1) as u64;
        frames * 1000 / self.sample_rate.max(1) as u64
    }
}

/// A block of raw samples straight from the capture device.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Interleaved samples in [-1.0, 1.0]
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
    /// Monotonic timestamp of the device callback
    pub captured_at: Instant,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, format: AudioFormat) -> Self {
        Self {
            samples,
            sample_rate: format.sample_rate,
            channels: format.channels,
            captured_at: Instant::now(),
        }
    }

    pub fn format(&self) -> AudioFormat {
        AudioFormat::new(self.sample_rate, self.channels)
    }
}
