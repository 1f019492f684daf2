//! Speaker output using CPAL
//!
//! Decoded assistant audio is queued into a shared sample queue that the device
//! callback drains. Underruns play silence. `clear()` drops everything queued,
//! which is how barge-in halts playback immediately.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};

use super::{AudioError, AudioFormat};

/// Upper bound on queued playback audio, in seconds
const MAX_QUEUED_SECS: u32 = 10;

const DEVICE_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Audio output the playback pipeline writes to.
///
/// Shared between the player task (writes) and the orchestrator (clears on
/// barge-in), so every method takes `&self`.
pub trait AudioSink: Send + Sync {
    /// Format `write` expects
    fn format(&self) -> AudioFormat;

    /// Queue interleaved PCM16 samples for playback.
    fn write(&self, samples: &[i16]) -> Result<(), AudioError>;

    /// Discard everything queued but not yet played.
    fn clear(&self);

    /// Samples queued but not yet played
    fn queued_samples(&self) -> usize;

    /// Stop the device and release it.
    fn close(&self);
}

type SampleQueue = Arc<Mutex<VecDeque<i16>>>;

/// Plays to the default output device.
pub struct CpalSink {
    format: AudioFormat,
    queue: SampleQueue,
    max_queued: usize,
    underruns: Arc<AtomicU64>,
    lost: Arc<AtomicBool>,
    thread: Mutex<Option<(std::sync::mpsc::Sender<()>, JoinHandle<()>)>>,
}

impl CpalSink {
    /// Open the default output device and start its stream.
    pub fn open() -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| AudioError::DeviceUnavailable("no output device found".to_string()))?;

        log::info!("Playback: using output device {:?}", device.name());

        let supported = device
            .default_output_config()
            .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?;
        let format = AudioFormat::new(supported.sample_rate().0, supported.channels());
        let sample_format = supported.sample_format();

        log::info!(
            "Playback: {} Hz, {} channels, {:?}",
            format.sample_rate,
            format.channels,
            sample_format
        );

        let queue: SampleQueue = Arc::new(Mutex::new(VecDeque::new()));
        let underruns = Arc::new(AtomicU64::new(0));
        let lost = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

        let thread_queue = queue.clone();
        let thread_underruns = underruns.clone();
        let thread_lost = lost.clone();
        let thread = std::thread::Builder::new()
            .name("duplex-voice-playback".to_string())
            .spawn(move || {
                let opened = open_stream(
                    format,
                    sample_format,
                    thread_queue,
                    thread_underruns,
                    thread_lost,
                );
                let stream = match opened {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                let _ = stop_rx.recv();
                drop(stream);
                log::info!("Playback: audio thread exiting, device released");
            })
            .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?;

        match ready_rx.recv_timeout(DEVICE_OPEN_TIMEOUT) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = stop_tx.send(());
                return Err(AudioError::DeviceUnavailable(
                    "timed out opening output device".to_string(),
                ));
            }
        }

        Ok(Self {
            format,
            queue,
            max_queued: format.samples_for_ms(MAX_QUEUED_SECS * 1000),
            underruns,
            lost,
            thread: Mutex::new(Some((stop_tx, thread))),
        })
    }

    /// Device callbacks that ran out of queued audio mid-buffer
    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }
}

impl AudioSink for CpalSink {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn write(&self, samples: &[i16]) -> Result<(), AudioError> {
        if self.lost.load(Ordering::Acquire) {
            return Err(AudioError::DeviceLost(
                "output device no longer available".to_string(),
            ));
        }
        let mut queue = self
            .queue
            .lock()
            .map_err(|_| AudioError::Playback("sample queue poisoned".to_string()))?;
        queue.extend(samples.iter().copied());

        let overflow = queue.len().saturating_sub(self.max_queued);
        if overflow > 0 {
            queue.drain(..overflow);
            log::warn!("Playback: queue over {}s, dropped {} samples", MAX_QUEUED_SECS, overflow);
        }
        Ok(())
    }

    fn clear(&self) {
        if let Ok(mut queue) = self.queue.lock() {
            let dropped = queue.len();
            queue.clear();
            if dropped > 0 {
                log::debug!("Playback: cleared {} queued samples", dropped);
            }
        }
    }

    fn queued_samples(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    fn close(&self) {
        let handle = self.thread.lock().ok().and_then(|mut guard| guard.take());
        if let Some((stop_tx, thread)) = handle {
            self.clear();
            let _ = stop_tx.send(());
            if thread.join().is_err() {
                log::error!("Playback: audio thread panicked");
            }
            log::info!("Playback: closed ({} underruns)", self.underruns());
        }
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_stream(
    format: AudioFormat,
    sample_format: SampleFormat,
    queue: SampleQueue,
    underruns: Arc<AtomicU64>,
    lost: Arc<AtomicBool>,
) -> Result<Stream, AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| AudioError::DeviceUnavailable("no output device found".to_string()))?;

    let config = StreamConfig {
        channels: format.channels,
        sample_rate: cpal::SampleRate(format.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = match sample_format {
        SampleFormat::I16 => build_stream_typed::<i16>(&device, &config, queue, underruns, lost)?,
        SampleFormat::U16 => build_stream_typed::<u16>(&device, &config, queue, underruns, lost)?,
        SampleFormat::F32 => build_stream_typed::<f32>(&device, &config, queue, underruns, lost)?,
        other => {
            return Err(AudioError::UnsupportedFormat(format!(
                "playback sample format {:?}",
                other
            )))
        }
    };

    stream
        .play()
        .map_err(|e| AudioError::DeviceUnavailable(format!("failed to start stream: {}", e)))?;

    Ok(stream)
}

fn build_stream_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    queue: SampleQueue,
    underruns: Arc<AtomicU64>,
    lost: Arc<AtomicBool>,
) -> Result<Stream, AudioError>
where
    T: cpal::SizedSample + cpal::FromSample<i16> + Send + 'static,
{
    let err_fn = move |err: cpal::StreamError| {
        log::error!("Playback: stream error: {}", err);
        if matches!(err, cpal::StreamError::DeviceNotAvailable) {
            lost.store(true, Ordering::Release);
        }
    };

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let mut guard = match queue.lock() {
                    Ok(guard) => guard,
                    Err(_) => return,
                };
                let had_audio = !guard.is_empty();
                let mut starved = false;
                for out in data.iter_mut() {
                    let sample = match guard.pop_front() {
                        Some(s) => s,
                        None => {
                            starved = true;
                            0
                        }
                    };
                    *out = T::from_sample(sample);
                }
                if starved && had_audio {
                    underruns.fetch_add(1, Ordering::Relaxed);
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))
}
