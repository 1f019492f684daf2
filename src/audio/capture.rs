//! Microphone capture using CPAL
//!
//! The CPAL stream lives on a dedicated audio thread (streams are not `Send` on
//! every platform). The device callback converts samples to `f32` and hands
//! frames to the async side through a bounded channel without ever blocking.
//!
//! A stream error is handed to the audio thread, which tears the stream down
//! and closes the frame channel. The fault reaches the pipeline even when the
//! channel is full: either as an `Err` item or as the end of the sequence.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Sample, SampleFormat, Stream, StreamConfig};
use tokio::sync::mpsc;

use super::{AudioError, AudioFormat, AudioFrame};

/// One element of the capture sequence: a frame, or a device fault.
pub type CaptureItem = Result<AudioFrame, AudioError>;

/// Receiving end of a started capture sequence.
pub type CaptureReceiver = mpsc::Receiver<CaptureItem>;

/// Frames buffered between the audio thread and the outbound pipeline
const CAPTURE_CHANNEL_CAPACITY: usize = 64;

/// How long `start()` waits for the audio thread to open the device
const DEVICE_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Source of captured audio frames.
///
/// `start()` yields a lazy, infinite sequence at the device cadence; it can be
/// started only once. `stop()` ends the sequence and releases the device.
pub trait AudioCaptureSource: Send {
    /// Format of every frame this source produces
    fn format(&self) -> AudioFormat;

    fn start(&mut self) -> Result<CaptureReceiver, AudioError>;

    fn stop(&mut self);
}

/// Messages to the audio thread
enum ThreadSignal {
    Stop,
    Fault(AudioError),
}

enum Lifecycle {
    Ready,
    Running {
        stop_tx: std::sync::mpsc::Sender<ThreadSignal>,
        thread: JoinHandle<()>,
    },
    Finished,
}

/// Captures from the default input device.
pub struct CpalCapture {
    format: AudioFormat,
    sample_format: SampleFormat,
    lifecycle: Lifecycle,
    dropped_frames: Arc<AtomicU64>,
}

impl CpalCapture {
    /// Probe the default input device and remember its native format.
    pub fn new() -> Result<Self, AudioError> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| AudioError::DeviceUnavailable("no input device found".to_string()))?;

        log::info!("Capture: using input device {:?}", device.name());

        let supported = device
            .default_input_config()
            .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?;

        log::info!(
            "Capture: {} Hz, {} channels, {:?}",
            supported.sample_rate().0,
            supported.channels(),
            supported.sample_format()
        );

        Ok(Self {
            format: AudioFormat::new(supported.sample_rate().0, supported.channels()),
            sample_format: supported.sample_format(),
            lifecycle: Lifecycle::Ready,
            dropped_frames: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Frames discarded because the pipeline was not keeping up
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }
}

impl AudioCaptureSource for CpalCapture {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn start(&mut self) -> Result<CaptureReceiver, AudioError> {
        if !matches!(self.lifecycle, Lifecycle::Ready) {
            return Err(AudioError::CaptureFinished);
        }

        let (frame_tx, frame_rx) = mpsc::channel(CAPTURE_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel();

        let format = self.format;
        let sample_format = self.sample_format;
        let dropped = self.dropped_frames.clone();
        let fault_signal = stop_tx.clone();

        let thread = std::thread::Builder::new()
            .name("duplex-voice-capture".to_string())
            .spawn(move || {
                let fault_tx = frame_tx.clone();
                let stream =
                    match open_stream(format, sample_format, frame_tx, dropped, fault_signal) {
                        Ok(stream) => stream,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                let _ = ready_tx.send(Ok(()));

                // Park until stop(), a device fault, or the handle is dropped
                let signal = stop_rx.recv();
                drop(stream);
                if let Ok(ThreadSignal::Fault(fault)) = signal {
                    report_fault(fault_tx, fault);
                }
                log::info!("Capture: audio thread exiting, device released");
            })
            .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))?;

        match ready_rx.recv_timeout(DEVICE_OPEN_TIMEOUT) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = thread.join();
                self.lifecycle = Lifecycle::Finished;
                return Err(e);
            }
            Err(_) => {
                let _ = stop_tx.send(ThreadSignal::Stop);
                self.lifecycle = Lifecycle::Finished;
                return Err(AudioError::DeviceUnavailable(
                    "timed out opening input device".to_string(),
                ));
            }
        }

        log::info!("Capture: started");
        self.lifecycle = Lifecycle::Running { stop_tx, thread };
        Ok(frame_rx)
    }

    fn stop(&mut self) {
        match std::mem::replace(&mut self.lifecycle, Lifecycle::Finished) {
            Lifecycle::Running { stop_tx, thread } => {
                let _ = stop_tx.send(ThreadSignal::Stop);
                if thread.join().is_err() {
                    log::error!("Capture: audio thread panicked");
                }
                log::info!(
                    "Capture: stopped ({} frames dropped)",
                    self.dropped_frames()
                );
            }
            Lifecycle::Ready | Lifecycle::Finished => {}
        }
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Deliver `fault` and close the frame channel.
///
/// The stream and its senders are already gone, so dropping `tx` ends the
/// sequence once buffered frames are read. A full channel loses the reason but
/// not the fault.
fn report_fault(tx: mpsc::Sender<CaptureItem>, fault: AudioError) {
    if tx.try_send(Err(fault)).is_err() {
        log::warn!("Capture: frame channel full, ending capture without a reason");
    }
}

fn open_stream(
    format: AudioFormat,
    sample_format: SampleFormat,
    tx: mpsc::Sender<CaptureItem>,
    dropped: Arc<AtomicU64>,
    faults: std::sync::mpsc::Sender<ThreadSignal>,
) -> Result<Stream, AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| AudioError::DeviceUnavailable("no input device found".to_string()))?;

    let config = StreamConfig {
        channels: format.channels,
        sample_rate: cpal::SampleRate(format.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = match sample_format {
        SampleFormat::I16 => {
            build_stream_typed::<i16>(&device, &config, format, tx, dropped, faults)?
        }
        SampleFormat::U16 => {
            build_stream_typed::<u16>(&device, &config, format, tx, dropped, faults)?
        }
        SampleFormat::F32 => {
            build_stream_typed::<f32>(&device, &config, format, tx, dropped, faults)?
        }
        other => {
            return Err(AudioError::UnsupportedFormat(format!(
                "capture sample format {:?}",
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
    format: AudioFormat,
    tx: mpsc::Sender<CaptureItem>,
    dropped: Arc<AtomicU64>,
    faults: std::sync::mpsc::Sender<ThreadSignal>,
) -> Result<Stream, AudioError>
where
    T: cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    let err_fn = move |err: cpal::StreamError| {
        log::error!("Capture: stream error: {}", err);
        let fault = match err {
            cpal::StreamError::DeviceNotAvailable => {
                AudioError::DeviceLost("input device no longer available".to_string())
            }
            cpal::StreamError::BackendSpecific { err } => AudioError::DeviceLost(err.description),
        };
        let _ = faults.send(ThreadSignal::Fault(fault));
    };

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let samples: Vec<f32> = data.iter().map(|&s| s.to_sample::<f32>()).collect();
                let frame = AudioFrame::new(samples, format);
                if tx.try_send(Ok(frame)).is_err() {
                    let n = dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if n % 50 == 1 {
                        log::warn!("Capture: pipeline not keeping up, {} frames dropped", n);
                    }
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::DeviceUnavailable(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fault_is_delivered_when_there_is_room() {
        let (tx, mut rx) = mpsc::channel(4);
        report_fault(tx, AudioError::DeviceLost("unplugged".to_string()));

        assert_eq!(
            rx.recv().await.unwrap().unwrap_err(),
            AudioError::DeviceLost("unplugged".to_string())
        );
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn full_channel_still_ends_the_sequence() {
        let (tx, mut rx) = mpsc::channel(1);
        tx.try_send(Ok(AudioFrame::new(vec![0.0; 4], AudioFormat::new(24000, 1))))
            .unwrap();
        report_fault(tx, AudioError::DeviceLost("unplugged".to_string()));

        assert!(rx.recv().await.unwrap().is_ok());
        assert!(rx.recv().await.is_none());
    }
}
