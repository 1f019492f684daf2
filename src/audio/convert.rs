//! Format conversion between the capture device, the wire codec and the playback device
//!
//! Every call is independent: no filter state is carried between frames.
//!
//! # Resampling policy
//!
//! - Identical rates pass through untouched
//! - Integer down-ratios (e.g. 48kHz → 24kHz) average each group of N frames
//! - Everything else uses linear interpolation, producing `ceil(len * dst / src)` frames
//!
//! The policy is deterministic: the same input always produces the same output.

use super::{AudioError, AudioFormat, AudioFrame};

const MIN_SAMPLE_RATE: u32 = 8_000;
const MAX_SAMPLE_RATE: u32 = 192_000;
const MAX_CAPTURE_CHANNELS: u16 = 8;

/// Converts captured frames to the wire format and wire audio to the playback format.
#[derive(Debug, Clone)]
pub struct AudioFormatConverter {
    capture: AudioFormat,
    wire: AudioFormat,
    playback: AudioFormat,
}

impl AudioFormatConverter {
    /// Validate the three formats up front so misconfiguration fails at startup.
    pub fn new(
        capture: AudioFormat,
        wire: AudioFormat,
        playback: AudioFormat,
    ) -> Result<Self, AudioError> {
        validate_rate("capture", capture.sample_rate)?;
        validate_rate("wire", wire.sample_rate)?;
        validate_rate("playback", playback.sample_rate)?;

        if capture.channels == 0 || capture.channels > MAX_CAPTURE_CHANNELS {
            return Err(AudioError::UnsupportedFormat(format!(
                "capture channel count {} (expected 1..={})",
                capture.channels, MAX_CAPTURE_CHANNELS
            )));
        }
        validate_stream_channels("wire", wire.channels)?;
        validate_stream_channels("playback", playback.channels)?;

        log::info!(
            "Converter: capture {}Hz/{}ch → wire {}Hz/{}ch → playback {}Hz/{}ch",
            capture.sample_rate,
            capture.channels,
            wire.sample_rate,
            wire.channels,
            playback.sample_rate,
            playback.channels
        );

        Ok(Self {
            capture,
            wire,
            playback,
        })
    }

    pub fn capture_format(&self) -> AudioFormat {
        self.capture
    }

    pub fn wire_format(&self) -> AudioFormat {
        self.wire
    }

    pub fn playback_format(&self) -> AudioFormat {
        self.playback
    }

    /// Convert a captured frame into PCM16 samples in the wire format.
    pub fn to_wire(&self, frame: &AudioFrame) -> Result<Vec<i16>, AudioError> {
        if frame.format() != self.capture {
            return Err(AudioError::UnsupportedFormat(format!(
                "frame is {}Hz/{}ch, capture is configured for {}Hz/{}ch",
                frame.sample_rate, frame.channels, self.capture.sample_rate, self.capture.channels
            )));
        }

        let mixed = remix(&frame.samples, self.capture.channels, self.wire.channels);
        let resampled = resample(
            &mixed,
            self.wire.channels,
            self.capture.sample_rate,
            self.wire.sample_rate,
        );

        Ok(resampled.into_iter().map(sample_to_i16).collect())
    }

    /// Convert decoded PCM16 audio in `source` format into the playback format.
    pub fn to_playback(&self, samples: &[i16], source: AudioFormat) -> Result<Vec<i16>, AudioError> {
        validate_rate("inbound", source.sample_rate)?;
        validate_stream_channels("inbound", source.channels)?;

        if source == self.playback {
            return Ok(samples.to_vec());
        }

        let floats = i16_to_f32(samples);
        let mixed = remix(&floats, source.channels, self.playback.channels);
        let resampled = resample(
            &mixed,
            self.playback.channels,
            source.sample_rate,
            self.playback.sample_rate,
        );

        Ok(resampled.into_iter().map(sample_to_i16).collect())
    }
}

fn validate_rate(label: &str, rate: u32) -> Result<(), AudioError> {
    if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&rate) {
        return Err(AudioError::UnsupportedFormat(format!(
            "{} sample rate {}Hz (expected {}..={})",
            label, rate, MIN_SAMPLE_RATE, MAX_SAMPLE_RATE
        )));
    }
    Ok(())
}

fn validate_stream_channels(label: &str, channels: u16) -> Result<(), AudioError> {
    if channels != 1 && channels != 2 {
        return Err(AudioError::UnsupportedFormat(format!(
            "{} channel count {} (expected mono or stereo)",
            label, channels
        )));
    }
    Ok(())
}

/// Convert any sample type to i16.
pub fn sample_to_i16<T>(sample: T) -> i16
where
    T: cpal::Sample,
    f32: cpal::FromSample<T>,
{
    let f32_sample: f32 = sample.to_sample::<f32>();
    // Clamp and convert to i16
    let clamped = f32_sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32) as i16
}

/// Inverse of [`sample_to_i16`] for f32 pipelines.
pub fn i16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples
        .iter()
        .map(|&s| s as f32 / i16::MAX as f32)
        .collect()
}

/// Change the channel layout of interleaved samples.
///
/// Down to mono averages every channel; mono to stereo duplicates; wider
/// layouts to stereo keep the first two channels.
fn remix(samples: &[f32], from: u16, to: u16) -> Vec<f32> {
    let from = from as usize;
    let to = to as usize;
    if from == to {
        return samples.to_vec();
    }

    let mut out = Vec::with_capacity(samples.len() / from * to);
    for frame in samples.chunks(from) {
        match to {
            1 => out.push(frame.iter().sum::<f32>() / frame.len() as f32),
            _ if frame.len() == 1 => {
                out.extend(std::iter::repeat(frame[0]).take(to));
            }
            _ => {
                for ch in 0..to {
                    out.push(frame.get(ch).copied().unwrap_or(0.0));
                }
            }
        }
    }
    out
}

/// Resample interleaved samples from `source_rate` to `target_rate`.
fn resample(samples: &[f32], channels: u16, source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == target_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let channels = channels as usize;
    let in_frames = samples.len() / channels;

    if source_rate > target_rate && source_rate % target_rate == 0 {
        let ratio = (source_rate / target_rate) as usize;
        let mut out = Vec::with_capacity(in_frames / ratio * channels + channels);
        for group in samples.chunks(ratio * channels) {
            let frames = group.len() / channels;
            for ch in 0..channels {
                let sum: f32 = (0..frames).map(|f| group[f * channels + ch]).sum();
                out.push(sum / frames as f32);
            }
        }
        return out;
    }

    let out_frames =
        ((in_frames as u64 * target_rate as u64 + source_rate as u64 - 1) / source_rate as u64) as usize;
    let step = source_rate as f64 / target_rate as f64;
    let mut out = Vec::with_capacity(out_frames * channels);

    for i in 0..out_frames {
        let pos = i as f64 * step;
        let idx = (pos.floor() as usize).min(in_frames - 1);
        let next = (idx + 1).min(in_frames - 1);
        let frac = (pos - idx as f64) as f32;
        for ch in 0..channels {
            let a = samples[idx * channels + ch];
            let b = samples[next * channels + ch];
            out.push(a + (b - a) * frac);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn converter(capture: AudioFormat, wire: AudioFormat) -> AudioFormatConverter {
        AudioFormatConverter::new(capture, wire, wire).unwrap()
    }

    #[test]
    fn test_sample_to_i16() {
        assert_eq!(sample_to_i16(0.0f32), 0);
        assert_eq!(sample_to_i16(1.0f32), i16::MAX);
        assert_eq!(sample_to_i16(-1.0f32), -i16::MAX);

        // Test clamping
        assert_eq!(sample_to_i16(2.0f32), i16::MAX);
        assert_eq!(sample_to_i16(-2.0f32), -i16::MAX);
    }

    #[test]
    fn test_rejects_unsupported_channel_count() {
        let err = AudioFormatConverter::new(
            AudioFormat::new(48000, 1),
            AudioFormat::new(24000, 3),
            AudioFormat::new(24000, 1),
        )
        .unwrap_err();
        assert!(matches!(err, AudioError::UnsupportedFormat(_)));

        let err = AudioFormatConverter::new(
            AudioFormat::new(48000, 0),
            AudioFormat::new(24000, 1),
            AudioFormat::new(24000, 1),
        )
        .unwrap_err();
        assert!(matches!(err, AudioError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_rejects_out_of_range_rate() {
        let err = AudioFormatConverter::new(
            AudioFormat::new(4000, 1),
            AudioFormat::new(24000, 1),
            AudioFormat::new(24000, 1),
        )
        .unwrap_err();
        assert!(matches!(err, AudioError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_frame_with_wrong_format_is_rejected() {
        let conv = converter(AudioFormat::new(48000, 1), AudioFormat::new(24000, 1));
        let frame = AudioFrame::new(vec![0.0; 480], AudioFormat::new(44100, 1));
        assert!(matches!(
            conv.to_wire(&frame),
            Err(AudioError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_downsample_2x_averages() {
        let conv = converter(AudioFormat::new(48000, 1), AudioFormat::new(24000, 1));
        let frame = AudioFrame::new(vec![0.1, 0.3, 0.5, 0.7], AudioFormat::new(48000, 1));
        let wire = conv.to_wire(&frame).unwrap();

        assert_eq!(wire.len(), 2);
        assert_eq!(wire[0], sample_to_i16(0.2f32));
        assert_eq!(wire[1], sample_to_i16(0.6f32));
    }

    #[test]
    fn test_stereo_capture_mixes_to_mono() {
        let conv = converter(AudioFormat::new(24000, 2), AudioFormat::new(24000, 1));
        let frame = AudioFrame::new(vec![0.5, -0.5, 1.0, 0.0], AudioFormat::new(24000, 2));
        let wire = conv.to_wire(&frame).unwrap();

        assert_eq!(wire, vec![0, sample_to_i16(0.5f32)]);
    }

    #[test]
    fn test_linear_upsample_length_and_endpoints() {
        let conv = AudioFormatConverter::new(
            AudioFormat::new(24000, 1),
            AudioFormat::new(24000, 1),
            AudioFormat::new(48000, 1),
        )
        .unwrap();
        let out = conv
            .to_playback(&[0, 1000, 2000], AudioFormat::new(24000, 1))
            .unwrap();

        assert_eq!(out.len(), 6);
        assert_eq!(out[0], 0);
        // Midpoint between 0 and 1000
        assert!((out[1] as i32 - 500).abs() <= 1);
    }

    #[test]
    fn test_non_integer_ratio_is_deterministic() {
        let conv = converter(AudioFormat::new(44100, 1), AudioFormat::new(24000, 1));
        let samples: Vec<f32> = (0..441).map(|i| (i as f32 / 441.0) - 0.5).collect();
        let frame = AudioFrame::new(samples, AudioFormat::new(44100, 1));

        let first = conv.to_wire(&frame).unwrap();
        let second = conv.to_wire(&frame).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 240);
    }

    #[test]
    fn test_round_trip_identical_formats_within_tolerance() {
        let format = AudioFormat::new(24000, 1);
        let conv = converter(format, format);
        let samples: Vec<f32> = (0..240).map(|i| ((i as f32) * 0.05).sin() * 0.8).collect();
        let frame = AudioFrame::new(samples.clone(), format);

        let wire = conv.to_wire(&frame).unwrap();
        let playback = conv.to_playback(&wire, format).unwrap();
        assert_eq!(playback, wire);

        let back = i16_to_f32(&playback);
        for (orig, got) in samples.iter().zip(back.iter()) {
            assert!((orig - got).abs() <= 1.0 / i16::MAX as f32);
        }
    }

    #[test]
    fn test_to_playback_mono_to_stereo() {
        let conv = AudioFormatConverter::new(
            AudioFormat::new(24000, 1),
            AudioFormat::new(24000, 1),
            AudioFormat::new(24000, 2),
        )
        .unwrap();
        let out = conv
            .to_playback(&[100, -100], AudioFormat::new(24000, 1))
            .unwrap();
        assert_eq!(out.len(), 4);
        assert_eq!(out[0], out[1]);
        assert_eq!(out[2], out[3]);
    }
}
