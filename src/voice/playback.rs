//! Audio playback to speakers

use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Host, SampleFormat, SampleRate, StreamConfig};

use super::frame::{tone, PcmAudio};
use crate::config::AudioConfig;
use crate::error::DeviceError;
use crate::{Error, Result};

/// Sink for finished clips
#[async_trait]
pub trait PlaybackDevice: Send + Sync {
    /// Play a clip to completion
    ///
    /// # Errors
    ///
    /// Returns `DeviceError` if the output device is unavailable or fails
    async fn accept(&self, audio: PcmAudio) -> std::result::Result<(), DeviceError>;
}

/// Plays clips on a cpal output device
///
/// A stream is built per clip, so a speaker that comes back after being
/// unplugged is picked up on the next session.
pub struct CpalPlayback {
    device_name: Option<String>,
}

impl CpalPlayback {
    #[must_use]
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            device_name: config.output_device_name.clone(),
        }
    }

    /// Check that an output device can be found
    ///
    /// # Errors
    ///
    /// Returns `DeviceError::Unavailable` if there is no output device
    pub fn probe(&self) -> std::result::Result<String, DeviceError> {
        let host = cpal::default_host();
        let device = find_output_device(&host, self.device_name.as_deref())?;
        Ok(device.name().unwrap_or_else(|_| "unknown".to_string()))
    }
}

#[async_trait]
impl PlaybackDevice for CpalPlayback {
    async fn accept(&self, audio: PcmAudio) -> std::result::Result<(), DeviceError> {
        if audio.is_empty() {
            return Ok(());
        }
        let device_name = self.device_name.clone();
        tokio::task::spawn_blocking(move || play_blocking(device_name.as_deref(), &audio))
            .await
            .map_err(|e| DeviceError::Playback(e.to_string()))?
    }
}

/// Play a clip on the calling thread, returning when it has finished
fn play_blocking(device_name: Option<&str>, audio: &PcmAudio) -> std::result::Result<(), DeviceError> {
    let host = cpal::default_host();
    let device = find_output_device(&host, device_name)?;
    let (config, format) = pick_output_config(&device, audio.sample_rate)?;
    let channels = usize::from(config.channels);

    let samples = if config.sample_rate.0 == audio.sample_rate {
        audio.to_f32()
    } else {
        resample(&audio.to_f32(), audio.sample_rate, config.sample_rate.0)
            .map_err(|e| DeviceError::Playback(e.to_string()))?
    };
    let total = samples.len();
    let samples = Arc::new(samples);
    let position = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicBool::new(false));

    let err_flag = Arc::clone(&failed);
    let on_error = move |err: cpal::StreamError| {
        tracing::error!(error = %err, "audio playback error");
        err_flag.store(true, Ordering::Release);
    };

    let stream = match format {
        SampleFormat::I16 => {
            let (samples, position) = (Arc::clone(&samples), Arc::clone(&position));
            device.build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    fill(data, channels, &samples, &position, super::frame::f32_to_i16);
                },
                on_error,
                None,
            )
        }
        _ => {
            let (samples, position) = (Arc::clone(&samples), Arc::clone(&position));
            device.build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    fill(data, channels, &samples, &position, |s| s);
                },
                on_error,
                None,
            )
        }
    }
    .map_err(|e| DeviceError::Stream(e.to_string()))?;

    stream
        .play()
        .map_err(|e| DeviceError::Stream(e.to_string()))?;

    // Poll for completion with a margin over the clip length
    let clip_ms = (total as u64 * 1000) / u64::from(config.sample_rate.0.max(1));
    let deadline = Instant::now() + Duration::from_millis(clip_ms + 500);
    while position.load(Ordering::Acquire) < total {
        if failed.load(Ordering::Acquire) {
            return Err(DeviceError::Playback("output stream failed".to_string()));
        }
        if Instant::now() > deadline {
            tracing::warn!(played = position.load(Ordering::Acquire), total, "playback deadline passed");
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    // Let the device drain its last buffer
    std::thread::sleep(Duration::from_millis(100));
    drop(stream);
    tracing::debug!(samples = total, "playback complete");
    Ok(())
}

fn fill<T: Copy + Default>(
    data: &mut [T],
    channels: usize,
    samples: &[f32],
    position: &AtomicUsize,
    convert: impl Fn(f32) -> T,
) {
    let mut pos = position.load(Ordering::Acquire);
    for frame in data.chunks_mut(channels.max(1)) {
        let value = samples.get(pos).map_or_else(T::default, |&s| convert(s));
        for out in frame.iter_mut() {
            *out = value;
        }
        if pos < samples.len() {
            pos += 1;
        }
    }
    position.store(pos, Ordering::Release);
}

fn pick_output_config(
    device: &Device,
    sample_rate: u32,
) -> std::result::Result<(StreamConfig, SampleFormat), DeviceError> {
    let usable = |f: SampleFormat| matches!(f, SampleFormat::F32 | SampleFormat::I16);

    let exact = device
        .supported_output_configs()
        .map_err(|e| DeviceError::Unavailable(e.to_string()))?
        .filter(|c| {
            usable(c.sample_format())
                && c.min_sample_rate() <= SampleRate(sample_rate)
                && c.max_sample_rate() >= SampleRate(sample_rate)
        })
        .min_by_key(cpal::SupportedStreamConfigRange::channels);
    if let Some(range) = exact {
        let format = range.sample_format();
        return Ok((range.with_sample_rate(SampleRate(sample_rate)).config(), format));
    }

    // Fallback: device default, resampled
    let default = device
        .default_output_config()
        .map_err(|e| DeviceError::Unavailable(e.to_string()))?;
    if !usable(default.sample_format()) {
        return Err(DeviceError::Unavailable(format!(
            "unsupported output sample format {:?}",
            default.sample_format()
        )));
    }
    Ok((default.config(), default.sample_format()))
}

/// Find an output device whose name contains `name`, else the default
///
/// # Errors
///
/// Returns `DeviceError::Unavailable` if the host has no output device
pub fn find_output_device(host: &Host, name: Option<&str>) -> std::result::Result<Device, DeviceError> {
    if let Some(wanted) = name {
        let found = host
            .output_devices()
            .map_err(|e| DeviceError::Unavailable(e.to_string()))?
            .find(|d| d.name().is_ok_and(|n| n.contains(wanted)));
        if let Some(device) = found {
            return Ok(device);
        }
        tracing::warn!(device = wanted, "output device not found, using default");
    }
    host.default_output_device()
        .ok_or_else(|| DeviceError::Unavailable("no output device available".to_string()))
}

/// Resample mono `f32` audio
///
/// # Errors
///
/// Returns error if the resampler cannot be built or fails
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    use rubato::{
        Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
    };

    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let mut resampler = SincFixedIn::<f32>::new(
        f64::from(to_rate) / f64::from(from_rate),
        2.0,
        params,
        samples.len(),
        1,
    )
    .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?;

    let mut output = resampler
        .process(&[samples.to_vec()], None)
        .map_err(|e| Error::Audio(format!("resampling failed: {e}")))?;
    Ok(output.pop().unwrap_or_default())
}

/// Load the clip played when a session fails
///
/// Reads `path` as WAV or MP3 by extension. Without a usable file, a clip
/// of three short 440 Hz beeps is generated instead.
#[must_use]
pub fn load_error_clip(path: Option<&Path>, sample_rate: u32) -> PcmAudio {
    if let Some(path) = path {
        match load_clip(path) {
            Ok(clip) if !clip.is_empty() => {
                tracing::debug!(path = %path.display(), "loaded error clip");
                return clip;
            }
            Ok(_) => tracing::warn!(path = %path.display(), "error clip is empty, using beeps"),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to load error clip, using beeps");
            }
        }
    }
    beep_clip(sample_rate)
}

/// Decode a WAV or MP3 file
///
/// # Errors
///
/// Returns error if the file cannot be read or decoded
pub fn load_clip(path: &Path) -> Result<PcmAudio> {
    let is_mp3 = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("mp3"));
    if is_mp3 {
        let bytes = std::fs::read(path)?;
        decode_mp3(&bytes)
    } else {
        PcmAudio::read_wav(path)
    }
}

/// Three 0.3 s beeps at 440 Hz separated by 0.1 s of silence
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn beep_clip(sample_rate: u32) -> PcmAudio {
    let beep = tone(440.0, 0.3, 0.5, sample_rate);
    let gap = vec![0_i16; (f64::from(sample_rate) * 0.1) as usize];
    let mut samples = Vec::with_capacity(beep.len() * 3 + gap.len() * 2);
    for i in 0..3 {
        if i > 0 {
            samples.extend_from_slice(&gap);
        }
        samples.extend_from_slice(&beep);
    }
    PcmAudio::new(samples, sample_rate)
}

/// Decode MP3 bytes to mono 16-bit PCM
fn decode_mp3(mp3_data: &[u8]) -> Result<PcmAudio> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = 0;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                if sample_rate == 0 {
                    sample_rate = u32::try_from(frame.sample_rate).unwrap_or_default();
                }
                samples.extend(super::frame::downmix(&frame.data, frame.channels));
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
        }
    }

    Ok(PcmAudio::new(samples, sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_beep_clip_layout() {
        let clip = beep_clip(10_000);
        // 3 × 3000 beep + 2 × 1000 gap
        assert_eq!(clip.samples.len(), 11_000);
        assert!(clip.samples[3000..4000].iter().all(|&s| s == 0));
        assert_eq!(clip.duration(), Duration::from_millis(1100));
    }

    #[test]
    fn test_error_clip_falls_back_to_beeps() {
        let clip = load_error_clip(Some(Path::new("/nonexistent/error.wav")), 16_000);
        assert_eq!(clip, beep_clip(16_000));
    }

    #[test]
    fn test_error_clip_from_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("error.wav");
        let clip = PcmAudio::new(tone(880.0, 0.2, 0.4, 16_000), 16_000);
        clip.write_wav(&path).unwrap();
        assert_eq!(load_error_clip(Some(&path), 22_050), clip);
    }

    #[test]
    fn test_resample_length() {
        let input = vec![0.0_f32; 1600];
        let output = resample(&input, 16_000, 48_000).unwrap();
        let expected = 4800_i64;
        #[allow(clippy::cast_possible_wrap)]
        let diff = (output.len() as i64 - expected).abs();
        assert!(diff < 300, "got {} samples", output.len());
    }

    #[test]
    fn test_fill_duplicates_channels() {
        let position = AtomicUsize::new(0);
        let mut data = [0.0_f32; 6];
        fill(&mut data[..], 2, &[0.1, 0.2], &position, |s| s);
        assert_eq!(data, [0.1, 0.1, 0.2, 0.2, 0.0, 0.0]);
        assert_eq!(position.load(Ordering::Acquire), 2);
    }
}
