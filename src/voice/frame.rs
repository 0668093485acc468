//! PCM frames and clips

use std::path::Path;

use crate::{Error, Result};

/// Fixed-length block of mono 16-bit PCM
///
/// Immutable once captured. Frames are moved from the capture queue into the
/// detector or the utterance buffer and dropped there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Box<[i16]>,
}

impl AudioFrame {
    #[must_use]
    pub fn new(samples: Vec<i16>) -> Self {
        Self {
            samples: samples.into_boxed_slice(),
        }
    }

    /// Frame of digital silence
    #[must_use]
    pub fn silent(len: usize) -> Self {
        Self::new(vec![0; len])
    }

    #[must_use]
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Normalized RMS energy in `0.0..=1.0`
    #[must_use]
    pub fn energy(&self) -> f32 {
        rms_i16(&self.samples)
    }

    /// Take the samples out of the frame
    #[must_use]
    pub fn into_samples(self) -> Vec<i16> {
        self.samples.into_vec()
    }
}

/// A finished audio clip with its sample rate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmAudio {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

impl PcmAudio {
    #[must_use]
    pub const fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Clip length
    #[must_use]
    pub fn duration(&self) -> std::time::Duration {
        if self.sample_rate == 0 {
            return std::time::Duration::ZERO;
        }
        let micros = self.samples.len() as u64 * 1_000_000 / u64::from(self.sample_rate);
        std::time::Duration::from_micros(micros)
    }

    /// Samples as `f32` in `-1.0..1.0`
    #[must_use]
    pub fn to_f32(&self) -> Vec<f32> {
        self.samples.iter().map(|&s| f32::from(s) / 32768.0).collect()
    }

    /// Build a clip from `f32` samples, clamping out-of-range values
    #[must_use]
    pub fn from_f32(samples: &[f32], sample_rate: u32) -> Self {
        Self::new(samples.iter().map(|&s| f32_to_i16(s)).collect(), sample_rate)
    }

    /// Encode as a 16-bit mono WAV
    ///
    /// # Errors
    ///
    /// Returns error if WAV encoding fails
    pub fn to_wav(&self) -> Result<Vec<u8>> {
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, wav_spec(self.sample_rate))
                .map_err(|e| Error::Audio(e.to_string()))?;
            for &sample in &self.samples {
                writer
                    .write_sample(sample)
                    .map_err(|e| Error::Audio(e.to_string()))?;
            }
            writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
        }
        Ok(cursor.into_inner())
    }

    /// Write a 16-bit mono WAV file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be created or written
    pub fn write_wav(&self, path: &Path) -> Result<()> {
        let mut writer = hound::WavWriter::create(path, wav_spec(self.sample_rate))
            .map_err(|e| Error::Audio(e.to_string()))?;
        for &sample in &self.samples {
            writer
                .write_sample(sample)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }
        writer.finalize().map_err(|e| Error::Audio(e.to_string()))
    }

    /// Read a WAV file, downmixing to mono
    ///
    /// # Errors
    ///
    /// Returns error if the file is not a readable WAV
    pub fn read_wav(path: &Path) -> Result<Self> {
        let reader = hound::WavReader::open(path).map_err(|e| Error::Audio(e.to_string()))?;
        Self::from_wav_reader(reader)
    }

    /// Decode WAV bytes, downmixing to mono
    ///
    /// # Errors
    ///
    /// Returns error if the bytes are not a readable WAV
    pub fn from_wav_bytes(bytes: &[u8]) -> Result<Self> {
        let reader = hound::WavReader::new(std::io::Cursor::new(bytes))
            .map_err(|e| Error::Audio(e.to_string()))?;
        Self::from_wav_reader(reader)
    }

    #[allow(clippy::cast_precision_loss)]
    fn from_wav_reader<R: std::io::Read>(reader: hound::WavReader<R>) -> Result<Self> {
        let spec = reader.spec();
        let interleaved: Vec<i16> = match (spec.sample_format, spec.bits_per_sample) {
            (hound::SampleFormat::Int, 16) => reader
                .into_samples::<i16>()
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::Audio(e.to_string()))?,
            (hound::SampleFormat::Int, bits) if (8..=32).contains(&bits) => {
                #[allow(clippy::cast_precision_loss)]
                let scale = (1_i64 << (bits - 1)) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|v| f32_to_i16(v as f32 / scale)))
                    .collect::<std::result::Result<_, _>>()
                    .map_err(|e| Error::Audio(e.to_string()))?
            }
            (hound::SampleFormat::Float, _) => reader
                .into_samples::<f32>()
                .map(|s| s.map(f32_to_i16))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::Audio(e.to_string()))?,
            (_, bits) => {
                return Err(Error::Audio(format!("unsupported WAV sample width: {bits}")));
            }
        };

        Ok(Self::new(
            downmix(&interleaved, usize::from(spec.channels)),
            spec.sample_rate,
        ))
    }
}

/// Average interleaved channels into mono
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
pub fn downmix(interleaved: &[i16], channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| i32::from(s)).sum();
            (sum / frame.len() as i32) as i16
        })
        .collect()
}

/// Convert an `f32` sample to `i16`
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}

/// Normalized RMS energy of 16-bit samples
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn rms_i16(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f64 = samples
        .iter()
        .map(|&s| {
            let v = f64::from(s) / 32768.0;
            v * v
        })
        .sum();
    #[allow(clippy::cast_possible_truncation)]
    let rms = (sum_squares / samples.len() as f64).sqrt() as f32;
    rms
}

/// Splits an arbitrary stream of samples into fixed-size frames
///
/// Used by the capture callback, which receives device buffers of whatever
/// size the backend chooses.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_len: usize,
    channels: usize,
    pending: Vec<i16>,
}

impl FrameAssembler {
    /// Create an assembler for `frame_len` mono samples per frame from an
    /// input with `channels` interleaved channels
    #[must_use]
    pub fn new(frame_len: usize, channels: usize) -> Self {
        Self {
            frame_len: frame_len.max(1),
            channels: channels.max(1),
            pending: Vec::with_capacity(frame_len.max(1)),
        }
    }

    /// Feed interleaved `f32` samples, calling `emit` for each complete frame
    pub fn push_f32(&mut self, interleaved: &[f32], mut emit: impl FnMut(AudioFrame)) {
        for frame in interleaved.chunks(self.channels) {
            #[allow(clippy::cast_precision_loss)]
            let mono = frame.iter().sum::<f32>() / frame.len() as f32;
            self.pending.push(f32_to_i16(mono));
            if self.pending.len() == self.frame_len {
                self.flush_into(&mut emit);
            }
        }
    }

    /// Feed interleaved `i16` samples, calling `emit` for each complete frame
    pub fn push_i16(&mut self, interleaved: &[i16], mut emit: impl FnMut(AudioFrame)) {
        for frame in interleaved.chunks(self.channels) {
            let mono = downmix(frame, frame.len());
            self.pending.extend_from_slice(&mono);
            if self.pending.len() >= self.frame_len {
                self.flush_into(&mut emit);
            }
        }
    }

    /// Samples waiting for a full frame
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn flush_into(&mut self, emit: &mut impl FnMut(AudioFrame)) {
        let next = Vec::with_capacity(self.frame_len);
        let full = std::mem::replace(&mut self.pending, next);
        emit(AudioFrame::new(full));
    }
}

/// Sine tone generator for test clips and the built-in error beep
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn tone(frequency: f32, seconds: f32, amplitude: f32, sample_rate: u32) -> Vec<i16> {
    let count = (seconds * sample_rate as f32) as usize;
    (0..count)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            f32_to_i16((t * frequency * std::f32::consts::TAU).sin() * amplitude)
        })
        .collect()
}

fn wav_spec(sample_rate: u32) -> hound::WavSpec {
    hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    }
}
