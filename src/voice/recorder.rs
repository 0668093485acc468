//! Utterance recording
//!
//! After a wake event, frames accumulate in an [`UtteranceBuffer`] until
//! either the hard capacity ceiling is hit or enough trailing silence has
//! been heard. The finished buffer is consumed into a read-only
//! [`Utterance`] that moves to the transcriber.

use std::time::Duration;

use super::{AudioFrame, PcmAudio};
use crate::config::{Config, UtteranceConfig};
use crate::error::CapacityExceeded;

/// Why a buffer stopped accepting audio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Capacity ceiling reached
    Capacity,
    /// Trailing silence reached the cutoff
    Silence,
}

/// Recording policy shared by every session
#[derive(Debug, Clone)]
pub struct UtteranceRecorder {
    capacity: usize,
    silence_threshold: f32,
    silence_samples: usize,
    sample_rate: u32,
}

/// Audio collected for one utterance
///
/// Only grows by [`UtteranceRecorder::push`] and never exceeds its capacity.
#[derive(Debug)]
pub struct UtteranceBuffer {
    samples: Vec<i16>,
    capacity: usize,
    trailing_silence: usize,
    voiced_samples: usize,
    frames: usize,
    full: bool,
}

/// A finished, read-only utterance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    samples: Vec<i16>,
    sample_rate: u32,
    completion: Completion,
}

impl UtteranceRecorder {
    /// Create a recorder with a ceiling of `capacity` samples
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(config: &UtteranceConfig, capacity: usize, sample_rate: u32) -> Self {
        let silence_samples =
            (config.silence_duration_ms * u64::from(sample_rate) / 1000) as usize;
        Self {
            capacity,
            silence_threshold: config.silence_threshold,
            silence_samples,
            sample_rate,
        }
    }

    /// Recorder for a resolved config
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            &config.utterance,
            config.utterance_capacity(),
            config.audio.sample_rate,
        )
    }

    /// Begin a new, empty buffer
    ///
    /// At most one second is reserved up front; the buffer grows toward the
    /// ceiling as audio arrives.
    #[must_use]
    pub fn start(&self) -> UtteranceBuffer {
        let reserve = self
            .capacity
            .min(usize::try_from(self.sample_rate).unwrap_or(usize::MAX));
        UtteranceBuffer {
            samples: Vec::with_capacity(reserve),
            capacity: self.capacity,
            trailing_silence: 0,
            voiced_samples: 0,
            frames: 0,
            full: false,
        }
    }

    /// Append a frame
    ///
    /// A frame that crosses the ceiling is truncated so the buffer ends up
    /// exactly at capacity.
    ///
    /// # Errors
    ///
    /// Returns `CapacityExceeded` when any part of the frame did not fit.
    /// The buffer is complete from then on.
    pub fn push(
        &self,
        buffer: &mut UtteranceBuffer,
        frame: AudioFrame,
    ) -> Result<(), CapacityExceeded> {
        if buffer.full {
            return Err(CapacityExceeded {
                capacity: buffer.capacity,
                discarded: frame.len(),
            });
        }

        let silent = frame.energy() < self.silence_threshold;
        let room = buffer.capacity - buffer.samples.len();
        let taken = frame.len().min(room);
        buffer.samples.extend_from_slice(&frame.samples()[..taken]);
        buffer.frames += 1;

        if silent {
            buffer.trailing_silence += taken;
        } else {
            buffer.trailing_silence = 0;
            buffer.voiced_samples += taken;
        }

        if buffer.samples.len() == buffer.capacity {
            buffer.full = true;
        }

        if taken < frame.len() {
            tracing::debug!(
                capacity = buffer.capacity,
                discarded = frame.len() - taken,
                "utterance capacity reached"
            );
            return Err(CapacityExceeded {
                capacity: buffer.capacity,
                discarded: frame.len() - taken,
            });
        }
        Ok(())
    }

    /// Whether recording should stop
    #[must_use]
    pub fn is_complete(&self, buffer: &UtteranceBuffer) -> bool {
        self.completion(buffer).is_some()
    }

    /// Reason the buffer is complete, if it is
    #[must_use]
    pub fn completion(&self, buffer: &UtteranceBuffer) -> Option<Completion> {
        if buffer.full {
            Some(Completion::Capacity)
        } else if buffer.frames > 0 && buffer.trailing_silence >= self.silence_samples {
            Some(Completion::Silence)
        } else {
            None
        }
    }

    /// Consume the buffer into a finished utterance
    ///
    /// Trailing silence is trimmed whichever way recording ended.
    #[must_use]
    pub fn finalize(&self, buffer: UtteranceBuffer) -> Utterance {
        let completion = self.completion(&buffer).unwrap_or(Completion::Capacity);
        let UtteranceBuffer {
            mut samples,
            trailing_silence,
            voiced_samples,
            ..
        } = buffer;

        let keep = samples.len().saturating_sub(trailing_silence);
        samples.truncate(keep);

        tracing::debug!(
            samples = samples.len(),
            voiced_samples,
            completion = ?completion,
            "utterance finalized"
        );

        Utterance {
            samples,
            sample_rate: self.sample_rate,
            completion,
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl UtteranceBuffer {
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Samples judged as speech so far
    #[must_use]
    pub const fn voiced_samples(&self) -> usize {
        self.voiced_samples
    }
}

impl Utterance {
    /// Wrap already-recorded audio, e.g. from a WAV file
    #[must_use]
    pub const fn from_samples(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            completion: Completion::Silence,
        }
    }

    #[must_use]
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    #[must_use]
    pub const fn completion(&self) -> Completion {
        self.completion
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    #[must_use]
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.samples.len() as u64 * 1_000_000 / u64::from(self.sample_rate))
    }

    /// Copy into a playable clip
    #[must_use]
    pub fn to_pcm(&self) -> PcmAudio {
        PcmAudio::new(self.samples.clone(), self.sample_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(capacity: usize) -> UtteranceRecorder {
        let config = UtteranceConfig {
            max_duration_seconds: 1.0,
            silence_threshold: 0.01,
            silence_duration_ms: 100,
        };
        UtteranceRecorder::new(&config, capacity, 1000)
    }

    fn voiced(len: usize) -> AudioFrame {
        AudioFrame::new(vec![8000; len])
    }

    #[test]
    fn test_capacity_truncates_exactly() {
        let rec = recorder(250);
        let mut buf = rec.start();
        assert!(rec.push(&mut buf, voiced(100)).is_ok());
        assert!(rec.push(&mut buf, voiced(100)).is_ok());
        let err = rec.push(&mut buf, voiced(100)).unwrap_err();
        assert_eq!(err.discarded, 50);
        assert_eq!(buf.len(), 250);
        assert_eq!(rec.completion(&buf), Some(Completion::Capacity));

        // Further pushes are refused outright
        assert!(rec.push(&mut buf, voiced(100)).is_err());
        assert_eq!(buf.len(), 250);
    }

    #[test]
    fn test_capacity_completion_trims_trailing_silence() {
        let rec = recorder(250);
        let mut buf = rec.start();
        rec.push(&mut buf, voiced(120)).unwrap();
        rec.push(&mut buf, AudioFrame::silent(60)).unwrap();
        assert!(rec.push(&mut buf, AudioFrame::silent(100)).is_err());
        assert_eq!(buf.len(), 250);
        assert_eq!(rec.completion(&buf), Some(Completion::Capacity));

        let utterance = rec.finalize(buf);
        assert_eq!(utterance.completion(), Completion::Capacity);
        assert_eq!(utterance.samples().len(), 120);
    }

    #[test]
    fn test_huge_ceiling_does_not_preallocate() {
        let rec = recorder(usize::MAX);
        let mut buf = rec.start();
        rec.push(&mut buf, voiced(100)).unwrap();
        assert_eq!(buf.len(), 100);
        assert!(!rec.is_complete(&buf));
    }

    #[test]
    fn test_exact_fit_completes_without_error() {
        let rec = recorder(200);
        let mut buf = rec.start();
        assert!(rec.push(&mut buf, voiced(100)).is_ok());
        assert!(rec.push(&mut buf, voiced(100)).is_ok());
        assert!(rec.is_complete(&buf));
    }

    #[test]
    fn test_silence_cutoff_and_trim() {
        let rec = recorder(10_000);
        let mut buf = rec.start();
        for _ in 0..3 {
            rec.push(&mut buf, voiced(50)).unwrap();
        }
        rec.push(&mut buf, AudioFrame::silent(50)).unwrap();
        assert!(!rec.is_complete(&buf));
        rec.push(&mut buf, AudioFrame::silent(50)).unwrap();
        assert_eq!(rec.completion(&buf), Some(Completion::Silence));

        let utterance = rec.finalize(buf);
        assert_eq!(utterance.samples().len(), 150);
        assert_eq!(utterance.completion(), Completion::Silence);
    }

    #[test]
    fn test_speech_resets_silence_run() {
        let rec = recorder(10_000);
        let mut buf = rec.start();
        rec.push(&mut buf, AudioFrame::silent(60)).unwrap();
        rec.push(&mut buf, voiced(10)).unwrap();
        rec.push(&mut buf, AudioFrame::silent(60)).unwrap();
        assert!(!rec.is_complete(&buf));
    }

    #[test]
    fn test_all_silence_still_completes() {
        let rec = recorder(10_000);
        let mut buf = rec.start();
        rec.push(&mut buf, AudioFrame::silent(100)).unwrap();
        assert!(rec.is_complete(&buf));
        assert_eq!(buf.voiced_samples(), 0);
        assert!(rec.finalize(buf).is_empty());
    }

    #[test]
    fn test_empty_buffer_not_complete() {
        let rec = recorder(10_000);
        assert!(!rec.is_complete(&rec.start()));
    }
}
