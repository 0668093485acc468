//! Wake word detection
//!
//! Detection is two-stage. The [`WakeDetector`] keeps a rolling window of the
//! most recent samples and asks a [`KeywordModel`] for a confidence score on
//! every frame. A detection fires when the score reaches the current
//! sensitivity, which is read from a `watch` channel so it can change while
//! running. The window that triggered it is then handed to a
//! [`PhraseSpotter`], which transcribes it and looks for a configured phrase.

use tokio::sync::watch;

use super::frame::rms_i16;
use super::{AudioFrame, Transcriber, Utterance};
use crate::config::WakeWordConfig;
use crate::error::TranscriptionError;

/// Outcome of observing one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WakeSignal {
    None,
    Detected(f32),
}

impl WakeSignal {
    #[must_use]
    pub const fn is_detected(&self) -> bool {
        matches!(self, Self::Detected(_))
    }
}

/// Scores a window of audio for the presence of the wake phrase
pub trait KeywordModel: Send + Sync {
    /// Confidence in `0.0..=1.0` that the window ends with the keyword
    fn score(&mut self, window: &[i16]) -> f32;

    /// Model identifier for logs
    fn name(&self) -> &str;
}

/// Block length the energy model scores, 10 ms at 16 kHz
const ENERGY_BLOCK: usize = 160;

/// Keyword model that fires on sustained voiced energy
///
/// Confidence is the fraction of 10 ms blocks in the window whose RMS is
/// above the energy floor. Suited to push-to-talk style setups and tests;
/// a trained keyword model plugs in behind the same trait.
#[derive(Debug, Clone)]
pub struct EnergyKeywordModel {
    energy_floor: f32,
}

impl EnergyKeywordModel {
    #[must_use]
    pub const fn new(energy_floor: f32) -> Self {
        Self { energy_floor }
    }
}

impl KeywordModel for EnergyKeywordModel {
    #[allow(clippy::cast_precision_loss)]
    fn score(&mut self, window: &[i16]) -> f32 {
        let mut blocks = 0_usize;
        let mut voiced = 0_usize;
        for block in window.chunks(ENERGY_BLOCK) {
            blocks += 1;
            if rms_i16(block) >= self.energy_floor {
                voiced += 1;
            }
        }
        if blocks == 0 {
            return 0.0;
        }
        voiced as f32 / blocks as f32
    }

    fn name(&self) -> &str {
        "energy"
    }
}

/// Continuous wake word detector
pub struct WakeDetector {
    model: Box<dyn KeywordModel>,
    sensitivity: watch::Receiver<f32>,
    ring: Vec<i16>,
    scratch: Vec<i16>,
    head: usize,
    filled: usize,
    refractory_samples: usize,
    since_detection: usize,
}

impl WakeDetector {
    /// Create a detector with a window sized from config at `sample_rate`
    #[must_use]
    pub fn new(
        model: Box<dyn KeywordModel>,
        config: &WakeWordConfig,
        sample_rate: u32,
        sensitivity: watch::Receiver<f32>,
    ) -> Self {
        let window = ms_to_samples(config.window_ms, sample_rate).max(1);
        let refractory_samples = ms_to_samples(config.refractory_ms, sample_rate);

        tracing::debug!(
            model = model.name(),
            window_samples = window,
            refractory_samples,
            sensitivity = *sensitivity.borrow(),
            "wake word detector initialized"
        );

        Self {
            model,
            sensitivity,
            ring: vec![0; window],
            scratch: vec![0; window],
            head: 0,
            filled: 0,
            refractory_samples,
            since_detection: usize::MAX,
        }
    }

    /// Feed one frame and report whether the wake phrase was heard
    ///
    /// Never blocks and does not allocate.
    pub fn observe(&mut self, frame: &AudioFrame) -> WakeSignal {
        let len = self.ring.len();
        for &sample in frame.samples() {
            self.ring[self.head] = sample;
            self.head = (self.head + 1) % len;
        }
        self.filled = (self.filled + frame.len()).min(len);
        self.since_detection = self.since_detection.saturating_add(frame.len());

        if self.filled < len || self.since_detection < self.refractory_samples {
            return WakeSignal::None;
        }

        // Oldest sample first
        let (newer, older) = self.ring.split_at(self.head);
        self.scratch[..older.len()].copy_from_slice(older);
        self.scratch[older.len()..].copy_from_slice(newer);

        let confidence = self.model.score(&self.scratch).clamp(0.0, 1.0);
        let threshold = *self.sensitivity.borrow();
        if confidence >= threshold {
            tracing::info!(confidence, threshold, "wake word detected");
            self.since_detection = 0;
            self.filled = 0;
            WakeSignal::Detected(confidence)
        } else {
            tracing::trace!(confidence, threshold, "below wake threshold");
            WakeSignal::None
        }
    }

    /// The window scored by the last detection, oldest sample first
    #[must_use]
    pub fn window(&self) -> &[i16] {
        &self.scratch
    }

    /// Forget buffered audio, keeping the refractory timer
    pub fn reset(&mut self) {
        self.head = 0;
        self.filled = 0;
    }

    /// Current threshold
    #[must_use]
    pub fn sensitivity(&self) -> f32 {
        *self.sensitivity.borrow()
    }
}

/// Confirms a wake trigger by transcribing it
///
/// Phrases match on whole words after lower-casing and dropping punctuation,
/// so "Hey, Dia!" confirms the phrase "hey dia".
pub struct PhraseSpotter {
    phrases: Vec<String>,
    transcriber: Box<dyn Transcriber>,
}

impl PhraseSpotter {
    /// `None` when no phrase is configured, leaving the energy trigger alone
    #[must_use]
    pub fn new(phrases: &[String], transcriber: Box<dyn Transcriber>) -> Option<Self> {
        let phrases: Vec<String> = phrases
            .iter()
            .map(|p| normalize_phrase(p))
            .filter(|p| !p.is_empty())
            .collect();
        if phrases.is_empty() {
            return None;
        }
        tracing::debug!(phrases = ?phrases, "wake phrase confirmation enabled");
        Some(Self {
            phrases,
            transcriber,
        })
    }

    /// Transcribe `window` and return the phrase it contains, if any
    ///
    /// # Errors
    ///
    /// Returns the transcriber's error
    pub async fn confirm(&self, window: Utterance) -> Result<Option<&str>, TranscriptionError> {
        let transcript = self.transcriber.transcribe(window).await?;
        let found = self.find(&transcript);
        match found {
            Some(phrase) => tracing::debug!(phrase, transcript = %transcript, "wake phrase confirmed"),
            None => tracing::debug!(transcript = %transcript, "no wake phrase in trigger"),
        }
        Ok(found)
    }

    /// First configured phrase present in `transcript`
    #[must_use]
    pub fn find(&self, transcript: &str) -> Option<&str> {
        let padded = format!(" {} ", normalize_phrase(transcript));
        self.phrases
            .iter()
            .find(|phrase| padded.contains(&format!(" {phrase} ")))
            .map(String::as_str)
    }

    #[must_use]
    pub fn phrases(&self) -> &[String] {
        &self.phrases
    }
}

fn normalize_phrase(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .filter(|c| !matches!(c, '\'' | '\u{2019}'))
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[allow(clippy::cast_possible_truncation)]
fn ms_to_samples(ms: u64, sample_rate: u32) -> usize {
    (ms * u64::from(sample_rate) / 1000) as usize
}
