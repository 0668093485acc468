//! Configuration management for the Dia assistant
//!
//! A [`Config`] is resolved once at startup (file > default) and shared as an
//! immutable snapshot for the whole coordinator run. The wake sensitivity is
//! the only value that may change without a restart, see
//! [`Config::reload_sensitivity`].

pub mod file;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub use file::{config_file_path, load_config_file, DiaConfigFile};

/// Default persona preamble for the LLM planner
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Dia, a helpful voice assistant running on a Raspberry Pi. \
Provide concise, accurate responses. You run completely offline.";

/// Longest utterance a config may ask for
pub const MAX_UTTERANCE_SECONDS: f32 = 300.0;

/// Which response planner to build
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineType {
    #[default]
    Rules,
    Llm,
}

/// Resolved assistant configuration
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub audio: AudioConfig,
    pub wake_word: WakeWordConfig,
    pub utterance: UtteranceConfig,
    pub asr: AsrConfig,
    pub response_generator: ResponseConfig,
    pub tts: TtsConfig,
    pub rag: RagConfig,
    pub timeouts: TimeoutConfig,
    pub logging: LoggingConfig,
}

/// Audio device configuration
#[derive(Debug, Clone, Serialize)]
pub struct AudioConfig {
    /// Capture sample rate in Hz
    pub sample_rate: u32,

    /// Channels requested from the input device (downmixed to mono)
    pub channels: u16,

    /// Samples per [`AudioFrame`](crate::voice::AudioFrame)
    pub chunk_size: usize,

    /// Capture queue capacity in samples
    pub buffer_max_length: usize,

    /// Substring of the preferred input device name
    pub input_device_name: Option<String>,

    /// Substring of the preferred output device name
    pub output_device_name: Option<String>,

    /// Clip played when a session fails
    pub error_sound_path: Option<PathBuf>,

    /// First reconnect delay after a device loss
    pub reconnect_initial_ms: u64,

    /// Reconnect delay ceiling
    pub reconnect_max_ms: u64,
}

/// Wake word detector configuration
#[derive(Debug, Clone, Serialize)]
pub struct WakeWordConfig {
    /// Minimum confidence for a detection, 0.0 to 1.0
    pub sensitivity: f32,

    /// Keyword model file, unused by the built-in energy model
    pub model_path: Option<PathBuf>,

    /// Wake phrases; an energy trigger only opens a session when the
    /// transcribed window contains one. Empty disables confirmation.
    pub phrases: Vec<String>,

    /// Rolling analysis window
    pub window_ms: u64,

    /// Quiet period after a detection
    pub refractory_ms: u64,

    /// RMS level counted as voiced by the energy model
    pub energy_floor: f32,
}

/// Utterance recording policy
#[derive(Debug, Clone, Serialize)]
pub struct UtteranceConfig {
    /// Hard ceiling on utterance length
    pub max_duration_seconds: f32,

    /// Normalized RMS below which a frame counts as silence
    pub silence_threshold: f32,

    /// Trailing silence that ends an utterance
    pub silence_duration_ms: u64,
}

/// Speech-to-text configuration
#[derive(Debug, Clone, Serialize)]
pub struct AsrConfig {
    pub model_path: Option<PathBuf>,
    pub sample_rate: u32,
    /// Program to run, looked up on `PATH`
    pub command: String,
    /// Argument template with `{input}`, `{model}` and `{sample_rate}`
    pub args: Vec<String>,
}

/// Response generator configuration
#[derive(Debug, Clone, Serialize)]
pub struct ResponseConfig {
    pub engine_type: EngineType,
    pub model_path: Option<PathBuf>,
    /// Context window in tokens
    pub context_size: usize,
    /// Reply budget in tokens
    pub max_tokens: usize,
    pub temperature: f32,
    pub rules_resource: Option<PathBuf>,
    /// Base URL of the local inference server
    pub endpoint: String,
    pub assistant_name: String,
    pub system_prompt: String,
    pub fallback_reply: String,
    pub apology_reply: String,
}

/// Text-to-speech configuration
#[derive(Debug, Clone, Serialize)]
pub struct TtsConfig {
    pub model_path: Option<PathBuf>,
    pub sample_rate: u32,
    pub command: String,
    /// Argument template with `{output}`, `{text}` and `{model}`
    pub args: Vec<String>,
}

/// Retrieval configuration
#[derive(Debug, Clone, Serialize)]
pub struct RagConfig {
    pub enabled: bool,
    /// Directory holding `documents.sqlite`
    pub database_path: PathBuf,
    pub top_k: usize,
}

/// Per-stage time budgets
#[derive(Debug, Clone, Serialize)]
pub struct TimeoutConfig {
    pub transcription_ms: u64,
    pub retrieval_ms: u64,
    pub planning_ms: u64,
    pub synthesis_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive when `RUST_LOG` is unset
    pub level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_file(DiaConfigFile::default())
    }
}

impl Config {
    /// Load and validate configuration
    ///
    /// A missing or unparseable file falls back to defaults with a warning.
    ///
    /// # Errors
    ///
    /// Returns error if the resolved values are out of range
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = Self::from_file(load_config_file(path));
        config.validate()?;
        Ok(config)
    }

    /// Resolve a parsed file against defaults
    #[must_use]
    pub fn from_file(fc: DiaConfigFile) -> Self {
        let audio = AudioConfig {
            sample_rate: fc.audio.sample_rate.unwrap_or(16_000),
            channels: fc.audio.channels.unwrap_or(1),
            chunk_size: fc.audio.chunk_size.unwrap_or(1024),
            buffer_max_length: fc.audio.buffer_max_length.unwrap_or(80_000),
            input_device_name: fc.audio.input_device_name,
            output_device_name: fc.audio.output_device_name,
            error_sound_path: fc.audio.error_sound_path,
            reconnect_initial_ms: fc.audio.reconnect_initial_ms.unwrap_or(1000),
            reconnect_max_ms: fc.audio.reconnect_max_ms.unwrap_or(30_000),
        };

        let wake_word = WakeWordConfig {
            sensitivity: fc.wake_word.sensitivity.unwrap_or(0.5),
            model_path: fc.wake_word.model_path,
            phrases: fc
                .wake_word
                .phrases
                .unwrap_or_else(|| vec!["hey dia".to_string()]),
            window_ms: fc.wake_word.window_ms.unwrap_or(500),
            refractory_ms: fc.wake_word.refractory_ms.unwrap_or(1500),
            energy_floor: fc.wake_word.energy_floor.unwrap_or(0.02),
        };

        let utterance = UtteranceConfig {
            max_duration_seconds: fc.utterance.max_duration_seconds.unwrap_or(5.0),
            silence_threshold: fc.utterance.silence_threshold.unwrap_or(0.01),
            silence_duration_ms: fc.utterance.silence_duration_ms.unwrap_or(1000),
        };

        let asr = AsrConfig {
            model_path: fc.asr.model_path,
            sample_rate: fc.asr.sample_rate.unwrap_or(16_000),
            command: fc.asr.command.unwrap_or_else(|| "whisper-cli".to_string()),
            args: fc.asr.args.unwrap_or_else(|| {
                ["-m", "{model}", "-f", "{input}", "-nt"]
                    .into_iter()
                    .map(String::from)
                    .collect()
            }),
        };

        let rg = fc.response_generator;
        let response_generator = ResponseConfig {
            engine_type: rg.engine_type.unwrap_or_default(),
            model_path: rg.model_path,
            context_size: rg.context_size.unwrap_or(2048),
            max_tokens: rg.max_tokens.unwrap_or(100),
            temperature: rg.temperature.unwrap_or(0.7),
            rules_resource: rg.rules_resource,
            endpoint: rg
                .endpoint
                .unwrap_or_else(|| "http://127.0.0.1:8080".to_string()),
            assistant_name: rg.assistant_name.unwrap_or_else(|| "Dia".to_string()),
            system_prompt: rg
                .system_prompt
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            fallback_reply: rg
                .fallback_reply
                .unwrap_or_else(|| "I'm not sure how to respond to that.".to_string()),
            apology_reply: rg
                .apology_reply
                .unwrap_or_else(|| "I'm having trouble thinking right now.".to_string()),
        };

        let tts = TtsConfig {
            model_path: fc.tts.model_path,
            sample_rate: fc.tts.sample_rate.unwrap_or(22_050),
            command: fc.tts.command.unwrap_or_else(|| "espeak".to_string()),
            args: fc.tts.args.unwrap_or_else(|| {
                ["-w", "{output}", "-s", "150", "-p", "50", "-a", "100", "{text}"]
                    .into_iter()
                    .map(String::from)
                    .collect()
            }),
        };

        let rag = RagConfig {
            enabled: fc.rag.enabled.unwrap_or(false),
            database_path: fc.rag.database_path.unwrap_or_else(default_rag_dir),
            top_k: fc.rag.top_k.unwrap_or(3),
        };

        let timeouts = TimeoutConfig {
            transcription_ms: fc.timeouts.transcription_ms.unwrap_or(10_000),
            retrieval_ms: fc.timeouts.retrieval_ms.unwrap_or(1000),
            planning_ms: fc.timeouts.planning_ms.unwrap_or(15_000),
            synthesis_ms: fc.timeouts.synthesis_ms.unwrap_or(10_000),
        };

        let logging = LoggingConfig {
            level: fc.logging.level.unwrap_or_else(|| "info".to_string()),
        };

        Self {
            audio,
            wake_word,
            utterance,
            asr,
            response_generator,
            tts,
            rag,
            timeouts,
            logging,
        }
    }

    /// Reject values the pipeline cannot run with
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the first offending key
    pub fn validate(&self) -> Result<()> {
        validate_sensitivity(self.wake_word.sensitivity)?;

        if self.audio.sample_rate == 0 {
            return Err(Error::Config("audio.sample_rate must be positive".to_string()));
        }
        if self.audio.chunk_size == 0 {
            return Err(Error::Config("audio.chunk_size must be positive".to_string()));
        }
        if self.audio.channels == 0 {
            return Err(Error::Config("audio.channels must be positive".to_string()));
        }
        if self.audio.buffer_max_length < self.audio.chunk_size {
            return Err(Error::Config(format!(
                "audio.buffer_max_length ({}) must hold at least one chunk ({})",
                self.audio.buffer_max_length, self.audio.chunk_size
            )));
        }
        if self.audio.reconnect_initial_ms == 0
            || self.audio.reconnect_max_ms < self.audio.reconnect_initial_ms
        {
            return Err(Error::Config(
                "audio.reconnect_max_ms must be at least reconnect_initial_ms (> 0)".to_string(),
            ));
        }
        let max_duration = self.utterance.max_duration_seconds;
        if !max_duration.is_finite() || max_duration <= 0.0 || max_duration > MAX_UTTERANCE_SECONDS
        {
            return Err(Error::Config(format!(
                "utterance.max_duration_seconds must be within (0, {MAX_UTTERANCE_SECONDS}], got {max_duration}"
            )));
        }
        if self.utterance_capacity() < self.audio.chunk_size {
            return Err(Error::Config(
                "utterance.max_duration_seconds is shorter than one audio chunk".to_string(),
            ));
        }
        if self.wake_word.window_ms == 0 {
            return Err(Error::Config("wake_word.window_ms must be positive".to_string()));
        }
        if self
            .wake_word
            .phrases
            .iter()
            .any(|phrase| phrase.trim().is_empty())
        {
            return Err(Error::Config(
                "wake_word.phrases must not contain blank entries".to_string(),
            ));
        }
        let t = &self.timeouts;
        if t.transcription_ms == 0 || t.retrieval_ms == 0 || t.planning_ms == 0 || t.synthesis_ms == 0
        {
            return Err(Error::Config("timeouts must be positive".to_string()));
        }
        if self.response_generator.max_tokens == 0 {
            return Err(Error::Config(
                "response_generator.max_tokens must be positive".to_string(),
            ));
        }
        let replies = &self.response_generator;
        if replies.fallback_reply.trim().is_empty() || replies.apology_reply.trim().is_empty() {
            return Err(Error::Config(
                "response_generator.fallback_reply and apology_reply must not be empty".to_string(),
            ));
        }
        if self.rag.top_k == 0 {
            return Err(Error::Config("rag.top_k must be positive".to_string()));
        }
        Ok(())
    }

    /// Re-read only the wake sensitivity from the config file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or the value is out of range
    pub fn reload_sensitivity(path: Option<&Path>) -> Result<f32> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(config_file_path)
            .ok_or_else(|| Error::Config("no config file to reload".to_string()))?;
        let fc = file::read_config_file(&path)?;
        let sensitivity = fc.wake_word.sensitivity.unwrap_or(0.5);
        validate_sensitivity(sensitivity)?;
        Ok(sensitivity)
    }

    /// Capture queue capacity in whole frames
    #[must_use]
    pub fn queue_frames(&self) -> usize {
        (self.audio.buffer_max_length / self.audio.chunk_size).max(1)
    }

    /// Utterance ceiling in samples at the capture rate
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn utterance_capacity(&self) -> usize {
        (f64::from(self.utterance.max_duration_seconds) * f64::from(self.audio.sample_rate)) as usize
    }

    /// Duration of one capture frame
    #[must_use]
    pub fn frame_duration(&self) -> Duration {
        let micros = self.audio.chunk_size as u64 * 1_000_000 / u64::from(self.audio.sample_rate);
        Duration::from_micros(micros)
    }
}

impl TimeoutConfig {
    #[must_use]
    pub const fn transcription(&self) -> Duration {
        Duration::from_millis(self.transcription_ms)
    }

    #[must_use]
    pub const fn retrieval(&self) -> Duration {
        Duration::from_millis(self.retrieval_ms)
    }

    #[must_use]
    pub const fn planning(&self) -> Duration {
        Duration::from_millis(self.planning_ms)
    }

    #[must_use]
    pub const fn synthesis(&self) -> Duration {
        Duration::from_millis(self.synthesis_ms)
    }
}

fn validate_sensitivity(sensitivity: f32) -> Result<()> {
    if (0.0..=1.0).contains(&sensitivity) {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "wake_word.sensitivity must be within 0.0..=1.0, got {sensitivity}"
        )))
    }
}

/// Default RAG store directory: `~/.local/share/dia/rag`
fn default_rag_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from("data/rag"),
        |d| d.data_dir().join("dia").join("rag"),
    )
}
