//! YAML configuration file loading
//!
//! Supports `~/.config/dia/dia.yaml` as the persistent config source. All
//! fields are optional; the file is a partial overlay on top of defaults and
//! unknown keys are ignored.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::EngineType;
use crate::{Error, Result};

/// Environment variable that points at an alternate config file
pub const CONFIG_ENV: &str = "DIA_CONFIG";

/// Top-level YAML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct DiaConfigFile {
    #[serde(default)]
    pub audio: AudioFileConfig,

    #[serde(default)]
    pub wake_word: WakeWordFileConfig,

    #[serde(default)]
    pub utterance: UtteranceFileConfig,

    #[serde(default)]
    pub asr: AsrFileConfig,

    #[serde(default)]
    pub response_generator: ResponseFileConfig,

    #[serde(default)]
    pub tts: TtsFileConfig,

    #[serde(default)]
    pub rag: RagFileConfig,

    #[serde(default)]
    pub timeouts: TimeoutsFileConfig,

    #[serde(default)]
    pub logging: LoggingFileConfig,
}

/// Capture and playback device settings
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    /// Samples per frame
    pub chunk_size: Option<usize>,
    /// Capture queue capacity in samples
    pub buffer_max_length: Option<usize>,
    pub input_device_name: Option<String>,
    pub output_device_name: Option<String>,
    pub error_sound_path: Option<PathBuf>,
    pub reconnect_initial_ms: Option<u64>,
    pub reconnect_max_ms: Option<u64>,
}

/// Wake word settings
#[derive(Debug, Default, Deserialize)]
pub struct WakeWordFileConfig {
    pub sensitivity: Option<f32>,
    pub model_path: Option<PathBuf>,
    /// Phrases confirmed by transcribing the wake window
    pub phrases: Option<Vec<String>>,
    pub window_ms: Option<u64>,
    pub refractory_ms: Option<u64>,
    pub energy_floor: Option<f32>,
}

/// Utterance recording policy
#[derive(Debug, Default, Deserialize)]
pub struct UtteranceFileConfig {
    pub max_duration_seconds: Option<f32>,
    pub silence_threshold: Option<f32>,
    pub silence_duration_ms: Option<u64>,
}

/// Speech-to-text engine
#[derive(Debug, Default, Deserialize)]
pub struct AsrFileConfig {
    pub model_path: Option<PathBuf>,
    pub sample_rate: Option<u32>,
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
}

/// Response generator (rules or local LLM)
#[derive(Debug, Default, Deserialize)]
pub struct ResponseFileConfig {
    pub engine_type: Option<EngineType>,
    pub model_path: Option<PathBuf>,
    pub context_size: Option<usize>,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
    /// Older setups call this `rules_file`
    #[serde(alias = "rules_file")]
    pub rules_resource: Option<PathBuf>,
    pub endpoint: Option<String>,
    pub assistant_name: Option<String>,
    pub system_prompt: Option<String>,
    pub fallback_reply: Option<String>,
    pub apology_reply: Option<String>,
}

/// Text-to-speech engine
#[derive(Debug, Default, Deserialize)]
pub struct TtsFileConfig {
    pub model_path: Option<PathBuf>,
    pub sample_rate: Option<u32>,
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
}

/// Retrieval store
#[derive(Debug, Default, Deserialize)]
pub struct RagFileConfig {
    pub enabled: Option<bool>,
    pub database_path: Option<PathBuf>,
    pub top_k: Option<usize>,
}

/// Per-stage time budgets in milliseconds
#[derive(Debug, Default, Deserialize)]
pub struct TimeoutsFileConfig {
    pub transcription_ms: Option<u64>,
    pub retrieval_ms: Option<u64>,
    pub planning_ms: Option<u64>,
    pub synthesis_ms: Option<u64>,
}

/// Logging
#[derive(Debug, Default, Deserialize)]
pub struct LoggingFileConfig {
    pub level: Option<String>,
}

/// Parse a config document
///
/// # Errors
///
/// Returns error if the document is not valid YAML for this schema
pub fn parse_config_file(content: &str) -> Result<DiaConfigFile> {
    // An empty document deserializes to unit, not a mapping
    if content.trim().is_empty() {
        return Ok(DiaConfigFile::default());
    }
    Ok(serde_yaml::from_str(content)?)
}

/// Load the YAML config file
///
/// Uses `path` when given, otherwise [`config_file_path`]. Returns
/// `DiaConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file(path: Option<&Path>) -> DiaConfigFile {
    let Some(path) = path.map(Path::to_path_buf).or_else(config_file_path) else {
        return DiaConfigFile::default();
    };

    if !path.exists() {
        tracing::warn!(path = %path.display(), "config file not found, using defaults");
        return DiaConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match parse_config_file(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                DiaConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            DiaConfigFile::default()
        }
    }
}

/// Load the config file strictly, surfacing read and parse failures
///
/// # Errors
///
/// Returns error if the file cannot be read or parsed
pub fn read_config_file(path: &Path) -> Result<DiaConfigFile> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
    parse_config_file(&content)
}

/// Return the config file path: `$DIA_CONFIG`, else `~/.config/dia/dia.yaml`
pub fn config_file_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return Some(PathBuf::from(path));
    }
    directories::BaseDirs::new().map(|d| d.config_dir().join("dia").join("dia.yaml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_partial_overlay() {
        let fc = parse_config_file(
            "audio:\n  sample_rate: 44100\nwake_word:\n  sensitivity: 0.7\n",
        )
        .unwrap();
        assert_eq!(fc.audio.sample_rate, Some(44100));
        assert_eq!(fc.audio.chunk_size, None);
        assert_eq!(fc.wake_word.sensitivity, Some(0.7));
        assert!(fc.asr.command.is_none());
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let fc = parse_config_file("audio:\n  foo: bar\nextra_section:\n  x: 1\n").unwrap();
        assert!(fc.audio.sample_rate.is_none());
    }

    #[test]
    fn test_empty_document() {
        let fc = parse_config_file("").unwrap();
        assert!(fc.rag.enabled.is_none());
    }

    #[test]
    fn test_rules_file_alias() {
        let fc = parse_config_file("response_generator:\n  rules_file: rules.yaml\n").unwrap();
        assert_eq!(
            fc.response_generator.rules_resource,
            Some(PathBuf::from("rules.yaml"))
        );
    }

    #[test]
    fn test_engine_type_parsed() {
        let fc = parse_config_file("response_generator:\n  engine_type: llm\n").unwrap();
        assert_eq!(fc.response_generator.engine_type, Some(EngineType::Llm));
    }

    #[test]
    fn test_missing_file_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let fc = load_config_file(Some(&dir.path().join("nope.yaml")));
        assert!(fc.audio.sample_rate.is_none());
    }

    #[test]
    fn test_invalid_file_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dia.yaml");
        std::fs::write(&path, "audio: [not, a, map").unwrap();
        let fc = load_config_file(Some(&path));
        assert!(fc.audio.sample_rate.is_none());
        assert!(read_config_file(&path).is_err());
    }
}
