//! Speech-to-text (STT) processing

use std::path::PathBuf;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use super::command;
use super::playback::resample;
use super::{PcmAudio, Utterance};
use crate::config::AsrConfig;
use crate::error::TranscriptionError;

/// Bracketed annotations engines emit for non-speech, e.g. `[BLANK_AUDIO]`
static ANNOTATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[^\]]*\]|\([^)]*\)").expect("valid regex"));

/// Turns an utterance into text
///
/// Empty or unintelligible audio yields `Ok("")`, not an error.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe one utterance
    ///
    /// # Errors
    ///
    /// Returns `TranscriptionError::EngineFailure` if the engine fails
    async fn transcribe(&self, utterance: Utterance) -> Result<String, TranscriptionError>;
}

/// Runs an offline ASR program on a temporary WAV file
///
/// The argument template may use `{input}`, `{model}` and `{sample_rate}`.
/// The transcript is read from stdout.
pub struct CommandTranscriber {
    program: String,
    args: Vec<String>,
    model_path: Option<PathBuf>,
    sample_rate: u32,
}

impl CommandTranscriber {
    #[must_use]
    pub fn new(config: &AsrConfig) -> Self {
        match command::resolve_program(&config.command) {
            Some(path) => tracing::debug!(program = %path.display(), "STT engine found"),
            None => tracing::warn!(
                program = %config.command,
                "STT program not found on PATH, transcription will fail"
            ),
        }
        if let Some(model) = config.model_path.as_ref().filter(|m| !m.exists()) {
            tracing::warn!(model = %model.display(), "STT model file missing");
        }

        Self {
            program: config.command.clone(),
            args: config.args.clone(),
            model_path: config.model_path.clone(),
            sample_rate: config.sample_rate,
        }
    }

    fn prepare_audio(&self, utterance: &Utterance) -> Result<PcmAudio, TranscriptionError> {
        if utterance.sample_rate() == self.sample_rate {
            return Ok(utterance.to_pcm());
        }
        let pcm = utterance.to_pcm();
        let resampled = resample(&pcm.to_f32(), pcm.sample_rate, self.sample_rate)
            .map_err(|e| TranscriptionError::EngineFailure(e.to_string()))?;
        Ok(PcmAudio::from_f32(&resampled, self.sample_rate))
    }
}

#[async_trait]
impl Transcriber for CommandTranscriber {
    async fn transcribe(&self, utterance: Utterance) -> Result<String, TranscriptionError> {
        if utterance.is_empty() {
            return Ok(String::new());
        }

        tracing::debug!(
            samples = utterance.samples().len(),
            duration_ms = utterance.duration().as_millis(),
            "starting transcription"
        );

        let audio = self.prepare_audio(&utterance)?;
        let file = tempfile::Builder::new()
            .prefix("dia-utterance-")
            .suffix(".wav")
            .tempfile()
            .map_err(|e| TranscriptionError::EngineFailure(e.to_string()))?;
        audio
            .write_wav(file.path())
            .map_err(|e| TranscriptionError::EngineFailure(e.to_string()))?;

        let input = file.path().to_string_lossy().into_owned();
        let model = self
            .model_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let rate = self.sample_rate.to_string();
        let args = command::render_args(
            &self.args,
            &[
                ("input", input.as_str()),
                ("model", model.as_str()),
                ("sample_rate", rate.as_str()),
            ],
        );

        let output = command::run(&self.program, &args, None)
            .await
            .map_err(TranscriptionError::EngineFailure)?;

        let transcript = clean_transcript(&String::from_utf8_lossy(&output.stdout));
        tracing::debug!(transcript = %transcript, "transcription complete");
        Ok(transcript)
    }
}

/// Strip engine annotations and collapse whitespace
#[must_use]
pub fn clean_transcript(raw: &str) -> String {
    ANNOTATION
        .replace_all(raw, " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_transcript() {
        assert_eq!(clean_transcript("  Hello   world \n"), "Hello world");
        assert_eq!(clean_transcript("[BLANK_AUDIO]\n"), "");
        assert_eq!(clean_transcript(" (wind blowing) what time is it"), "what time is it");
    }

    #[tokio::test]
    async fn test_empty_utterance_skips_engine() {
        let config = AsrConfig {
            model_path: None,
            sample_rate: 16_000,
            command: "dia-no-such-asr".to_string(),
            args: vec!["{input}".to_string()],
        };
        let stt = CommandTranscriber::new(&config);
        let text = stt
            .transcribe(Utterance::from_samples(Vec::new(), 16_000))
            .await
            .unwrap();
        assert!(text.is_empty());
    }

    #[tokio::test]
    async fn test_missing_engine_fails() {
        let config = AsrConfig {
            model_path: None,
            sample_rate: 16_000,
            command: "dia-no-such-asr".to_string(),
            args: vec!["{input}".to_string()],
        };
        let stt = CommandTranscriber::new(&config);
        let err = stt
            .transcribe(Utterance::from_samples(vec![100; 1600], 16_000))
            .await
            .unwrap_err();
        assert!(matches!(err, TranscriptionError::EngineFailure(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reads_transcript_from_stdout() {
        let config = AsrConfig {
            model_path: None,
            sample_rate: 16_000,
            command: "echo".to_string(),
            args: vec!["[MUSIC]".to_string(), "turn".to_string(), "on".to_string()],
        };
        let stt = CommandTranscriber::new(&config);
        let text = stt
            .transcribe(Utterance::from_samples(vec![100; 1600], 16_000))
            .await
            .unwrap();
        assert_eq!(text, "turn on");
    }
}
