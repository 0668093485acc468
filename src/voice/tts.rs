//! Text-to-speech (TTS) processing

use std::path::PathBuf;

use async_trait::async_trait;

use super::command;
use super::PcmAudio;
use crate::config::TtsConfig;
use crate::error::SynthesisError;

/// Renders reply text as audio
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Synthesize `text`
    ///
    /// # Errors
    ///
    /// Returns `SynthesisError` if the engine fails or produces no audio
    async fn synthesize(&self, text: String) -> Result<PcmAudio, SynthesisError>;
}

/// Runs an offline TTS program such as `espeak` or `piper`
///
/// Text goes in through `{text}` when the template uses it, otherwise on
/// stdin. Audio comes back through the `{output}` file when used, otherwise
/// as WAV on stdout.
pub struct CommandSynthesizer {
    program: String,
    args: Vec<String>,
    model_path: Option<PathBuf>,
}

impl CommandSynthesizer {
    #[must_use]
    pub fn new(config: &TtsConfig) -> Self {
        match command::resolve_program(&config.command) {
            Some(path) => tracing::debug!(program = %path.display(), "TTS engine found"),
            None => tracing::warn!(
                program = %config.command,
                "TTS program not found on PATH, replies will use the error clip"
            ),
        }

        Self {
            program: config.command.clone(),
            args: config.args.clone(),
            model_path: config.model_path.clone(),
        }
    }
}

#[async_trait]
impl Synthesizer for CommandSynthesizer {
    async fn synthesize(&self, text: String) -> Result<PcmAudio, SynthesisError> {
        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(SynthesisError::EmptyOutput);
        }

        tracing::debug!(chars = text.len(), program = %self.program, "starting synthesis");

        let to_file = command::uses_placeholder(&self.args, "output");
        let text_in_args = command::uses_placeholder(&self.args, "text");

        let file = tempfile::Builder::new()
            .prefix("dia-reply-")
            .suffix(".wav")
            .tempfile()
            .map_err(|e| SynthesisError::EngineFailure(e.to_string()))?;
        let output_path = file.path().to_string_lossy().into_owned();
        let model = self
            .model_path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        let args = command::render_args(
            &self.args,
            &[
                ("output", output_path.as_str()),
                ("text", text.as_str()),
                ("model", model.as_str()),
            ],
        );
        let stdin = if text_in_args { None } else { Some(text.as_str()) };

        let output = command::run(&self.program, &args, stdin)
            .await
            .map_err(SynthesisError::EngineFailure)?;

        let audio = if to_file {
            PcmAudio::read_wav(file.path())
        } else {
            PcmAudio::from_wav_bytes(&output.stdout)
        }
        .map_err(|e| SynthesisError::EngineFailure(e.to_string()))?;

        if audio.is_empty() {
            return Err(SynthesisError::EmptyOutput);
        }

        tracing::debug!(
            samples = audio.samples.len(),
            sample_rate = audio.sample_rate,
            "synthesis complete"
        );
        Ok(audio)
    }
}
