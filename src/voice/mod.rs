//! Voice processing module
//!
//! Handles audio capture, wake word detection, utterance recording,
//! offline STT/TTS engines, and playback.

mod capture;
pub mod command;
mod frame;
mod playback;
mod queue;
mod recorder;
mod stt;
mod tts;
mod wake_word;

pub use capture::{CaptureDevice, CpalCapture, find_input_device, list_devices};
pub use frame::{AudioFrame, FrameAssembler, PcmAudio, downmix, f32_to_i16, rms_i16, tone};
pub use playback::{
    CpalPlayback, PlaybackDevice, beep_clip, find_output_device, load_clip, load_error_clip,
    resample,
};
pub use queue::FrameQueue;
pub use recorder::{Completion, Utterance, UtteranceBuffer, UtteranceRecorder};
pub use stt::{CommandTranscriber, Transcriber, clean_transcript};
pub use tts::{CommandSynthesizer, Synthesizer};
pub use wake_word::{EnergyKeywordModel, KeywordModel, PhraseSpotter, WakeDetector, WakeSignal};
