//! Error types for the Dia assistant
//!
//! Startup and configuration failures use the crate-level [`Error`]. Each
//! pipeline stage has its own error enum so the coordinator can pick the
//! matching fallback without string matching.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for Dia operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur outside a running session
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio device error
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// Audio encoding or decoding error
    #[error("audio error: {0}")]
    Audio(String),

    /// Response planner setup error
    #[error("planner error: {0}")]
    Planner(String),

    /// Retrieval store error
    #[error("database error: {0}")]
    Database(String),

    /// Control channel closed
    #[error("control error: {0}")]
    Control(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Audio device failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    /// No usable device could be opened
    #[error("audio device unavailable: {0}")]
    Unavailable(String),

    /// Stream could not be built or started
    #[error("audio stream error: {0}")]
    Stream(String),

    /// Device went away mid-run
    #[error("audio device disconnected")]
    Disconnected,

    /// Output failed while playing
    #[error("playback failed: {0}")]
    Playback(String),
}

/// Raised when a frame would push an utterance past its ceiling
///
/// This is a completion signal, not a failure.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("utterance capacity of {capacity} samples reached")]
pub struct CapacityExceeded {
    /// Ceiling in samples
    pub capacity: usize,
    /// Samples of the offending frame that did not fit
    pub discarded: usize,
}

/// Speech-to-text failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TranscriptionError {
    /// Engine did not answer in time
    #[error("transcription timed out after {0:?}")]
    Timeout(Duration),

    /// Engine failed or could not run
    #[error("transcription engine failure: {0}")]
    EngineFailure(String),
}

/// Response planning failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlanError {
    /// Inference engine missing, failed, or timed out
    #[error("inference engine unavailable: {0}")]
    EngineUnavailable(String),

    /// No rule matched and there is nothing to fall back to
    #[error("no response matched")]
    NoMatch,
}

/// Text-to-speech failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SynthesisError {
    /// Engine did not answer in time
    #[error("synthesis timed out after {0:?}")]
    Timeout(Duration),

    /// Engine failed or could not run
    #[error("synthesis engine failure: {0}")]
    EngineFailure(String),

    /// Engine ran but produced no audio
    #[error("synthesis produced no audio")]
    EmptyOutput,
}

/// Retrieval failures, never fatal to a session
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RetrievalError {
    /// Store could not be read
    #[error("retrieval store unavailable: {0}")]
    StoreUnavailable(String),

    /// Lookup did not finish in time
    #[error("retrieval timed out after {0:?}")]
    Timeout(Duration),
}
