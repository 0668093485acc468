//! Dia - offline voice assistant pipeline
//!
//! This library provides the core of the Dia assistant:
//! - Continuous microphone capture with a bounded, drop-oldest queue
//! - Wake word detection and utterance recording
//! - Offline STT and TTS engines
//! - Rule-based or local LLM response planning, with optional retrieval
//! - A session coordinator that keeps one exchange in flight at a time
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   frames   ┌──────────────┐  wake / utterance  ┌──────────────────┐
//! │   Capture    │──────────▶│ Drain worker │───────────────────▶│   Coordinator    │
//! │ (cpal, own   │ FrameQueue │ WakeDetector │      events        │ STT → plan → TTS │
//! │   thread)    │            │ Recorder     │◀───────────────────│   → playback     │
//! └──────────────┘            └──────────────┘   resume / reset   └──────────────────┘
//!                                                                          ▲
//!                                                          ControlCommand  │
//!                                                                   ┌──────┴─────┐
//!                                                                   │ Supervisor │
//!                                                                   └────────────┘
//! ```

pub mod config;
pub mod control;
pub mod coordinator;
pub mod error;
pub mod planner;
pub mod rag;
pub mod session;
pub mod stats;
pub mod voice;

pub use config::Config;
pub use control::{ConfigSource, ControlCommand, ControlHandle, DeviceFactory, Supervisor};
pub use coordinator::{Pipeline, SessionCoordinator, Stages};
pub use error::{Error, Result};
pub use session::{SessionOutcome, SessionReport, SessionState};
