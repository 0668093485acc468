//! Session state and reports
//!
//! A [`Session`] lives from a wake event until the coordinator is back in
//! `Idle`. It owns every intermediate artifact of the exchange, and each
//! stage takes its input out of the session by value.

use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::voice::{PcmAudio, Utterance};

/// Coordinator state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Idle,
    Listening,
    Transcribing,
    Planning,
    Synthesizing,
    Speaking,
    /// Capture device lost, reconnecting
    Degraded,
}

impl SessionState {
    /// Whether an inference stage is running
    #[must_use]
    pub const fn is_inference(self) -> bool {
        matches!(self, Self::Transcribing | Self::Planning | Self::Synthesizing)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Transcribing => "transcribing",
            Self::Planning => "planning",
            Self::Synthesizing => "synthesizing",
            Self::Speaking => "speaking",
            Self::Degraded => "degraded",
        };
        f.write_str(name)
    }
}

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    /// A reply (or substitute clip) was played
    Replied,
    /// The transcript was empty
    Silent,
    /// Transcription failed and the error clip was played
    TranscriptionFailed,
    /// Stopped or disconnected before finishing
    Abandoned,
}

/// One wake-to-idle exchange
#[derive(Debug)]
pub struct Session {
    pub id: u64,
    pub state: SessionState,
    pub started_at: DateTime<Local>,
    pub utterance: Option<Utterance>,
    pub transcript: Option<String>,
    pub reply_text: Option<String>,
    pub reply_audio: Option<PcmAudio>,
    /// A fallback reply or the error clip stood in for a stage result
    pub used_fallback: bool,
    path: Vec<SessionState>,
    clock: Instant,
}

impl Session {
    /// Start a session in `Listening`
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self {
            id,
            state: SessionState::Listening,
            started_at: Local::now(),
            utterance: None,
            transcript: None,
            reply_text: None,
            reply_audio: None,
            used_fallback: false,
            path: vec![SessionState::Idle, SessionState::Listening],
            clock: Instant::now(),
        }
    }

    /// Move to `state`, recording it in the path
    pub fn advance(&mut self, state: SessionState) {
        tracing::debug!(session_id = self.id, from = %self.state, to = %state, "session state change");
        self.state = state;
        self.path.push(state);
    }

    /// States visited so far, starting with `Idle`
    #[must_use]
    pub fn path(&self) -> &[SessionState] {
        &self.path
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.clock.elapsed()
    }

    /// Close the session and summarize it
    #[must_use]
    pub fn finish(mut self, outcome: SessionOutcome) -> SessionReport {
        if outcome != SessionOutcome::Abandoned {
            self.path.push(SessionState::Idle);
        }
        SessionReport {
            id: self.id,
            started_at: self.started_at,
            path: self.path,
            outcome,
            used_fallback: self.used_fallback,
            transcript: self.transcript,
            reply: self.reply_text,
            elapsed: self.clock.elapsed(),
        }
    }
}

/// Summary of a finished session
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub id: u64,
    pub started_at: DateTime<Local>,
    pub path: Vec<SessionState>,
    pub outcome: SessionOutcome,
    pub used_fallback: bool,
    pub transcript: Option<String>,
    pub reply: Option<String>,
    #[serde(serialize_with = "serialize_millis")]
    pub elapsed: Duration,
}

impl SessionReport {
    /// Whether the path passed through `state`
    #[must_use]
    pub fn visited(&self, state: SessionState) -> bool {
        self.path.contains(&state)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn serialize_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_records_transitions() {
        let mut session = Session::new(7);
        session.advance(SessionState::Transcribing);
        session.advance(SessionState::Planning);
        assert_eq!(session.state, SessionState::Planning);

        let report = session.finish(SessionOutcome::Replied);
        assert_eq!(report.id, 7);
        assert_eq!(
            report.path,
            vec![
                SessionState::Idle,
                SessionState::Listening,
                SessionState::Transcribing,
                SessionState::Planning,
                SessionState::Idle,
            ]
        );
        assert!(report.visited(SessionState::Planning));
        assert!(!report.visited(SessionState::Speaking));
    }

    #[test]
    fn test_abandoned_does_not_reach_idle() {
        let mut session = Session::new(1);
        session.advance(SessionState::Transcribing);
        let report = session.finish(SessionOutcome::Abandoned);
        assert_eq!(report.path.last(), Some(&SessionState::Transcribing));
    }

    #[test]
    fn test_report_serializes() {
        let report = Session::new(3).finish(SessionOutcome::Silent);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["outcome"], "silent");
        assert_eq!(json["path"][1], "listening");
        assert!(json["elapsed"].is_u64());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Degraded.to_string(), "degraded");
        assert!(SessionState::Planning.is_inference());
        assert!(!SessionState::Speaking.is_inference());
    }
}
