//! Pipeline counters
//!
//! Plain atomics shared between the coordinator and the drain worker. They
//! are only read for status reports and logs.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::session::{SessionOutcome, SessionReport};

/// Running totals for one coordinator
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub sessions_started: AtomicU64,
    pub sessions_replied: AtomicU64,
    pub sessions_silent: AtomicU64,
    pub sessions_abandoned: AtomicU64,
    pub wake_events_ignored: AtomicU64,
    /// Triggers whose transcript held no wake phrase
    pub wake_rejections: AtomicU64,
    /// Frames thrown away while a session was busy
    pub frames_discarded: AtomicU64,
    pub utterances_truncated: AtomicU64,
    pub transcription_failures: AtomicU64,
    pub transcription_timeouts: AtomicU64,
    pub plan_failures: AtomicU64,
    pub retrieval_failures: AtomicU64,
    pub synthesis_failures: AtomicU64,
    pub playback_failures: AtomicU64,
    pub fallbacks_used: AtomicU64,
    pub reconnect_attempts: AtomicU64,
    pub reconnect_failures: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub sessions_started: u64,
    pub sessions_replied: u64,
    pub sessions_silent: u64,
    pub sessions_abandoned: u64,
    pub sessions_failed: u64,
    pub wake_events_ignored: u64,
    pub wake_rejections: u64,
    pub frames_dropped: u64,
    pub frames_discarded: u64,
    pub utterances_truncated: u64,
    pub transcription_timeouts: u64,
    pub plan_failures: u64,
    pub retrieval_failures: u64,
    pub synthesis_failures: u64,
    pub playback_failures: u64,
    pub fallbacks_used: u64,
    pub reconnect_attempts: u64,
    pub reconnect_failures: u64,
}

/// Add one to `counter`
pub fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl PipelineStats {
    /// Count a finished session
    pub fn record(&self, report: &SessionReport) {
        let counter = match report.outcome {
            SessionOutcome::Replied => &self.sessions_replied,
            SessionOutcome::Silent => &self.sessions_silent,
            SessionOutcome::TranscriptionFailed => &self.transcription_failures,
            SessionOutcome::Abandoned => &self.sessions_abandoned,
        };
        incr(counter);
        if report.used_fallback {
            incr(&self.fallbacks_used);
        }
    }

    /// Copy all counters
    ///
    /// `frames_dropped` comes from the capture queue, which keeps its own
    /// count.
    #[must_use]
    pub fn snapshot(&self, frames_dropped: u64) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            sessions_started: get(&self.sessions_started),
            sessions_replied: get(&self.sessions_replied),
            sessions_silent: get(&self.sessions_silent),
            sessions_abandoned: get(&self.sessions_abandoned),
            sessions_failed: get(&self.transcription_failures),
            wake_events_ignored: get(&self.wake_events_ignored),
            wake_rejections: get(&self.wake_rejections),
            frames_dropped,
            frames_discarded: get(&self.frames_discarded),
            utterances_truncated: get(&self.utterances_truncated),
            transcription_timeouts: get(&self.transcription_timeouts),
            plan_failures: get(&self.plan_failures),
            retrieval_failures: get(&self.retrieval_failures),
            synthesis_failures: get(&self.synthesis_failures),
            playback_failures: get(&self.playback_failures),
            fallbacks_used: get(&self.fallbacks_used),
            reconnect_attempts: get(&self.reconnect_attempts),
            reconnect_failures: get(&self.reconnect_failures),
        }
    }
}
