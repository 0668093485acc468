//! Session coordinator
//!
//! Owns the capture device and the inference stages, and drives the session
//! state machine:
//!
//! ```text
//! Idle -> Listening -> Transcribing -> Planning -> Synthesizing -> Speaking -> Idle
//!   \_______________________ device lost: Degraded -> Idle ____________________/
//! ```
//!
//! A wake trigger only leaves Idle once its audio window transcribes to a
//! configured phrase.
//!
//! Frames never pass through this task. The [`DrainWorker`] routes them and
//! reports wake events and finished utterances over a channel, so a slow
//! stage can never stall capture.

mod drain;
mod pipeline;
mod reconnect;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::config::Config;
use crate::error::DeviceError;
use crate::session::{Session, SessionOutcome, SessionReport, SessionState};
use crate::stats::{self, PipelineStats};
use crate::voice::{
    CaptureDevice, FrameQueue, KeywordModel, PcmAudio, PhraseSpotter, UtteranceRecorder,
    WakeDetector, load_error_clip,
};
use crate::{Error, Result};

pub use drain::{CaptureEvent, DrainCommand, DrainWorker};
pub use pipeline::{Pipeline, Stages};
pub use reconnect::Backoff;

/// How often the capture device's health is checked
const HEALTH_INTERVAL: Duration = Duration::from_millis(250);

/// Why a session stopped early
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Stop,
    Disconnected,
}

/// Drives sessions from wake event to idle, one at a time
pub struct SessionCoordinator {
    config: Arc<Config>,
    capture: Box<dyn CaptureDevice>,
    spotter: Option<PhraseSpotter>,
    stages: Stages,
    queue: Arc<FrameQueue>,
    error_clip: PcmAudio,
    stats: Arc<PipelineStats>,
    state: watch::Sender<SessionState>,
    backoff: Backoff,
    next_session_id: u64,
    worker: Option<DrainWorker>,
    events: mpsc::UnboundedReceiver<CaptureEvent>,
    commands: mpsc::UnboundedSender<DrainCommand>,
    reports: Option<mpsc::UnboundedSender<SessionReport>>,
}

impl SessionCoordinator {
    /// Wire a pipeline to a fresh capture queue
    ///
    /// `sensitivity` is read by the wake detector on every frame.
    #[must_use]
    pub fn new(config: Arc<Config>, pipeline: Pipeline, sensitivity: watch::Receiver<f32>) -> Self {
        let Pipeline {
            capture,
            keyword_model,
            wake_spotter,
            stages,
        } = pipeline;

        let queue = FrameQueue::new(config.queue_frames());
        let stats = Arc::new(PipelineStats::default());
        let (event_tx, events) = mpsc::unbounded_channel();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let worker = DrainWorker::new(
            Arc::clone(&queue),
            build_detector(keyword_model, &config, sensitivity),
            UtteranceRecorder::from_config(&config),
            Arc::clone(&stats),
            event_tx,
            command_rx,
        );
        let error_clip = load_error_clip(
            config.audio.error_sound_path.as_deref(),
            config.audio.sample_rate,
        );
        let (state, _) = watch::channel(SessionState::Idle);

        Self {
            backoff: Backoff::from_config(&config.audio),
            config,
            capture,
            spotter: wake_spotter,
            stages,
            queue,
            error_clip,
            stats,
            state,
            next_session_id: 0,
            worker: Some(worker),
            events,
            commands,
            reports: None,
        }
    }

    /// Replace the clip played when a session fails
    #[must_use]
    pub fn with_error_clip(mut self, clip: PcmAudio) -> Self {
        self.error_clip = clip;
        self
    }

    #[must_use]
    pub const fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Receive a report for every finished session
    pub fn subscribe_reports(&mut self) -> mpsc::UnboundedReceiver<SessionReport> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.reports = Some(tx);
        rx
    }

    /// Watch the coordinator state
    #[must_use]
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// The capture queue, for drop counts
    #[must_use]
    pub fn queue(&self) -> Arc<FrameQueue> {
        Arc::clone(&self.queue)
    }

    /// Open the capture device
    ///
    /// # Errors
    ///
    /// Returns `Error::Device` if capture cannot start
    pub async fn open(&mut self) -> Result<()> {
        self.open_capture().await?;
        tracing::info!(
            device = %self.capture.name(),
            queue_frames = self.queue.capacity(),
            "capture device opened"
        );
        Ok(())
    }

    /// Open capture on the blocking pool, device enumeration can stall
    async fn open_capture(&mut self) -> std::result::Result<(), DeviceError> {
        let queue = Arc::clone(&self.queue);
        let mut capture = std::mem::replace(&mut self.capture, Box::new(Detached));
        let opened = tokio::task::spawn_blocking(move || {
            let result = capture.open(queue);
            (capture, result)
        })
        .await;
        match opened {
            Ok((capture, result)) => {
                self.capture = capture;
                result
            }
            Err(e) => Err(DeviceError::Unavailable(format!("capture open task failed: {e}"))),
        }
    }

    /// Run until `stop` turns true or its sender is dropped
    ///
    /// A session that is speaking finishes playback first; one that is
    /// still in an inference stage is abandoned.
    ///
    /// # Errors
    ///
    /// Returns error if the capture device cannot be opened at start, or if
    /// the coordinator has already run
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> Result<()> {
        if !self.capture.is_connected() {
            self.open().await?;
        }
        let worker = self
            .worker
            .take()
            .ok_or_else(|| Error::Control("coordinator already ran".to_string()))?;
        let drain = worker.spawn();

        let mut health = tokio::time::interval(HEALTH_INTERVAL);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut session: Option<Session> = None;
        self.set_state(SessionState::Idle);
        tracing::info!("listening for wake word");

        loop {
            tokio::select! {
                biased;
                _ = async { stop.wait_for(|&stopped| stopped).await.map(|_| ()) } => break,
                _ = health.tick() => {
                    if self.capture.is_connected() {
                        continue;
                    }
                    if let Some(active) = session.take() {
                        self.publish(active.finish(SessionOutcome::Abandoned));
                    }
                    if !self.reconnect(&mut stop).await {
                        break;
                    }
                }
                event = self.events.recv() => match event {
                    Some(CaptureEvent::WakeDetected { confidence, window }) => {
                        let state = *self.state.borrow();
                        if session.is_some() || state != SessionState::Idle {
                            stats::incr(&self.stats.wake_events_ignored);
                            tracing::debug!(state = %state, "wake event ignored, not idle");
                            continue;
                        }
                        let confirmed = self.confirm_wake(window, &mut stop).await;
                        match confirmed {
                            Ok(true) => session = Some(self.begin_session(confidence)),
                            Ok(false) => self.resume(),
                            Err(Interrupt::Stop) => break,
                            Err(Interrupt::Disconnected) => {
                                if !self.reconnect(&mut stop).await {
                                    break;
                                }
                            }
                        }
                    }
                    Some(CaptureEvent::UtteranceReady(utterance)) => {
                        let Some(mut active) = session.take() else {
                            tracing::debug!("utterance without a session, discarded");
                            self.resume();
                            continue;
                        };
                        active.utterance = Some(utterance);
                        let (report, interrupt) = self.run_session(active, &mut stop).await;
                        self.publish(report);
                        match interrupt {
                            None => self.resume(),
                            Some(Interrupt::Stop) => break,
                            Some(Interrupt::Disconnected) => {
                                if !self.reconnect(&mut stop).await {
                                    break;
                                }
                            }
                        }
                    }
                    None => break,
                },
            }
        }

        if let Some(active) = session.take() {
            self.publish(active.finish(SessionOutcome::Abandoned));
        }
        self.capture.close();
        self.queue.close();
        let _ = drain.await;
        self.set_state(SessionState::Idle);
        tracing::info!(
            sessions = self.next_session_id,
            frames_dropped = self.queue.dropped(),
            "coordinator stopped"
        );
        Ok(())
    }

    fn begin_session(&mut self, confidence: f32) -> Session {
        self.next_session_id += 1;
        stats::incr(&self.stats.sessions_started);
        tracing::info!(session_id = self.next_session_id, confidence, "wake word heard, listening");
        self.set_state(SessionState::Listening);
        Session::new(self.next_session_id)
    }

    /// Back to idle and watching for the wake phrase
    fn resume(&self) {
        self.set_state(SessionState::Idle);
        let _ = self.commands.send(DrainCommand::Resume);
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }

    fn publish(&self, report: SessionReport) {
        tracing::info!(
            session_id = report.id,
            outcome = ?report.outcome,
            used_fallback = report.used_fallback,
            elapsed_ms = u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX),
            path = ?report.path,
            "session finished"
        );
        self.stats.record(&report);
        if let Some(tx) = &self.reports {
            let _ = tx.send(report);
        }
    }

    /// Reopen capture with backoff until it works or `stop` fires
    ///
    /// Returns `false` if stopped while degraded.
    async fn reconnect(&mut self, stop: &mut watch::Receiver<bool>) -> bool {
        self.set_state(SessionState::Degraded);
        let _ = self.commands.send(DrainCommand::Reset);
        self.capture.close();
        tracing::warn!(device = %self.capture.name(), "capture device lost, reconnecting");

        let mut attempt = 0_u32;
        loop {
            let delay = self.backoff.delay_for_attempt(attempt);
            tokio::select! {
                biased;
                _ = stop.wait_for(|&stopped| stopped) => return false,
                () = tokio::time::sleep(delay) => {}
            }

            stats::incr(&self.stats.reconnect_attempts);
            match self.open_capture().await {
                Ok(()) => {
                    tracing::info!(
                        device = %self.capture.name(),
                        attempts = attempt + 1,
                        "capture device reconnected"
                    );
                    self.resume();
                    return true;
                }
                Err(e) => {
                    stats::incr(&self.stats.reconnect_failures);
                    attempt = attempt.saturating_add(1);
                    tracing::warn!(
                        error = %e,
                        attempt,
                        next_delay_ms = u64::try_from(self.backoff.delay_for_attempt(attempt).as_millis())
                            .unwrap_or(u64::MAX),
                        "reconnect failed"
                    );
                }
            }
        }
    }
}

/// Stands in for the capture device while it is opening on another thread
struct Detached;

impl CaptureDevice for Detached {
    fn open(&mut self, _queue: Arc<FrameQueue>) -> std::result::Result<(), DeviceError> {
        Err(DeviceError::Unavailable("capture device is detached".to_string()))
    }

    fn close(&mut self) {}

    fn is_connected(&self) -> bool {
        false
    }

    fn name(&self) -> String {
        "detached".to_string()
    }
}

fn build_detector(
    model: Box<dyn KeywordModel>,
    config: &Config,
    sensitivity: watch::Receiver<f32>,
) -> WakeDetector {
    WakeDetector::new(model, &config.wake_word, config.audio.sample_rate, sensitivity)
}
