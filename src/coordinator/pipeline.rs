//! Stage execution for one session
//!
//! Every inference stage runs under its own timeout and is raced against
//! stop requests and capture health. A timed-out stage future is dropped,
//! which kills engine subprocesses and discards late results.

use std::future::Future;

use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, timeout};

use super::{HEALTH_INTERVAL, Interrupt, SessionCoordinator};
use crate::config::Config;
use crate::error::{PlanError, RetrievalError, SynthesisError, TranscriptionError};
use crate::planner::ResponsePlanner;
use crate::rag::{Retriever, Snippet, SqliteRetriever};
use crate::session::{Session, SessionOutcome, SessionReport, SessionState};
use crate::stats;
use crate::voice::{
    CaptureDevice, CommandSynthesizer, CommandTranscriber, CpalCapture, CpalPlayback,
    EnergyKeywordModel, KeywordModel, PcmAudio, PhraseSpotter, PlaybackDevice, Synthesizer,
    Transcriber, Utterance,
};

/// The inference and output stages of a session
pub struct Stages {
    pub transcriber: Box<dyn Transcriber>,
    pub planner: ResponsePlanner,
    pub synthesizer: Box<dyn Synthesizer>,
    pub playback: Box<dyn PlaybackDevice>,
    /// Only consulted by planners that take context
    pub retriever: Option<Box<dyn Retriever>>,
}

/// Everything a coordinator needs besides configuration
pub struct Pipeline {
    pub capture: Box<dyn CaptureDevice>,
    pub keyword_model: Box<dyn KeywordModel>,
    /// Confirms keyword model triggers; `None` trusts the model alone
    pub wake_spotter: Option<PhraseSpotter>,
    pub stages: Stages,
}

impl Pipeline {
    /// Build the device-backed pipeline described by `config`
    ///
    /// Missing engines and an unusable retrieval store are logged but do
    /// not fail; sessions will fall back at the affected stage.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        if let Some(model) = &config.wake_word.model_path {
            tracing::warn!(
                model = %model.display(),
                "keyword model files are not supported, using the energy model"
            );
        }
        let wake_spotter = PhraseSpotter::new(
            &config.wake_word.phrases,
            Box::new(CommandTranscriber::new(&config.asr)),
        );
        if wake_spotter.is_none() {
            tracing::warn!("no wake phrases configured, any sustained sound starts a session");
        }

        let playback = CpalPlayback::new(&config.audio);
        match playback.probe() {
            Ok(name) => tracing::info!(device = %name, "playback device found"),
            Err(e) => tracing::warn!(error = %e, "no playback device, replies will be lost"),
        }

        let retriever: Option<Box<dyn Retriever>> = if config.rag.enabled {
            match SqliteRetriever::open(&config.rag.database_path) {
                Ok(retriever) => {
                    tracing::info!(path = %config.rag.database_path.display(), "retrieval store opened");
                    Some(Box::new(retriever))
                }
                Err(e) => {
                    tracing::warn!(error = %e, "retrieval store unavailable, RAG disabled");
                    None
                }
            }
        } else {
            None
        };

        let planner = ResponsePlanner::from_config(&config.response_generator);
        tracing::info!(engine = ?planner.kind(), rag = retriever.is_some(), "response planner loaded");

        Self {
            capture: Box::new(CpalCapture::new(&config.audio)),
            keyword_model: Box::new(EnergyKeywordModel::new(config.wake_word.energy_floor)),
            wake_spotter,
            stages: Stages {
                transcriber: Box::new(CommandTranscriber::new(&config.asr)),
                planner,
                synthesizer: Box::new(CommandSynthesizer::new(&config.tts)),
                playback: Box::new(playback),
                retriever,
            },
        }
    }
}

impl SessionCoordinator {
    /// Check a wake trigger for a configured phrase
    ///
    /// Transcription errors and timeouts count as a rejection.
    pub(super) async fn confirm_wake(
        &self,
        window: Utterance,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<bool, Interrupt> {
        let Some(spotter) = &self.spotter else {
            return Ok(true);
        };
        let budget = self.config.timeouts.transcription();
        let checked = self
            .guarded(stop, timeout(budget, spotter.confirm(window)))
            .await?;
        let confirmed = match checked {
            Ok(Ok(found)) => found.is_some(),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "wake phrase check failed");
                false
            }
            Err(_) => {
                tracing::warn!(budget_ms = self.config.timeouts.transcription_ms, "wake phrase check timed out");
                false
            }
        };
        if !confirmed {
            stats::incr(&self.stats.wake_rejections);
            tracing::debug!("wake trigger rejected, back to idle");
        }
        Ok(confirmed)
    }

    /// Take a session with a finished utterance through to playback
    #[allow(clippy::too_many_lines)]
    pub(super) async fn run_session(
        &self,
        mut session: Session,
        stop: &mut watch::Receiver<bool>,
    ) -> (SessionReport, Option<Interrupt>) {
        let timeouts = &self.config.timeouts;

        // Transcribing
        self.enter(&mut session, SessionState::Transcribing);
        let Some(utterance) = session.utterance.take() else {
            return (session.finish(SessionOutcome::Silent), None);
        };
        tracing::debug!(
            session_id = session.id,
            audio_ms = u64::try_from(utterance.duration().as_millis()).unwrap_or(u64::MAX),
            "transcribing"
        );
        let transcribed = self
            .guarded(
                stop,
                timeout(timeouts.transcription(), self.stages.transcriber.transcribe(utterance)),
            )
            .await;
        let transcript = match transcribed {
            Err(interrupt) => return abandon(session, interrupt),
            Ok(Ok(Ok(text))) => text,
            Ok(Ok(Err(e))) => return self.transcription_failed(session, &e).await,
            Ok(Err(_)) => {
                stats::incr(&self.stats.transcription_timeouts);
                let e = TranscriptionError::Timeout(timeouts.transcription());
                return self.transcription_failed(session, &e).await;
            }
        };

        if transcript.trim().is_empty() {
            tracing::info!(session_id = session.id, "empty transcript, back to idle");
            return (session.finish(SessionOutcome::Silent), None);
        }
        tracing::info!(session_id = session.id, transcript = %transcript, "transcribed");
        session.transcript = Some(transcript.clone());

        // Planning
        self.enter(&mut session, SessionState::Planning);
        let context = match self.retrieve(&session, &transcript, stop).await {
            Ok(context) => context,
            Err(interrupt) => return abandon(session, interrupt),
        };
        let planned = self
            .guarded(
                stop,
                timeout(
                    timeouts.planning(),
                    self.stages.planner.plan(&transcript, context.as_deref()),
                ),
            )
            .await;
        let reply = match planned {
            Err(interrupt) => return abandon(session, interrupt),
            Ok(Ok(Ok(reply))) if !reply.trim().is_empty() => reply,
            Ok(Ok(Ok(_))) => self.substitute_reply(&mut session, &PlanError::NoMatch),
            Ok(Ok(Err(e))) => self.substitute_reply(&mut session, &e),
            Ok(Err(_)) => self.substitute_reply(
                &mut session,
                &PlanError::EngineUnavailable(format!(
                    "timed out after {}ms",
                    timeouts.planning_ms
                )),
            ),
        };
        tracing::info!(session_id = session.id, reply = %reply, "reply planned");
        session.reply_text = Some(reply.clone());

        // Synthesizing
        self.enter(&mut session, SessionState::Synthesizing);
        let synthesized = self
            .guarded(
                stop,
                timeout(timeouts.synthesis(), self.stages.synthesizer.synthesize(reply)),
            )
            .await;
        let audio = match synthesized {
            Err(interrupt) => return abandon(session, interrupt),
            Ok(Ok(Ok(audio))) => audio,
            Ok(Ok(Err(e))) => self.synthesis_failed(&mut session, &e),
            Ok(Err(_)) => {
                let e = SynthesisError::Timeout(timeouts.synthesis());
                self.synthesis_failed(&mut session, &e)
            }
        };
        session.reply_audio = Some(audio);

        // Speaking
        if let Some(audio) = session.reply_audio.take() {
            self.speak(&mut session, audio).await;
        }
        (session.finish(SessionOutcome::Replied), None)
    }

    fn enter(&self, session: &mut Session, state: SessionState) {
        session.advance(state);
        self.set_state(state);
    }

    /// Play the error clip and end the session
    async fn transcription_failed(
        &self,
        mut session: Session,
        error: &TranscriptionError,
    ) -> (SessionReport, Option<Interrupt>) {
        tracing::warn!(session_id = session.id, error = %error, "transcription failed, playing error clip");
        session.used_fallback = true;
        self.speak(&mut session, self.error_clip.clone()).await;
        (session.finish(SessionOutcome::TranscriptionFailed), None)
    }

    /// Error clip standing in for the synthesized reply
    fn synthesis_failed(&self, session: &mut Session, error: &SynthesisError) -> PcmAudio {
        stats::incr(&self.stats.synthesis_failures);
        tracing::warn!(session_id = session.id, error = %error, "synthesis failed, playing error clip");
        session.used_fallback = true;
        self.error_clip.clone()
    }

    /// Play a clip to completion; playback errors are logged, never fatal
    async fn speak(&self, session: &mut Session, audio: PcmAudio) {
        self.enter(session, SessionState::Speaking);
        let clip_ms = u64::try_from(audio.duration().as_millis()).unwrap_or(u64::MAX);
        if let Err(e) = self.stages.playback.accept(audio).await {
            stats::incr(&self.stats.playback_failures);
            tracing::warn!(session_id = session.id, error = %e, "playback failed");
        } else {
            tracing::debug!(session_id = session.id, clip_ms, "playback finished");
        }
    }

    /// Look up context for planners that use it
    ///
    /// Failures and timeouts leave the context empty.
    async fn retrieve(
        &self,
        session: &Session,
        text: &str,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<Option<Vec<Snippet>>, Interrupt> {
        let Some(retriever) = self
            .stages
            .retriever
            .as_ref()
            .filter(|_| self.stages.planner.wants_context())
        else {
            return Ok(None);
        };

        let budget = self.config.timeouts.retrieval();
        let found = self
            .guarded(stop, timeout(budget, retriever.search(text, self.config.rag.top_k)))
            .await?;
        let result = found.unwrap_or(Err(RetrievalError::Timeout(budget)));
        match result {
            Ok(snippets) => {
                tracing::debug!(session_id = session.id, snippets = snippets.len(), "context retrieved");
                Ok(Some(snippets))
            }
            Err(e) => {
                stats::incr(&self.stats.retrieval_failures);
                tracing::warn!(session_id = session.id, error = %e, "retrieval failed, planning without context");
                Ok(None)
            }
        }
    }

    /// Reply text used when the planner could not produce one
    fn substitute_reply(&self, session: &mut Session, error: &PlanError) -> String {
        stats::incr(&self.stats.plan_failures);
        session.used_fallback = true;
        let replies = &self.config.response_generator;
        let reply = match error {
            PlanError::EngineUnavailable(_) => &replies.apology_reply,
            PlanError::NoMatch => &replies.fallback_reply,
        };
        tracing::warn!(session_id = session.id, error = %error, "planning failed, using canned reply");
        reply.clone()
    }

    /// Await `fut` unless a stop is requested or capture is lost first
    async fn guarded<F: Future>(
        &self,
        stop: &mut watch::Receiver<bool>,
        fut: F,
    ) -> Result<F::Output, Interrupt> {
        tokio::pin!(fut);
        let mut health = tokio::time::interval_at(
            tokio::time::Instant::now() + HEALTH_INTERVAL,
            HEALTH_INTERVAL,
        );
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = stop.wait_for(|&stopped| stopped) => return Err(Interrupt::Stop),
                _ = health.tick() => {
                    if !self.capture.is_connected() {
                        return Err(Interrupt::Disconnected);
                    }
                }
                output = &mut fut => return Ok(output),
            }
        }
    }
}

fn abandon(session: Session, interrupt: Interrupt) -> (SessionReport, Option<Interrupt>) {
    tracing::warn!(
        session_id = session.id,
        state = %session.state,
        reason = ?interrupt,
        "session abandoned"
    );
    (session.finish(SessionOutcome::Abandoned), Some(interrupt))
}
