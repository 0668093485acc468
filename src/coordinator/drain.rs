//! Capture drain worker
//!
//! One task pulls frames off the [`FrameQueue`] in capture order and routes
//! them by mode: into the wake detector while idle, into the utterance
//! buffer while listening, and nowhere while a session is busy. It talks to
//! the coordinator only through channels, so capture never waits on
//! inference.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::stats::{self, PipelineStats};
use crate::voice::{
    AudioFrame, FrameQueue, Utterance, UtteranceBuffer, UtteranceRecorder, WakeDetector,
    WakeSignal,
};

/// Something the coordinator must act on
#[derive(Debug)]
pub enum CaptureEvent {
    /// Wake trigger fired; the worker is now recording
    ///
    /// `window` is the audio that triggered it, for phrase confirmation.
    WakeDetected { confidence: f32, window: Utterance },
    /// Recording finished; the worker discards frames until resumed
    UtteranceReady(Utterance),
}

/// Instructions from the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainCommand {
    /// Session over, watch for the wake phrase again
    Resume,
    /// Drop any partial recording and discard frames until resumed
    Reset,
}

enum Mode {
    Idle,
    Listening(UtteranceBuffer),
    Busy,
}

/// Routes captured frames to the detector or the recorder
pub struct DrainWorker {
    queue: Arc<FrameQueue>,
    detector: WakeDetector,
    recorder: UtteranceRecorder,
    sample_rate: u32,
    stats: Arc<PipelineStats>,
    events: mpsc::UnboundedSender<CaptureEvent>,
    commands: mpsc::UnboundedReceiver<DrainCommand>,
    mode: Mode,
}

impl DrainWorker {
    #[must_use]
    pub fn new(
        queue: Arc<FrameQueue>,
        detector: WakeDetector,
        recorder: UtteranceRecorder,
        stats: Arc<PipelineStats>,
        events: mpsc::UnboundedSender<CaptureEvent>,
        commands: mpsc::UnboundedReceiver<DrainCommand>,
    ) -> Self {
        Self {
            queue,
            detector,
            sample_rate: recorder.sample_rate(),
            recorder,
            stats,
            events,
            commands,
            mode: Mode::Idle,
        }
    }

    /// Run on the tokio runtime until the queue closes
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Drain until the queue is closed and empty, or the coordinator goes away
    pub async fn run(mut self) {
        tracing::debug!(capacity = self.queue.capacity(), "drain worker started");
        loop {
            tokio::select! {
                biased;
                command = self.commands.recv() => match command {
                    Some(command) => self.apply(command),
                    None => break,
                },
                frame = self.queue.recv() => match frame {
                    Some(frame) => self.handle(frame),
                    None => break,
                },
            }
        }
        tracing::debug!("drain worker stopped");
    }

    fn apply(&mut self, command: DrainCommand) {
        tracing::trace!(command = ?command, "drain command");
        self.detector.reset();
        self.mode = match command {
            DrainCommand::Resume => Mode::Idle,
            DrainCommand::Reset => Mode::Busy,
        };
    }

    fn handle(&mut self, frame: AudioFrame) {
        match &mut self.mode {
            Mode::Idle => {
                if let WakeSignal::Detected(confidence) = self.detector.observe(&frame) {
                    let window =
                        Utterance::from_samples(self.detector.window().to_vec(), self.sample_rate);
                    self.mode = Mode::Listening(self.recorder.start());
                    let _ = self
                        .events
                        .send(CaptureEvent::WakeDetected { confidence, window });
                }
            }
            Mode::Listening(buffer) => {
                if self.recorder.push(buffer, frame).is_err() {
                    stats::incr(&self.stats.utterances_truncated);
                }
                if !self.recorder.is_complete(buffer) {
                    return;
                }
                if let Mode::Listening(buffer) = std::mem::replace(&mut self.mode, Mode::Busy) {
                    let utterance = self.recorder.finalize(buffer);
                    let _ = self.events.send(CaptureEvent::UtteranceReady(utterance));
                }
            }
            Mode::Busy => stats::incr(&self.stats.frames_discarded),
        }
    }
}
