//! Shared test utilities

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

use dia_assistant::config::Config;
use dia_assistant::control::PipelineFactory;
use dia_assistant::coordinator::{Backoff, Pipeline, SessionCoordinator, Stages};
use dia_assistant::error::{DeviceError, PlanError, SynthesisError, TranscriptionError};
use dia_assistant::planner::{
    CompletionRequest, InferenceEngine, LlmPlanner, ResponsePlanner, RulesPlanner, default_rules,
};
use dia_assistant::rag::Retriever;
use dia_assistant::session::{SessionReport, SessionState};
use dia_assistant::stats::PipelineStats;
use dia_assistant::voice::{
    AudioFrame, CaptureDevice, Completion, EnergyKeywordModel, FrameQueue, PcmAudio,
    PhraseSpotter, PlaybackDevice, Synthesizer, Transcriber, Utterance, tone,
};

pub const SAMPLE_RATE: u32 = 16_000;

/// 100 ms frames
pub const CHUNK: usize = 1600;

/// How long helpers wait for the coordinator before failing a test
pub const PATIENCE: Duration = Duration::from_secs(5);

/// Config with small, fast settings for coordinator tests
#[must_use]
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.audio.sample_rate = SAMPLE_RATE;
    config.audio.chunk_size = CHUNK;
    config.audio.buffer_max_length = CHUNK * 512;
    config.audio.reconnect_initial_ms = 10;
    config.audio.reconnect_max_ms = 40;
    config.wake_word.sensitivity = 0.5;
    config.wake_word.phrases = vec!["hey dia".to_string()];
    config.wake_word.window_ms = 200;
    config.wake_word.refractory_ms = 0;
    config.wake_word.energy_floor = 0.02;
    config.utterance.max_duration_seconds = 5.0;
    config.utterance.silence_threshold = 0.01;
    config.utterance.silence_duration_ms = 1000;
    config.timeouts.transcription_ms = 1000;
    config.timeouts.retrieval_ms = 200;
    config.timeouts.planning_ms = 1000;
    config.timeouts.synthesis_ms = 1000;
    config.rag.enabled = false;
    config
}

/// One frame of a 440 Hz tone, well above the energy floor
#[must_use]
pub fn loud_frame() -> AudioFrame {
    let mut samples = tone(440.0, 1.0, 0.5, SAMPLE_RATE);
    samples.truncate(CHUNK);
    AudioFrame::new(samples)
}

#[must_use]
pub fn silent_frame() -> AudioFrame {
    AudioFrame::silent(CHUNK)
}

/// `count` voiced frames
#[must_use]
pub fn speech(count: usize) -> Vec<AudioFrame> {
    vec![loud_frame(); count]
}

/// `count` silent frames
#[must_use]
pub fn silence(count: usize) -> Vec<AudioFrame> {
    vec![silent_frame(); count]
}

/// Enough voiced audio to fill the wake window, heard as the wake phrase
#[must_use]
pub fn wake() -> Vec<AudioFrame> {
    speech(2)
}

/// Wake phrase, `speech_frames` of speech, then a full second of silence
#[must_use]
pub fn utterance(speech_frames: usize) -> Vec<AudioFrame> {
    let mut frames = wake();
    frames.extend(speech(speech_frames));
    frames.extend(silence(10));
    frames
}

/// Shared handle onto a [`ScriptedCapture`]
#[derive(Default)]
pub struct CaptureControl {
    queue: std::sync::Mutex<Option<Arc<FrameQueue>>>,
    connected: AtomicBool,
    failing_opens: AtomicU32,
    opens: AtomicU32,
}

impl CaptureControl {
    /// Push frames as if the device had captured them
    pub fn feed(&self, frames: Vec<AudioFrame>) {
        let queue = self
            .queue
            .lock()
            .unwrap()
            .clone()
            .expect("capture was never opened");
        for frame in frames {
            queue.push(frame);
        }
    }

    /// Simulate the device going away
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Make the next `count` opens fail
    pub fn fail_next_opens(&self, count: u32) {
        self.failing_opens.store(count, Ordering::SeqCst);
    }

    #[must_use]
    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Capture device driven by the test instead of a microphone
pub struct ScriptedCapture {
    control: Arc<CaptureControl>,
}

impl ScriptedCapture {
    #[must_use]
    pub fn new(control: Arc<CaptureControl>) -> Self {
        Self { control }
    }
}

impl CaptureDevice for ScriptedCapture {
    fn open(&mut self, queue: Arc<FrameQueue>) -> Result<(), DeviceError> {
        self.control.opens.fetch_add(1, Ordering::SeqCst);
        let failing = self.control.failing_opens.load(Ordering::SeqCst);
        if failing > 0 {
            self.control.failing_opens.store(failing - 1, Ordering::SeqCst);
            return Err(DeviceError::Unavailable("scripted failure".to_string()));
        }
        *self.control.queue.lock().unwrap() = Some(queue);
        self.control.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) {
        self.control.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.control.is_connected()
    }

    fn name(&self) -> String {
        "scripted".to_string()
    }
}

/// What the stub stages saw
#[derive(Default)]
pub struct Probe {
    pub wake_checks: AtomicUsize,
    pub wake_windows: Mutex<Vec<usize>>,
    pub transcriptions: AtomicUsize,
    pub utterance_samples: Mutex<Vec<usize>>,
    pub utterance_completions: Mutex<Vec<Completion>>,
    pub completions: AtomicUsize,
    pub prompts: Mutex<Vec<String>>,
    pub synthesized: Mutex<Vec<String>>,
    pub played: Mutex<Vec<PcmAudio>>,
}

impl Probe {
    pub fn wake_checks(&self) -> usize {
        self.wake_checks.load(Ordering::SeqCst)
    }

    pub fn transcriptions(&self) -> usize {
        self.transcriptions.load(Ordering::SeqCst)
    }

    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }

    pub async fn synthesized(&self) -> Vec<String> {
        self.synthesized.lock().await.clone()
    }

    pub async fn played(&self) -> Vec<PcmAudio> {
        self.played.lock().await.clone()
    }

    pub async fn utterance_samples(&self) -> Vec<usize> {
        self.utterance_samples.lock().await.clone()
    }

    pub async fn utterance_completions(&self) -> Vec<Completion> {
        self.utterance_completions.lock().await.clone()
    }

    pub async fn wake_windows(&self) -> Vec<usize> {
        self.wake_windows.lock().await.clone()
    }
}

pub struct StubTranscriber {
    reply: Result<String, TranscriptionError>,
    delay: Duration,
    probe: Arc<Probe>,
}

impl StubTranscriber {
    pub fn new(reply: Result<String, TranscriptionError>, delay: Duration, probe: Arc<Probe>) -> Self {
        Self { reply, delay, probe }
    }
}

#[async_trait]
impl Transcriber for StubTranscriber {
    async fn transcribe(&self, utterance: Utterance) -> Result<String, TranscriptionError> {
        self.probe.transcriptions.fetch_add(1, Ordering::SeqCst);
        self.probe
            .utterance_samples
            .lock()
            .await
            .push(utterance.samples().len());
        self.probe
            .utterance_completions
            .lock()
            .await
            .push(utterance.completion());
        tokio::time::sleep(self.delay).await;
        self.reply.clone()
    }
}

/// Transcribes every wake trigger window to the same text
pub struct StubWakeTranscriber {
    reply: Result<String, TranscriptionError>,
    probe: Arc<Probe>,
}

impl StubWakeTranscriber {
    pub fn new(reply: Result<String, TranscriptionError>, probe: Arc<Probe>) -> Self {
        Self { reply, probe }
    }
}

#[async_trait]
impl Transcriber for StubWakeTranscriber {
    async fn transcribe(&self, window: Utterance) -> Result<String, TranscriptionError> {
        self.probe.wake_checks.fetch_add(1, Ordering::SeqCst);
        self.probe.wake_windows.lock().await.push(window.samples().len());
        self.reply.clone()
    }
}

/// Inference engine with a canned completion
pub struct StubEngine {
    reply: Result<String, PlanError>,
    delay: Duration,
    probe: Arc<Probe>,
}

impl StubEngine {
    pub fn new(reply: Result<String, PlanError>, delay: Duration, probe: Arc<Probe>) -> Self {
        Self { reply, delay, probe }
    }
}

#[async_trait]
impl InferenceEngine for StubEngine {
    async fn complete(&self, request: CompletionRequest) -> Result<String, PlanError> {
        self.probe.completions.fetch_add(1, Ordering::SeqCst);
        self.probe.prompts.lock().await.push(request.prompt);
        tokio::time::sleep(self.delay).await;
        self.reply.clone()
    }
}

/// Synthesizer that returns `reply_ms` of tone per reply
pub struct StubSynthesizer {
    fail: bool,
    reply_ms: u64,
    probe: Arc<Probe>,
}

impl StubSynthesizer {
    pub fn new(fail: bool, reply_ms: u64, probe: Arc<Probe>) -> Self {
        Self { fail, reply_ms, probe }
    }
}

#[async_trait]
impl Synthesizer for StubSynthesizer {
    #[allow(clippy::cast_precision_loss)]
    async fn synthesize(&self, text: String) -> Result<PcmAudio, SynthesisError> {
        self.probe.synthesized.lock().await.push(text);
        if self.fail {
            return Err(SynthesisError::EngineFailure("voice model missing".to_string()));
        }
        let samples = tone(330.0, self.reply_ms as f32 / 1000.0, 0.3, SAMPLE_RATE);
        Ok(PcmAudio::new(samples, SAMPLE_RATE))
    }
}

/// Playback that takes as long as the clip, then records it
pub struct StubPlayback {
    realtime: bool,
    fail: bool,
    probe: Arc<Probe>,
}

impl StubPlayback {
    pub fn new(realtime: bool, fail: bool, probe: Arc<Probe>) -> Self {
        Self { realtime, fail, probe }
    }
}

#[async_trait]
impl PlaybackDevice for StubPlayback {
    async fn accept(&self, audio: PcmAudio) -> Result<(), DeviceError> {
        if self.fail {
            return Err(DeviceError::Playback("no output device".to_string()));
        }
        if self.realtime {
            tokio::time::sleep(audio.duration()).await;
        }
        self.probe.played.lock().await.push(audio);
        Ok(())
    }
}

/// Knobs for the stub pipeline
pub struct Script {
    /// What the wake trigger window transcribes to
    pub wake_transcript: Result<String, TranscriptionError>,
    pub transcript: Result<String, TranscriptionError>,
    pub transcribe_delay: Duration,
    /// `None` uses the built-in rules
    pub completion: Option<Result<String, PlanError>>,
    pub completion_delay: Duration,
    pub synthesis_fails: bool,
    pub reply_ms: u64,
    pub realtime_playback: bool,
    pub playback_fails: bool,
    pub retriever: Option<Box<dyn Retriever>>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            wake_transcript: Ok("Hey Dia".to_string()),
            transcript: Ok("hello there".to_string()),
            transcribe_delay: Duration::ZERO,
            completion: None,
            completion_delay: Duration::ZERO,
            synthesis_fails: false,
            reply_ms: 50,
            realtime_playback: false,
            playback_fails: false,
            retriever: None,
        }
    }
}

impl Script {
    /// Build the pipeline, wiring every stub to `probe`
    pub fn build(self, config: &Config, control: &Arc<CaptureControl>, probe: &Arc<Probe>) -> Pipeline {
        let planner = match self.completion {
            None => ResponsePlanner::Rules(RulesPlanner::new(
                default_rules(),
                &config.response_generator.fallback_reply,
            )),
            Some(reply) => ResponsePlanner::Llm(LlmPlanner::new(
                Box::new(StubEngine::new(reply, self.completion_delay, Arc::clone(probe))),
                &config.response_generator,
            )),
        };

        Pipeline {
            capture: Box::new(ScriptedCapture::new(Arc::clone(control))),
            keyword_model: Box::new(EnergyKeywordModel::new(config.wake_word.energy_floor)),
            wake_spotter: PhraseSpotter::new(
                &config.wake_word.phrases,
                Box::new(StubWakeTranscriber::new(self.wake_transcript, Arc::clone(probe))),
            ),
            stages: Stages {
                transcriber: Box::new(StubTranscriber::new(
                    self.transcript,
                    self.transcribe_delay,
                    Arc::clone(probe),
                )),
                planner,
                synthesizer: Box::new(StubSynthesizer::new(
                    self.synthesis_fails,
                    self.reply_ms,
                    Arc::clone(probe),
                )),
                playback: Box::new(StubPlayback::new(
                    self.realtime_playback,
                    self.playback_fails,
                    Arc::clone(probe),
                )),
                retriever: self.retriever,
            },
        }
    }
}

/// Builds stub pipelines for the supervisor
#[derive(Clone, Default)]
pub struct StubFactory {
    pub control: Arc<CaptureControl>,
    pub probe: Arc<Probe>,
    pub builds: Arc<AtomicUsize>,
}

impl StubFactory {
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

impl PipelineFactory for StubFactory {
    fn build(&self, config: &Config) -> dia_assistant::Result<Pipeline> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok(Script::default().build(config, &self.control, &self.probe))
    }
}

/// A running coordinator and the handles tests drive it with
pub struct Harness {
    pub control: Arc<CaptureControl>,
    pub probe: Arc<Probe>,
    pub stats: Arc<PipelineStats>,
    pub queue: Arc<FrameQueue>,
    pub state: watch::Receiver<SessionState>,
    pub reports: mpsc::UnboundedReceiver<SessionReport>,
    pub sensitivity: watch::Sender<f32>,
    pub stop: watch::Sender<bool>,
    pub task: JoinHandle<dia_assistant::Result<()>>,
}

impl Harness {
    /// Start a coordinator over the stub pipeline
    pub async fn start(config: Config, script: Script) -> Self {
        Self::start_with_error_clip(config, script, PcmAudio::new(vec![0; 800], SAMPLE_RATE)).await
    }

    pub async fn start_with_error_clip(config: Config, script: Script, error_clip: PcmAudio) -> Self {
        let control = Arc::new(CaptureControl::default());
        let probe = Arc::new(Probe::default());
        let pipeline = script.build(&config, &control, &probe);
        let (sensitivity, sensitivity_rx) = watch::channel(config.wake_word.sensitivity);
        let backoff = Backoff::from_config(&config.audio);

        let mut coordinator = SessionCoordinator::new(Arc::new(config), pipeline, sensitivity_rx)
            .with_error_clip(error_clip)
            .with_backoff(backoff);
        coordinator.open().await.expect("scripted capture opens");
        let reports = coordinator.subscribe_reports();
        let state = coordinator.state();
        let stats = coordinator.stats();
        let queue = coordinator.queue();

        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::spawn(coordinator.run(stop_rx));

        Self {
            control,
            probe,
            stats,
            queue,
            state,
            reports,
            sensitivity,
            stop,
            task,
        }
    }

    /// Next finished session
    pub async fn next_report(&mut self) -> SessionReport {
        tokio::time::timeout(PATIENCE, self.reports.recv())
            .await
            .expect("timed out waiting for a session report")
            .expect("coordinator dropped the report channel")
    }

    /// Wait until the coordinator reaches `state`
    pub async fn wait_for_state(&mut self, state: SessionState) {
        tokio::time::timeout(PATIENCE, self.state.wait_for(|&s| s == state))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {state}"))
            .expect("coordinator dropped the state channel");
    }

    /// Stop the coordinator and wait for it to exit
    pub async fn shutdown(self) -> Arc<Probe> {
        self.stop.send_replace(true);
        tokio::time::timeout(PATIENCE, self.task)
            .await
            .expect("coordinator did not stop")
            .expect("coordinator task panicked")
            .expect("coordinator returned an error");
        self.probe
    }
}

/// Counter value
#[must_use]
pub fn count(counter: &std::sync::atomic::AtomicU64) -> u64 {
    counter.load(Ordering::SeqCst)
}
