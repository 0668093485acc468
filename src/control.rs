//! Control interface
//!
//! A [`Supervisor`] owns the coordinator's lifecycle and accepts
//! [`ControlCommand`]s over a channel. Process signals, tests and any other
//! front end talk to it through a cloneable [`ControlHandle`].

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::coordinator::{Pipeline, SessionCoordinator};
use crate::session::SessionState;
use crate::stats::{PipelineStats, StatsSnapshot};
use crate::voice::FrameQueue;
use crate::{Config, Error, Result};

/// Control channel depth
const COMMAND_BUFFER: usize = 16;

/// Requests handled by the [`Supervisor`]
#[derive(Debug)]
pub enum ControlCommand {
    /// Load config, open devices and begin listening
    Start(oneshot::Sender<Result<()>>),
    /// Finish or abandon the current session and close devices
    Stop(oneshot::Sender<()>),
    /// Stop, re-read configuration, start
    Restart(oneshot::Sender<Result<()>>),
    /// Report lifecycle, state and counters
    Status(oneshot::Sender<StatusReport>),
    /// Apply a new wake sensitivity without restarting
    SetSensitivity(f32, oneshot::Sender<Result<()>>),
}

/// Whether a coordinator is running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Stopped,
    Running,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Running => write!(f, "running"),
        }
    }
}

/// Answer to [`ControlCommand::Status`]
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub lifecycle: Lifecycle,
    pub state: SessionState,
    pub sensitivity: f32,
    pub stats: StatsSnapshot,
}

/// Where the supervisor gets its configuration on each start
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// Read the file (or the default search path) on every start
    File(Option<PathBuf>),
    /// Use a fixed config
    Fixed(Config),
}

impl ConfigSource {
    fn load(&self) -> Result<Config> {
        match self {
            Self::File(path) => Config::load(path.as_deref()),
            Self::Fixed(config) => {
                config.validate()?;
                Ok(config.clone())
            }
        }
    }
}

/// Builds the devices and stages for a run
pub trait PipelineFactory: Send + Sync {
    /// Create a pipeline for `config`
    ///
    /// # Errors
    ///
    /// Returns error if a required component cannot be created
    fn build(&self, config: &Config) -> Result<Pipeline>;
}

/// Real audio devices and command-line engines
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceFactory;

impl PipelineFactory for DeviceFactory {
    fn build(&self, config: &Config) -> Result<Pipeline> {
        Ok(Pipeline::from_config(config))
    }
}

/// Sends commands to a [`Supervisor`]
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<ControlCommand>,
}

impl ControlHandle {
    /// Start the coordinator
    ///
    /// # Errors
    ///
    /// Returns the startup error, or `Error::Control` if the supervisor is gone
    pub async fn start(&self) -> Result<()> {
        self.request(ControlCommand::Start).await?
    }

    /// Stop the coordinator, waiting until it has shut down
    ///
    /// # Errors
    ///
    /// Returns `Error::Control` if the supervisor is gone
    pub async fn stop(&self) -> Result<()> {
        self.request(ControlCommand::Stop).await
    }

    /// Stop, reload configuration and start again
    ///
    /// # Errors
    ///
    /// Returns the startup error, or `Error::Control` if the supervisor is gone
    pub async fn restart(&self) -> Result<()> {
        self.request(ControlCommand::Restart).await?
    }

    /// Current status
    ///
    /// # Errors
    ///
    /// Returns `Error::Control` if the supervisor is gone
    pub async fn status(&self) -> Result<StatusReport> {
        self.request(ControlCommand::Status).await
    }

    /// Change the wake sensitivity of the running and future coordinators
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if out of range, or `Error::Control` if the
    /// supervisor is gone
    pub async fn set_sensitivity(&self, sensitivity: f32) -> Result<()> {
        self.request(|reply| ControlCommand::SetSensitivity(sensitivity, reply))
            .await?
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> ControlCommand,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(command(reply_tx))
            .await
            .map_err(|_| Error::Control("supervisor is not running".to_string()))?;
        reply_rx
            .await
            .map_err(|_| Error::Control("supervisor dropped the request".to_string()))
    }
}

struct Running {
    stop: watch::Sender<bool>,
    handle: JoinHandle<Result<()>>,
    state: watch::Receiver<SessionState>,
    stats: Arc<PipelineStats>,
    queue: Arc<FrameQueue>,
}

/// Owns the coordinator across start, stop and restart
pub struct Supervisor {
    source: ConfigSource,
    factory: Box<dyn PipelineFactory>,
    sensitivity: watch::Sender<f32>,
    /// Set once the sensitivity came from config or a `SetSensitivity`
    sensitivity_pinned: bool,
    running: Option<Running>,
    last_stats: StatsSnapshot,
    commands: mpsc::Receiver<ControlCommand>,
}

impl Supervisor {
    /// Create a stopped supervisor and its handle
    #[must_use]
    pub fn new(source: ConfigSource, factory: Box<dyn PipelineFactory>) -> (Self, ControlHandle) {
        let (tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let initial = match &source {
            ConfigSource::Fixed(config) => config.wake_word.sensitivity,
            ConfigSource::File(_) => Config::default().wake_word.sensitivity,
        };
        let (sensitivity, _) = watch::channel(initial);
        let supervisor = Self {
            source,
            factory,
            sensitivity,
            sensitivity_pinned: false,
            running: None,
            last_stats: StatsSnapshot::default(),
            commands,
        };
        (supervisor, ControlHandle { tx })
    }

    /// Run on the tokio runtime until every handle is dropped
    #[must_use]
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Serve commands until every handle is dropped, then stop
    pub async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            match command {
                ControlCommand::Start(reply) => {
                    let _ = reply.send(self.start().await);
                }
                ControlCommand::Stop(reply) => {
                    self.stop().await;
                    let _ = reply.send(());
                }
                ControlCommand::Restart(reply) => {
                    tracing::info!("restarting coordinator");
                    self.stop().await;
                    let _ = reply.send(self.start().await);
                }
                ControlCommand::Status(reply) => {
                    let _ = reply.send(self.status());
                }
                ControlCommand::SetSensitivity(value, reply) => {
                    let _ = reply.send(self.set_sensitivity(value));
                }
            }
        }
        self.stop().await;
        tracing::debug!("supervisor stopped");
    }

    async fn start(&mut self) -> Result<()> {
        if self.is_running() {
            tracing::warn!("start requested but coordinator is already running");
            return Ok(());
        }
        // A coordinator that exited on its own is replaced
        self.running = None;

        let config = Arc::new(self.source.load()?);
        // Later starts keep whatever was applied while running
        if !self.sensitivity_pinned {
            self.sensitivity.send_replace(config.wake_word.sensitivity);
            self.sensitivity_pinned = true;
        }
        let pipeline = self.factory.build(&config)?;

        let mut coordinator =
            SessionCoordinator::new(Arc::clone(&config), pipeline, self.sensitivity.subscribe());
        coordinator.open().await?;

        let (stop, stop_rx) = watch::channel(false);
        let state = coordinator.state();
        let stats = coordinator.stats();
        let queue = coordinator.queue();
        let handle = tokio::spawn(coordinator.run(stop_rx));

        tracing::info!(
            engine = ?config.response_generator.engine_type,
            sensitivity = *self.sensitivity.borrow(),
            "coordinator started"
        );
        self.running = Some(Running {
            stop,
            handle,
            state,
            stats,
            queue,
        });
        Ok(())
    }

    async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.stop.send_replace(true);
        match running.handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "coordinator exited with error"),
            Err(e) => tracing::error!(error = %e, "coordinator task failed"),
        }
        self.last_stats = running.stats.snapshot(running.queue.dropped());
        tracing::info!("coordinator stopped");
    }

    fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    fn status(&self) -> StatusReport {
        let (state, stats) = match &self.running {
            Some(running) => (
                *running.state.borrow(),
                running.stats.snapshot(running.queue.dropped()),
            ),
            None => (SessionState::Idle, self.last_stats.clone()),
        };
        StatusReport {
            lifecycle: if self.is_running() {
                Lifecycle::Running
            } else {
                Lifecycle::Stopped
            },
            state,
            sensitivity: *self.sensitivity.borrow(),
            stats,
        }
    }

    fn set_sensitivity(&mut self, value: f32) -> Result<()> {
        if !(0.0..=1.0).contains(&value) {
            return Err(Error::Config(format!(
                "wake_word.sensitivity must be within 0.0..=1.0, got {value}"
            )));
        }
        let previous = self.sensitivity.send_replace(value);
        self.sensitivity_pinned = true;
        tracing::info!(previous, sensitivity = value, "wake sensitivity updated");
        Ok(())
    }
}
