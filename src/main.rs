use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use dia_assistant::config::load_config_file;
use dia_assistant::planner::ResponsePlanner;
use dia_assistant::rag::{DocumentStore, Retriever, SqliteRetriever};
use dia_assistant::voice::{
    CaptureDevice, CommandSynthesizer, CpalCapture, CpalPlayback, FrameQueue, PcmAudio,
    PlaybackDevice, Synthesizer, list_devices, load_error_clip, rms_i16, tone,
};
use dia_assistant::{Config, ConfigSource, ControlHandle, DeviceFactory, Supervisor};

/// Dia - offline voice assistant
#[derive(Parser)]
#[command(name = "dia", version, about)]
struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long, env = "DIA_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the assistant (default)
    Run,
    /// Print the resolved configuration
    CheckConfig,
    /// List audio devices
    Devices,
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker {
        /// Play the session error clip instead of a tone
        #[arg(long)]
        error_clip: bool,
    },
    /// Speak text through the configured TTS engine
    Say {
        /// Text to speak
        #[arg(default_value = "Hello! This is a test of the text to speech system.")]
        text: String,
    },
    /// Print the planner's reply to typed text
    Ask {
        /// What the user said
        text: String,
    },
    /// Add a text file to the retrieval store
    AddDocument {
        /// Document title, defaults to the file name
        #[arg(short, long)]
        title: Option<String>,
        /// Plain text file
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // -v wins over RUST_LOG, which wins over logging.level
    let filter = match cli.verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            let level = load_config_file(cli.config.as_deref())
                .logging
                .level
                .unwrap_or_else(|| "info".to_string());
            EnvFilter::new(format!("info,dia_assistant={level},dia={level}"))
        }),
        1 => EnvFilter::new("info,dia_assistant=debug,dia=debug"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let path = cli.config.as_deref();
    match cli.command.unwrap_or(Command::Run) {
        Command::Run => serve(cli.config.clone()).await,
        Command::CheckConfig => check_config(path),
        Command::Devices => {
            devices();
            Ok(())
        }
        Command::TestMic { duration } => test_mic(path, duration).await,
        Command::TestSpeaker { error_clip } => test_speaker(path, error_clip).await,
        Command::Say { text } => say(path, &text).await,
        Command::Ask { text } => ask(path, &text).await,
        Command::AddDocument { title, file } => add_document(path, title, &file),
    }
}

/// Run the assistant until SIGINT or SIGTERM
async fn serve(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    tracing::info!(config = ?config_path, "starting dia");

    let (supervisor, handle) =
        Supervisor::new(ConfigSource::File(config_path.clone()), Box::new(DeviceFactory));
    let task = supervisor.spawn();

    handle.start().await?;
    tracing::info!("dia ready");

    wait_for_signals(&handle, config_path.as_deref()).await?;

    handle.stop().await?;
    drop(handle);
    task.await?;
    Ok(())
}

/// Map process signals to control commands until asked to exit
#[cfg(unix)]
async fn wait_for_signals(handle: &ControlHandle, config_path: Option<&Path>) -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    let mut status = signal(SignalKind::user_defined1())?;
    let mut restart = signal(SignalKind::user_defined2())?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received, stopping");
                return Ok(());
            }
            _ = terminate.recv() => {
                tracing::info!("terminate received, stopping");
                return Ok(());
            }
            _ = hangup.recv() => reload_sensitivity(handle, config_path).await,
            _ = status.recv() => {
                let report = handle.status().await?;
                tracing::info!(status = %serde_json::to_string(&report)?, "status");
            }
            _ = restart.recv() => {
                if let Err(e) = handle.restart().await {
                    tracing::error!(error = %e, "restart failed, coordinator stopped");
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signals(_handle: &ControlHandle, _config_path: Option<&Path>) -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received, stopping");
    Ok(())
}

/// Re-read the config file and apply only the wake sensitivity
#[cfg_attr(not(unix), allow(dead_code))]
async fn reload_sensitivity(handle: &ControlHandle, config_path: Option<&Path>) {
    let result = match Config::reload_sensitivity(config_path) {
        Ok(value) => handle.set_sensitivity(value).await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        tracing::warn!(error = %e, "sensitivity reload failed, keeping current value");
    }
}

/// Print the resolved configuration as YAML
fn check_config(path: Option<&Path>) -> anyhow::Result<()> {
    let config = Config::load(path)?;
    print!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}

fn devices() {
    let (inputs, outputs) = list_devices();
    println!("Input devices:");
    for name in &inputs {
        println!("  {name}");
    }
    println!("Output devices:");
    for name in &outputs {
        println!("  {name}");
    }
    if inputs.is_empty() && outputs.is_empty() {
        println!("  (none found)");
    }
}

/// Show a live level meter from the configured microphone
async fn test_mic(path: Option<&Path>, duration: u64) -> anyhow::Result<()> {
    let config = Config::load(path)?;
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let queue = FrameQueue::new(config.queue_frames());
    let mut capture = CpalCapture::new(&config.audio);
    capture.open(queue.clone())?;

    println!("Device: {}", capture.name());
    println!("Sample rate: {} Hz", config.audio.sample_rate);
    println!("---");

    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let mut samples = Vec::new();
        while let Some(frame) = queue.try_pop() {
            samples.extend_from_slice(frame.samples());
        }
        let energy = rms_i16(&samples);
        let peak = samples
            .iter()
            .map(|&s| f32::from(s).abs() / 32768.0)
            .fold(0.0_f32, f32::max);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (energy * 100.0).min(50.0) as usize;
        let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!(
            "[{:2}s] RMS: {:.4} | Peak: {:.4} | [{}]{}",
            i + 1,
            energy,
            peak,
            meter,
            if capture.is_connected() { "" } else { " (disconnected)" }
        );
    }

    capture.close();
    println!("\n---");
    println!("Dropped frames: {}", queue.dropped());
    println!("If RMS stayed near 0, check the input device and its levels.");
    Ok(())
}

/// Play a tone or the error clip on the configured output
async fn test_speaker(path: Option<&Path>, error_clip: bool) -> anyhow::Result<()> {
    let config = Config::load(path)?;
    let rate = config.audio.sample_rate;
    let clip = if error_clip {
        println!("Playing the session error clip...");
        load_error_clip(config.audio.error_sound_path.as_deref(), rate)
    } else {
        println!("You should hear a 440Hz tone for 2 seconds");
        PcmAudio::new(tone(440.0, 2.0, 0.3, rate), rate)
    };

    CpalPlayback::new(&config.audio).accept(clip).await?;
    println!("\nIf you heard it, your speakers are working!");
    Ok(())
}

/// Synthesize and play `text`
async fn say(path: Option<&Path>, text: &str) -> anyhow::Result<()> {
    let config = Config::load(path)?;
    let synthesizer = CommandSynthesizer::new(&config.tts);

    println!("Synthesizing speech...");
    let audio = tokio::time::timeout(
        config.timeouts.synthesis(),
        synthesizer.synthesize(text.to_string()),
    )
    .await
    .map_err(|_| anyhow::anyhow!("synthesis timed out"))??;
    println!(
        "Got {} ms of audio at {} Hz",
        audio.duration().as_millis(),
        audio.sample_rate
    );

    CpalPlayback::new(&config.audio).accept(audio).await?;
    Ok(())
}

/// Plan a reply for typed text, with retrieval when enabled
async fn ask(path: Option<&Path>, text: &str) -> anyhow::Result<()> {
    let config = Config::load(path)?;
    let planner = ResponsePlanner::from_config(&config.response_generator);

    let context = if config.rag.enabled && planner.wants_context() {
        let retriever = SqliteRetriever::open(&config.rag.database_path)?;
        let snippets = retriever.search(text, config.rag.top_k).await?;
        for snippet in &snippets {
            println!("[context {:.2}] {}", snippet.score, snippet.title);
        }
        Some(snippets)
    } else {
        None
    };

    let reply = tokio::time::timeout(
        config.timeouts.planning(),
        planner.plan(text, context.as_deref()),
    )
    .await
    .map_err(|_| anyhow::anyhow!("planning timed out"))??;
    println!("{reply}");
    Ok(())
}

/// Seed the retrieval store from a text file
fn add_document(path: Option<&Path>, title: Option<String>, file: &Path) -> anyhow::Result<()> {
    let config = Config::load(path)?;
    let content = std::fs::read_to_string(file)?;
    let title = title.unwrap_or_else(|| {
        file.file_stem()
            .map_or_else(|| "untitled".to_string(), |s| s.to_string_lossy().into_owned())
    });

    let store = DocumentStore::open(&config.rag.database_path)?;
    let id = store.add_document(&title, &content)?;
    println!(
        "Added \"{title}\" as document {id} ({} documents in {})",
        store.document_count()?,
        config.rag.database_path.display()
    );
    Ok(())
}
