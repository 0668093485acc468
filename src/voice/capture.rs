//! Audio capture from microphone
//!
//! The cpal stream lives on its own thread because streams are not `Send`.
//! Captured samples are assembled into fixed-size frames and pushed into a
//! shared [`FrameQueue`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Host, SampleFormat, SampleRate, StreamConfig};

use super::{FrameAssembler, FrameQueue};
use crate::config::AudioConfig;
use crate::error::DeviceError;

/// Source of captured frames
///
/// `open` starts delivering frames into the queue; reopening after a
/// disconnect restarts delivery into the same queue.
pub trait CaptureDevice: Send + Sync {
    /// Start capturing into `queue`
    ///
    /// # Errors
    ///
    /// Returns `DeviceError` if no usable input device can be opened
    fn open(&mut self, queue: Arc<FrameQueue>) -> Result<(), DeviceError>;

    /// Stop capturing and release the device
    fn close(&mut self);

    /// Whether the stream is open and has not reported an error
    fn is_connected(&self) -> bool;

    /// Human-readable device name
    fn name(&self) -> String;
}

struct CaptureThread {
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Captures audio from a cpal input device
pub struct CpalCapture {
    device_name: Option<String>,
    sample_rate: u32,
    channels: u16,
    chunk_size: usize,
    connected: Arc<AtomicBool>,
    resolved_name: String,
    thread: Option<CaptureThread>,
}

impl CpalCapture {
    /// Create a capture device from config, opened later with [`CaptureDevice::open`]
    #[must_use]
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            device_name: config.input_device_name.clone(),
            sample_rate: config.sample_rate,
            channels: config.channels,
            chunk_size: config.chunk_size,
            connected: Arc::new(AtomicBool::new(false)),
            resolved_name: String::new(),
            thread: None,
        }
    }
}

impl CaptureDevice for CpalCapture {
    fn open(&mut self, queue: Arc<FrameQueue>) -> Result<(), DeviceError> {
        if self.thread.is_some() {
            self.close();
        }

        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<String, DeviceError>>(1);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let connected = Arc::clone(&self.connected);
        let device_name = self.device_name.clone();
        let sample_rate = self.sample_rate;
        let channels = self.channels;
        let chunk_size = self.chunk_size;

        let handle = std::thread::Builder::new()
            .name("dia-capture".to_string())
            .spawn(move || {
                let (stream, name) = match build_stream(
                    device_name.as_deref(),
                    sample_rate,
                    channels,
                    chunk_size,
                    &queue,
                    &connected,
                ) {
                    Ok(pair) => pair,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(DeviceError::Stream(e.to_string())));
                    return;
                }
                connected.store(true, Ordering::Release);
                let _ = ready_tx.send(Ok(name));

                // Hold the stream until asked to stop
                let _ = stop_rx.recv();
                connected.store(false, Ordering::Release);
                drop(stream);
            })
            .map_err(|e| DeviceError::Stream(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(name)) => {
                tracing::info!(device = %name, sample_rate, chunk_size, "audio capture started");
                self.resolved_name = name;
                self.thread = Some(CaptureThread { stop_tx, handle });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(DeviceError::Stream("capture thread exited".to_string()))
            }
        }
    }

    fn close(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.stop_tx.send(());
            let _ = thread.handle.join();
            tracing::debug!(device = %self.resolved_name, "audio capture stopped");
        }
        self.connected.store(false, Ordering::Release);
    }

    fn is_connected(&self) -> bool {
        self.thread.is_some() && self.connected.load(Ordering::Acquire)
    }

    fn name(&self) -> String {
        if self.resolved_name.is_empty() {
            self.device_name.clone().unwrap_or_else(|| "default".to_string())
        } else {
            self.resolved_name.clone()
        }
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.close();
    }
}

fn build_stream(
    device_name: Option<&str>,
    sample_rate: u32,
    channels: u16,
    chunk_size: usize,
    queue: &Arc<FrameQueue>,
    connected: &Arc<AtomicBool>,
) -> Result<(cpal::Stream, String), DeviceError> {
    let host = cpal::default_host();
    let device = find_input_device(&host, device_name)?;
    let name = device.name().unwrap_or_else(|_| "unknown".to_string());

    let supported = device
        .supported_input_configs()
        .map_err(|e| DeviceError::Unavailable(e.to_string()))?
        .filter(|c| {
            c.min_sample_rate() <= SampleRate(sample_rate)
                && c.max_sample_rate() >= SampleRate(sample_rate)
                && matches!(c.sample_format(), SampleFormat::F32 | SampleFormat::I16)
        })
        .min_by_key(|c| (c.channels() != channels, c.channels()))
        .ok_or_else(|| {
            DeviceError::Unavailable(format!("{name}: no input config at {sample_rate} Hz"))
        })?;

    let format = supported.sample_format();
    let config: StreamConfig = supported.with_sample_rate(SampleRate(sample_rate)).config();

    tracing::debug!(
        device = %name,
        sample_rate,
        channels = config.channels,
        format = ?format,
        "audio capture initialized"
    );

    let mut assembler = FrameAssembler::new(chunk_size, usize::from(config.channels));
    let err_flag = Arc::clone(connected);
    let on_error = move |err: cpal::StreamError| {
        tracing::error!(error = %err, "audio capture error");
        err_flag.store(false, Ordering::Release);
    };

    let queue = Arc::clone(queue);
    let stream = match format {
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                assembler.push_i16(data, |frame| {
                    queue.push(frame);
                });
            },
            on_error,
            None,
        ),
        _ => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                assembler.push_f32(data, |frame| {
                    queue.push(frame);
                });
            },
            on_error,
            None,
        ),
    }
    .map_err(|e| DeviceError::Stream(e.to_string()))?;

    Ok((stream, name))
}

/// Find an input device whose name contains `name`, else the default
///
/// # Errors
///
/// Returns `DeviceError::Unavailable` if the host has no input device
pub fn find_input_device(host: &Host, name: Option<&str>) -> Result<Device, DeviceError> {
    if let Some(wanted) = name {
        let found = host
            .input_devices()
            .map_err(|e| DeviceError::Unavailable(e.to_string()))?
            .find(|d| d.name().is_ok_and(|n| n.contains(wanted)));
        if let Some(device) = found {
            return Ok(device);
        }
        tracing::warn!(device = wanted, "input device not found, using default");
    }
    host.default_input_device()
        .ok_or_else(|| DeviceError::Unavailable("no input device available".to_string()))
}

/// Names of the host's input and output devices
#[must_use]
pub fn list_devices() -> (Vec<String>, Vec<String>) {
    let host = cpal::default_host();
    let names = |devices: Option<Vec<Device>>| -> Vec<String> {
        devices
            .unwrap_or_default()
            .iter()
            .filter_map(|d| d.name().ok())
            .collect()
    };
    let inputs = names(host.input_devices().ok().map(Iterator::collect));
    let outputs = names(host.output_devices().ok().map(Iterator::collect));
    (inputs, outputs)
}
