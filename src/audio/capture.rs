//! Real audio capture using CPAL (Cross-Platform Audio Library).
//!
//! Delivers mono `f32` frames at the configured sample rate to a callback
//! running on the driver's realtime thread. Channel reduction (single
//! channel extraction or averaging) happens in the callback using a
//! preallocated scratch buffer so the fast path does not allocate.

use crate::config::AudioConfig;
use crate::error::{Result, VoxdError};
use crate::sys::with_suppressed_stderr;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Frame callback: `(samples, sample_rate, timestamp)`.
///
/// Invoked once per driver buffer on the driver's realtime thread. The
/// sample slice is mono, normalized to [-1, 1], and only valid for the
/// duration of the call.
pub type FrameCallback = Box<dyn FnMut(&[f32], u32, Instant) + Send>;

/// Error callback invoked when the stream fails mid-run (device unplugged,
/// backend died). The pipeline reacts by pausing, not by exiting.
pub type StreamErrorCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Wrapper for cpal::Stream to make it Send.
///
/// SAFETY: The stream is only accessed from a single thread at a time
/// through the Mutex wrapper in CpalAudioSource. Stream methods are called
/// synchronously and don't cross thread boundaries unsafely.
struct SendableStream(cpal::Stream);

// SAFETY: see SendableStream docs.
unsafe impl Send for SendableStream {}

/// Audio source backed by a CPAL input stream.
pub struct CpalAudioSource {
    device: cpal::Device,
    device_label: String,
    stream: Mutex<Option<SendableStream>>,
    config: AudioConfig,
    native_channels: u16,
}

impl CpalAudioSource {
    /// Open the capture device described by `config`.
    ///
    /// An empty `device_name` selects the default input device; otherwise
    /// the first enumerated input device whose name contains the configured
    /// string wins.
    pub fn open(config: &AudioConfig) -> Result<Self> {
        let device = with_suppressed_stderr(|| find_input_device(&config.device_name))?;
        let device_label = device
            .name()
            .unwrap_or_else(|_| "<unnamed device>".to_string());

        // The native channel count decides how many channels we ask the
        // driver for when extracting a single channel.
        let native_channels = with_suppressed_stderr(|| device.default_input_config())
            .map(|c| c.channels())
            .unwrap_or(config.channels.max(1));

        Ok(Self {
            device,
            device_label,
            stream: Mutex::new(None),
            config: config.clone(),
            native_channels,
        })
    }

    /// Human-readable name of the opened device.
    pub fn device_name(&self) -> &str {
        &self.device_label
    }

    /// Channel count the stream will be captured with.
    pub fn capture_channels(&self) -> u16 {
        if self.config.force_single_channel {
            self.native_channels
        } else {
            self.config.channels.max(1)
        }
    }

    /// Start capturing; `on_frame` receives mono frames until `stop`.
    ///
    /// The requested buffer size is best effort: if the driver rejects a
    /// fixed-size stream the device default is used instead. Returns
    /// `AudioFormatRejected` if the device refuses both.
    pub fn start(&self, on_frame: FrameCallback, on_error: StreamErrorCallback) -> Result<()> {
        let mut guard = self.stream.lock().map_err(|e| VoxdError::AudioCapture {
            message: format!("stream lock poisoned: {}", e),
        })?;
        if guard.is_some() {
            return Ok(()); // Already started
        }

        let channels = self.capture_channels();
        let sample_rate = self.config.sample_rate;
        let frames_per_buffer = self.config.buffer_size_ms * sample_rate / 1000;

        // The data callback is consumed by each build attempt, so it is
        // shared behind a mutex only the driver thread ever locks.
        let shared_frame_cb: Arc<Mutex<FrameCallback>> = Arc::new(Mutex::new(on_frame));

        let fixed = cpal::StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Fixed(frames_per_buffer),
        };
        let fallback = cpal::StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let stream = self
            .build_stream(&fixed, &shared_frame_cb, &on_error)
            .or_else(|_| self.build_stream(&fallback, &shared_frame_cb, &on_error))
            .map_err(|e| VoxdError::AudioFormatRejected {
                message: format!(
                    "device '{}' rejected f32/{}Hz/{}ch: {}",
                    self.device_label, sample_rate, channels, e
                ),
            })?;

        stream.play().map_err(|e| VoxdError::AudioCapture {
            message: format!("failed to start audio stream: {}", e),
        })?;

        *guard = Some(SendableStream(stream));
        Ok(())
    }

    /// Stop capturing and drop the stream. Idempotent.
    pub fn stop(&self) -> Result<()> {
        let mut guard = self.stream.lock().map_err(|e| VoxdError::AudioCapture {
            message: format!("stream lock poisoned: {}", e),
        })?;
        if let Some(stream) = guard.take() {
            stream.0.pause().map_err(|e| VoxdError::AudioCapture {
                message: format!("failed to stop audio stream: {}", e),
            })?;
        }
        Ok(())
    }

    /// Whether a stream is currently running.
    pub fn is_running(&self) -> bool {
        self.stream.lock().map(|g| g.is_some()).unwrap_or(false)
    }

    fn build_stream(
        &self,
        stream_config: &cpal::StreamConfig,
        shared_frame_cb: &Arc<Mutex<FrameCallback>>,
        on_error: &StreamErrorCallback,
    ) -> std::result::Result<cpal::Stream, cpal::BuildStreamError> {
        let sample_rate = stream_config.sample_rate.0;
        let frames_per_buffer =
            (self.config.buffer_size_ms * self.config.sample_rate / 1000).max(256) as usize;
        let mut reducer = ChannelReducer::new(
            stream_config.channels,
            self.config.force_single_channel,
            self.config.input_channel_index,
            frames_per_buffer,
        );
        let frame_cb = Arc::clone(shared_frame_cb);
        let error_cb = Arc::clone(on_error);

        self.device.build_input_stream(
            stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let timestamp = Instant::now();
                let mono = reducer.reduce(data);
                // Only the driver thread locks this; never contended.
                if let Ok(mut cb) = frame_cb.lock() {
                    cb(mono, sample_rate, timestamp);
                }
            },
            move |err| error_cb(format!("audio stream error: {}", err)),
            None,
        )
    }
}

/// Find an input device, by substring match or default.
fn find_input_device(device_name: &str) -> Result<cpal::Device> {
    let host = cpal::default_host();

    if device_name.is_empty() {
        return host
            .default_input_device()
            .ok_or_else(|| VoxdError::AudioDeviceNotFound {
                device: "default".to_string(),
            });
    }

    let devices = host.input_devices().map_err(|e| VoxdError::AudioCapture {
        message: format!("failed to enumerate input devices: {}", e),
    })?;

    for device in devices {
        if let Ok(name) = device.name()
            && name.contains(device_name)
        {
            return Ok(device);
        }
    }

    Err(VoxdError::AudioDeviceNotFound {
        device: device_name.to_string(),
    })
}

/// List the names of all available audio input devices.
pub fn list_input_devices() -> Result<Vec<String>> {
    with_suppressed_stderr(|| {
        let host = cpal::default_host();
        let devices = host.input_devices().map_err(|e| VoxdError::AudioCapture {
            message: format!("failed to enumerate input devices: {}", e),
        })?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    })
}

/// Reduces interleaved multi-channel input to mono.
///
/// Owns a scratch buffer sized for one driver buffer so the realtime
/// callback never allocates in steady state.
struct ChannelReducer {
    channels: usize,
    force_single_channel: bool,
    channel_index: usize,
    scratch: Vec<f32>,
    warned_bad_index: bool,
}

impl ChannelReducer {
    fn new(
        channels: u16,
        force_single_channel: bool,
        channel_index: u16,
        frames_per_buffer: usize,
    ) -> Self {
        Self {
            channels: channels.max(1) as usize,
            force_single_channel,
            channel_index: channel_index as usize,
            scratch: Vec::with_capacity(frames_per_buffer.max(256)),
            warned_bad_index: false,
        }
    }

    /// Returns a mono view of `data`. Borrows either the input (already
    /// mono) or the internal scratch buffer.
    fn reduce<'a>(&'a mut self, data: &'a [f32]) -> &'a [f32] {
        if self.channels == 1 {
            return data;
        }

        self.scratch.clear();
        if self.force_single_channel {
            let mut index = self.channel_index;
            if index >= self.channels {
                if !self.warned_bad_index {
                    self.warned_bad_index = true;
                    eprintln!(
                        "voxd: input channel {} not available ({} channels), using channel 0",
                        index, self.channels
                    );
                }
                index = 0;
            }
            extract_channel(data, self.channels, index, &mut self.scratch);
        } else {
            mix_to_mono(data, self.channels, &mut self.scratch);
        }
        &self.scratch
    }
}

/// Copy one channel out of an interleaved buffer.
fn extract_channel(data: &[f32], channels: usize, index: usize, out: &mut Vec<f32>) {
    out.extend(data.chunks_exact(channels).map(|frame| frame[index]));
}

/// Average all channels of an interleaved buffer into mono.
fn mix_to_mono(data: &[f32], channels: usize, out: &mut Vec<f32>) {
    out.extend(
        data.chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32),
    );
}
