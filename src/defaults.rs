//! Default configuration constants for voxd.
//!
//! Shared across the config types, the engine, and both binaries so the
//! documented defaults live in exactly one place.

/// Default audio sample rate in Hz.
///
/// 16kHz is the standard for speech recognition and what Whisper models
/// expect as input.
pub const SAMPLE_RATE: u32 = 16_000;

/// Default capture buffer size in milliseconds (best effort; the driver
/// may round to its own period size).
pub const BUFFER_SIZE_MS: u32 = 30;

/// Default Unix control socket path.
pub const SOCKET_PATH: &str = "/tmp/rt-stt.sock";

/// Default Whisper model path.
pub const MODEL_PATH: &str = "models/ggml-small.en.bin";

/// Default language code for transcription.
pub const LANGUAGE: &str = "en";

/// Language value that triggers automatic language detection.
pub const AUTO_LANGUAGE: &str = "auto";

/// Absolute RMS energy floor used when adaptive thresholding is off, and
/// the lower clamp (halved) for the adaptive noise floor.
pub const VAD_ENERGY_THRESHOLD: f32 = 0.001;

/// Multiplier over the noise floor above which a frame counts as speech.
pub const VAD_SPEECH_START_THRESHOLD: f32 = 1.08;

/// Multiplier over the noise floor below which a frame counts as silence.
pub const VAD_SPEECH_END_THRESHOLD: f32 = 0.85;

/// Sustained speech required before an utterance is considered started (ms).
pub const VAD_SPEECH_START_MS: u32 = 150;

/// Sustained silence required before an utterance is considered ended (ms).
pub const VAD_SPEECH_END_MS: u32 = 1000;

/// Minimum utterance duration; shorter candidates are discarded (ms).
pub const VAD_MIN_SPEECH_MS: u32 = 500;

/// Audio retained before speech onset so the first syllable is not clipped (ms).
pub const VAD_PRE_SPEECH_BUFFER_MS: u32 = 500;

/// Exponential smoothing rate for the adaptive noise floor.
pub const VAD_NOISE_FLOOR_ADAPTATION_RATE: f32 = 0.01;

/// Number of per-frame energies kept for the noise-floor percentile.
pub const VAD_ENERGY_HISTORY_LEN: usize = 100;

/// Bounded utterance queue capacity. When full, the oldest unprocessed
/// utterance is dropped in favor of fresher speech.
pub const UTTERANCE_QUEUE_CAPACITY: usize = 100;

/// Maximum length of a framed IPC message in bytes.
pub const MAX_MESSAGE_LEN: u32 = 1024 * 1024;

/// Interval between periodic status broadcasts (seconds).
pub const STATUS_INTERVAL_SECS: u64 = 30;

/// Report the GPU backend compiled into this build.
///
/// Returns a human-readable name based on the compile-time feature flags.
/// Only one GPU backend can be active at a time; if none is enabled,
/// returns "CPU".
pub fn gpu_backend() -> &'static str {
    if cfg!(feature = "cuda") {
        "CUDA"
    } else if cfg!(feature = "vulkan") {
        "Vulkan"
    } else if cfg!(feature = "hipblas") {
        "HipBLAS (AMD)"
    } else if cfg!(feature = "openblas") {
        "OpenBLAS"
    } else {
        "CPU"
    }
}
