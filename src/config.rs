//! Configuration loading, merging, and persistence.
//!
//! The config file is a UTF-8 JSON object with optional `stt` and `ipc`
//! sections. Every key has a documented default; unknown keys at any level
//! are preserved across a load → `set_config` → save round trip.

use crate::audio::vad::VadConfig;
use crate::defaults;
use crate::error::{Result, VoxdError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub stt: SttConfig,
    pub ipc: IpcConfig,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Speech-to-text configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SttConfig {
    pub model: ModelConfig,
    pub vad: VadSettings,
    pub audio: AudioConfig,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// ASR model configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    pub path: String,
    pub language: String,
    pub use_gpu: bool,
    pub n_threads: u32,
    pub beam_size: u32,
    pub temperature: f32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Voice activity detection settings as they appear on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VadSettings {
    pub energy_threshold: f32,
    pub speech_start_ms: u32,
    pub speech_end_ms: u32,
    pub min_speech_ms: u32,
    pub speech_start_threshold: f32,
    pub speech_end_threshold: f32,
    pub pre_speech_buffer_ms: u32,
    pub noise_floor_adaptation_rate: f32,
    pub use_adaptive_threshold: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Audio capture configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AudioConfig {
    /// Substring matched against enumerated input devices. Empty selects
    /// the default input device.
    pub device_name: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub buffer_size_ms: u32,
    /// Channel to deinterleave when `force_single_channel` is set.
    pub input_channel_index: u16,
    pub force_single_channel: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// IPC configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IpcConfig {
    pub socket_path: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: defaults::MODEL_PATH.to_string(),
            language: defaults::LANGUAGE.to_string(),
            use_gpu: true,
            n_threads: 4,
            beam_size: 5,
            temperature: 0.0,
            extra: Map::new(),
        }
    }
}

impl Default for VadSettings {
    fn default() -> Self {
        Self {
            energy_threshold: defaults::VAD_ENERGY_THRESHOLD,
            speech_start_ms: defaults::VAD_SPEECH_START_MS,
            speech_end_ms: defaults::VAD_SPEECH_END_MS,
            min_speech_ms: defaults::VAD_MIN_SPEECH_MS,
            speech_start_threshold: defaults::VAD_SPEECH_START_THRESHOLD,
            speech_end_threshold: defaults::VAD_SPEECH_END_THRESHOLD,
            pre_speech_buffer_ms: defaults::VAD_PRE_SPEECH_BUFFER_MS,
            noise_floor_adaptation_rate: defaults::VAD_NOISE_FLOOR_ADAPTATION_RATE,
            use_adaptive_threshold: true,
            extra: Map::new(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device_name: String::new(),
            sample_rate: defaults::SAMPLE_RATE,
            channels: 1,
            buffer_size_ms: defaults::BUFFER_SIZE_MS,
            input_channel_index: 0,
            force_single_channel: false,
            extra: Map::new(),
        }
    }
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            socket_path: defaults::SOCKET_PATH.to_string(),
            extra: Map::new(),
        }
    }
}

impl VadSettings {
    /// Builds the detector configuration for a given stream sample rate.
    pub fn to_vad_config(&self, sample_rate: u32) -> VadConfig {
        VadConfig {
            energy_threshold: self.energy_threshold,
            speech_start_threshold: self.speech_start_threshold,
            speech_end_threshold: self.speech_end_threshold,
            speech_start_ms: self.speech_start_ms,
            speech_end_ms: self.speech_end_ms,
            min_speech_ms: self.min_speech_ms,
            pre_speech_buffer_ms: self.pre_speech_buffer_ms,
            noise_floor_adaptation_rate: self.noise_floor_adaptation_rate,
            use_adaptive_threshold: self.use_adaptive_threshold,
            sample_rate,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file.
    ///
    /// Missing keys use default values. Invalid JSON is an error.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                VoxdError::ConfigFileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                VoxdError::Io(e)
            }
        })?;
        serde_json::from_str(&contents).map_err(|e| VoxdError::ConfigParse {
            message: format!("{}: {}", path.display(), e),
        })
    }

    /// Load configuration from a file, or return defaults if it is missing.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(VoxdError::ConfigFileNotFound { .. }) => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    /// Write the configuration as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Apply a partial snapshot on top of the current configuration.
    ///
    /// Objects merge recursively; any other value replaces the old one.
    /// Unknown keys in the patch are retained in the `extra` maps.
    pub fn merge_patch(&mut self, patch: &Value) -> Result<()> {
        let mut current = serde_json::to_value(&*self)?;
        merge_value(&mut current, patch);
        *self = serde_json::from_value(current).map_err(|e| VoxdError::ConfigParse {
            message: format!("invalid config patch: {}", e),
        })?;
        Ok(())
    }

    /// Apply environment variable overrides.
    ///
    /// Supported variables: `VOXD_MODEL`, `VOXD_LANGUAGE`,
    /// `VOXD_AUDIO_DEVICE`, `VOXD_SOCKET`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(model) = std::env::var("VOXD_MODEL")
            && !model.is_empty()
        {
            self.stt.model.path = model;
        }
        if let Ok(language) = std::env::var("VOXD_LANGUAGE")
            && !language.is_empty()
        {
            self.stt.model.language = language;
        }
        if let Ok(device) = std::env::var("VOXD_AUDIO_DEVICE")
            && !device.is_empty()
        {
            self.stt.audio.device_name = device;
        }
        if let Ok(socket) = std::env::var("VOXD_SOCKET")
            && !socket.is_empty()
        {
            self.ipc.socket_path = socket;
        }
        self
    }

    /// Default configuration file path: `~/.config/voxd/config.json`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("voxd").join("config.json"))
    }
}

/// Recursive JSON merge: objects merge key-by-key, everything else replaces.
fn merge_value(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                match target_map.get_mut(key) {
                    Some(existing) => merge_value(existing, patch_value),
                    None => {
                        target_map.insert(key.clone(), patch_value.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}
