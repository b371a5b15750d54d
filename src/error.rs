//! Error types for voxd.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoxdError {
    // Configuration errors
    #[error("Configuration file not found at {path}")]
    ConfigFileNotFound { path: String },

    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    // Audio capture errors
    #[error("Audio device not found: {device}")]
    AudioDeviceNotFound { device: String },

    #[error("Audio format rejected: {message}")]
    AudioFormatRejected { message: String },

    #[error("Audio capture failed: {message}")]
    AudioCapture { message: String },

    // Transcription errors
    #[error("Transcription model not found at {path}")]
    ModelNotFound { path: String },

    #[error("Failed to load transcription model: {message}")]
    ModelLoadFailed { message: String },

    #[error("Transcription failed: {message}")]
    Transcription { message: String },

    // IPC errors
    #[error("IPC socket error: {message}")]
    IpcSocket { message: String },

    #[error("IPC protocol error: {message}")]
    IpcProtocol { message: String },

    #[error("IPC connection failed: {message}")]
    IpcConnection { message: String },

    // General I/O and serialization errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, VoxdError>;
