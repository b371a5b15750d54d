//! Whisper-based transcription via whisper-rs.
//!
//! # Feature Gate
//!
//! This module requires the `whisper` feature (enabled by default) and
//! cmake to build whisper.cpp. Without the feature a stub is compiled that
//! fails at runtime, so the rest of the daemon (and its tests) build
//! without the native toolchain.

use crate::defaults;
use crate::error::{Result, VoxdError};
use crate::stt::transcriber::{Segment, Transcriber, TranscriptionResult};
use std::path::PathBuf;
use std::sync::Mutex;

#[cfg(feature = "whisper")]
use std::sync::Once;
#[cfg(feature = "whisper")]
use whisper_rs::{
    FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters, install_logging_hooks,
};

#[cfg(feature = "whisper")]
static LOGGING_HOOKS_INSTALLED: Once = Once::new();

/// Configuration for the Whisper transcriber.
#[derive(Debug, Clone)]
pub struct WhisperConfig {
    /// Path to the ggml model file.
    pub model_path: PathBuf,
    /// Language code ("en", "de", ...) or "auto" for detection.
    pub language: String,
    /// Inference threads (0 = whisper.cpp default).
    pub n_threads: u32,
    /// Beam width; 1 selects greedy decoding.
    pub beam_size: u32,
    /// Sampling temperature.
    pub temperature: f32,
    /// Whether to use GPU acceleration.
    pub use_gpu: bool,
}

impl Default for WhisperConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from(defaults::MODEL_PATH),
            language: defaults::LANGUAGE.to_string(),
            n_threads: 4,
            beam_size: 5,
            temperature: 0.0,
            use_gpu: true,
        }
    }
}

impl From<&crate::config::ModelConfig> for WhisperConfig {
    fn from(model: &crate::config::ModelConfig) -> Self {
        Self {
            model_path: PathBuf::from(&model.path),
            language: model.language.clone(),
            n_threads: model.n_threads,
            beam_size: model.beam_size,
            temperature: model.temperature,
            use_gpu: model.use_gpu,
        }
    }
}

/// Whisper-backed transcriber.
///
/// The `WhisperContext` is wrapped in a Mutex; the engine's worker thread
/// is the only steady-state caller, the lock just makes model handles safe
/// to share behind `Arc<dyn Transcriber>`.
#[cfg(feature = "whisper")]
pub struct WhisperTranscriber {
    context: Mutex<WhisperContext>,
    config: WhisperConfig,
    language: Mutex<String>,
    model_name: String,
}

/// Stub compiled without the `whisper` feature; fails on use.
#[cfg(not(feature = "whisper"))]
pub struct WhisperTranscriber {
    config: WhisperConfig,
    language: Mutex<String>,
    model_name: String,
}

fn model_name_from_path(path: &std::path::Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("unknown")
        .to_string()
}

#[cfg(feature = "whisper")]
impl WhisperTranscriber {
    /// Load a Whisper model.
    ///
    /// Returns `ModelNotFound` if the file is missing and `ModelLoadFailed`
    /// if whisper.cpp rejects it; callers keep their previous transcriber
    /// in that case.
    pub fn new(config: WhisperConfig) -> Result<Self> {
        // Route whisper.cpp logging through hooks once so it stops spamming
        // stderr on every inference.
        LOGGING_HOOKS_INSTALLED.call_once(|| {
            install_logging_hooks();
        });

        if !config.model_path.exists() {
            return Err(VoxdError::ModelNotFound {
                path: config.model_path.to_string_lossy().to_string(),
            });
        }

        let mut context_params = WhisperContextParameters::default();
        context_params.use_gpu(config.use_gpu);
        let context = WhisperContext::new_with_params(
            config.model_path.to_str().ok_or_else(|| VoxdError::ModelLoadFailed {
                message: "invalid UTF-8 in model path".to_string(),
            })?,
            context_params,
        )
        .map_err(|e| VoxdError::ModelLoadFailed {
            message: e.to_string(),
        })?;

        Ok(Self {
            context: Mutex::new(context),
            language: Mutex::new(config.language.clone()),
            model_name: model_name_from_path(&config.model_path),
            config,
        })
    }
}

#[cfg(not(feature = "whisper"))]
impl WhisperTranscriber {
    /// Stub constructor; only verifies the model file exists.
    pub fn new(config: WhisperConfig) -> Result<Self> {
        if !config.model_path.exists() {
            return Err(VoxdError::ModelNotFound {
                path: config.model_path.to_string_lossy().to_string(),
            });
        }
        Ok(Self {
            language: Mutex::new(config.language.clone()),
            model_name: model_name_from_path(&config.model_path),
            config,
        })
    }
}

impl WhisperTranscriber {
    /// The configuration this transcriber was created with.
    pub fn config(&self) -> &WhisperConfig {
        &self.config
    }
}

#[cfg(feature = "whisper")]
impl Transcriber for WhisperTranscriber {
    fn transcribe(&self, audio: &[f32], _sample_rate: u32) -> Result<TranscriptionResult> {
        let context = self.context.lock().map_err(|e| VoxdError::Transcription {
            message: format!("context lock poisoned: {}", e),
        })?;
        let mut state = context.create_state().map_err(|e| VoxdError::Transcription {
            message: format!("failed to create Whisper state: {}", e),
        })?;

        let mut params = if self.config.beam_size > 1 {
            FullParams::new(SamplingStrategy::BeamSearch {
                beam_size: self.config.beam_size as i32,
                patience: -1.0,
            })
        } else {
            FullParams::new(SamplingStrategy::Greedy { best_of: 1 })
        };

        let language = self
            .language
            .lock()
            .map(|l| l.clone())
            .unwrap_or_else(|_| defaults::LANGUAGE.to_string());
        if language == defaults::AUTO_LANGUAGE {
            params.set_language(None);
        } else {
            params.set_language(Some(&language));
        }
        if self.config.n_threads > 0 {
            params.set_n_threads(self.config.n_threads as i32);
        }
        params.set_temperature(self.config.temperature);
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);

        state.full(params, audio).map_err(|e| VoxdError::Transcription {
            message: format!("Whisper inference failed: {}", e),
        })?;

        let lang_id = state.full_lang_id_from_state();
        let detected_language = whisper_rs::get_lang_str(lang_id).unwrap_or("").to_string();

        let mut text = String::new();
        let mut segments = Vec::new();
        let mut prob_sum = 0.0_f64;
        let mut token_count = 0_u32;

        for (index, segment) in state.as_iter().enumerate() {
            let segment_text = match segment.to_str_lossy() {
                Ok(t) => t.into_owned(),
                Err(_) => continue,
            };
            text.push_str(&segment_text);

            let mut tokens = Vec::new();
            let mut segment_prob_sum = 0.0_f64;
            let mut segment_tokens = 0_u32;
            for i in 0..segment.n_tokens() {
                if let Some(token) = segment.get_token(i) {
                    let prob = token.token_probability();
                    prob_sum += prob as f64;
                    token_count += 1;
                    segment_prob_sum += prob as f64;
                    segment_tokens += 1;

                    if let Ok(token_text) = token.to_str_lossy() {
                        // Skip special tokens like <|endoftext|>.
                        if !token_text.is_empty()
                            && !token_text.starts_with("<|")
                            && !token_text.starts_with("[_")
                        {
                            tokens.push(token_text.into_owned());
                        }
                    }
                }
            }

            let avg_logprob = if segment_tokens > 0 {
                ((segment_prob_sum / segment_tokens as f64).max(1e-10)).ln() as f32
            } else {
                0.0
            };

            segments.push(Segment {
                id: index as u32,
                // whisper timestamps are in centiseconds.
                start_ms: segment.start_timestamp() * 10,
                end_ms: segment.end_timestamp() * 10,
                text: segment_text.trim().to_string(),
                tokens,
                temperature: self.config.temperature,
                avg_logprob,
                // Not exposed by the binding.
                compression_ratio: 0.0,
                no_speech_prob: 0.0,
            });
        }

        let confidence = if token_count > 0 {
            (prob_sum / token_count as f64).clamp(0.0, 1.0) as f32
        } else {
            0.0
        };

        Ok(TranscriptionResult {
            text: text.trim().to_string(),
            confidence,
            language: detected_language,
            segments,
            ..TranscriptionResult::default()
        })
    }

    fn set_language(&self, language: &str) {
        if let Ok(mut guard) = self.language.lock() {
            *guard = language.to_string();
        }
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn is_ready(&self) -> bool {
        true
    }
}

#[cfg(not(feature = "whisper"))]
impl Transcriber for WhisperTranscriber {
    fn transcribe(&self, _audio: &[f32], _sample_rate: u32) -> Result<TranscriptionResult> {
        Err(VoxdError::Transcription {
            message: concat!(
                "Whisper feature not enabled. This binary was built without speech recognition.\n",
                "To fix: cargo build --release (whisper is enabled by default)\n",
                "If the build fails with cmake errors, install cmake first."
            )
            .to_string(),
        })
    }

    fn set_language(&self, language: &str) {
        if let Ok(mut guard) = self.language.lock() {
            *guard = language.to_string();
        }
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn is_ready(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = WhisperConfig::default();
        assert_eq!(config.model_path, PathBuf::from(defaults::MODEL_PATH));
        assert_eq!(config.language, "en");
        assert_eq!(config.beam_size, 5);
        assert!(config.use_gpu);
    }

    #[test]
    fn test_config_from_model_config() {
        let model = crate::config::ModelConfig {
            path: "models/ggml-base.bin".to_string(),
            language: "de".to_string(),
            n_threads: 8,
            beam_size: 1,
            temperature: 0.2,
            use_gpu: false,
            ..Default::default()
        };
        let config = WhisperConfig::from(&model);
        assert_eq!(config.model_path, PathBuf::from("models/ggml-base.bin"));
        assert_eq!(config.language, "de");
        assert_eq!(config.n_threads, 8);
        assert_eq!(config.beam_size, 1);
        assert!(!config.use_gpu);
    }

    #[test]
    fn test_missing_model_is_model_not_found() {
        let config = WhisperConfig {
            model_path: PathBuf::from("/nonexistent/model.bin"),
            ..WhisperConfig::default()
        };
        let result = WhisperTranscriber::new(config);
        match result {
            Err(VoxdError::ModelNotFound { path }) => {
                assert_eq!(path, "/nonexistent/model.bin");
            }
            _ => panic!("expected ModelNotFound"),
        }
    }

    #[test]
    fn test_model_name_from_path() {
        assert_eq!(
            model_name_from_path(std::path::Path::new("models/ggml-small.en.bin")),
            "ggml-small.en"
        );
        assert_eq!(model_name_from_path(std::path::Path::new("")), "unknown");
    }
}
