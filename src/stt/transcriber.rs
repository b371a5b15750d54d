//! Transcriber trait and result types.
//!
//! The ASR back end is a capability set behind a trait so the engine can
//! swap implementations (real Whisper vs mock) and reload models at
//! runtime.

use crate::error::{Result, VoxdError};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// One decoded segment of a transcription.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Segment {
    pub id: u32,
    pub start_ms: i64,
    pub end_ms: i64,
    pub text: String,
    pub tokens: Vec<String>,
    pub temperature: f32,
    pub avg_logprob: f32,
    pub compression_ratio: f32,
    pub no_speech_prob: f32,
}

/// Result of transcribing one utterance.
///
/// The back end fills `text`, `confidence`, `language`, and `segments`;
/// the worker fills the timing fields and `is_final` before broadcasting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TranscriptionResult {
    pub text: String,
    /// Mean token probability, clamped to [0, 1].
    pub confidence: f32,
    pub language: String,
    pub processing_time_ms: u64,
    pub audio_duration_ms: u64,
    /// Always true: the pipeline emits only whole-utterance results.
    pub is_final: bool,
    pub segments: Vec<Segment>,
}

/// Trait for speech-to-text transcription back ends.
///
/// Implementations must be synchronous and callable again after a model
/// swap; the engine serializes calls on its worker thread.
pub trait Transcriber: Send + Sync {
    /// Transcribe mono `f32` samples normalized to [-1, 1].
    fn transcribe(&self, audio: &[f32], sample_rate: u32) -> Result<TranscriptionResult>;

    /// Change the recognition language for subsequent calls.
    fn set_language(&self, language: &str);

    /// Name of the loaded model.
    fn model_name(&self) -> &str;

    /// Whether the transcriber is usable.
    fn is_ready(&self) -> bool;
}

/// Mock transcriber for tests and model-less runs.
pub struct MockTranscriber {
    model_name: String,
    response: String,
    should_fail: bool,
    delay: Option<std::time::Duration>,
    language: Mutex<String>,
    calls: Mutex<Vec<usize>>,
}

impl MockTranscriber {
    /// Create a new mock transcriber with default settings.
    pub fn new(model_name: &str) -> Self {
        Self {
            model_name: model_name.to_string(),
            response: "mock transcription".to_string(),
            should_fail: false,
            delay: None,
            language: Mutex::new("en".to_string()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Configure the mock to return a specific text.
    pub fn with_response(mut self, response: &str) -> Self {
        self.response = response.to_string();
        self
    }

    /// Configure the mock to fail on transcribe.
    pub fn with_failure(mut self) -> Self {
        self.should_fail = true;
        self
    }

    /// Configure the mock to sleep before answering, to simulate a slow
    /// back end.
    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Sample counts of every utterance this mock has transcribed.
    pub fn calls(&self) -> Vec<usize> {
        self.calls.lock().unwrap().clone()
    }

    /// Language most recently set via `set_language`.
    pub fn language(&self) -> String {
        self.language.lock().unwrap().clone()
    }
}

impl Transcriber for MockTranscriber {
    fn transcribe(&self, audio: &[f32], sample_rate: u32) -> Result<TranscriptionResult> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.calls.lock().unwrap().push(audio.len());
        if self.should_fail {
            return Err(VoxdError::Transcription {
                message: "mock transcription failure".to_string(),
            });
        }
        let duration_ms = audio.len() as i64 * 1000 / sample_rate as i64;
        Ok(TranscriptionResult {
            text: self.response.clone(),
            confidence: 0.9,
            language: self.language.lock().unwrap().clone(),
            segments: vec![Segment {
                id: 0,
                start_ms: 0,
                end_ms: duration_ms,
                text: self.response.clone(),
                tokens: self
                    .response
                    .split_whitespace()
                    .map(str::to_string)
                    .collect(),
                temperature: 0.0,
                avg_logprob: -0.1,
                compression_ratio: 1.0,
                no_speech_prob: 0.02,
            }],
            ..TranscriptionResult::default()
        })
    }

    fn set_language(&self, language: &str) {
        *self.language.lock().unwrap() = language.to_string();
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn is_ready(&self) -> bool {
        !self.should_fail
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_returns_configured_response() {
        let transcriber = MockTranscriber::new("test-model").with_response("hello world");
        let audio = vec![0.0_f32; 16_000];
        let result = transcriber.transcribe(&audio, 16_000).unwrap();
        assert_eq!(result.text, "hello world");
        assert_eq!(result.segments.len(), 1);
        assert_eq!(result.segments[0].end_ms, 1000);
        assert_eq!(result.segments[0].tokens, vec!["hello", "world"]);
    }

    #[test]
    fn test_mock_failure() {
        let transcriber = MockTranscriber::new("test-model").with_failure();
        let result = transcriber.transcribe(&[0.0; 100], 16_000);
        assert!(matches!(result, Err(VoxdError::Transcription { .. })));
        assert!(!transcriber.is_ready());
    }

    #[test]
    fn test_mock_records_calls() {
        let transcriber = MockTranscriber::new("test-model");
        transcriber.transcribe(&[0.0; 10], 16_000).unwrap();
        transcriber.transcribe(&[0.0; 20], 16_000).unwrap();
        assert_eq!(transcriber.calls(), vec![10, 20]);
    }

    #[test]
    fn test_mock_set_language() {
        let transcriber = MockTranscriber::new("test-model");
        transcriber.set_language("de");
        assert_eq!(transcriber.language(), "de");
        let result = transcriber.transcribe(&[0.0; 10], 16_000).unwrap();
        assert_eq!(result.language, "de");
    }

    #[test]
    fn test_trait_is_object_safe() {
        let transcriber: Box<dyn Transcriber> =
            Box::new(MockTranscriber::new("boxed").with_response("boxed test"));
        assert_eq!(transcriber.model_name(), "boxed");
        let result = transcriber.transcribe(&[0.0; 10], 16_000).unwrap();
        assert_eq!(result.text, "boxed test");
    }

    #[test]
    fn test_result_serializes_with_wire_field_names() {
        let result = TranscriptionResult {
            text: "hi there".to_string(),
            confidence: 0.5,
            language: "en".to_string(),
            processing_time_ms: 42,
            audio_duration_ms: 1200,
            is_final: true,
            segments: vec![],
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["text"], "hi there");
        assert_eq!(value["confidence"], 0.5);
        assert_eq!(value["processing_time_ms"], 42);
        assert_eq!(value["audio_duration_ms"], 1200);
        assert_eq!(value["is_final"], true);
    }
}
