//! The transcription engine: supervisor of the realtime pipeline.
//!
//! `Engine` owns the VAD, the in-flight speech buffer, the bounded
//! utterance queue, and the ASR worker thread. Audio arrives on the driver
//! thread via [`Engine::feed_audio`]; finished transcriptions leave through
//! a crossbeam channel that the daemon bridges into the IPC broadcast.

pub mod metrics;
pub mod queue;

use crate::audio::vad::{Vad, VadConfig, VadState};
use crate::defaults;
use crate::stt::text::clean_transcript;
use crate::stt::transcriber::{Transcriber, TranscriptionResult};
use crossbeam_channel::Sender;
use metrics::{MetricsTracker, PipelineMetrics};
use queue::{Job, Utterance, UtteranceQueue};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Events emitted by the pipeline toward the IPC layer.
#[derive(Debug)]
pub enum EngineEvent {
    /// A finished, cleaned transcription ready to broadcast.
    Transcription(Box<TranscriptionResult>),
    /// The audio device failed mid-run; the pipeline paused itself.
    DeviceError { message: String },
}

/// Engine construction parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub vad: VadConfig,
    pub queue_capacity: usize,
    pub sample_rate: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            vad: VadConfig::default(),
            queue_capacity: defaults::UTTERANCE_QUEUE_CAPACITY,
            sample_rate: defaults::SAMPLE_RATE,
        }
    }
}

/// Segmentation state owned by the audio thread.
struct FeedState {
    vad: Vad,
    /// In-flight utterance: pre-speech padding plus confirmed speech.
    speech: Vec<f32>,
    /// Frames seen while in `SpeechEnding`; appended to `speech` only if
    /// speech resumes, discarded when the utterance ends.
    ending: Vec<f32>,
    /// Length of the pre-speech padding prepended at speech confirmation.
    padding_len: usize,
}

struct EngineShared {
    feed: Mutex<FeedState>,
    pending_vad: Mutex<Option<VadConfig>>,
    queue: UtteranceQueue,
    transcriber: RwLock<Arc<dyn Transcriber>>,
    metrics: MetricsTracker,
    paused: AtomicBool,
    running: AtomicBool,
    sample_rate: u32,
    event_tx: Sender<EngineEvent>,
}

/// Realtime speech-to-text pipeline.
pub struct Engine {
    shared: Arc<EngineShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Create an engine; call [`Engine::start`] to spawn the worker.
    pub fn new(
        config: EngineConfig,
        transcriber: Arc<dyn Transcriber>,
        event_tx: Sender<EngineEvent>,
    ) -> Self {
        let shared = EngineShared {
            feed: Mutex::new(FeedState {
                vad: Vad::new(config.vad),
                speech: Vec::new(),
                ending: Vec::new(),
                padding_len: 0,
            }),
            pending_vad: Mutex::new(None),
            queue: UtteranceQueue::with_capacity(config.queue_capacity),
            transcriber: RwLock::new(transcriber),
            metrics: MetricsTracker::new(),
            paused: AtomicBool::new(false),
            running: AtomicBool::new(false),
            sample_rate: config.sample_rate,
            event_tx,
        };
        Self {
            shared: Arc::new(shared),
            worker: Mutex::new(None),
        }
    }

    /// Spawn the ASR worker thread. Idempotent.
    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("voxd-asr-worker".to_string())
            .spawn(move || worker_loop(shared))
            .expect("failed to spawn ASR worker thread");
        *self.worker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Stop the worker and join it. Queued utterances may be discarded.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shared.queue.shutdown();
        if let Some(handle) = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = handle.join();
        }
    }

    /// Whether the worker is running.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Stop consuming audio; frames are accepted but dropped before VAD.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::SeqCst);
    }

    /// Resume after a pause, clearing VAD state and the pre-speech ring so
    /// stale energy cannot trigger a transition.
    pub fn resume(&self) {
        let mut feed = self.shared.feed.lock().unwrap_or_else(|e| e.into_inner());
        feed.vad.reset();
        feed.speech.clear();
        feed.ending.clear();
        feed.padding_len = 0;
        drop(feed);
        self.shared.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    /// Running and not paused.
    pub fn is_listening(&self) -> bool {
        self.is_running() && !self.is_paused()
    }

    /// Ingest one frame of mono samples.
    ///
    /// Called from the audio driver thread. Must not block: the only lock
    /// taken is the feed mutex, which application threads touch only for
    /// rare control operations (resume, VAD reconfiguration).
    pub fn feed_audio(&self, samples: &[f32], timestamp: Instant) {
        if !self.shared.running.load(Ordering::SeqCst) {
            return;
        }
        self.shared.metrics.add_processed_samples(samples.len() as u64);
        if self.shared.paused.load(Ordering::SeqCst) {
            return;
        }

        let mut feed = self.shared.feed.lock().unwrap_or_else(|e| e.into_inner());

        // Staged VAD reconfiguration applies between utterances only.
        if feed.vad.state() == VadState::Silence
            && let Some(config) = self
                .shared
                .pending_vad
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
        {
            feed.vad.update_config(config);
        }

        let prev = feed.vad.state();
        let state = feed.vad.process(samples);

        use VadState::*;
        match (prev, state) {
            (Silence, SpeechMaybe) => {
                feed.speech.clear();
                feed.ending.clear();
                feed.padding_len = 0;
                feed.speech.extend_from_slice(samples);
            }
            (SpeechMaybe, SpeechMaybe) => feed.speech.extend_from_slice(samples),
            (SpeechMaybe, Silence) => feed.speech.clear(),
            (SpeechMaybe, Speech) => {
                feed.speech.extend_from_slice(samples);
                // Prepend the part of the pre-speech ring that precedes the
                // already-buffered candidate, so the onset is not clipped
                // and nothing is double-counted.
                let ring = feed.vad.buffered_audio();
                let overlap = feed.speech.len().min(ring.len());
                let prefix = &ring[..ring.len() - overlap];
                feed.padding_len = prefix.len();
                let mut padded = Vec::with_capacity(prefix.len() + feed.speech.len());
                padded.extend_from_slice(prefix);
                padded.extend_from_slice(&feed.speech);
                feed.speech = padded;
            }
            (Speech, Speech) => feed.speech.extend_from_slice(samples),
            (Speech, SpeechEnding) => {
                feed.ending.clear();
                feed.ending.extend_from_slice(samples);
            }
            (SpeechEnding, SpeechEnding) => feed.ending.extend_from_slice(samples),
            (SpeechEnding, Speech) => {
                // The pause was mid-utterance: keep the quiet stretch.
                let ending = std::mem::take(&mut feed.ending);
                feed.speech.extend_from_slice(&ending);
                feed.speech.extend_from_slice(samples);
            }
            (SpeechEnding, Silence) => self.finish_utterance(&mut feed, timestamp),
            (Silence, Silence) => {}
            // The state machine takes exactly one transition per frame;
            // other pairs cannot occur.
            (from, to) => {
                debug_assert!(false, "impossible VAD transition {:?} -> {:?}", from, to);
            }
        }
    }

    /// Emit the buffered utterance if the spoken part is long enough.
    fn finish_utterance(&self, feed: &mut FeedState, timestamp: Instant) {
        let sample_rate = self.shared.sample_rate as u64;
        let spoken_samples = feed.speech.len().saturating_sub(feed.padding_len);
        let spoken_ms = spoken_samples as u64 * 1000 / sample_rate;
        let min_ms = feed.vad.config().min_speech_ms as u64;

        let trailing_ms = feed.ending.len() as u64 * 1000 / sample_rate;
        feed.ending.clear();

        if spoken_ms < min_ms {
            feed.speech.clear();
            feed.padding_len = 0;
            return;
        }

        let samples = std::mem::take(&mut feed.speech);
        feed.padding_len = 0;
        let duration = Duration::from_millis(samples.len() as u64 * 1000 / sample_rate);
        let end = timestamp
            .checked_sub(Duration::from_millis(trailing_ms))
            .unwrap_or(timestamp);
        let start = end.checked_sub(duration).unwrap_or(end);

        self.shared.queue.try_push(Utterance {
            samples,
            sample_rate: self.shared.sample_rate,
            start,
            end,
            enqueued_at: Instant::now(),
        });
        self.shared
            .metrics
            .set_queue_overflows(self.shared.queue.overflow_count());
    }

    /// Stage a VAD reconfiguration; it takes effect at the next frame
    /// processed while no utterance is in flight.
    pub fn update_vad(&self, config: VadConfig) {
        let mut feed = self.shared.feed.lock().unwrap_or_else(|e| e.into_inner());
        if feed.vad.state() == VadState::Silence {
            feed.vad.update_config(config);
        } else {
            *self
                .shared
                .pending_vad
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = Some(config);
        }
    }

    /// Current VAD configuration (the staged one if an update is pending).
    pub fn vad_config(&self) -> VadConfig {
        if let Some(pending) = *self
            .shared
            .pending_vad
            .lock()
            .unwrap_or_else(|e| e.into_inner())
        {
            return pending;
        }
        let feed = self.shared.feed.lock().unwrap_or_else(|e| e.into_inner());
        *feed.vad.config()
    }

    /// Forward a language change to the ASR back end.
    pub fn set_language(&self, language: &str) {
        self.shared
            .transcriber
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .set_language(language);
    }

    /// Swap the ASR back end. The caller constructs (and validates) the
    /// replacement first, so a failed load never disturbs the prior model.
    /// The worker observes the swap at its next utterance.
    pub fn replace_transcriber(&self, transcriber: Arc<dyn Transcriber>) {
        *self
            .shared
            .transcriber
            .write()
            .unwrap_or_else(|e| e.into_inner()) = transcriber;
    }

    /// Name of the currently loaded model.
    pub fn model_name(&self) -> String {
        self.shared
            .transcriber
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .model_name()
            .to_string()
    }

    /// Pipeline metrics snapshot.
    pub fn metrics(&self) -> PipelineMetrics {
        self.shared
            .metrics
            .set_queue_overflows(self.shared.queue.overflow_count());
        self.shared.metrics.snapshot()
    }

    /// Pause the pipeline and report a device failure to subscribers.
    pub fn report_device_error(&self, message: String) {
        self.pause();
        let _ = self
            .shared
            .event_tx
            .try_send(EngineEvent::DeviceError { message });
    }
}

fn worker_loop(shared: Arc<EngineShared>) {
    loop {
        match shared.queue.pop_blocking() {
            Job::Shutdown => break,
            Job::Utterance(utterance) => process_utterance(&shared, *utterance),
        }
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }
    }
}

fn process_utterance(shared: &EngineShared, utterance: Utterance) {
    let transcriber = shared
        .transcriber
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone();

    let started = Instant::now();
    let audio_ms = utterance.duration_ms();

    match transcriber.transcribe(&utterance.samples, utterance.sample_rate) {
        Ok(mut result) => {
            let processing_ms = started.elapsed().as_millis() as u64;
            let latency_ms = utterance.enqueued_at.elapsed().as_secs_f32() * 1000.0;
            shared
                .metrics
                .record_transcription(latency_ms, processing_ms as f32, audio_ms as f32);

            let Some(text) = clean_transcript(&result.text) else {
                return;
            };
            result.text = text;
            result.processing_time_ms = processing_ms;
            result.audio_duration_ms = audio_ms;
            result.is_final = true;
            let _ = shared
                .event_tx
                .try_send(EngineEvent::Transcription(Box::new(result)));
        }
        Err(e) => {
            // One bad utterance never stops the worker.
            eprintln!("voxd: transcription failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stt::transcriber::MockTranscriber;
    use crossbeam_channel::Receiver;

    const FRAME: usize = 160; // 10ms at 16kHz

    fn test_engine_config() -> EngineConfig {
        EngineConfig {
            vad: VadConfig {
                energy_threshold: 0.001,
                speech_start_threshold: 1.08,
                speech_end_threshold: 0.85,
                speech_start_ms: 150,
                speech_end_ms: 1000,
                min_speech_ms: 500,
                pre_speech_buffer_ms: 500,
                noise_floor_adaptation_rate: 0.01,
                use_adaptive_threshold: true,
                sample_rate: 16_000,
            },
            queue_capacity: 8,
            sample_rate: 16_000,
        }
    }

    fn engine_with(
        transcriber: Arc<dyn Transcriber>,
    ) -> (Engine, Receiver<EngineEvent>) {
        let (tx, rx) = crossbeam_channel::bounded(64);
        let engine = Engine::new(test_engine_config(), transcriber, tx);
        engine.start();
        (engine, rx)
    }

    fn tone_frame() -> Vec<f32> {
        // 440Hz at amplitude 0.1, well above the adaptive threshold.
        (0..FRAME)
            .map(|i| 0.1 * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 16_000.0).sin())
            .collect()
    }

    fn feed_silence(engine: &Engine, frames: usize) {
        for _ in 0..frames {
            engine.feed_audio(&vec![0.0; FRAME], Instant::now());
        }
    }

    fn feed_tone(engine: &Engine, frames: usize) {
        let frame = tone_frame();
        for _ in 0..frames {
            engine.feed_audio(&frame, Instant::now());
        }
    }

    fn collect_transcriptions(
        rx: &Receiver<EngineEvent>,
        wait: Duration,
    ) -> Vec<TranscriptionResult> {
        let deadline = Instant::now() + wait;
        let mut results = Vec::new();
        while Instant::now() < deadline {
            match rx.recv_timeout(Duration::from_millis(20)) {
                Ok(EngineEvent::Transcription(result)) => results.push(*result),
                Ok(EngineEvent::DeviceError { .. }) => {}
                Err(_) => {}
            }
        }
        results
    }

    #[test]
    fn test_hello_world_scenario() {
        // 500ms silence, 1s tone, 1.2s silence → exactly one utterance
        // with audio_duration_ms in [1000, 1500].
        let mock = Arc::new(MockTranscriber::new("m").with_response("hello world"));
        let (engine, rx) = engine_with(mock);

        feed_silence(&engine, 50);
        feed_tone(&engine, 100);
        feed_silence(&engine, 120);

        let results = collect_transcriptions(&rx, Duration::from_millis(500));
        engine.stop();

        assert_eq!(results.len(), 1, "expected exactly one transcription");
        let result = &results[0];
        assert_eq!(result.text, "hello world");
        assert!(result.is_final);
        assert!(
            (1000..=1500).contains(&result.audio_duration_ms),
            "audio_duration_ms = {}",
            result.audio_duration_ms
        );
    }

    #[test]
    fn test_short_tone_is_rejected() {
        // 200ms of tone is below min_speech_ms = 500.
        let mock = Arc::new(MockTranscriber::new("m").with_response("nope"));
        let (engine, rx) = engine_with(mock);

        feed_silence(&engine, 50);
        feed_tone(&engine, 20);
        feed_silence(&engine, 120);

        let results = collect_transcriptions(&rx, Duration::from_millis(300));
        engine.stop();
        assert!(results.is_empty(), "short utterance must be dropped");
    }

    #[test]
    fn test_tone_of_exactly_min_speech_is_emitted() {
        // 500ms of tone == min_speech_ms: the boundary case is kept.
        let mock = Arc::new(MockTranscriber::new("m").with_response("boundary"));
        let (engine, rx) = engine_with(mock);

        feed_silence(&engine, 50);
        feed_tone(&engine, 50);
        feed_silence(&engine, 120);

        let results = collect_transcriptions(&rx, Duration::from_millis(500));
        engine.stop();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].text, "boundary");
    }

    #[test]
    fn test_pause_isolates_audio() {
        let mock = Arc::new(MockTranscriber::new("m").with_response("spoken"));
        let (engine, rx) = engine_with(mock);

        engine.pause();
        assert!(!engine.is_listening());
        feed_silence(&engine, 20);
        feed_tone(&engine, 100);
        feed_silence(&engine, 120);

        engine.resume();
        assert!(engine.is_listening());
        feed_silence(&engine, 20);
        feed_tone(&engine, 100);
        feed_silence(&engine, 120);

        let results = collect_transcriptions(&rx, Duration::from_millis(500));
        engine.stop();
        assert_eq!(results.len(), 1, "only the post-resume utterance counts");
    }

    #[test]
    fn test_cleanup_normalizes_whitespace() {
        let mock = Arc::new(MockTranscriber::new("m").with_response("  hello \t  there "));
        let (engine, rx) = engine_with(mock);

        feed_silence(&engine, 20);
        feed_tone(&engine, 100);
        feed_silence(&engine, 120);

        let results = collect_transcriptions(&rx, Duration::from_millis(500));
        engine.stop();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].text, "hello there");
    }

    #[test]
    fn test_cleanup_rejects_punctuation_only() {
        let mock = Arc::new(MockTranscriber::new("m").with_response(" ... "));
        let (engine, rx) = engine_with(mock);

        feed_silence(&engine, 20);
        feed_tone(&engine, 100);
        feed_silence(&engine, 120);

        let results = collect_transcriptions(&rx, Duration::from_millis(300));
        engine.stop();
        assert!(results.is_empty());
    }

    #[test]
    fn test_transcription_failure_does_not_stop_worker() {
        let failing = Arc::new(MockTranscriber::new("bad").with_failure());
        let (engine, rx) = engine_with(failing);

        feed_silence(&engine, 20);
        feed_tone(&engine, 100);
        feed_silence(&engine, 120);
        assert!(collect_transcriptions(&rx, Duration::from_millis(300)).is_empty());

        // Swap in a working transcriber; the worker must still be alive.
        engine.replace_transcriber(Arc::new(
            MockTranscriber::new("good").with_response("recovered"),
        ));
        feed_silence(&engine, 20);
        feed_tone(&engine, 100);
        feed_silence(&engine, 120);

        let results = collect_transcriptions(&rx, Duration::from_millis(500));
        engine.stop();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].text, "recovered");
    }

    #[test]
    fn test_metrics_updated_after_transcription() {
        let mock = Arc::new(MockTranscriber::new("m").with_response("metrics run"));
        let (engine, rx) = engine_with(mock);

        feed_silence(&engine, 20);
        feed_tone(&engine, 100);
        feed_silence(&engine, 120);
        let _ = collect_transcriptions(&rx, Duration::from_millis(500));
        engine.stop();

        let metrics = engine.metrics();
        assert_eq!(metrics.transcriptions_count, 1);
        assert!(metrics.processed_samples > 0);
        assert!(metrics.avg_latency_ms >= 0.0);
    }

    #[test]
    fn test_vad_update_applies_between_utterances() {
        let mock = Arc::new(MockTranscriber::new("m").with_response("first pass"));
        let (engine, rx) = engine_with(mock);

        // Start an utterance, then raise min_speech_ms mid-flight.
        feed_silence(&engine, 20);
        feed_tone(&engine, 50);
        let stricter = VadConfig {
            min_speech_ms: 60_000,
            ..test_engine_config().vad
        };
        engine.update_vad(stricter);
        feed_tone(&engine, 50);
        feed_silence(&engine, 120);

        // The in-flight utterance was evaluated under the old config.
        let results = collect_transcriptions(&rx, Duration::from_millis(500));
        assert_eq!(results.len(), 1);

        // The next utterance falls under the stricter config and is dropped.
        feed_silence(&engine, 20);
        feed_tone(&engine, 100);
        feed_silence(&engine, 120);
        let results = collect_transcriptions(&rx, Duration::from_millis(300));
        engine.stop();
        assert!(results.is_empty());

        assert_eq!(engine.vad_config().min_speech_ms, 60_000);
    }

    #[test]
    fn test_set_language_reaches_transcriber() {
        let mock = Arc::new(MockTranscriber::new("m"));
        let mock_ref = mock.clone();
        let (engine, _rx) = engine_with(mock);
        engine.set_language("de");
        engine.stop();
        assert_eq!(mock_ref.language(), "de");
    }

    #[test]
    fn test_stop_is_idempotent_and_bounded() {
        let mock = Arc::new(MockTranscriber::new("m"));
        let (engine, _rx) = engine_with(mock);
        engine.stop();
        engine.stop();
        assert!(!engine.is_running());
    }

    #[test]
    fn test_mid_utterance_pause_is_kept() {
        // Tone, short dip below threshold, tone again: one utterance whose
        // duration covers both tone bursts and the dip.
        let mock = Arc::new(MockTranscriber::new("m").with_response("two bursts"));
        let (engine, rx) = engine_with(mock);

        feed_silence(&engine, 20);
        feed_tone(&engine, 60); // 600ms
        feed_silence(&engine, 30); // 300ms dip, under speech_end_ms
        feed_tone(&engine, 60); // 600ms
        feed_silence(&engine, 120);

        let results = collect_transcriptions(&rx, Duration::from_millis(500));
        engine.stop();
        assert_eq!(results.len(), 1);
        assert!(
            results[0].audio_duration_ms >= 1500,
            "dip should be included, got {}ms",
            results[0].audio_duration_ms
        );
    }

    #[test]
    fn test_device_error_pauses_engine() {
        let mock = Arc::new(MockTranscriber::new("m"));
        let (engine, rx) = engine_with(mock);
        engine.report_device_error("device unplugged".to_string());
        assert!(engine.is_paused());
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(EngineEvent::DeviceError { message }) => {
                assert!(message.contains("unplugged"));
            }
            other => panic!("expected DeviceError, got {:?}", other),
        }
        engine.stop();
    }
}
