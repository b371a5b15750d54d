//! Voice Activity Detection (VAD) module.
//!
//! Segments a continuous mono sample stream into utterances using RMS
//! energy, an adaptive noise floor, and a four-state machine. The detector
//! is single-threaded: it runs on the audio thread and is never touched
//! concurrently.

use crate::defaults;
use std::collections::VecDeque;

/// Configuration for Voice Activity Detection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadConfig {
    /// Absolute RMS threshold; also the basis of the noise-floor clamp.
    pub energy_threshold: f32,
    /// Speech threshold. A multiplier over the noise floor when adaptive
    /// thresholding is on, an absolute RMS value otherwise.
    pub speech_start_threshold: f32,
    /// Silence threshold, same interpretation as `speech_start_threshold`.
    pub speech_end_threshold: f32,
    /// Sustained speech required to confirm an utterance start (ms).
    pub speech_start_ms: u32,
    /// Sustained silence required to confirm an utterance end (ms).
    pub speech_end_ms: u32,
    /// Minimum utterance duration; shorter candidates are dropped (ms).
    pub min_speech_ms: u32,
    /// Audio retained before speech onset (ms).
    pub pre_speech_buffer_ms: u32,
    /// Exponential smoothing rate for the noise floor.
    pub noise_floor_adaptation_rate: f32,
    /// Derive thresholds from the noise floor instead of using them as-is.
    pub use_adaptive_threshold: bool,
    /// Sample rate of the incoming stream in Hz.
    pub sample_rate: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            energy_threshold: defaults::VAD_ENERGY_THRESHOLD,
            speech_start_threshold: defaults::VAD_SPEECH_START_THRESHOLD,
            speech_end_threshold: defaults::VAD_SPEECH_END_THRESHOLD,
            speech_start_ms: defaults::VAD_SPEECH_START_MS,
            speech_end_ms: defaults::VAD_SPEECH_END_MS,
            min_speech_ms: defaults::VAD_MIN_SPEECH_MS,
            pre_speech_buffer_ms: defaults::VAD_PRE_SPEECH_BUFFER_MS,
            noise_floor_adaptation_rate: defaults::VAD_NOISE_FLOOR_ADAPTATION_RATE,
            use_adaptive_threshold: true,
            sample_rate: defaults::SAMPLE_RATE,
        }
    }
}

/// Current state of voice activity detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    /// No speech detected.
    Silence,
    /// Energy above the speech threshold, not yet sustained long enough.
    SpeechMaybe,
    /// Confirmed speech.
    Speech,
    /// Energy below the silence threshold, not yet sustained long enough.
    SpeechEnding,
}

/// Callback invoked on every non-self state transition with `(old, new)`.
pub type StateObserver = Box<dyn FnMut(VadState, VadState) + Send>;

/// Energy-based voice activity detector with adaptive noise floor.
pub struct Vad {
    config: VadConfig,
    state: VadState,
    observer: Option<StateObserver>,

    // Pre-speech ring, updated every frame regardless of state.
    pre_speech: VecDeque<f32>,
    pre_speech_max: usize,

    // Energy tracking
    current_energy: f32,
    noise_floor: f32,
    energy_history: Vec<f32>,
    energy_idx: usize,

    // State timing, counted in samples
    speech_samples: usize,
    silence_samples: usize,
    samples_per_ms: usize,
}

impl Vad {
    /// Creates a new detector with the given configuration.
    pub fn new(config: VadConfig) -> Self {
        let samples_per_ms = (config.sample_rate / 1000) as usize;
        let pre_speech_max = config.pre_speech_buffer_ms as usize * samples_per_ms;
        Self {
            state: VadState::Silence,
            observer: None,
            pre_speech: VecDeque::with_capacity(pre_speech_max),
            pre_speech_max,
            current_energy: 0.0,
            noise_floor: config.energy_threshold,
            energy_history: vec![config.energy_threshold; defaults::VAD_ENERGY_HISTORY_LEN],
            energy_idx: 0,
            speech_samples: 0,
            silence_samples: 0,
            samples_per_ms,
            config,
        }
    }

    /// Processes one frame of mono samples and returns the resulting state.
    ///
    /// Exactly one transition (possibly a self-loop) happens per call.
    pub fn process(&mut self, samples: &[f32]) -> VadState {
        self.current_energy = rms_energy(samples);

        // Noise floor adapts only while no speech is in progress.
        if self.config.use_adaptive_threshold && self.state == VadState::Silence {
            self.update_noise_floor(self.current_energy);
        }

        self.update_pre_speech(samples);

        let (speech_threshold, silence_threshold) = self.thresholds();
        let n = samples.len();

        match self.state {
            VadState::Silence => {
                if self.current_energy > speech_threshold {
                    self.change_state(VadState::SpeechMaybe);
                    self.speech_samples = n;
                    self.silence_samples = 0;
                }
            }
            VadState::SpeechMaybe => {
                if self.current_energy > speech_threshold {
                    self.speech_samples += n;
                    if self.speech_samples >= self.ms_to_samples(self.config.speech_start_ms) {
                        self.change_state(VadState::Speech);
                    }
                } else {
                    // False start, back to silence.
                    self.change_state(VadState::Silence);
                    self.speech_samples = 0;
                }
            }
            VadState::Speech => {
                if self.current_energy < silence_threshold {
                    self.change_state(VadState::SpeechEnding);
                    self.silence_samples = n;
                } else {
                    self.speech_samples += n;
                }
            }
            VadState::SpeechEnding => {
                if self.current_energy < silence_threshold {
                    self.silence_samples += n;
                    if self.silence_samples >= self.ms_to_samples(self.config.speech_end_ms) {
                        self.change_state(VadState::Silence);
                        self.speech_samples = 0;
                        self.silence_samples = 0;
                    }
                } else {
                    // Speech resumed before the silence window elapsed.
                    self.change_state(VadState::Speech);
                    self.speech_samples += n;
                    self.silence_samples = 0;
                }
            }
        }

        self.state
    }

    /// Returns the current state without processing anything.
    pub fn state(&self) -> VadState {
        self.state
    }

    /// RMS energy of the most recently processed frame.
    pub fn current_energy(&self) -> f32 {
        self.current_energy
    }

    /// Current adaptive noise floor estimate.
    pub fn noise_floor(&self) -> f32 {
        self.noise_floor
    }

    /// Returns the contents of the pre-speech ring, oldest sample first.
    pub fn buffered_audio(&self) -> Vec<f32> {
        self.pre_speech.iter().copied().collect()
    }

    /// Total samples counted as speech in the current candidate.
    pub fn speech_samples(&self) -> usize {
        self.speech_samples
    }

    /// Registers an observer notified on every non-self transition.
    pub fn set_state_observer(&mut self, observer: StateObserver) {
        self.observer = Some(observer);
    }

    /// Replaces the configuration and resets adaptive state.
    ///
    /// Callers are expected to apply this between utterances.
    pub fn update_config(&mut self, config: VadConfig) {
        self.samples_per_ms = (config.sample_rate / 1000) as usize;
        self.pre_speech_max = config.pre_speech_buffer_ms as usize * self.samples_per_ms;
        while self.pre_speech.len() > self.pre_speech_max {
            self.pre_speech.pop_front();
        }
        if config.use_adaptive_threshold {
            self.noise_floor = config.energy_threshold;
            self.energy_history.fill(config.energy_threshold);
            self.energy_idx = 0;
        }
        self.config = config;
    }

    /// Returns the active configuration.
    pub fn config(&self) -> &VadConfig {
        &self.config
    }

    /// Resets the detector to `Silence`, clearing buffers and counters.
    pub fn reset(&mut self) {
        self.state = VadState::Silence;
        self.speech_samples = 0;
        self.silence_samples = 0;
        self.pre_speech.clear();
        self.current_energy = 0.0;
        if self.config.use_adaptive_threshold {
            self.noise_floor = self.config.energy_threshold;
            self.energy_history.fill(self.config.energy_threshold);
            self.energy_idx = 0;
        }
    }

    fn thresholds(&self) -> (f32, f32) {
        if self.config.use_adaptive_threshold {
            (
                self.noise_floor * self.config.speech_start_threshold,
                self.noise_floor * self.config.speech_end_threshold,
            )
        } else {
            (
                self.config.speech_start_threshold,
                self.config.speech_end_threshold,
            )
        }
    }

    fn ms_to_samples(&self, ms: u32) -> usize {
        ms as usize * self.samples_per_ms
    }

    fn update_noise_floor(&mut self, energy: f32) {
        self.energy_history[self.energy_idx] = energy;
        self.energy_idx = (self.energy_idx + 1) % self.energy_history.len();

        // 20th percentile of the recent energy history.
        let mut sorted = self.energy_history.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let p20 = sorted[sorted.len() / 5];

        let rate = self.config.noise_floor_adaptation_rate;
        self.noise_floor = self.noise_floor * (1.0 - rate) + p20 * rate;

        // Never let the floor collapse below half the configured threshold.
        self.noise_floor = self.noise_floor.max(self.config.energy_threshold * 0.5);
    }

    fn update_pre_speech(&mut self, samples: &[f32]) {
        for &s in samples {
            self.pre_speech.push_back(s);
        }
        while self.pre_speech.len() > self.pre_speech_max {
            self.pre_speech.pop_front();
        }
    }

    fn change_state(&mut self, new_state: VadState) {
        if self.state != new_state {
            let old_state = self.state;
            self.state = new_state;
            if let Some(observer) = self.observer.as_mut() {
                observer(old_state, new_state);
            }
        }
    }
}

/// Root-mean-square energy of a frame. Empty frames have zero energy.
pub fn rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f32 = samples.iter().map(|&s| s * s).sum();
    (sum_squares / samples.len() as f32).sqrt()
}
