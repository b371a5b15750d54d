//! Pipeline and system metrics.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use sysinfo::System;

/// Rolling pipeline statistics, updated by the ASR worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PipelineMetrics {
    /// Running mean of wall-clock time from enqueue to result emission.
    pub avg_latency_ms: f32,
    /// Running mean of processing time over audio duration.
    pub avg_rtf: f32,
    pub transcriptions_count: u64,
    pub processed_samples: u64,
    /// Utterances discarded because the queue was full.
    pub queue_overflows: u64,
}

/// Thread-safe metrics accumulator.
///
/// All reads and writes are short; the mutex is never held across
/// inference or I/O.
#[derive(Default)]
pub struct MetricsTracker {
    inner: Mutex<PipelineMetrics>,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one transcription into the running means.
    pub fn record_transcription(&self, latency_ms: f32, processing_ms: f32, audio_ms: f32) {
        let mut metrics = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        metrics.transcriptions_count += 1;
        let n = metrics.transcriptions_count as f32;
        metrics.avg_latency_ms = (metrics.avg_latency_ms * (n - 1.0) + latency_ms) / n;
        let rtf = if audio_ms > 0.0 {
            processing_ms / audio_ms
        } else {
            0.0
        };
        metrics.avg_rtf = (metrics.avg_rtf * (n - 1.0) + rtf) / n;
    }

    /// Count samples that passed through the ingress path.
    pub fn add_processed_samples(&self, n: u64) {
        let mut metrics = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        metrics.processed_samples += n;
    }

    /// Record the current queue overflow total.
    pub fn set_queue_overflows(&self, n: u64) {
        let mut metrics = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        metrics.queue_overflows = n;
    }

    /// Copy out the current values.
    pub fn snapshot(&self) -> PipelineMetrics {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Process-level CPU and memory usage sampled via sysinfo.
pub struct SystemSampler {
    system: Mutex<System>,
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemSampler {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    /// Returns `(cpu_usage_percent, memory_usage_mb)` for this process.
    ///
    /// CPU usage needs two refreshes to produce a delta; the first call
    /// after startup may report 0.
    pub fn sample(&self) -> (f32, u64) {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_cpu_usage();
        system.refresh_memory();

        let cpu_usage = system.global_cpu_usage();
        let memory_mb = sysinfo::get_current_pid()
            .ok()
            .and_then(|pid| {
                system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[pid]), true);
                system.process(pid).map(|p| p.memory() / (1024 * 1024))
            })
            .unwrap_or(0);

        (cpu_usage, memory_mb)
    }
}
