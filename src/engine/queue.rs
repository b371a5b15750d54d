//! Bounded hand-off queue between the audio thread and the ASR worker.
//!
//! Complete utterances flow one way: the VAD side pushes without blocking,
//! the worker blocks on pop. When the queue is full the oldest unprocessed
//! utterance is dropped so latency stays bounded and the freshest speech
//! wins.

use crate::defaults;
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// A complete speech segment, including pre-speech padding.
#[derive(Debug, Clone)]
pub struct Utterance {
    /// Mono samples normalized to [-1, 1].
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Timestamp of the first sample.
    pub start: Instant,
    /// Timestamp of the last sample.
    pub end: Instant,
    /// When the utterance entered the queue; basis for latency metrics.
    pub enqueued_at: Instant,
}

impl Utterance {
    /// Duration derived from the sample count.
    pub fn duration_ms(&self) -> u64 {
        self.samples.len() as u64 * 1000 / self.sample_rate as u64
    }
}

/// Work item for the ASR worker.
#[derive(Debug)]
pub enum Job {
    Utterance(Box<Utterance>),
    /// Sentinel that wakes and stops the worker.
    Shutdown,
}

/// Bounded utterance queue with drop-oldest overflow behavior.
pub struct UtteranceQueue {
    tx: Sender<Job>,
    rx: Receiver<Job>,
    overflow: AtomicU64,
}

impl Default for UtteranceQueue {
    fn default() -> Self {
        Self::with_capacity(defaults::UTTERANCE_QUEUE_CAPACITY)
    }
}

impl UtteranceQueue {
    /// Create a queue holding at most `capacity` in-flight utterances.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self {
            tx,
            rx,
            overflow: AtomicU64::new(0),
        }
    }

    /// Enqueue an utterance without blocking.
    ///
    /// On a full queue the oldest queued utterance is discarded and the
    /// overflow counter incremented; a shutdown sentinel is never
    /// discarded.
    pub fn try_push(&self, utterance: Utterance) {
        let mut job = Job::Utterance(Box::new(utterance));
        loop {
            match self.tx.try_send(job) {
                Ok(()) => return,
                Err(TrySendError::Full(rejected)) => {
                    match self.rx.try_recv() {
                        Ok(Job::Utterance(_)) => {
                            self.overflow.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(Job::Shutdown) => {
                            // Shutting down; drop the utterance and restore
                            // the sentinel for the worker.
                            let _ = self.tx.try_send(Job::Shutdown);
                            return;
                        }
                        Err(_) => {}
                    }
                    job = rejected;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    /// Block until a job is available.
    ///
    /// Returns `Job::Shutdown` when the queue is torn down.
    pub fn pop_blocking(&self) -> Job {
        self.rx.recv().unwrap_or(Job::Shutdown)
    }

    /// Wake the worker with a shutdown sentinel.
    ///
    /// If the queue is full, queued utterances are discarded to make room;
    /// shutdown must never block.
    pub fn shutdown(&self) {
        let mut job = Job::Shutdown;
        loop {
            match self.tx.try_send(job) {
                Ok(()) => return,
                Err(TrySendError::Full(rejected)) => {
                    let _ = self.rx.try_recv();
                    job = rejected;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    /// Number of utterances dropped due to a full queue.
    pub fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }

    /// Number of jobs currently queued.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
