//! Bounded multi-worker batch prefetching.
//!
//! Worker threads share one [`IndexSampler`], build whole batches from a
//! [`PatchSource`] and push them into a `sync_channel` sized to
//! `max_queue_size`. A full channel blocks the workers, so memory stays
//! bounded no matter how slow the consumer is.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use super::batch::{Batch, BatchSource};
use super::sampler::IndexSampler;
use super::source::{PatchSource, Sample};
use crate::error::{DataError, QueueError};

/// What a worker does when a sample fails to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Replace the sample with a random other index, up to `max_attempts`
    /// reads in total, then fail.
    Retry { max_attempts: usize },
    /// Fail the queue on the first error.
    Fatal,
}

#[derive(Debug, Clone)]
pub struct PrefetchConfig {
    pub workers: usize,
    pub max_queue_size: usize,
    pub batch_size: usize,
    pub shuffle: bool,
    pub seed: u64,
    pub failure_policy: FailurePolicy,
    /// Bound on how long `get_batch` waits; `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        PrefetchConfig {
            workers: 4,
            max_queue_size: 10,
            batch_size: 16,
            shuffle: true,
            seed: 42,
            failure_policy: FailurePolicy::Retry { max_attempts: 8 },
            timeout: None,
        }
    }
}

type Message = Result<Batch, DataError>;

/// Background batch producer.
///
/// Lifecycle is `new` → `start` → `get_batch`* → `stop`. Dropping the queue
/// stops it, so workers never outlive their owner.
pub struct PrefetchQueue {
    source: Arc<PatchSource>,
    config: PrefetchConfig,
    sampler: Arc<Mutex<IndexSampler>>,
    receiver: Option<Receiver<Message>>,
    workers: Vec<JoinHandle<()>>,
    stop_flag: Arc<AtomicBool>,
}

impl PrefetchQueue {
    pub fn new(source: Arc<PatchSource>, config: PrefetchConfig) -> Self {
        let sampler = IndexSampler::new(source.len(), config.batch_size, config.shuffle, config.seed);
        PrefetchQueue {
            source,
            config,
            sampler: Arc::new(Mutex::new(sampler)),
            receiver: None,
            workers: Vec::new(),
            stop_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start, run `f`, then stop, even if `f` returns early with an error.
    pub fn scoped<R>(
        source: Arc<PatchSource>,
        config: PrefetchConfig,
        f: impl FnOnce(&mut PrefetchQueue) -> R,
    ) -> R {
        let mut queue = PrefetchQueue::new(source, config);
        queue.start();
        let result = f(&mut queue);
        queue.stop();
        result
    }

    /// Spawn the workers. Calling `start` on a running queue does nothing.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        self.stop_flag.store(false, Ordering::SeqCst);
        let (tx, rx) = sync_channel(self.config.max_queue_size.max(1));
        let workers = self.config.workers.max(1);

        for worker_id in 0..workers {
            let worker = Worker {
                id: worker_id,
                source: Arc::clone(&self.source),
                sampler: Arc::clone(&self.sampler),
                stop_flag: Arc::clone(&self.stop_flag),
                policy: self.config.failure_policy,
                rng: StdRng::seed_from_u64(
                    self.config.seed.wrapping_add(worker_id as u64 + 1),
                ),
                tx: tx.clone(),
            };
            self.workers.push(thread::spawn(move || worker.run()));
        }
        self.receiver = Some(rx);
        debug!(
            "prefetch queue started: {} worker(s), capacity {}, batch size {}",
            workers, self.config.max_queue_size, self.config.batch_size
        );
    }

    pub fn is_running(&self) -> bool {
        self.receiver.is_some()
    }

    /// Next ready batch, waiting at most the configured timeout.
    pub fn get_batch(&mut self) -> Result<Batch, QueueError> {
        self.receive(self.config.timeout)
    }

    pub fn get_batch_timeout(&mut self, timeout: Duration) -> Result<Batch, QueueError> {
        self.receive(Some(timeout))
    }

    fn receive(&mut self, timeout: Option<Duration>) -> Result<Batch, QueueError> {
        let rx = self.receiver.as_ref().ok_or(QueueError::NotStarted)?;
        let message = match timeout {
            None => rx.recv().map_err(|_| QueueError::Closed)?,
            Some(t) => match rx.recv_timeout(t) {
                Ok(message) => message,
                Err(RecvTimeoutError::Timeout) => return Err(QueueError::Timeout(t)),
                Err(RecvTimeoutError::Disconnected) => return Err(QueueError::Closed),
            },
        };
        match message {
            Ok(batch) => Ok(batch),
            Err(err) => {
                // one fatal error shuts the whole queue down
                self.stop();
                Err(QueueError::Worker(err))
            }
        }
    }

    /// Signal workers, release any blocked on a full channel, and join them.
    /// Idempotent.
    pub fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if self.receiver.take().is_none() && self.workers.is_empty() {
            return;
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("prefetch worker panicked");
            }
        }
        debug!("prefetch queue stopped");
    }

    /// Batches drawn from the sampler so far, including ones still queued
    /// or being built.
    pub fn batches_dispatched(&self) -> usize {
        self.sampler
            .lock()
            .map(|sampler| sampler.batches_issued())
            .unwrap_or(0)
    }

    pub fn capacity(&self) -> usize {
        self.config.max_queue_size.max(1)
    }
}

impl BatchSource for PrefetchQueue {
    fn next_batch(&mut self) -> Result<Batch, QueueError> {
        self.get_batch()
    }
}

impl Drop for PrefetchQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    id: usize,
    source: Arc<PatchSource>,
    sampler: Arc<Mutex<IndexSampler>>,
    stop_flag: Arc<AtomicBool>,
    policy: FailurePolicy,
    rng: StdRng,
    tx: SyncSender<Message>,
}

impl Worker {
    fn run(mut self) {
        while !self.stop_flag.load(Ordering::SeqCst) {
            let indices = {
                let Ok(mut sampler) = self.sampler.lock() else {
                    break;
                };
                match sampler.next_batch() {
                    Some(indices) => indices,
                    None => break,
                }
            };

            let message = self.build_batch(&indices);
            let failed = message.is_err();
            // send only fails once the receiver is gone
            if self.tx.send(message).is_err() || failed {
                break;
            }
        }
        debug!("prefetch worker {} exiting", self.id);
    }

    fn build_batch(&mut self, indices: &[usize]) -> Message {
        let mut samples = Vec::with_capacity(indices.len());
        for &index in indices {
            samples.push(self.load_sample(index)?);
        }
        Batch::from_samples(&samples).ok_or(DataError::IndexOutOfRange {
            index: 0,
            len: self.source.len(),
        })
    }

    fn load_sample(&mut self, index: usize) -> Result<Sample, DataError> {
        let max_attempts = match self.policy {
            FailurePolicy::Fatal => return self.source.get_with_rng(index, &mut self.rng),
            FailurePolicy::Retry { max_attempts } => max_attempts.max(1),
        };
        let mut candidate = index;
        let mut attempt = 1;
        loop {
            match self.source.get_with_rng(candidate, &mut self.rng) {
                Ok(sample) => return Ok(sample),
                Err(err) if attempt < max_attempts => {
                    let replacement = self.rng.random_range(0..self.source.len());
                    warn!(
                        "worker {}: skipping sample {} ({}), retrying with {} [{}/{}]",
                        self.id, candidate, err, replacement, attempt, max_attempts
                    );
                    candidate = replacement;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
