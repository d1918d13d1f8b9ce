use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Rolling step timings for the training loops.
///
/// Separates time spent waiting on the batch queue from time spent inside
/// the model, so a starved accelerator shows up in the logs.
pub struct TimingMetrics {
    wait_micros: VecDeque<u64>, // blocked in next_batch
    step_micros: VecDeque<u64>, // inside train_on_batch / predict
    capacity: usize,
    run_start: Instant,
    window_start: Instant,
    window_count: usize,
    window_overhead: Duration, // validation/snapshot/checkpoint, excluded from throughput
}

impl TimingMetrics {
    pub fn with_capacity(capacity: usize) -> Self {
        let now = Instant::now();
        TimingMetrics {
            wait_micros: VecDeque::with_capacity(capacity),
            step_micros: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            run_start: now,
            window_start: now,
            window_count: 0,
            window_overhead: Duration::ZERO,
        }
    }

    pub fn new() -> Self {
        Self::with_capacity(100)
    }

    fn push(buf: &mut VecDeque<u64>, capacity: usize, d: Duration) {
        buf.push_back(d.as_micros() as u64);
        if buf.len() > capacity {
            buf.pop_front();
        }
    }

    pub fn record_wait(&mut self, d: Duration) {
        Self::push(&mut self.wait_micros, self.capacity, d);
    }

    /// Record one model step; each call counts toward throughput.
    pub fn record_step(&mut self, d: Duration) {
        Self::push(&mut self.step_micros, self.capacity, d);
        self.window_count += 1;
    }

    pub fn record_overhead(&mut self, d: Duration) {
        self.window_overhead += d;
    }

    fn mean_ms(buf: &VecDeque<u64>) -> f32 {
        if buf.is_empty() {
            return 0.0;
        }
        let mean = buf.iter().map(|&v| v as f64).sum::<f64>() / buf.len() as f64;
        (mean / 1000.0) as f32
    }

    pub fn avg_wait_ms(&self) -> f32 {
        Self::mean_ms(&self.wait_micros)
    }

    pub fn avg_step_ms(&self) -> f32 {
        Self::mean_ms(&self.step_micros)
    }

    /// Steps per second since the last `reset_window`, minus overhead.
    pub fn steps_per_sec(&self) -> f32 {
        let elapsed = self
            .window_start
            .elapsed()
            .saturating_sub(self.window_overhead)
            .as_secs_f32();
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.window_count as f32 / elapsed
    }

    /// Wall time since the loop started.
    pub fn elapsed(&self) -> Duration {
        self.run_start.elapsed()
    }

    pub fn window_elapsed(&self) -> Duration {
        self.window_start.elapsed()
    }

    pub fn reset_window(&mut self) {
        self.window_start = Instant::now();
        self.window_count = 0;
        self.window_overhead = Duration::ZERO;
    }
}

impl Default for TimingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Time a closure, returning its result and the elapsed wall time.
pub fn timed<T>(f: impl FnOnce() -> T) -> (T, Duration) {
    let start = Instant::now();
    let out = f();
    (out, start.elapsed())
}
