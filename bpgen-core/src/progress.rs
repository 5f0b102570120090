use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, Instant};
use tracing::info;

/// Counters shared between a running generation and whoever watches it.
/// Cloning yields another handle onto the same counters.
#[derive(Clone)]
pub struct Progress {
    pub bytes_processed: Arc<AtomicU64>,
    pub new_chunks: Arc<AtomicU64>,
    pub known_chunks: Arc<AtomicU64>,
    pub files_processed: Arc<AtomicU64>,
    started: Instant,
    interval: Duration,
    last_log_ms: Arc<AtomicU64>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub bytes_processed: u64,
    pub new_chunks: u64,
    pub known_chunks: u64,
    pub files_processed: u64,
}

impl Progress {
    /// `interval` of zero disables the periodic log line.
    pub fn new(interval: Duration) -> Self {
        Self {
            bytes_processed: Arc::new(AtomicU64::new(0)),
            new_chunks: Arc::new(AtomicU64::new(0)),
            known_chunks: Arc::new(AtomicU64::new(0)),
            files_processed: Arc::new(AtomicU64::new(0)),
            started: Instant::now(),
            interval,
            last_log_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes_processed.fetch_add(n, Ordering::Relaxed);
    }
    pub fn inc_new(&self) {
        self.new_chunks.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_known(&self) {
        self.known_chunks.fetch_add(1, Ordering::Relaxed);
    }
    pub fn inc_files(&self) {
        self.files_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn new_chunks(&self) -> u64 {
        self.new_chunks.load(Ordering::Relaxed)
    }

    pub fn known_chunks(&self) -> u64 {
        self.known_chunks.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            bytes_processed: self.bytes_processed.load(Ordering::Relaxed),
            new_chunks: self.new_chunks(),
            known_chunks: self.known_chunks(),
            files_processed: self.files_processed.load(Ordering::Relaxed),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Log a progress line if the interval has passed since the last one.
    pub fn maybe_log(&self, label: &str) {
        if self.interval.is_zero() {
            return;
        }
        let now_ms = self.started.elapsed().as_millis() as u64;
        let last = self.last_log_ms.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) < self.interval.as_millis() as u64 {
            return;
        }
        if self
            .last_log_ms
            .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        let s = self.snapshot();
        info!(
            "[{:>4}s] {} | {} MiB | files {} | chunks new {} known {}",
            now_ms / 1000,
            label,
            s.bytes_processed >> 20,
            s.files_processed,
            s.new_chunks,
            s.known_chunks
        );
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}
