//! Rolling byte counters for one connection.
//!
//! Mutation happens only on the owning connection context (record + roll);
//! any thread may read. Counters are plain atomics so a reader holding an
//! `Arc<TrafficCounter>` never blocks the writer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Byte accounting over fixed windows of `check_interval`.
///
/// `current_*` accumulates the window in progress; on [`roll`](Self::roll)
/// it moves into `last_window_*` and restarts from zero. The reported rate is
/// therefore one window old by construction.
#[derive(Debug)]
pub struct TrafficCounter {
    check_interval: Duration,
    cumulative_written: AtomicU64,
    cumulative_read: AtomicU64,
    current_written: AtomicU64,
    current_read: AtomicU64,
    last_window_written: AtomicU64,
    last_window_read: AtomicU64,
    completed_windows: AtomicU64,
}

impl TrafficCounter {
    pub fn new(check_interval: Duration) -> Self {
        Self {
            check_interval,
            cumulative_written: AtomicU64::new(0),
            cumulative_read: AtomicU64::new(0),
            current_written: AtomicU64::new(0),
            current_read: AtomicU64::new(0),
            last_window_written: AtomicU64::new(0),
            last_window_read: AtomicU64::new(0),
            completed_windows: AtomicU64::new(0),
        }
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    pub fn record_write(&self, n: u64) {
        self.current_written.fetch_add(n, Ordering::Relaxed);
        self.cumulative_written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_read(&self, n: u64) {
        self.current_read.fetch_add(n, Ordering::Relaxed);
        self.cumulative_read.fetch_add(n, Ordering::Relaxed);
    }

    /// Close the current window.
    pub fn roll(&self) {
        let written = self.current_written.swap(0, Ordering::Relaxed);
        let read = self.current_read.swap(0, Ordering::Relaxed);
        self.last_window_written.store(written, Ordering::Relaxed);
        self.last_window_read.store(read, Ordering::Relaxed);
        self.completed_windows.fetch_add(1, Ordering::Release);
    }

    /// Bytes written so far in the window in progress.
    pub fn current_window_written(&self) -> u64 {
        self.current_written.load(Ordering::Relaxed)
    }

    pub fn current_window_read(&self) -> u64 {
        self.current_read.load(Ordering::Relaxed)
    }

    pub fn last_window_written(&self) -> u64 {
        self.last_window_written.load(Ordering::Relaxed)
    }

    pub fn last_window_read(&self) -> u64 {
        self.last_window_read.load(Ordering::Relaxed)
    }

    pub fn cumulative_written(&self) -> u64 {
        self.cumulative_written.load(Ordering::Relaxed)
    }

    pub fn cumulative_read(&self) -> u64 {
        self.cumulative_read.load(Ordering::Relaxed)
    }

    pub fn completed_windows(&self) -> u64 {
        self.completed_windows.load(Ordering::Acquire)
    }

    /// Outbound rate of the last completed window in bytes/s.
    /// `None` until the first window has completed.
    pub fn current_write_rate(&self) -> Option<u64> {
        if self.completed_windows() == 0 {
            return None;
        }
        Some(self.per_second(self.last_window_written()))
    }

    /// Inbound rate of the last completed window in bytes/s.
    pub fn current_read_rate(&self) -> Option<u64> {
        if self.completed_windows() == 0 {
            return None;
        }
        Some(self.per_second(self.last_window_read()))
    }

    fn per_second(&self, bytes: u64) -> u64 {
        let ms = self.check_interval.as_millis().max(1);
        let rate = u128::from(bytes) * 1000 / ms;
        u64::try_from(rate).unwrap_or(u64::MAX)
    }
}
