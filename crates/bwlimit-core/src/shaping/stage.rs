//! Outbound write shaper.
//!
//! Admission rule for a write of `len` bytes while the stage has a write limit:
//! - the queue must be empty (writes are never reordered), and
//! - the window must have room: `used + len <= quota`, where
//!   `quota = write_limit * check_interval`.
//!
//! An empty window always admits its first write, whatever its size, so a
//! single write larger than the quota cannot stall the connection. That is the
//! only overshoot: one write per window.
//!
//! Writes that are not admitted wait in a FIFO queue and are charged to the
//! counter when they are released, never at enqueue time. Releases happen on
//! [`ShapingStage::tick`], which the owner calls at [`ShapingStage::next_tick`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{BwError, Result};
use crate::shaping::TrafficCounter;

#[derive(Debug)]
struct Pending<T> {
    item: T,
    len: u64,
    enqueued_at: Instant,
}

/// A queued write handed back by [`ShapingStage::tick`].
#[derive(Debug)]
pub struct Released<T> {
    pub item: T,
    /// Time spent in the queue.
    pub waited: Duration,
}

/// Per-connection shaper. `0` in either limit means unlimited.
#[derive(Debug)]
pub struct ShapingStage<T> {
    write_limit: u64,
    read_limit: u64,
    check_interval: Duration,
    window_start: Instant,
    counter: Arc<TrafficCounter>,
    queue: VecDeque<Pending<T>>,
    queued_bytes: u64,
}

impl<T> ShapingStage<T> {
    pub fn new(write_limit: u64, read_limit: u64, check_interval: Duration, now: Instant) -> Result<Self> {
        if check_interval.is_zero() {
            return Err(BwError::InvalidArgument("check interval must be greater than 0".into()));
        }
        Ok(Self {
            write_limit,
            read_limit,
            check_interval,
            window_start: now,
            counter: Arc::new(TrafficCounter::new(check_interval)),
            queue: VecDeque::new(),
            queued_bytes: 0,
        })
    }

    /// Shared handle on this stage's counter (readable from any thread).
    pub fn counter(&self) -> Arc<TrafficCounter> {
        Arc::clone(&self.counter)
    }

    pub fn write_limit(&self) -> u64 {
        self.write_limit
    }

    pub fn read_limit(&self) -> u64 {
        self.read_limit
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Replace the write limit. Queued writes see it on the next tick.
    pub fn set_write_limit(&mut self, limit: u64) {
        self.write_limit = limit;
    }

    pub fn set_read_limit(&mut self, limit: u64) {
        self.read_limit = limit;
    }

    pub fn queued_len(&self) -> usize {
        self.queue.len()
    }

    pub fn queued_bytes(&self) -> u64 {
        self.queued_bytes
    }

    /// End of the window in progress.
    pub fn next_tick(&self) -> Instant {
        self.window_start + self.check_interval
    }

    /// Bytes the window may carry under `limit`, `None` when unlimited.
    fn window_quota(&self, limit: u64) -> Option<u64> {
        if limit == 0 {
            return None;
        }
        let ms = self.check_interval.as_millis().max(1);
        let quota = u128::from(limit) * ms / 1000;
        Some(u64::try_from(quota).unwrap_or(u64::MAX).max(1))
    }

    fn admits_write(&self, len: u64) -> bool {
        match self.window_quota(self.write_limit) {
            None => true,
            Some(quota) => {
                let used = self.counter.current_window_written();
                used == 0 || used.saturating_add(len) <= quota
            }
        }
    }

    /// Offer a write of `len` bytes.
    ///
    /// Returns the item when it may go out now (already charged to the
    /// counter); `None` when it was queued behind the window boundary.
    pub fn submit(&mut self, item: T, len: u64, now: Instant) -> Option<T> {
        if self.queue.is_empty() && self.admits_write(len) {
            self.counter.record_write(len);
            return Some(item);
        }
        self.queued_bytes = self.queued_bytes.saturating_add(len);
        self.queue.push_back(Pending {
            item,
            len,
            enqueued_at: now,
        });
        None
    }

    /// Window timer. Rolls the counter once the boundary is reached and
    /// releases as many queued writes, in order, as the new window admits.
    pub fn tick(&mut self, now: Instant) -> Vec<Released<T>> {
        let boundary = self.next_tick();
        if now >= boundary {
            self.counter.roll();
            // A timer that fired more than a whole window late restarts the cadence.
            self.window_start = if now.saturating_duration_since(boundary) >= self.check_interval {
                now
            } else {
                boundary
            };
        }
        let released = self.release(now);
        if !released.is_empty() {
            tracing::trace!(
                released = released.len(),
                still_queued = self.queue.len(),
                "shaping window released queued writes"
            );
        }
        released
    }

    fn release(&mut self, now: Instant) -> Vec<Released<T>> {
        let mut out = Vec::new();
        while let Some(head) = self.queue.front() {
            if !self.admits_write(head.len) {
                break;
            }
            let Some(p) = self.queue.pop_front() else { break };
            self.queued_bytes = self.queued_bytes.saturating_sub(p.len);
            self.counter.record_write(p.len);
            out.push(Released {
                item: p.item,
                waited: now.saturating_duration_since(p.enqueued_at),
            });
        }
        out
    }

    /// Account `len` inbound bytes and return how long the reader should pause.
    pub fn record_read(&mut self, len: u64, now: Instant) -> Duration {
        let used = self.counter.current_window_read();
        self.counter.record_read(len);
        match self.window_quota(self.read_limit) {
            Some(quota) if used > 0 && used.saturating_add(len) > quota => {
                self.next_tick().saturating_duration_since(now)
            }
            _ => Duration::ZERO,
        }
    }

    /// Remove every queued write, oldest first (used when the stage is detached).
    pub fn take_pending(&mut self) -> Vec<T> {
        self.queued_bytes = 0;
        self.queue.drain(..).map(|p| p.item).collect()
    }
}
