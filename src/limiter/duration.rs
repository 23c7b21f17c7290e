//! Duration-accounting rate limiter algorithms.
//!
//! Admission-rate limiters only meter starts. The duration variants track
//! each operation from `start_operation` to `end_operation`, so what is
//! enforced is occupancy over time: an operation holds its slot while it
//! runs (and, for the sliding window, for a full window after it ends).

use std::time::{Duration, Instant};

/// Identifies one in-flight operation on a duration limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationId(pub(crate) u64);

pub(crate) trait DurationAlgorithm: Send {
    /// Admits an operation if capacity allows, returning its id.
    fn try_start(&mut self) -> Option<OperationId>;

    /// Marks the operation finished.
    fn end(&mut self, id: OperationId);

    /// Periodic replenishment.
    fn update(&mut self);

    /// Time until the next `update` is due.
    fn next_update(&self) -> Duration;
}

/// Fixed window over occupancy: an operation counts against every window
/// it overlaps. At each window roll the counter restarts at the number of
/// operations still in flight.
pub(crate) struct FixedWindowDuration {
    max: u64,
    window: Duration,
    window_end: Instant,
    counted: u64,
    running: u64,
    next_id: u64,
}

impl FixedWindowDuration {
    pub(crate) fn new(max: u64, window: Duration) -> Self {
        Self {
            max,
            window,
            window_end: Instant::now() + window,
            counted: 0,
            running: 0,
            next_id: 0,
        }
    }
}

impl DurationAlgorithm for FixedWindowDuration {
    fn try_start(&mut self) -> Option<OperationId> {
        if self.counted >= self.max {
            return None;
        }
        self.counted += 1;
        self.running += 1;
        self.next_id += 1;
        Some(OperationId(self.next_id))
    }

    fn end(&mut self, _id: OperationId) {
        self.running = self.running.saturating_sub(1);
    }

    fn update(&mut self) {
        // Operations still running carry into the new window.
        self.counted = self.running;
        let now = Instant::now();
        while self.window_end <= now {
            self.window_end += self.window;
        }
    }

    fn next_update(&self) -> Duration {
        self.window_end.saturating_duration_since(Instant::now())
    }
}

struct SlidingEntry {
    id: OperationId,
    finished_at: Option<Instant>,
}

/// Sliding window over occupancy: an operation holds its slot while it
/// runs and for `window` after it finishes.
pub(crate) struct SlidingWindowDuration {
    max: u64,
    window: Duration,
    entries: Vec<SlidingEntry>,
    next_id: u64,
}

impl SlidingWindowDuration {
    pub(crate) fn new(max: u64, window: Duration) -> Self {
        Self {
            max,
            window,
            entries: Vec::new(),
            next_id: 0,
        }
    }

    fn prune(&mut self) {
        let now = Instant::now();
        let window = self.window;
        self.entries.retain(|entry| match entry.finished_at {
            Some(finished) => now.saturating_duration_since(finished) < window,
            None => true,
        });
    }
}

impl DurationAlgorithm for SlidingWindowDuration {
    fn try_start(&mut self) -> Option<OperationId> {
        self.prune();
        if (self.entries.len() as u64) >= self.max {
            return None;
        }
        self.next_id += 1;
        let id = OperationId(self.next_id);
        self.entries.push(SlidingEntry {
            id,
            finished_at: None,
        });
        Some(id)
    }

    fn end(&mut self, id: OperationId) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) {
            entry.finished_at = Some(Instant::now());
        }
    }

    fn update(&mut self) {
        self.prune();
    }

    fn next_update(&self) -> Duration {
        let now = Instant::now();
        self.entries
            .iter()
            .filter_map(|e| e.finished_at)
            .map(|finished| (finished + self.window).saturating_duration_since(now))
            .min()
            .unwrap_or(self.window)
    }
}

/// Leaky bucket over occupancy: each start fills the bucket by one; each
/// update leaks one *completed* operation. In-flight operations never
/// leak, so the bucket level also bounds concurrency.
pub(crate) struct LeakyBucketDuration {
    max: u64,
    leak_interval: Duration,
    level: u64,
    running: u64,
    next_id: u64,
}

impl LeakyBucketDuration {
    pub(crate) fn new(max: u64, leak_interval: Duration) -> Self {
        Self {
            max,
            leak_interval,
            level: 0,
            running: 0,
            next_id: 0,
        }
    }
}

impl DurationAlgorithm for LeakyBucketDuration {
    fn try_start(&mut self) -> Option<OperationId> {
        if self.level >= self.max {
            return None;
        }
        self.level += 1;
        self.running += 1;
        self.next_id += 1;
        Some(OperationId(self.next_id))
    }

    fn end(&mut self, _id: OperationId) {
        self.running = self.running.saturating_sub(1);
    }

    fn update(&mut self) {
        if self.level > self.running {
            self.level -= 1;
        }
    }

    fn next_update(&self) -> Duration {
        self.leak_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_window_carries_running_operations() {
        let mut alg = FixedWindowDuration::new(2, Duration::from_millis(50));
        let a = alg.try_start().expect("room");
        let _b = alg.try_start().expect("room");
        assert!(alg.try_start().is_none());

        alg.end(a);
        // Still within the window: the finished operation keeps counting.
        assert!(alg.try_start().is_none());

        alg.update();
        // One operation carried over, one slot free.
        assert!(alg.try_start().is_some());
        assert!(alg.try_start().is_none());
    }

    #[test]
    fn sliding_window_holds_slots_past_completion() {
        let mut alg = SlidingWindowDuration::new(1, Duration::from_millis(30));
        let a = alg.try_start().expect("room");
        alg.end(a);
        assert!(alg.try_start().is_none());
        std::thread::sleep(Duration::from_millis(40));
        assert!(alg.try_start().is_some());
    }

    #[test]
    fn leaky_bucket_never_leaks_in_flight() {
        let mut alg = LeakyBucketDuration::new(2, Duration::from_millis(10));
        let a = alg.try_start().expect("room");
        let _b = alg.try_start().expect("room");
        assert!(alg.try_start().is_none());

        // Leaking cannot free slots held by running operations.
        alg.update();
        alg.update();
        assert!(alg.try_start().is_none());

        alg.end(a);
        alg.update();
        assert!(alg.try_start().is_some());
    }
}
