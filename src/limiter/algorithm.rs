//! Admission-rate algorithms.
//!
//! Each algorithm guards its own state behind the limiter's lock; the
//! limiter's background fork calls [`AdmissionAlgorithm::update`] every
//! [`AdmissionAlgorithm::next_update`], which is what replenishes
//! capacity. All three of `try_acquire`, `update` and `next_update` are
//! linearizable under that lock.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::schedule::TokenBucket;

pub(crate) trait AdmissionAlgorithm: Send {
    /// Admits one operation if capacity allows.
    fn try_acquire(&mut self) -> bool;

    /// Periodic replenishment, driven by the limiter's background fork.
    fn update(&mut self);

    /// Time until the next `update` is due.
    fn next_update(&self) -> Duration;
}

/// At most `max` admissions per fixed window; the counter resets at each
/// window boundary.
pub(crate) struct FixedWindow {
    max: u64,
    window: Duration,
    admitted: u64,
    window_end: Instant,
}

impl FixedWindow {
    pub(crate) fn new(max: u64, window: Duration) -> Self {
        Self {
            max,
            window,
            admitted: 0,
            window_end: Instant::now() + window,
        }
    }
}

impl AdmissionAlgorithm for FixedWindow {
    fn try_acquire(&mut self) -> bool {
        if self.admitted < self.max {
            self.admitted += 1;
            true
        } else {
            false
        }
    }

    fn update(&mut self) {
        self.admitted = 0;
        let now = Instant::now();
        while self.window_end <= now {
            self.window_end += self.window;
        }
    }

    fn next_update(&self) -> Duration {
        self.window_end.saturating_duration_since(Instant::now())
    }
}

/// At most `max` admissions in any sliding interval of length `window`,
/// tracked as a log of admission timestamps.
pub(crate) struct SlidingWindow {
    max: u64,
    window: Duration,
    log: VecDeque<Instant>,
}

impl SlidingWindow {
    pub(crate) fn new(max: u64, window: Duration) -> Self {
        Self {
            max,
            window,
            log: VecDeque::new(),
        }
    }

    fn prune(&mut self) {
        let now = Instant::now();
        while let Some(oldest) = self.log.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                self.log.pop_front();
            } else {
                break;
            }
        }
    }
}

impl AdmissionAlgorithm for SlidingWindow {
    fn try_acquire(&mut self) -> bool {
        self.prune();
        if (self.log.len() as u64) < self.max {
            self.log.push_back(Instant::now());
            true
        } else {
            false
        }
    }

    fn update(&mut self) {
        self.prune();
    }

    fn next_update(&self) -> Duration {
        self.log.front().map_or(self.window, |oldest| {
            (*oldest + self.window).saturating_duration_since(Instant::now())
        })
    }
}

/// Classic token bucket: one token per admission, one token back per
/// refill interval, up to `max`.
pub(crate) struct RefillBucket {
    tokens: TokenBucket,
    refill_interval: Duration,
}

impl RefillBucket {
    pub(crate) fn new(max: u64, refill_interval: Duration) -> Self {
        Self {
            tokens: TokenBucket::new(max),
            refill_interval,
        }
    }
}

impl AdmissionAlgorithm for RefillBucket {
    fn try_acquire(&mut self) -> bool {
        self.tokens.try_acquire(1)
    }

    fn update(&mut self) {
        self.tokens.release(1);
    }

    fn next_update(&self) -> Duration {
        self.refill_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_window_caps_then_resets() {
        let mut alg = FixedWindow::new(3, Duration::from_millis(50));
        for _ in 0..3 {
            assert!(alg.try_acquire());
        }
        assert!(!alg.try_acquire());
        alg.update();
        assert!(alg.try_acquire());
    }

    #[test]
    fn sliding_window_admits_as_entries_age_out() {
        let mut alg = SlidingWindow::new(2, Duration::from_millis(30));
        assert!(alg.try_acquire());
        assert!(alg.try_acquire());
        assert!(!alg.try_acquire());
        std::thread::sleep(Duration::from_millis(40));
        assert!(alg.try_acquire());
    }

    #[test]
    fn refill_bucket_restores_one_per_update() {
        let mut alg = RefillBucket::new(2, Duration::from_millis(10));
        assert!(alg.try_acquire());
        assert!(alg.try_acquire());
        assert!(!alg.try_acquire());
        alg.update();
        assert!(alg.try_acquire());
        // Updates never push the count past capacity.
        alg.update();
        alg.update();
        alg.update();
        assert!(alg.try_acquire());
        assert!(alg.try_acquire());
        assert!(!alg.try_acquire());
    }
}
