//! Rate limiters built on scoped forks.
//!
//! A limiter owns an algorithm behind a lock and a background daemon fork
//! that sleeps until the algorithm's next replenishment is due, applies
//! it, and wakes every parked acquirer. The fork is scope-bounded: when
//! the owning scope ends, the fork is interrupted and the limiter stops
//! replenishing.
//!
//! [`RateLimiter`] meters admission rate; [`DurationRateLimiter`]
//! additionally tracks each operation from start to end, enforcing
//! occupancy over time rather than just starts.
//!
//! # Example
//!
//! ```ignore
//! supervised(|scope| {
//!     let limiter = RateLimiter::fixed_rate(scope, 100, Duration::from_secs(1));
//!     limiter.run(|| call_downstream())?;
//!     Ok(())
//! })?;
//! ```

mod algorithm;
mod duration;

pub use duration::OperationId;

use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::Thread;
use std::time::Duration;

use crate::error::Result;
use crate::park;
use crate::scope::Scope;
use crate::time;
use crate::tracing_compat::trace;

use algorithm::{AdmissionAlgorithm, FixedWindow, RefillBucket, SlidingWindow};
use duration::{
    DurationAlgorithm, FixedWindowDuration, LeakyBucketDuration, SlidingWindowDuration,
};

struct AdmissionCore {
    algorithm: Mutex<Box<dyn AdmissionAlgorithm>>,
    waiters: Mutex<Vec<Thread>>,
}

impl AdmissionCore {
    fn replenish(&self) {
        self.algorithm.lock().update();
        trace!("rate limiter replenished");
        for waiter in self.waiters.lock().drain(..) {
            waiter.unpark();
        }
    }
}

/// An admission-rate limiter with a scope-bounded replenisher fork.
pub struct RateLimiter {
    core: Arc<AdmissionCore>,
}

impl RateLimiter {
    fn start(scope: &Scope, algorithm: Box<dyn AdmissionAlgorithm>) -> Self {
        let core = Arc::new(AdmissionCore {
            algorithm: Mutex::new(algorithm),
            waiters: Mutex::new(Vec::new()),
        });
        let worker = Arc::clone(&core);
        scope.fork(move |_: &Scope| -> Result<()> {
            loop {
                let pause = worker.algorithm.lock().next_update();
                time::sleep(pause)?;
                worker.replenish();
            }
        });
        Self { core }
    }

    /// At most `max` admissions per fixed `window`.
    #[must_use]
    pub fn fixed_rate(scope: &Scope, max: u64, window: Duration) -> Self {
        Self::start(scope, Box::new(FixedWindow::new(max, window)))
    }

    /// At most `max` admissions in any sliding interval of length `window`.
    #[must_use]
    pub fn sliding_window(scope: &Scope, max: u64, window: Duration) -> Self {
        Self::start(scope, Box::new(SlidingWindow::new(max, window)))
    }

    /// Token bucket holding up to `max` tokens, refilling one per
    /// `refill_interval`.
    #[must_use]
    pub fn bucket(scope: &Scope, max: u64, refill_interval: Duration) -> Self {
        Self::start(scope, Box::new(RefillBucket::new(max, refill_interval)))
    }

    /// Admits one operation if capacity allows, without blocking.
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        self.core.algorithm.lock().try_acquire()
    }

    /// Blocks until admitted.
    pub fn acquire(&self) -> Result<()> {
        let carrier = park::current_carrier();
        loop {
            if self.try_acquire() {
                return Ok(());
            }
            self.core.waiters.lock().push(std::thread::current());
            // Recheck after registering so an update between the failed
            // try and the registration cannot strand us parked.
            if self.try_acquire() {
                return Ok(());
            }
            carrier.check()?;
            std::thread::park();
        }
    }

    /// Acquires, then runs `op`.
    pub fn run<R>(&self, op: impl FnOnce() -> R) -> Result<R> {
        self.acquire()?;
        Ok(op())
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").finish_non_exhaustive()
    }
}

struct DurationCore {
    algorithm: Mutex<Box<dyn DurationAlgorithm>>,
    waiters: Mutex<Vec<Thread>>,
}

impl DurationCore {
    fn replenish(&self) {
        self.algorithm.lock().update();
        trace!("duration rate limiter replenished");
        for waiter in self.waiters.lock().drain(..) {
            waiter.unpark();
        }
    }
}

/// A rate limiter that accounts for operation duration and concurrency,
/// not just admission.
pub struct DurationRateLimiter {
    core: Arc<DurationCore>,
}

impl DurationRateLimiter {
    fn start(scope: &Scope, algorithm: Box<dyn DurationAlgorithm>) -> Self {
        let core = Arc::new(DurationCore {
            algorithm: Mutex::new(algorithm),
            waiters: Mutex::new(Vec::new()),
        });
        let worker = Arc::clone(&core);
        scope.fork(move |_: &Scope| -> Result<()> {
            loop {
                let pause = worker.algorithm.lock().next_update();
                time::sleep(pause)?;
                worker.replenish();
            }
        });
        Self { core }
    }

    /// Fixed-window occupancy: an operation counts against every window
    /// it overlaps.
    #[must_use]
    pub fn fixed_window(scope: &Scope, max: u64, window: Duration) -> Self {
        Self::start(scope, Box::new(FixedWindowDuration::new(max, window)))
    }

    /// Sliding-window occupancy: a slot is held while the operation runs
    /// and for `window` after it finishes.
    #[must_use]
    pub fn sliding_window(scope: &Scope, max: u64, window: Duration) -> Self {
        Self::start(scope, Box::new(SlidingWindowDuration::new(max, window)))
    }

    /// Leaky bucket that leaks only completed operations, bounding both
    /// rate and concurrency at `max`.
    #[must_use]
    pub fn leaky_bucket(scope: &Scope, max: u64, leak_interval: Duration) -> Self {
        Self::start(scope, Box::new(LeakyBucketDuration::new(max, leak_interval)))
    }

    /// Admits an operation if capacity allows, without blocking.
    #[must_use]
    pub fn try_start_operation(&self) -> Option<OperationId> {
        self.core.algorithm.lock().try_start()
    }

    /// Blocks until admitted; the returned id must be passed to
    /// [`DurationRateLimiter::end_operation`].
    pub fn start_operation(&self) -> Result<OperationId> {
        let carrier = park::current_carrier();
        loop {
            if let Some(id) = self.core.algorithm.lock().try_start() {
                return Ok(id);
            }
            self.core.waiters.lock().push(std::thread::current());
            if let Some(id) = self.core.algorithm.lock().try_start() {
                return Ok(id);
            }
            carrier.check()?;
            std::thread::park();
        }
    }

    /// Marks an admitted operation finished.
    pub fn end_operation(&self, id: OperationId) {
        self.core.algorithm.lock().end(id);
    }

    /// Brackets `op` between `start_operation` and `end_operation`; the
    /// operation is marked finished even if it panics.
    pub fn run<R>(&self, op: impl FnOnce() -> R) -> Result<R> {
        let id = self.start_operation()?;
        let guard = OperationGuard { limiter: self, id };
        let result = op();
        drop(guard);
        Ok(result)
    }
}

impl std::fmt::Debug for DurationRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurationRateLimiter").finish_non_exhaustive()
    }
}

struct OperationGuard<'a> {
    limiter: &'a DurationRateLimiter,
    id: OperationId,
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.limiter.end_operation(self.id);
    }
}
