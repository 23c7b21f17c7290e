//! Interruptible time primitives.
//!
//! [`sleep`] is the suspension point the schedule engine and rate limiters
//! pause on; it parks the carrier against a monotonic deadline and fails
//! fast with `ErrorKind::Interrupted` when the scope cancels the carrier.
//! [`timeout`] bounds an operation by running it in a cancellable fork.

use std::time::{Duration, Instant};

use crate::error::{Error, ErrorKind, Result};
use crate::park;
use crate::scope::Scope;

/// Parks the calling carrier for `duration`.
///
/// Returns `ErrorKind::Interrupted` as soon as the carrier is interrupted,
/// even mid-sleep. A zero duration still performs the interrupt check.
pub fn sleep(duration: Duration) -> Result<()> {
    let carrier = park::current_carrier();
    let deadline = Instant::now() + duration;
    loop {
        carrier.check()?;
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        std::thread::park_timeout(deadline - now);
    }
}

/// Runs `f` in a cancellable fork, cancelling it if `after` elapses first.
///
/// Returns the operation's outcome when it beats the deadline, and
/// `ErrorKind::DeadlineExceeded` when it does not. The cancelled fork is
/// interrupted and joined before this returns, so no work leaks past the
/// deadline beyond its next suspension point.
pub fn timeout<T, F>(scope: &Scope, after: Duration, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Scope) -> Result<T> + Send + 'static,
{
    let fork = scope.fork_cancellable(f);
    let deadline = Instant::now() + after;
    if fork.wait_done_until(deadline)? {
        return fork.join();
    }
    match fork.cancel() {
        // The operation raced the deadline and completed anyway.
        Ok(value) => Ok(value),
        Err(e) if e.is_interrupted() => Err(Error::new(ErrorKind::DeadlineExceeded)
            .with_context(format!("operation outlived {after:?}"))),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_waits_out_the_duration() {
        let started = Instant::now();
        sleep(Duration::from_millis(30)).expect("not interrupted");
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn zero_sleep_returns_immediately() {
        sleep(Duration::ZERO).expect("not interrupted");
    }

    #[test]
    fn interrupted_sleep_fails_fast() {
        let carrier = park::current_carrier();
        carrier.set();
        let err = sleep(Duration::from_secs(60)).expect_err("interrupted");
        assert!(err.is_interrupted());
        carrier.clear();
    }
}
