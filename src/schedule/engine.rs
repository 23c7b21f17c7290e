//! The schedule engine: drives repeated attempts of an operation.
//!
//! [`scheduled_with_error_mode`] is the single loop under `retry`,
//! `repeat` and the adaptive variants. Per attempt it runs the operation,
//! classifies the outcome through the scope's [`ErrorMode`], consults the
//! `after_attempt` hook, and sleeps according to the schedule before
//! looping. Failures are never thrown out of the loop: the last outcome is
//! returned unchanged in the mode's container. Only carrier interruption
//! (during the inter-attempt sleep) aborts the engine itself.

use std::time::{Duration, Instant};

use crate::error::Result;
use crate::schedule::Schedule;
use crate::scope::ErrorMode;
use crate::time;
use crate::tracing_compat::trace;
use crate::util::DetRng;

/// How the inter-attempt delay is slept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SleepMode {
    /// Sleep the full delay between the end of one attempt and the start
    /// of the next.
    #[default]
    Delay,
    /// Pace attempts to the delay interval: the sleep is reduced by how
    /// long the attempt itself took.
    Interval,
}

/// Verdict of the `after_attempt` hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleDecision {
    /// Keep going (subject to the schedule's own budget).
    Continue,
    /// Return the last outcome now.
    Stop,
}

impl ScheduleDecision {
    /// `Continue` when the flag holds, `Stop` otherwise.
    #[must_use]
    pub fn from_bool(keep_going: bool) -> Self {
        if keep_going {
            Self::Continue
        } else {
            Self::Stop
        }
    }
}

/// Hook invoked after each attempt with the attempt number (1-based) and a
/// view of the outcome.
pub type AfterAttempt<E, T> =
    Box<dyn FnMut(u64, core::result::Result<&T, &E>) -> ScheduleDecision + Send>;

/// Configuration for one engine run.
pub struct ScheduledConfig<E, T> {
    /// Delays between attempts.
    pub schedule: Schedule,
    /// How delays are slept.
    pub sleep_mode: SleepMode,
    /// Per-attempt hook deciding whether to keep going.
    pub after_attempt: AfterAttempt<E, T>,
}

impl<E, T> ScheduledConfig<E, T> {
    /// A config that runs the schedule to exhaustion.
    #[must_use]
    pub fn new(schedule: Schedule) -> Self {
        Self {
            schedule,
            sleep_mode: SleepMode::default(),
            after_attempt: Box::new(|_, _| ScheduleDecision::Continue),
        }
    }

    /// Sets the sleep mode.
    #[must_use]
    pub fn sleep_mode(mut self, mode: SleepMode) -> Self {
        self.sleep_mode = mode;
        self
    }

    /// Sets the per-attempt hook.
    #[must_use]
    pub fn after_attempt(mut self, hook: AfterAttempt<E, T>) -> Self {
        self.after_attempt = hook;
        self
    }
}

impl<E, T> std::fmt::Debug for ScheduledConfig<E, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledConfig")
            .field("schedule", &self.schedule)
            .field("sleep_mode", &self.sleep_mode)
            .finish_non_exhaustive()
    }
}

/// Runs `operation` repeatedly under `mode` until the hook or the schedule
/// stops it, returning the final outcome unchanged.
///
/// The outer `Result` fails only on carrier interruption.
pub fn scheduled_with_error_mode<M, E, T>(
    mode: &M,
    mut config: ScheduledConfig<E, T>,
    mut operation: impl FnMut() -> M::Container<T>,
) -> Result<M::Container<T>>
where
    M: ErrorMode<E>,
{
    let mut rng = DetRng::from_entropy();
    let mut attempt: u64 = 1;
    let mut last_delay: Option<Duration> = None;
    loop {
        let started = Instant::now();
        let outcome = operation();
        let elapsed = started.elapsed();

        let view: core::result::Result<&T, &E> = if mode.is_error(&outcome) {
            Err(mode.peek_error(&outcome))
        } else {
            Ok(mode.peek_value(&outcome))
        };
        if (config.after_attempt)(attempt, view) == ScheduleDecision::Stop {
            return Ok(outcome);
        }

        let Some(delay) = config.schedule.next_delay(attempt - 1, last_delay, &mut rng) else {
            return Ok(outcome);
        };
        let pause = match config.sleep_mode {
            SleepMode::Delay => delay,
            SleepMode::Interval => delay.saturating_sub(elapsed),
        };
        trace!(attempt, ?pause, "scheduling next attempt");
        time::sleep(pause)?;
        last_delay = Some(delay);
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scope::ResultMode;

    #[test]
    fn runs_schedule_to_exhaustion() {
        let mode = ResultMode::<&'static str>::new();
        let mut calls = 0;
        let outcome = scheduled_with_error_mode(
            &mode,
            ScheduledConfig::new(Schedule::immediate(4)),
            || {
                calls += 1;
                Err::<u32, _>("nope")
            },
        )
        .expect("not interrupted");
        assert_eq!(calls, 5);
        assert_eq!(outcome, Err("nope"));
    }

    #[test]
    fn hook_stop_short_circuits() {
        let mode = ResultMode::<&'static str>::new();
        let mut calls = 0;
        let outcome = scheduled_with_error_mode(
            &mode,
            ScheduledConfig::new(Schedule::immediate(100)).after_attempt(Box::new(
                |attempt, _| ScheduleDecision::from_bool(attempt < 3),
            )),
            || {
                calls += 1;
                Err::<u32, _>("nope")
            },
        )
        .expect("not interrupted");
        assert_eq!(calls, 3);
        assert_eq!(outcome, Err("nope"));
    }

    #[test]
    fn interval_mode_subtracts_attempt_time() {
        let mode = ResultMode::<&'static str>::new();
        let started = Instant::now();
        let mut calls = 0;
        let _ = scheduled_with_error_mode(
            &mode,
            ScheduledConfig::new(Schedule::delay(2, Duration::from_millis(40)))
                .sleep_mode(SleepMode::Interval),
            || {
                calls += 1;
                std::thread::sleep(Duration::from_millis(25));
                Err::<u32, _>("nope")
            },
        )
        .expect("not interrupted");
        assert_eq!(calls, 3);
        // Three 25 ms attempts paced to 40 ms intervals: ~105 ms, well
        // under the 195 ms a plain delay mode would take.
        assert!(started.elapsed() < Duration::from_millis(195));
    }
}
