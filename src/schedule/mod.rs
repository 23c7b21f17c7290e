//! Schedules: immutable descriptions of inter-attempt delays.
//!
//! A [`Schedule`] answers one question: after a given retry, how long to
//! wait before the next attempt — or `None` to stop. Schedules compose:
//! [`Schedule::fallback_to`] chains a second schedule after the first's
//! retry budget is exhausted, and [`Schedule::forever`] cycles a finite
//! schedule endlessly, resetting it at each end.
//!
//! # Example
//!
//! ```ignore
//! // Three immediate retries, then two more spaced 100 ms apart.
//! let schedule = Schedule::immediate(3)
//!     .fallback_to(Schedule::delay(2, Duration::from_millis(100)));
//! assert_eq!(schedule.retries(), Some(5));
//! ```

mod adaptive;
mod engine;
mod retry;

pub use adaptive::{AdaptiveRetry, TokenBucket};
pub use engine::{
    scheduled_with_error_mode, AfterAttempt, ScheduleDecision, ScheduledConfig, SleepMode,
};
pub use retry::{
    repeat, retry, retry_with_error_mode, OnRetry, RepeatConfig, ResultPolicy, RetryConfig,
    RetryError,
};

use std::time::Duration;

use crate::util::DetRng;

/// Randomization applied to a computed delay.
///
/// Jitter spreads simultaneous retries apart so they do not arrive at a
/// recovering dependency in lockstep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
    /// Use the exact computed delay.
    #[default]
    None,
    /// Random delay in `[0, computed]`.
    Full,
    /// `computed / 2` plus a random half: preserves most of the backoff.
    Equal,
    /// Random delay in `[initial, 3 * previous]`, capped. Grows
    /// independently of the attempt number.
    Decorrelated,
}

impl Jitter {
    fn apply(
        self,
        computed: Duration,
        initial: Duration,
        last: Option<Duration>,
        cap: Option<Duration>,
        rng: &mut DetRng,
    ) -> Duration {
        let jittered = match self {
            Self::None => computed,
            Self::Full => computed.mul_f64(rng.next_f64()),
            Self::Equal => computed / 2 + (computed / 2).mul_f64(rng.next_f64()),
            Self::Decorrelated => {
                let prev = last.unwrap_or(initial);
                let upper = prev.saturating_mul(3).max(initial);
                initial + (upper - initial).mul_f64(rng.next_f64())
            }
        };
        match cap {
            Some(cap) => jittered.min(cap),
            None => jittered,
        }
    }
}

/// An immutable sequence of inter-attempt delays.
#[derive(Debug, Clone)]
pub enum Schedule {
    /// Up to `max_retries` retries with no delay.
    Immediate {
        /// How many retries before stopping.
        max_retries: u64,
    },
    /// Up to `max_retries` retries with a fixed delay.
    Delay {
        /// How many retries before stopping.
        max_retries: u64,
        /// Delay before each retry.
        delay: Duration,
    },
    /// Exponentially growing delays.
    Exponential {
        /// How many retries before stopping.
        max_retries: u64,
        /// Delay before the first retry.
        initial: Duration,
        /// Multiplicative growth factor per retry.
        factor: f64,
        /// Upper bound on any single delay.
        cap: Option<Duration>,
        /// Randomization of each delay.
        jitter: Jitter,
    },
    /// Cycles the inner schedule endlessly, resetting it at each end.
    Forever(Box<Schedule>),
    /// Emits the first schedule's delays until its retry budget is
    /// exhausted, then the second's.
    FallbackTo(Box<Schedule>, Box<Schedule>),
}

impl Schedule {
    /// Up to `max_retries` retries with no delay.
    #[must_use]
    pub const fn immediate(max_retries: u64) -> Self {
        Self::Immediate { max_retries }
    }

    /// Immediate retries without bound.
    #[must_use]
    pub fn immediate_forever() -> Self {
        Self::immediate(1).forever()
    }

    /// Up to `max_retries` retries, each preceded by `delay`.
    #[must_use]
    pub const fn delay(max_retries: u64, delay: Duration) -> Self {
        Self::Delay { max_retries, delay }
    }

    /// Fixed-delay retries without bound.
    #[must_use]
    pub fn delay_forever(delay: Duration) -> Self {
        Self::delay(1, delay).forever()
    }

    /// Exponential backoff starting at `initial` with factor 2, no cap and
    /// no jitter. Adjust with [`Schedule::factor`], [`Schedule::cap`] and
    /// [`Schedule::jitter`].
    #[must_use]
    pub const fn exponential(max_retries: u64, initial: Duration) -> Self {
        Self::Exponential {
            max_retries,
            initial,
            factor: 2.0,
            cap: None,
            jitter: Jitter::None,
        }
    }

    /// Sets the growth factor of an exponential schedule. No-op otherwise.
    #[must_use]
    pub fn factor(mut self, value: f64) -> Self {
        if let Self::Exponential { factor, .. } = &mut self {
            *factor = value.max(1.0);
        }
        self
    }

    /// Caps each delay of an exponential schedule. No-op otherwise.
    #[must_use]
    pub fn cap(mut self, value: Duration) -> Self {
        if let Self::Exponential { cap, .. } = &mut self {
            *cap = Some(value);
        }
        self
    }

    /// Sets the jitter of an exponential schedule. No-op otherwise.
    #[must_use]
    pub fn jitter(mut self, value: Jitter) -> Self {
        if let Self::Exponential { jitter, .. } = &mut self {
            *jitter = value;
        }
        self
    }

    /// Chains `next` after this schedule's retry budget is exhausted.
    #[must_use]
    pub fn fallback_to(self, next: Schedule) -> Self {
        Self::FallbackTo(Box::new(self), Box::new(next))
    }

    /// Cycles this schedule endlessly, resetting it at each end.
    #[must_use]
    pub fn forever(self) -> Self {
        Self::Forever(Box::new(self))
    }

    /// Total retry budget, or `None` when unbounded.
    #[must_use]
    pub fn retries(&self) -> Option<u64> {
        match self {
            Self::Immediate { max_retries }
            | Self::Delay { max_retries, .. }
            | Self::Exponential { max_retries, .. } => Some(*max_retries),
            Self::Forever(_) => None,
            Self::FallbackTo(first, second) => match (first.retries(), second.retries()) {
                (Some(a), Some(b)) => Some(a + b),
                _ => None,
            },
        }
    }

    /// True when the schedule eventually stops on its own.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.retries().is_some()
    }

    /// Delay before retry number `retry_index` (0-based), or `None` when
    /// the budget is exhausted. `last_delay` feeds stateful jitter.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn next_delay(
        &self,
        retry_index: u64,
        last_delay: Option<Duration>,
        rng: &mut DetRng,
    ) -> Option<Duration> {
        match self {
            Self::Immediate { max_retries } => {
                (retry_index < *max_retries).then_some(Duration::ZERO)
            }
            Self::Delay { max_retries, delay } => (retry_index < *max_retries).then_some(*delay),
            Self::Exponential {
                max_retries,
                initial,
                factor,
                cap,
                jitter,
            } => {
                if retry_index >= *max_retries {
                    return None;
                }
                let exponent = i32::try_from(retry_index).unwrap_or(i32::MAX);
                let grown = initial.as_secs_f64() * factor.powi(exponent);
                let computed = Duration::try_from_secs_f64(grown).unwrap_or(Duration::MAX);
                let computed = cap.map_or(computed, |cap| computed.min(cap));
                Some(jitter.apply(computed, *initial, last_delay, *cap, rng))
            }
            Self::Forever(inner) => match inner.retries() {
                None => inner.next_delay(retry_index, last_delay, rng),
                Some(0) => Some(Duration::ZERO),
                Some(budget) => inner.next_delay(retry_index % budget, last_delay, rng),
            },
            Self::FallbackTo(first, second) => match first.retries() {
                None => first.next_delay(retry_index, last_delay, rng),
                Some(budget) if retry_index < budget => {
                    first.next_delay(retry_index, last_delay, rng)
                }
                Some(budget) => second.next_delay(retry_index - budget, last_delay, rng),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rng() -> DetRng {
        DetRng::new(42)
    }

    #[test]
    fn immediate_emits_zero_delays_then_stops() {
        let schedule = Schedule::immediate(3);
        let mut rng = rng();
        for i in 0..3 {
            assert_eq!(schedule.next_delay(i, None, &mut rng), Some(Duration::ZERO));
        }
        assert_eq!(schedule.next_delay(3, None, &mut rng), None);
    }

    #[test]
    fn fallback_switches_after_budget() {
        let schedule =
            Schedule::immediate(3).fallback_to(Schedule::delay(2, Duration::from_millis(100)));
        let mut rng = rng();
        assert_eq!(schedule.retries(), Some(5));
        assert_eq!(schedule.next_delay(2, None, &mut rng), Some(Duration::ZERO));
        assert_eq!(
            schedule.next_delay(3, None, &mut rng),
            Some(Duration::from_millis(100))
        );
        assert_eq!(
            schedule.next_delay(4, None, &mut rng),
            Some(Duration::from_millis(100))
        );
        assert_eq!(schedule.next_delay(5, None, &mut rng), None);
    }

    #[test]
    fn forever_cycles_inner() {
        let schedule = Schedule::delay(2, Duration::from_millis(5)).forever();
        let mut rng = rng();
        assert!(!schedule.is_finite());
        for i in 0..100 {
            assert_eq!(
                schedule.next_delay(i, None, &mut rng),
                Some(Duration::from_millis(5))
            );
        }
    }

    #[test]
    fn exponential_grows_and_caps() {
        let schedule = Schedule::exponential(10, Duration::from_millis(10))
            .cap(Duration::from_millis(50));
        let mut rng = rng();
        assert_eq!(
            schedule.next_delay(0, None, &mut rng),
            Some(Duration::from_millis(10))
        );
        assert_eq!(
            schedule.next_delay(1, None, &mut rng),
            Some(Duration::from_millis(20))
        );
        assert_eq!(
            schedule.next_delay(5, None, &mut rng),
            Some(Duration::from_millis(50))
        );
    }

    #[test]
    fn full_jitter_stays_under_computed() {
        let schedule = Schedule::exponential(10, Duration::from_millis(100))
            .factor(1.0)
            .jitter(Jitter::Full);
        let mut rng = rng();
        for i in 0..50 {
            let delay = schedule.next_delay(i, None, &mut rng).expect("in budget");
            assert!(delay <= Duration::from_millis(100));
        }
    }

    #[test]
    fn equal_jitter_preserves_half() {
        let schedule = Schedule::exponential(10, Duration::from_millis(100))
            .factor(1.0)
            .jitter(Jitter::Equal);
        let mut rng = rng();
        for i in 0..50 {
            let delay = schedule.next_delay(i, None, &mut rng).expect("in budget");
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(100));
        }
    }

    #[test]
    fn delay_forever_matches_named_constructor() {
        let mut rng1 = rng();
        let mut rng2 = rng();
        let a = Schedule::delay_forever(Duration::from_millis(2));
        let b = Schedule::delay(1, Duration::from_millis(2)).forever();
        for i in 0..10 {
            assert_eq!(
                a.next_delay(i, None, &mut rng1),
                b.next_delay(i, None, &mut rng2)
            );
        }
    }
}
