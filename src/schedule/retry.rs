//! Retry and repeat on top of the schedule engine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::Error;
use crate::error::Result;
use crate::schedule::engine::{
    scheduled_with_error_mode, ScheduleDecision, ScheduledConfig, SleepMode,
};
use crate::schedule::Schedule;
use crate::scope::{ErrorMode, ResultMode};

/// Classifies attempt outcomes for retry purposes.
///
/// Defaults: every value is a success, every error is worth retrying.
pub struct ResultPolicy<E, T> {
    is_success: Box<dyn Fn(&T) -> bool + Send>,
    is_worth_retrying: Box<dyn Fn(&E) -> bool + Send>,
}

impl<E, T> ResultPolicy<E, T> {
    /// The default policy.
    #[must_use]
    pub fn new() -> Self {
        Self {
            is_success: Box::new(|_| true),
            is_worth_retrying: Box::new(|_| true),
        }
    }

    /// Treats only values satisfying `f` as successes; others are retried.
    #[must_use]
    pub fn successful_if(mut self, f: impl Fn(&T) -> bool + Send + 'static) -> Self {
        self.is_success = Box::new(f);
        self
    }

    /// Retries only errors satisfying `f`; others stop the retry loop.
    #[must_use]
    pub fn retry_when(mut self, f: impl Fn(&E) -> bool + Send + 'static) -> Self {
        self.is_worth_retrying = Box::new(f);
        self
    }

    pub(crate) fn is_success(&self, value: &T) -> bool {
        (self.is_success)(value)
    }

    pub(crate) fn is_worth_retrying(&self, error: &E) -> bool {
        (self.is_worth_retrying)(error)
    }
}

impl<E, T> Default for ResultPolicy<E, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E, T> std::fmt::Debug for ResultPolicy<E, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ResultPolicy")
    }
}

/// Lifecycle hook invoked after every attempt.
pub type OnRetry<E, T> = Box<dyn FnMut(u64, core::result::Result<&T, &E>) + Send>;

/// Configuration for [`retry`]: a schedule, a result policy and an
/// optional lifecycle callback.
pub struct RetryConfig<E, T> {
    /// Delays between attempts.
    pub schedule: Schedule,
    /// What counts as success and what is worth retrying.
    pub policy: ResultPolicy<E, T>,
    pub(crate) on_retry: Option<OnRetry<E, T>>,
}

impl<E, T> RetryConfig<E, T> {
    /// A config with the default policy and no callback.
    #[must_use]
    pub fn new(schedule: Schedule) -> Self {
        Self {
            schedule,
            policy: ResultPolicy::new(),
            on_retry: None,
        }
    }

    /// Replaces the result policy.
    #[must_use]
    pub fn policy(mut self, policy: ResultPolicy<E, T>) -> Self {
        self.policy = policy;
        self
    }

    /// Installs a lifecycle callback, invoked after every attempt with the
    /// attempt number and a view of its outcome.
    #[must_use]
    pub fn on_retry(mut self, hook: OnRetry<E, T>) -> Self {
        self.on_retry = Some(hook);
        self
    }
}

impl<E, T> std::fmt::Debug for RetryConfig<E, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryConfig")
            .field("schedule", &self.schedule)
            .finish_non_exhaustive()
    }
}

/// Why a retried operation did not produce a value.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// Every attempt failed; carries the final error unchanged.
    #[error("all {attempts} attempts failed")]
    Exhausted {
        /// The error from the final attempt.
        error: E,
        /// Total attempts made.
        attempts: u64,
    },
    /// The carrier was interrupted between attempts.
    #[error("retry interrupted")]
    Interrupted(#[source] Error),
}

/// Builds the engine config for a retry run, mirroring attempt counts
/// into `attempts`.
fn retry_schedule<E, T>(config: RetryConfig<E, T>, attempts: &Arc<AtomicU64>) -> ScheduledConfig<E, T>
where
    E: 'static,
    T: 'static,
{
    let seen = Arc::clone(attempts);
    let policy = config.policy;
    let mut on_retry = config.on_retry;
    ScheduledConfig::new(config.schedule).after_attempt(Box::new(move |attempt, outcome| {
        seen.store(attempt, Ordering::SeqCst);
        if let Some(hook) = on_retry.as_mut() {
            hook(attempt, outcome);
        }
        match outcome {
            Ok(value) => ScheduleDecision::from_bool(!policy.is_success(value)),
            Err(error) => ScheduleDecision::from_bool(policy.is_worth_retrying(error)),
        }
    }))
}

/// Retries `operation` according to `config`.
///
/// The operation runs at least once. The final failing error is returned
/// unchanged inside [`RetryError::Exhausted`].
pub fn retry<T, E>(
    config: RetryConfig<E, T>,
    operation: impl FnMut() -> core::result::Result<T, E>,
) -> core::result::Result<T, RetryError<E>>
where
    T: 'static,
    E: Send + 'static,
{
    let mode = ResultMode::<E>::new();
    let attempts = Arc::new(AtomicU64::new(0));
    let scheduled = retry_schedule(config, &attempts);
    match scheduled_with_error_mode(&mode, scheduled, operation) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(RetryError::Exhausted {
            error,
            attempts: attempts.load(Ordering::SeqCst),
        }),
        Err(interrupt) => Err(RetryError::Interrupted(interrupt)),
    }
}

/// Retries `operation` under an arbitrary error mode.
///
/// Returns the final container unchanged; the outer `Result` fails only on
/// carrier interruption. This is the generalized face of [`retry`] for
/// custom result containers.
pub fn retry_with_error_mode<M, E, T>(
    mode: &M,
    config: RetryConfig<E, T>,
    operation: impl FnMut() -> M::Container<T>,
) -> Result<M::Container<T>>
where
    M: ErrorMode<E>,
    E: 'static,
    T: 'static,
{
    let attempts = Arc::new(AtomicU64::new(0));
    let scheduled = retry_schedule(config, &attempts);
    scheduled_with_error_mode(mode, scheduled, operation)
}

/// Configuration for [`repeat`].
pub struct RepeatConfig<T> {
    /// Intervals between runs.
    pub schedule: Schedule,
    should_continue: Box<dyn Fn(&T) -> bool + Send>,
}

impl<T> RepeatConfig<T> {
    /// Repeats until the schedule is exhausted.
    #[must_use]
    pub fn new(schedule: Schedule) -> Self {
        Self {
            schedule,
            should_continue: Box::new(|_| true),
        }
    }

    /// Stops repeating once a run's value satisfies `f`.
    #[must_use]
    pub fn until(mut self, f: impl Fn(&T) -> bool + Send + 'static) -> Self {
        self.should_continue = Box::new(move |value| !f(value));
        self
    }
}

impl<T> std::fmt::Debug for RepeatConfig<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepeatConfig")
            .field("schedule", &self.schedule)
            .finish_non_exhaustive()
    }
}

/// Runs `operation` periodically, paced to the schedule's intervals.
///
/// Unlike [`retry`], an error stops the loop immediately and is returned;
/// values keep the loop going until the config or schedule says stop. The
/// sleep between runs is reduced by how long each run took.
pub fn repeat<T, E>(
    config: RepeatConfig<T>,
    operation: impl FnMut() -> core::result::Result<T, E>,
) -> core::result::Result<T, RetryError<E>>
where
    T: 'static,
    E: Send + 'static,
{
    let mode = ResultMode::<E>::new();
    let attempts = Arc::new(AtomicU64::new(0));
    let seen = Arc::clone(&attempts);
    let should_continue = config.should_continue;

    let scheduled = ScheduledConfig::new(config.schedule)
        .sleep_mode(SleepMode::Interval)
        .after_attempt(Box::new(move |attempt, outcome| {
            seen.store(attempt, Ordering::SeqCst);
            match outcome {
                Ok(value) => ScheduleDecision::from_bool(should_continue(value)),
                Err(_) => ScheduleDecision::Stop,
            }
        }));

    match scheduled_with_error_mode(&mode, scheduled, operation) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(RetryError::Exhausted {
            error,
            attempts: attempts.load(Ordering::SeqCst),
        }),
        Err(interrupt) => Err(RetryError::Interrupted(interrupt)),
    }
}
