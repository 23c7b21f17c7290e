//! Adaptive retries backed by a shared token bucket.
//!
//! Plain retry treats every failure alike. Adaptive retry spends a token
//! budget on failures and earns it back on successes, so a dependency that
//! is down hard exhausts the budget quickly and stops being hammered,
//! while occasional failures retry freely.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::Result;
use crate::schedule::engine::{scheduled_with_error_mode, ScheduleDecision, ScheduledConfig};
use crate::schedule::retry::{RetryConfig, RetryError};
use crate::scope::{ErrorMode, ResultMode};

/// A thread-safe token counter with a fixed capacity.
///
/// `try_acquire` and `release` are single CAS loops; `release` never grows
/// the count past capacity.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u64,
    tokens: AtomicU64,
}

impl TokenBucket {
    /// A full bucket with the given capacity.
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            tokens: AtomicU64::new(capacity),
        }
    }

    /// The bucket's capacity.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Tokens currently available.
    #[must_use]
    pub fn available(&self) -> u64 {
        self.tokens.load(Ordering::SeqCst)
    }

    /// Takes `count` tokens if they are all available.
    pub fn try_acquire(&self, count: u64) -> bool {
        self.tokens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |tokens| {
                tokens.checked_sub(count)
            })
            .is_ok()
    }

    /// Returns `count` tokens, saturating at capacity.
    pub fn release(&self, count: u64) {
        let _ = self
            .tokens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |tokens| {
                Some((tokens.saturating_add(count)).min(self.capacity))
            });
    }
}

/// Retry driver that meters failures through a shared [`TokenBucket`].
///
/// Per attempt:
/// - a worth-retrying error retries only if `failure_cost` tokens can be
///   acquired;
/// - a successful value releases `success_reward` tokens and stops;
/// - an unsuccessful value either pays `failure_cost` to continue or, with
///   [`AdaptiveRetry::no_result_penalty`], continues for free.
#[derive(Debug)]
pub struct AdaptiveRetry {
    /// The shared failure budget. Clone the `Arc` to meter several
    /// operations with one bucket.
    pub token_bucket: Arc<TokenBucket>,
    /// Tokens a retried failure consumes.
    pub failure_cost: u64,
    /// Tokens a success returns.
    pub success_reward: u64,
    pay_penalty_for_result: bool,
}

impl Default for AdaptiveRetry {
    /// Capacity 500, failure cost 5, success reward 1.
    fn default() -> Self {
        Self::new(Arc::new(TokenBucket::new(500)), 5, 1)
    }
}

impl AdaptiveRetry {
    /// An adaptive retry driver over the given bucket.
    #[must_use]
    pub fn new(token_bucket: Arc<TokenBucket>, failure_cost: u64, success_reward: u64) -> Self {
        Self {
            token_bucket,
            failure_cost,
            success_reward,
            pay_penalty_for_result: true,
        }
    }

    /// Unsuccessful values (per the policy) retry without spending tokens.
    #[must_use]
    pub fn no_result_penalty(mut self) -> Self {
        self.pay_penalty_for_result = false;
        self
    }

    /// Retries `operation`, metering failures through the bucket.
    pub fn retry<T, E>(
        &self,
        config: RetryConfig<E, T>,
        operation: impl FnMut() -> core::result::Result<T, E>,
    ) -> core::result::Result<T, RetryError<E>>
    where
        T: 'static,
        E: Send + 'static,
    {
        let mode = ResultMode::<E>::new();
        let attempts = Arc::new(AtomicU64::new(0));
        let scheduled = self.metered_schedule(config, &attempts);
        match scheduled_with_error_mode(&mode, scheduled, operation) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(RetryError::Exhausted {
                error,
                attempts: attempts.load(Ordering::SeqCst),
            }),
            Err(interrupt) => Err(RetryError::Interrupted(interrupt)),
        }
    }

    /// Retries `operation` under an arbitrary error mode, metering
    /// failures through the bucket.
    pub fn retry_with_error_mode<M, E, T>(
        &self,
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
        let scheduled = self.metered_schedule(config, &attempts);
        scheduled_with_error_mode(mode, scheduled, operation)
    }

    fn metered_schedule<E, T>(
        &self,
        config: RetryConfig<E, T>,
        attempts: &Arc<AtomicU64>,
    ) -> ScheduledConfig<E, T>
    where
        E: 'static,
        T: 'static,
    {
        let bucket = Arc::clone(&self.token_bucket);
        let failure_cost = self.failure_cost;
        let success_reward = self.success_reward;
        let pay_penalty = self.pay_penalty_for_result;
        let seen = Arc::clone(attempts);
        let policy = config.policy;
        let mut on_retry = config.on_retry;

        ScheduledConfig::new(config.schedule).after_attempt(Box::new(move |attempt, outcome| {
            seen.store(attempt, Ordering::SeqCst);
            if let Some(hook) = on_retry.as_mut() {
                hook(attempt, outcome);
            }
            match outcome {
                Err(error) => {
                    if policy.is_worth_retrying(error) {
                        ScheduleDecision::from_bool(bucket.try_acquire(failure_cost))
                    } else {
                        ScheduleDecision::Stop
                    }
                }
                Ok(value) => {
                    if policy.is_success(value) {
                        bucket.release(success_reward);
                        ScheduleDecision::Stop
                    } else if pay_penalty {
                        ScheduleDecision::from_bool(bucket.try_acquire(failure_cost))
                    } else {
                        ScheduleDecision::Continue
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::Schedule;

    #[test]
    fn token_bucket_acquire_and_release() {
        let bucket = TokenBucket::new(10);
        assert!(bucket.try_acquire(10));
        assert!(!bucket.try_acquire(1));
        bucket.release(4);
        assert_eq!(bucket.available(), 4);
        // Release saturates at capacity.
        bucket.release(100);
        assert_eq!(bucket.available(), 10);
    }

    #[test]
    fn failures_stop_when_budget_exhausted() {
        // Capacity 10, cost 5: exactly two retried failures fit.
        let adaptive = AdaptiveRetry::new(Arc::new(TokenBucket::new(10)), 5, 1);
        let mut calls = 0;
        let err = adaptive
            .retry(
                RetryConfig::new(Schedule::immediate(100)),
                || -> core::result::Result<u32, &'static str> {
                    calls += 1;
                    Err("down")
                },
            )
            .expect_err("budget exhausts");
        // 1 initial attempt + 2 paid retries.
        assert_eq!(calls, 3);
        assert!(matches!(err, RetryError::Exhausted { attempts: 3, .. }));
    }

    #[test]
    fn success_releases_reward() {
        let bucket = Arc::new(TokenBucket::new(10));
        assert!(bucket.try_acquire(6));
        let adaptive = AdaptiveRetry::new(Arc::clone(&bucket), 5, 3);
        let value = adaptive
            .retry(
                RetryConfig::new(Schedule::immediate(10)),
                || -> core::result::Result<u32, &'static str> { Ok(7) },
            )
            .expect("first attempt succeeds");
        assert_eq!(value, 7);
        assert_eq!(bucket.available(), 7);
    }

    #[test]
    fn default_budget_matches_contract() {
        let adaptive = AdaptiveRetry::default();
        assert_eq!(adaptive.token_bucket.capacity(), 500);
        assert_eq!(adaptive.failure_cost, 5);
        assert_eq!(adaptive.success_reward, 1);
    }
}
