//! Trellis: structured concurrency with scoped forks, a rendezvous
//! channel, and scheduled resilience.
//!
//! # Overview
//!
//! Trellis bounds the lifetime of every concurrent task by a lexical
//! scope. A scope owns its forks: when the scope is left — normally or
//! through a failure — everything still running is interrupted, joined,
//! and finalized before the scope surfaces its outcome. No task outlives
//! the block that spawned it.
//!
//! # Core Guarantees
//!
//! - **No orphan forks**: every fork is owned by a scope; leaving the
//!   scope waits for all of them
//! - **First failure wins**: a supervised scope cancels everything on the
//!   first failure and attaches later ones as suppressed
//! - **Cooperative cancellation**: interrupts are delivered at suspension
//!   points (channel operations, `join`, sleeps, limiter acquires), never
//!   preemptively
//! - **Exactly-once handoff**: the rendezvous channel delivers each sent
//!   value to exactly one receiver, FIFO per side
//!
//! # Module Structure
//!
//! - [`scope`]: scopes, the supervisor, and the fork API
//! - [`channel`]: the rendezvous channel
//! - [`schedule`]: schedules, the retry/repeat engine, adaptive retries
//! - [`limiter`]: rate limiter family
//! - [`park`]: carrier interrupts and the continuation primitive
//! - [`time`]: interruptible sleep and timeout
//! - [`flow`]: the stage/sink contract consumed by stream libraries
//! - [`error`]: error types
//!
//! # Example
//!
//! ```ignore
//! use trellis::{supervised, Channel};
//! use std::sync::Arc;
//!
//! let received = supervised(|scope| {
//!     let ch = Arc::new(Channel::<u32>::rendezvous());
//!     let sender = Arc::clone(&ch);
//!     scope.fork(move |_| sender.send(5));
//!     ch.receive()
//! })?;
//! assert_eq!(received, 5);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod channel;
pub mod error;
pub mod flow;
pub mod limiter;
pub mod park;
pub mod schedule;
pub mod scope;
pub mod time;
pub mod tracing_compat;
pub mod util;

// Re-exports for convenient access to the core surface.
pub use channel::{Channel, ChannelClosed, ChannelValue};
pub use error::{Error, ErrorKind, Result, TryReceiveError, TrySendError};
pub use limiter::{DurationRateLimiter, OperationId, RateLimiter};
pub use schedule::{
    repeat, retry, retry_with_error_mode, scheduled_with_error_mode, AdaptiveRetry, Jitter,
    RepeatConfig, ResultPolicy, RetryConfig, RetryError, Schedule, ScheduleDecision,
    ScheduledConfig, SleepMode, TokenBucket,
};
pub use scope::{
    join_all, scoped, supervised, supervised_err, CancellableFork, ErrorMode, Fork, ResultMode,
    Scope,
};
pub use time::{sleep, timeout};
