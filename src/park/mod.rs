//! Thread-parking substrate: carrier interrupts and continuations.
//!
//! Every fork is backed by a dedicated OS thread, its *carrier*. Cancellation
//! is cooperative: a scope interrupts a carrier by setting its [`Interrupt`]
//! flag and unparking the thread; the carrier observes the flag at its next
//! suspension point (channel send/receive, `join`, sleep, limiter acquire)
//! and unwinds with `ErrorKind::Interrupted`.
//!
//! [`Continuation`] is the single-use parking cell the rendezvous channel
//! suspends on: one thread parks awaiting a value, a counterpart resumes it
//! exactly once via a CAS handshake.

mod continuation;
mod interrupt;

pub(crate) use continuation::{AwaitOutcome, Continuation};
pub use interrupt::Interrupt;
pub(crate) use interrupt::{current_carrier, install_carrier};
