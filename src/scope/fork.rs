//! Fork handles and their completion slots.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::Thread;
use std::time::Instant;

use crate::error::{Error, ErrorKind, Result};
use crate::park;
use crate::scope::supervisor::{panic_message, PanicPayload};

/// How a fork body ended.
pub(crate) enum ForkOutcome<T> {
    Value(T),
    Error(Error),
    Panicked(PanicPayload),
}

struct SlotInner<T> {
    outcome: Option<ForkOutcome<T>>,
    completed: bool,
    waiters: Vec<Thread>,
}

/// One-shot completion slot a fork writes and joiners park on.
pub(crate) struct ForkSlot<T> {
    inner: Mutex<SlotInner<T>>,
}

impl<T> ForkSlot<T> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(SlotInner {
                outcome: None,
                completed: false,
                waiters: Vec::new(),
            }),
        }
    }

    pub(crate) fn completed(outcome: ForkOutcome<T>) -> Self {
        Self {
            inner: Mutex::new(SlotInner {
                outcome: Some(outcome),
                completed: true,
                waiters: Vec::new(),
            }),
        }
    }

    pub(crate) fn complete(&self, outcome: ForkOutcome<T>) {
        let mut inner = self.inner.lock();
        debug_assert!(!inner.completed, "fork completed twice");
        inner.outcome = Some(outcome);
        inner.completed = true;
        for waiter in inner.waiters.drain(..) {
            waiter.unpark();
        }
    }

    /// Blocks until the fork completes, then takes its outcome.
    pub(crate) fn take(&self) -> Result<ForkOutcome<T>> {
        let carrier = park::current_carrier();
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(outcome) = inner.outcome.take() {
                    return Ok(outcome);
                }
                if inner.completed {
                    return Err(Error::new(ErrorKind::Internal)
                        .with_context("fork outcome already taken"));
                }
                inner.waiters.push(std::thread::current());
            }
            carrier.check()?;
            std::thread::park();
        }
    }

    /// Waits until the fork completes or the deadline passes, without
    /// consuming the outcome.
    pub(crate) fn wait_done_until(&self, deadline: Instant) -> Result<bool> {
        let carrier = park::current_carrier();
        loop {
            {
                let mut inner = self.inner.lock();
                if inner.completed {
                    return Ok(true);
                }
                inner.waiters.push(std::thread::current());
            }
            carrier.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            std::thread::park_timeout(deadline - now);
        }
    }
}

/// A handle to a fork running in a scope.
///
/// `join` blocks until the fork's completion slot fills, re-raising a
/// panic captured in an unsupervised fork to the joiner.
pub struct Fork<T> {
    slot: Arc<ForkSlot<T>>,
}

impl<T> Fork<T> {
    pub(crate) fn new(slot: Arc<ForkSlot<T>>) -> Self {
        Self { slot }
    }

    /// A fork that already completed with `value`.
    #[must_use]
    pub fn succeeded(value: T) -> Self {
        Self {
            slot: Arc::new(ForkSlot::completed(ForkOutcome::Value(value))),
        }
    }

    /// A fork that already failed with `error`.
    #[must_use]
    pub fn failed(error: Error) -> Self {
        Self {
            slot: Arc::new(ForkSlot::completed(ForkOutcome::Error(error))),
        }
    }

    /// Blocks until the fork completes and returns its result.
    ///
    /// A panic held in the fork is resumed on the joining thread. Fails
    /// with `Interrupted` if the joiner's carrier is cancelled first.
    pub fn join(self) -> Result<T> {
        match self.slot.take()? {
            ForkOutcome::Value(value) => Ok(value),
            ForkOutcome::Error(error) => Err(error),
            ForkOutcome::Panicked(payload) => std::panic::resume_unwind(payload),
        }
    }

    /// Like [`Fork::join`], but a held panic becomes an error value
    /// instead of resuming.
    pub fn join_either(self) -> Result<core::result::Result<T, Error>> {
        match self.slot.take()? {
            ForkOutcome::Value(value) => Ok(Ok(value)),
            ForkOutcome::Error(error) => Ok(Err(error)),
            ForkOutcome::Panicked(payload) => Ok(Err(Error::new(ErrorKind::ForkPanicked)
                .with_context(panic_message(&payload)))),
        }
    }

    pub(crate) fn wait_done_until(&self, deadline: Instant) -> Result<bool> {
        self.slot.wait_done_until(deadline)
    }
}

impl<T> std::fmt::Debug for Fork<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fork").finish_non_exhaustive()
    }
}

/// Joins every fork, failing on the first error.
pub fn join_all<T>(forks: Vec<Fork<T>>) -> Result<Vec<T>> {
    forks.into_iter().map(Fork::join).collect()
}

/// One-shot open gate the cancellable-fork watchdog parks on.
pub(crate) struct Gate {
    open: AtomicBool,
    waiters: Mutex<Vec<Thread>>,
}

impl Gate {
    pub(crate) fn new() -> Self {
        Self {
            open: AtomicBool::new(false),
            waiters: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
        for waiter in self.waiters.lock().drain(..) {
            waiter.unpark();
        }
    }

    /// Parks until the gate opens; interruptible.
    pub(crate) fn wait(&self) -> Result<()> {
        let carrier = park::current_carrier();
        loop {
            if self.open.load(Ordering::SeqCst) {
                return Ok(());
            }
            self.waiters.lock().push(std::thread::current());
            if self.open.load(Ordering::SeqCst) {
                return Ok(());
            }
            carrier.check()?;
            std::thread::park();
        }
    }
}

/// A fork with isolated cancellation.
///
/// Backed by two carriers: an outer fork that parks on a release gate, and
/// a nested scope running the body. Cancelling opens the gate; the nested
/// scope then interrupts the body and joins it, so cancellation never
/// disturbs the enclosing scope's accounting.
pub struct CancellableFork<T> {
    outer: Fork<Fork<T>>,
    gate: Arc<Gate>,
}

impl<T> CancellableFork<T> {
    pub(crate) fn new(outer: Fork<Fork<T>>, gate: Arc<Gate>) -> Self {
        Self { outer, gate }
    }

    /// Blocks until the body completes on its own.
    pub fn join(self) -> Result<T> {
        self.outer.join()?.join()
    }

    /// Requests cancellation and awaits the outcome.
    ///
    /// Returns the body's value if it won the race, and `Interrupted` if
    /// cancellation caught it mid-flight.
    pub fn cancel(self) -> Result<T> {
        self.gate.open();
        self.outer.join()?.join()
    }

    /// Requests cancellation without waiting for the body to finish.
    pub fn cancel_now(&self) {
        self.gate.open();
    }

    pub(crate) fn wait_done_until(&self, deadline: Instant) -> Result<bool> {
        self.outer.wait_done_until(deadline)
    }
}

impl<T> std::fmt::Debug for CancellableFork<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellableFork").finish_non_exhaustive()
    }
}
