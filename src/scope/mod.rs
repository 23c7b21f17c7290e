//! Scopes: lexical regions that own concurrent forks.
//!
//! A scope guarantees that every fork spawned inside it terminates before
//! the scope is left. Entering a scope installs a supervisor, a fork
//! registry and a finalizer list; leaving it interrupts whatever still
//! runs, joins every carrier thread, runs finalizers in LIFO order with
//! interrupts masked, and surfaces the outcome.
//!
//! Three block forms:
//!
//! - [`scoped`]: unsupervised; fork failures are held until `join`.
//! - [`supervised`]: the first fork failure (or body failure) ends the
//!   scope; the scope also waits for every user fork.
//! - [`supervised_err`]: like `supervised`, with application errors —
//!   error values under an [`ErrorMode`] — ending the scope and being
//!   returned (never panicked) at the boundary.
//!
//! # Fork flavors
//!
//! | API | Supervised? | Awaited at scope end? | Failure behavior |
//! |---|---|---|---|
//! | [`Scope::fork`] | yes (daemon) | interrupted | ends scope |
//! | [`Scope::fork_user`] | yes | awaited | ends scope |
//! | [`Scope::fork_unsupervised`] | no | interrupted | held for `join` |
//! | [`Scope::fork_error`] | yes, error mode | interrupted | app error ends scope |
//! | [`Scope::fork_user_error`] | yes, error mode | awaited | app error ends scope |
//! | [`Scope::fork_cancellable`] | no (nested scope) | interrupted | supports `cancel` |
//!
//! # Example
//!
//! ```ignore
//! let sum = supervised(|scope| {
//!     let a = scope.fork_user(|_| Ok(21));
//!     let b = scope.fork_user(|_| Ok(21));
//!     Ok(a.join()? + b.join()?)
//! })?;
//! assert_eq!(sum, 42);
//! ```

mod error_mode;
mod fork;
mod supervisor;

pub use error_mode::{ErrorMode, ResultMode};
pub use fork::{join_all, CancellableFork, Fork};

use parking_lot::Mutex;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::error::{Error, ErrorKind, Result};
use crate::park::{self, Interrupt};
use crate::tracing_compat::{debug, trace};

use fork::{ForkOutcome, ForkSlot, Gate};
use supervisor::{Failure, Supervisor, SupervisorKind};

/// Supervision flavor of a spawned fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flavor {
    Daemon,
    User,
    Unsupervised,
}

struct ForkEntry {
    handle: JoinHandle<()>,
    interrupt: Arc<Interrupt>,
}

struct ScopeInner {
    supervisor: Supervisor,
    registry: Mutex<Vec<ForkEntry>>,
    finalizers: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    /// Set under the registry lock; once true no fork is ever added again.
    ending: AtomicBool,
    fork_counter: AtomicU64,
}

/// Handle to the enclosing scope, passed to every fork body.
pub struct Scope {
    inner: Arc<ScopeInner>,
}

impl Scope {
    fn root(kind: SupervisorKind, scope_carrier: Arc<Interrupt>) -> Self {
        Self {
            inner: Arc::new(ScopeInner {
                supervisor: Supervisor::new(kind, scope_carrier),
                registry: Mutex::new(Vec::new()),
                finalizers: Mutex::new(Vec::new()),
                ending: AtomicBool::new(false),
                fork_counter: AtomicU64::new(0),
            }),
        }
    }

    // =========================================================================
    // Fork API
    // =========================================================================

    /// Spawns a supervised daemon fork: its failure ends the scope, but the
    /// scope does not wait for its success.
    pub fn fork<T, F>(&self, f: F) -> Fork<T>
    where
        T: Send + 'static,
        F: FnOnce(&Scope) -> Result<T> + Send + 'static,
    {
        self.spawn(Flavor::Daemon, f)
    }

    /// Spawns a supervised user fork: the scope stays open until it
    /// completes, and its failure ends the scope.
    pub fn fork_user<T, F>(&self, f: F) -> Fork<T>
    where
        T: Send + 'static,
        F: FnOnce(&Scope) -> Result<T> + Send + 'static,
    {
        self.spawn(Flavor::User, f)
    }

    /// Spawns an unsupervised fork: failures (including panics) are held
    /// in the fork and surface only at `join`.
    pub fn fork_unsupervised<T, F>(&self, f: F) -> Fork<T>
    where
        T: Send + 'static,
        F: FnOnce(&Scope) -> Result<T> + Send + 'static,
    {
        self.spawn(Flavor::Unsupervised, f)
    }

    /// Spawns a daemon fork under an error mode: an application error in
    /// the returned container ends the scope.
    pub fn fork_error<M, E, T, F>(&self, mode: M, f: F) -> Fork<M::Container<T>>
    where
        M: ErrorMode<E>,
        E: Send + 'static,
        T: Send + 'static,
        M::Container<T>: Send + 'static,
        F: FnOnce(&Scope) -> Result<M::Container<T>> + Send + 'static,
    {
        self.spawn_error_mode(Flavor::Daemon, mode, f)
    }

    /// Spawns a user fork under an error mode.
    pub fn fork_user_error<M, E, T, F>(&self, mode: M, f: F) -> Fork<M::Container<T>>
    where
        M: ErrorMode<E>,
        E: Send + 'static,
        T: Send + 'static,
        M::Container<T>: Send + 'static,
        F: FnOnce(&Scope) -> Result<M::Container<T>> + Send + 'static,
    {
        self.spawn_error_mode(Flavor::User, mode, f)
    }

    /// Spawns every body as a user fork, preserving order.
    pub fn fork_all<T, F>(&self, bodies: Vec<F>) -> Vec<Fork<T>>
    where
        T: Send + 'static,
        F: FnOnce(&Scope) -> Result<T> + Send + 'static,
    {
        bodies.into_iter().map(|f| self.fork_user(f)).collect()
    }

    /// Spawns a fork with isolated cancellation.
    ///
    /// The body runs inside a nested scope on its own carrier; an outer
    /// watchdog carrier parks on a release gate. [`CancellableFork::cancel`]
    /// opens the gate, which makes the nested scope finish and interrupt
    /// the body without touching this scope's supervisor accounting. Costs
    /// two carrier threads.
    pub fn fork_cancellable<T, F>(&self, f: F) -> CancellableFork<T>
    where
        T: Send + 'static,
        F: FnOnce(&Scope) -> Result<T> + Send + 'static,
    {
        let gate = Arc::new(Gate::new());
        let watchdog_gate = Arc::clone(&gate);
        let outer = self.fork_unsupervised(move |_| {
            let body_gate = Arc::clone(&watchdog_gate);
            scoped(move |nested| {
                let child = nested.fork_unsupervised(move |scope| {
                    let result = f(scope);
                    body_gate.open();
                    result
                });
                // Parked until cancelled or the body finishes. If the
                // enclosing scope cancels this carrier instead, fall
                // through: leaving the nested scope interrupts and joins
                // the body either way.
                let _ = watchdog_gate.wait();
                Ok(child)
            })
        });
        CancellableFork::new(outer, gate)
    }

    /// Registers a finalizer to run when the scope is left.
    ///
    /// Finalizers run after every fork has terminated, in LIFO order, with
    /// interrupts masked. A panicking finalizer does not stop the rest.
    pub fn defer(&self, f: impl FnOnce() + Send + 'static) {
        self.inner.finalizers.lock().push(Box::new(f));
    }

    // =========================================================================
    // Spawning internals
    // =========================================================================

    fn spawn<T, F>(&self, flavor: Flavor, f: F) -> Fork<T>
    where
        T: Send + 'static,
        F: FnOnce(&Scope) -> Result<T> + Send + 'static,
    {
        let mut registry = self.inner.registry.lock();
        if self.inner.ending.load(Ordering::SeqCst) {
            return Fork::failed(
                Error::new(ErrorKind::ScopeCancelled).with_context("fork into an ending scope"),
            );
        }

        if flavor == Flavor::User {
            self.inner.supervisor.fork_starts();
        }

        let slot = Arc::new(ForkSlot::new());
        let interrupt = Arc::new(Interrupt::new());
        let scope = Scope {
            inner: Arc::clone(&self.inner),
        };
        let fork_slot = Arc::clone(&slot);
        let fork_interrupt = Arc::clone(&interrupt);
        let id = self.inner.fork_counter.fetch_add(1, Ordering::Relaxed);

        let handle = std::thread::Builder::new()
            .name(format!("trellis-fork-{id}"))
            .spawn(move || {
                park::install_carrier(fork_interrupt);
                let result = catch_unwind(AssertUnwindSafe(|| f(&scope)));
                finish_fork(flavor, &scope.inner.supervisor, &fork_slot, result);
            })
            .expect("failed to spawn fork carrier thread");
        interrupt.bind(handle.thread().clone());
        registry.push(ForkEntry {
            handle,
            interrupt: Arc::clone(&interrupt),
        });
        trace!(fork = id, "fork spawned");
        Fork::new(slot)
    }

    fn spawn_error_mode<M, E, T, F>(&self, flavor: Flavor, mode: M, f: F) -> Fork<M::Container<T>>
    where
        M: ErrorMode<E>,
        E: Send + 'static,
        T: Send + 'static,
        M::Container<T>: Send + 'static,
        F: FnOnce(&Scope) -> Result<M::Container<T>> + Send + 'static,
    {
        self.spawn(flavor, move |scope: &Scope| {
            let container = f(scope)?;
            if !mode.is_error(&container) {
                return Ok(container);
            }
            let error = mode.get_error(container);
            match scope.inner.supervisor.fork_app_error(Box::new(error)) {
                None => Err(Error::new(ErrorKind::ScopeCancelled)
                    .with_context("application error propagated to scope")),
                Some(rejected) => {
                    let error = *rejected
                        .downcast::<E>()
                        .expect("application error keeps its type");
                    Ok(mode.pure_error(error))
                }
            }
        })
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Interrupts every live fork, joins their carriers, then runs
    /// finalizers. Idempotent; uninterruptible once joining starts.
    fn shutdown(&self) {
        {
            let registry = self.inner.registry.lock();
            self.inner.ending.store(true, Ordering::SeqCst);
            for entry in registry.iter() {
                entry.interrupt.set();
            }
        }
        loop {
            let entry = self.inner.registry.lock().pop();
            let Some(entry) = entry else { break };
            entry.interrupt.set();
            // Panics were already captured inside the fork.
            let _ = entry.handle.join();
        }

        let carrier = park::current_carrier();
        carrier.masked(|| loop {
            let finalizer = self.inner.finalizers.lock().pop();
            let Some(finalizer) = finalizer else { break };
            if catch_unwind(AssertUnwindSafe(finalizer)).is_err() {
                debug!("scope finalizer panicked");
            }
        });
    }

    /// Parks the scope thread until the supervisor signals scope end,
    /// recording an externally delivered interrupt as the scope failure.
    fn await_end(&self, carrier: &Interrupt) {
        loop {
            if self.inner.supervisor.is_ended() {
                return;
            }
            if carrier.is_set() && !self.inner.supervisor.interrupted_scope_itself() {
                self.inner.supervisor.record_external_interrupt();
                continue;
            }
            std::thread::park();
        }
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("ending", &self.inner.ending.load(Ordering::Relaxed))
            .field(
                "forks",
                &self.inner.fork_counter.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

/// Completes the fork's slot and reports to the supervisor per flavor.
fn finish_fork<T>(
    flavor: Flavor,
    supervisor: &Supervisor,
    slot: &ForkSlot<T>,
    result: std::thread::Result<Result<T>>,
) {
    let benign = |e: &Error| {
        matches!(
            e.kind(),
            ErrorKind::Interrupted | ErrorKind::ScopeCancelled
        )
    };
    match result {
        Ok(Ok(value)) => {
            slot.complete(ForkOutcome::Value(value));
            if flavor == Flavor::User {
                supervisor.fork_success();
            }
        }
        Ok(Err(error)) if flavor == Flavor::Unsupervised => {
            slot.complete(ForkOutcome::Error(error));
        }
        Ok(Err(error)) if benign(&error) => {
            // Cancellation unwinding out of the body is not a failure.
            slot.complete(ForkOutcome::Error(error));
            if flavor == Flavor::User {
                supervisor.fork_success();
            }
        }
        Ok(Err(error)) => {
            let _ = supervisor.fork_error(error.clone());
            slot.complete(ForkOutcome::Error(error));
        }
        Err(payload) if flavor == Flavor::Unsupervised => {
            slot.complete(ForkOutcome::Panicked(payload));
        }
        Err(payload) => match supervisor.fork_panic(payload) {
            None => slot.complete(ForkOutcome::Error(
                Error::new(ErrorKind::ForkPanicked)
                    .with_context("panic propagated to scope"),
            )),
            Some(payload) => slot.complete(ForkOutcome::Panicked(payload)),
        },
    }
}

// =============================================================================
// Block forms
// =============================================================================

/// Runs `body` in an unsupervised scope on the calling thread.
///
/// Fork failures are held in their forks; whatever still runs when the
/// body returns is interrupted and joined, finalizers run, and the body's
/// result (or panic) passes through.
pub fn scoped<T>(body: impl FnOnce(&Scope) -> Result<T>) -> Result<T> {
    let carrier = park::current_carrier();
    let scope = Scope::root(SupervisorKind::NoOp, carrier);
    let result = catch_unwind(AssertUnwindSafe(|| body(&scope)));
    scope.shutdown();
    match result {
        Ok(result) => result,
        Err(payload) => resume_unwind(payload),
    }
}

/// Runs `body` in a supervised scope.
///
/// The scope ends when the body and every user fork completed, or as soon
/// as any of them fails. On failure the body is interrupted, every fork is
/// cancelled and joined, finalizers run, and the first failure surfaces:
/// a panic resumes, an error returns with later failures attached as
/// suppressed.
pub fn supervised<T>(body: impl FnOnce(&Scope) -> Result<T>) -> Result<T> {
    let carrier = park::current_carrier();
    let scope = Scope::root(SupervisorKind::Default, Arc::clone(&carrier));

    let body_value = match catch_unwind(AssertUnwindSafe(|| body(&scope))) {
        Ok(Ok(value)) => Some(value),
        Ok(Err(error)) => {
            if error.is_interrupted() {
                if !scope.inner.supervisor.interrupted_scope_itself() {
                    scope.inner.supervisor.record_external_interrupt();
                }
            } else {
                let _ = scope.inner.supervisor.fork_error(error);
            }
            None
        }
        Err(payload) => {
            let _ = scope.inner.supervisor.fork_panic(payload);
            None
        }
    };
    scope.inner.supervisor.body_completed();
    scope.await_end(&carrier);
    scope.shutdown();

    if scope.inner.supervisor.interrupted_scope_itself()
        && !scope.inner.supervisor.saw_external_interrupt()
    {
        carrier.clear();
    }

    match scope.inner.supervisor.take_failure() {
        None => body_value.ok_or_else(|| {
            Error::new(ErrorKind::Internal).with_context("scope ended without failure or value")
        }),
        Some((Failure::Panic(payload), _)) => resume_unwind(payload),
        Some((Failure::Error(mut error), suppressed)) => {
            for s in suppressed {
                error.push_suppressed(s);
            }
            Err(error)
        }
        Some((Failure::App(_), _)) => Err(Error::new(ErrorKind::Internal)
            .with_context("application error reported outside supervised_err")),
    }
}

/// Runs `body` in a supervised scope under an error mode.
///
/// Application errors — containers the mode classifies as errors, whether
/// returned by the body or by `fork_error`/`fork_user_error` forks — end
/// the scope and are *returned* in the mode's container; they are never
/// panicked. Panics and plain errors behave as in [`supervised`].
pub fn supervised_err<M, E, T>(
    mode: M,
    body: impl FnOnce(&Scope) -> Result<M::Container<T>>,
) -> Result<M::Container<T>>
where
    M: ErrorMode<E>,
    E: Send + 'static,
{
    let carrier = park::current_carrier();
    let scope = Scope::root(SupervisorKind::Default, Arc::clone(&carrier));

    let body_value = match catch_unwind(AssertUnwindSafe(|| body(&scope))) {
        Ok(Ok(container)) => {
            if mode.is_error(&container) {
                let error = mode.get_error(container);
                let _ = scope.inner.supervisor.fork_app_error(Box::new(error));
                None
            } else {
                Some(container)
            }
        }
        Ok(Err(error)) => {
            if error.is_interrupted() {
                if !scope.inner.supervisor.interrupted_scope_itself() {
                    scope.inner.supervisor.record_external_interrupt();
                }
            } else {
                let _ = scope.inner.supervisor.fork_error(error);
            }
            None
        }
        Err(payload) => {
            let _ = scope.inner.supervisor.fork_panic(payload);
            None
        }
    };
    scope.inner.supervisor.body_completed();
    scope.await_end(&carrier);
    scope.shutdown();

    if scope.inner.supervisor.interrupted_scope_itself()
        && !scope.inner.supervisor.saw_external_interrupt()
    {
        carrier.clear();
    }

    match scope.inner.supervisor.take_failure() {
        None => body_value.ok_or_else(|| {
            Error::new(ErrorKind::Internal).with_context("scope ended without failure or value")
        }),
        Some((Failure::App(error), _)) => {
            let error = *error
                .downcast::<E>()
                .map_err(|_| {
                    Error::new(ErrorKind::Internal)
                        .with_context("application error type does not match the scope's mode")
                })?;
            Ok(mode.pure_error(error))
        }
        Some((Failure::Panic(payload), _)) => resume_unwind(payload),
        Some((Failure::Error(mut error), suppressed)) => {
            for s in suppressed {
                error.push_suppressed(s);
            }
            Err(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn scoped_returns_body_value() {
        let value = scoped(|_| Ok(41)).expect("body result");
        assert_eq!(value, 41);
    }

    #[test]
    fn supervised_joins_user_forks() {
        let value = supervised(|scope| {
            let a = scope.fork_user(|_| Ok(20));
            let b = scope.fork_user(|_| Ok(22));
            Ok(a.join()? + b.join()?)
        })
        .expect("scope result");
        assert_eq!(value, 42);
    }

    #[test]
    fn supervised_waits_for_unjoined_user_forks() {
        let counter = Arc::new(AtomicUsize::new(0));
        let witness = Arc::clone(&counter);
        supervised(move |scope| {
            let counter = Arc::clone(&witness);
            scope.fork_user(move |_| {
                crate::time::sleep(Duration::from_millis(30))?;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            Ok(())
        })
        .expect("scope result");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn daemon_fork_failure_ends_scope() {
        let err = supervised(|scope| {
            scope.fork(|_| -> Result<()> {
                Err(Error::new(ErrorKind::Internal).with_context("daemon failed"))
            });
            // Parked forever unless the failure interrupts us.
            crate::time::sleep(Duration::from_secs(60))?;
            Ok(())
        })
        .expect_err("daemon failure propagates");
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn daemon_fork_success_is_not_awaited() {
        let started = std::time::Instant::now();
        supervised(|scope| {
            scope.fork(|_| {
                crate::time::sleep(Duration::from_secs(60))?;
                Ok(())
            });
            Ok(())
        })
        .expect("scope ends without the daemon");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn unsupervised_fork_holds_failure_until_join() {
        let outcome = scoped(|scope| {
            let failing = scope.fork_unsupervised(|_| -> Result<()> {
                Err(Error::new(ErrorKind::Internal).with_context("held"))
            });
            // The scope is unaffected by the failure until we look at it.
            let err = failing.join().expect_err("held failure");
            Ok(err.kind())
        })
        .expect("scope result");
        assert_eq!(outcome, ErrorKind::Internal);
    }

    #[test]
    fn fork_panic_resumes_at_scope_exit() {
        let result = std::panic::catch_unwind(|| {
            let _ = supervised(|scope| {
                scope.fork(|_| -> Result<()> { panic!("fork exploded") });
                crate::time::sleep(Duration::from_secs(60))?;
                Ok(())
            });
        });
        assert!(result.is_err());
    }

    #[test]
    fn finalizers_run_lifo() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = Arc::clone(&order);
        let o2 = Arc::clone(&order);
        supervised(move |scope| {
            scope.defer(move || o1.lock().push(1));
            scope.defer(move || o2.lock().push(2));
            Ok(())
        })
        .expect("scope result");
        assert_eq!(*order.lock(), vec![2, 1]);
    }

    #[test]
    fn fork_into_ended_scope_fails() {
        let escaped = supervised(|scope| {
            Ok(Scope {
                inner: Arc::clone(&scope.inner),
            })
        })
        .expect("scope result");
        let fork = escaped.fork(|_| Ok(()));
        let err = fork.join().expect_err("scope already ended");
        assert_eq!(err.kind(), ErrorKind::ScopeCancelled);
    }

    #[test]
    fn cancellable_fork_cancels_promptly() {
        let started = std::time::Instant::now();
        supervised(|scope| {
            let fork = scope.fork_cancellable(|_| {
                crate::time::sleep(Duration::from_secs(3600))?;
                Ok(7)
            });
            let err = fork.cancel().expect_err("cancelled mid-sleep");
            assert!(err.is_interrupted());
            Ok(())
        })
        .expect("scope result");
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn cancellable_fork_returns_value_when_done_first() {
        supervised(|scope| {
            let fork = scope.fork_cancellable(|_| Ok(7));
            crate::time::sleep(Duration::from_millis(30))?;
            assert_eq!(fork.cancel().expect("already completed"), 7);
            Ok(())
        })
        .expect("scope result");
    }

    #[test]
    fn supervised_err_returns_application_error() {
        let mode = ResultMode::<String>::new();
        let outcome = supervised_err(mode, |scope| {
            let fork = scope.fork_user_error(mode, |_| Ok(Err::<u32, _>("bad input".to_string())));
            let _ = fork.join();
            crate::time::sleep(Duration::from_secs(60))?;
            Ok(Ok(0))
        })
        .expect("app errors are values");
        assert_eq!(outcome, Err("bad input".to_string()));
    }

    #[test]
    fn supervised_err_returns_body_value() {
        let mode = ResultMode::<String>::new();
        let outcome = supervised_err(mode, |_| Ok(Ok::<_, String>(5))).expect("value");
        assert_eq!(outcome, Ok(5));
    }

    #[test]
    fn fork_all_joins_in_order() {
        let values = supervised(|scope| {
            let bodies: Vec<_> = (1..=3).map(|i| move |_: &Scope| Ok(i)).collect();
            join_all(scope.fork_all(bodies))
        })
        .expect("scope result");
        assert_eq!(values, vec![1, 2, 3]);
    }
}
