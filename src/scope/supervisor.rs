//! Scope-ending policy.
//!
//! The supervisor is the authority that decides when a scope ends. It
//! tracks outstanding user forks and the first propagated failure; the
//! thread that entered the scope parks until the supervisor signals the
//! end, then performs teardown.

use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::Error;
use crate::park::Interrupt;
use crate::tracing_compat::debug;

/// A captured panic payload.
pub(crate) type PanicPayload = Box<dyn Any + Send + 'static>;

/// The first failure recorded on a scope.
pub(crate) enum Failure {
    /// A fork (or the body) failed with an error.
    Error(Error),
    /// A fork (or the body) panicked.
    Panic(PanicPayload),
    /// An error-mode fork produced an application error.
    App(Box<dyn Any + Send>),
}

/// Which policy the scope runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SupervisorKind {
    /// `scoped`: forks hold their failures until joined; nothing a fork
    /// does ends the scope early.
    NoOp,
    /// `supervised`/`supervised_err`: the first failure ends the scope;
    /// the scope also ends when the body and all user forks complete.
    Default,
}

pub(crate) struct Supervisor {
    kind: SupervisorKind,
    /// User forks still running.
    outstanding: AtomicUsize,
    body_done: AtomicBool,
    ended: AtomicBool,
    /// Set before interrupting the scope's own carrier so the scope thread
    /// can tell its own failure-interrupt from an external cancellation.
    interrupted_scope: AtomicBool,
    external_interrupt: AtomicBool,
    state: Mutex<FailureState>,
    scope_carrier: Arc<Interrupt>,
}

struct FailureState {
    failure: Option<Failure>,
    suppressed: Vec<Error>,
}

impl Supervisor {
    pub(crate) fn new(kind: SupervisorKind, scope_carrier: Arc<Interrupt>) -> Self {
        Self {
            kind,
            outstanding: AtomicUsize::new(0),
            body_done: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            interrupted_scope: AtomicBool::new(false),
            external_interrupt: AtomicBool::new(false),
            state: Mutex::new(FailureState {
                failure: None,
                suppressed: Vec::new(),
            }),
            scope_carrier,
        }
    }

    // =========================================================================
    // Fork accounting
    // =========================================================================

    /// A user fork was registered.
    pub(crate) fn fork_starts(&self) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
    }

    /// A user fork completed successfully (or was benignly interrupted).
    pub(crate) fn fork_success(&self) {
        let remaining = self.outstanding.fetch_sub(1, Ordering::SeqCst) - 1;
        if self.kind == SupervisorKind::Default
            && remaining == 0
            && self.body_done.load(Ordering::SeqCst)
        {
            self.signal_end();
        }
    }

    /// The scope body finished running.
    pub(crate) fn body_completed(&self) {
        self.body_done.store(true, Ordering::SeqCst);
        if self.kind == SupervisorKind::Default && self.outstanding.load(Ordering::SeqCst) == 0 {
            self.signal_end();
        }
    }

    // =========================================================================
    // Failure recording
    // =========================================================================

    /// Records a fork error. Returns the error back when another failure
    /// already won the first-failure race (or the supervisor is NoOp); the
    /// caller then surfaces it at `join`.
    pub(crate) fn fork_error(&self, error: Error) -> Option<Error> {
        match self.record(Failure::Error(error)) {
            None => None,
            Some(Failure::Error(error)) => {
                self.suppress(error.clone());
                Some(error)
            }
            Some(_) => unreachable!("error failure returns as error"),
        }
    }

    /// Records a fork panic; the payload comes back if rejected.
    pub(crate) fn fork_panic(&self, payload: PanicPayload) -> Option<PanicPayload> {
        match self.record(Failure::Panic(payload)) {
            None => None,
            Some(Failure::Panic(payload)) => {
                self.suppress(
                    Error::new(crate::error::ErrorKind::ForkPanicked)
                        .with_context(panic_message(&payload)),
                );
                Some(payload)
            }
            Some(_) => unreachable!("panic failure returns as panic"),
        }
    }

    /// Records an application error from an error-mode fork.
    pub(crate) fn fork_app_error(&self, error: Box<dyn Any + Send>) -> Option<Box<dyn Any + Send>> {
        match self.record(Failure::App(error)) {
            None => None,
            Some(Failure::App(error)) => {
                self.suppress(
                    Error::new(crate::error::ErrorKind::ScopeCancelled)
                        .with_context("suppressed application error"),
                );
                Some(error)
            }
            Some(_) => unreachable!("app failure returns as app"),
        }
    }

    /// The scope thread observed an interrupt it did not deliver to
    /// itself: record it as the scope's failure so teardown runs.
    pub(crate) fn record_external_interrupt(&self) {
        self.external_interrupt.store(true, Ordering::SeqCst);
        let _ = self.record(Failure::Error(Error::interrupted()));
        // record() only ends Default scopes; a NoOp scope tears down when
        // its body returns the interrupt error.
        self.signal_end();
    }

    /// First-writer-wins failure slot. `None` means the failure was
    /// accepted (and, under the default policy, the scope is now ending).
    fn record(&self, failure: Failure) -> Option<Failure> {
        if self.kind == SupervisorKind::NoOp {
            return Some(failure);
        }
        {
            let mut state = self.state.lock();
            if state.failure.is_some() {
                return Some(failure);
            }
            state.failure = Some(failure);
        }
        debug!("scope failure recorded; ending scope");
        if !self.body_done.load(Ordering::SeqCst) {
            // Abort the body: it observes the interrupt at its next
            // suspension point.
            self.interrupted_scope.store(true, Ordering::SeqCst);
            self.scope_carrier.set();
        }
        self.signal_end();
        None
    }

    fn suppress(&self, error: Error) {
        if self.kind == SupervisorKind::Default {
            self.state.lock().suppressed.push(error);
        }
    }

    // =========================================================================
    // Scope end
    // =========================================================================

    fn signal_end(&self) {
        self.ended.store(true, Ordering::SeqCst);
        self.scope_carrier.wake();
    }

    pub(crate) fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    pub(crate) fn interrupted_scope_itself(&self) -> bool {
        self.interrupted_scope.load(Ordering::SeqCst)
    }

    pub(crate) fn saw_external_interrupt(&self) -> bool {
        self.external_interrupt.load(Ordering::SeqCst)
    }

    /// Takes the recorded failure and everything suppressed behind it.
    pub(crate) fn take_failure(&self) -> Option<(Failure, Vec<Error>)> {
        let mut state = self.state.lock();
        let failure = state.failure.take()?;
        Some((failure, std::mem::take(&mut state.suppressed)))
    }
}

/// Best-effort text for a panic payload.
pub(crate) fn panic_message(payload: &PanicPayload) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn supervisor(kind: SupervisorKind) -> Supervisor {
        Supervisor::new(kind, Arc::new(Interrupt::for_current_thread()))
    }

    #[test]
    fn ends_when_body_and_user_forks_complete() {
        let s = supervisor(SupervisorKind::Default);
        s.fork_starts();
        s.body_completed();
        assert!(!s.is_ended());
        s.fork_success();
        assert!(s.is_ended());
    }

    #[test]
    fn ends_without_forks_when_body_completes() {
        let s = supervisor(SupervisorKind::Default);
        s.body_completed();
        assert!(s.is_ended());
    }

    #[test]
    fn first_failure_wins_and_ends_scope() {
        let s = supervisor(SupervisorKind::Default);
        s.fork_starts();
        assert!(s.fork_error(Error::new(ErrorKind::Internal)).is_none());
        assert!(s.is_ended());

        // The loser is handed back and recorded as suppressed.
        let rejected = s.fork_error(Error::new(ErrorKind::ChannelDone));
        assert!(rejected.is_some());

        let (failure, suppressed) = s.take_failure().expect("failure recorded");
        assert!(matches!(failure, Failure::Error(_)));
        assert_eq!(suppressed.len(), 1);
    }

    #[test]
    fn noop_rejects_and_never_ends() {
        let s = supervisor(SupervisorKind::NoOp);
        assert!(s.fork_error(Error::new(ErrorKind::Internal)).is_some());
        assert!(s.fork_panic(Box::new("boom")).is_some());
        assert!(!s.is_ended());
        assert!(s.take_failure().is_none());
    }

    #[test]
    fn failure_interrupts_running_body() {
        let carrier = Arc::new(Interrupt::for_current_thread());
        let s = Supervisor::new(SupervisorKind::Default, Arc::clone(&carrier));
        assert!(s.fork_error(Error::new(ErrorKind::Internal)).is_none());
        assert!(s.interrupted_scope_itself());
        assert!(carrier.is_set());
        carrier.clear();
    }

    #[test]
    fn panic_message_extraction() {
        assert_eq!(panic_message(&(Box::new("boom") as PanicPayload)), "boom");
        assert_eq!(
            panic_message(&(Box::new(String::from("ouch")) as PanicPayload)),
            "ouch"
        );
        assert_eq!(
            panic_message(&(Box::new(42_u32) as PanicPayload)),
            "opaque panic payload"
        );
    }
}
