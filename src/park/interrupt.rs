//! Per-carrier interrupt flags.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::Thread;

use crate::error::{Error, Result};

/// Cooperative cancellation flag for one carrier thread.
///
/// Setting the flag unparks the carrier; the carrier fails its next
/// suspension point with `ErrorKind::Interrupted`. Interruption is
/// idempotent and one-way except for an explicit [`Interrupt::clear`],
/// which a scope uses to consume an interrupt it delivered to itself.
#[derive(Debug)]
pub struct Interrupt {
    flag: AtomicBool,
    /// Interrupt checks succeed while masked; scope finalizers run masked.
    masked: AtomicBool,
    thread: OnceLock<Thread>,
}

impl Interrupt {
    /// Creates an unbound interrupt; [`Interrupt::bind`] attaches the thread.
    #[must_use]
    pub(crate) fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            masked: AtomicBool::new(false),
            thread: OnceLock::new(),
        }
    }

    /// Creates an interrupt bound to the calling thread.
    #[must_use]
    pub(crate) fn for_current_thread() -> Self {
        let interrupt = Self::new();
        interrupt.bind(std::thread::current());
        interrupt
    }

    /// Binds the carrier thread this interrupt targets. At most once.
    pub(crate) fn bind(&self, thread: Thread) {
        let _ = self.thread.set(thread);
    }

    /// Requests cancellation: sets the flag and unparks the carrier.
    pub fn set(&self) {
        self.flag.store(true, Ordering::Release);
        if let Some(thread) = self.thread.get() {
            thread.unpark();
        }
    }

    /// Unparks the carrier without requesting cancellation.
    pub(crate) fn wake(&self) {
        if let Some(thread) = self.thread.get() {
            thread.unpark();
        }
    }

    /// Returns true if cancellation was requested.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Fails with `ErrorKind::Interrupted` if cancellation was requested
    /// and interrupts are not masked.
    pub fn check(&self) -> Result<()> {
        if self.is_set() && !self.masked.load(Ordering::Acquire) {
            Err(Error::interrupted())
        } else {
            Ok(())
        }
    }

    /// Consumes a pending interrupt. Only the scope that delivered the
    /// interrupt to its own entering thread calls this.
    pub(crate) fn clear(&self) {
        self.flag.store(false, Ordering::Release);
    }

    /// Masks interrupt checks while `f` runs. Used for finalizers.
    pub(crate) fn masked<R>(&self, f: impl FnOnce() -> R) -> R {
        self.masked.store(true, Ordering::Release);
        let result = f();
        self.masked.store(false, Ordering::Release);
        result
    }
}

thread_local! {
    static CARRIER: RefCell<Option<Arc<Interrupt>>> = const { RefCell::new(None) };
}

/// Returns the calling thread's carrier interrupt, installing a root
/// carrier on first use for threads not spawned by a scope.
pub(crate) fn current_carrier() -> Arc<Interrupt> {
    CARRIER.with(|slot| {
        let mut slot = slot.borrow_mut();
        match &*slot {
            Some(interrupt) => Arc::clone(interrupt),
            None => {
                let interrupt = Arc::new(Interrupt::for_current_thread());
                *slot = Some(Arc::clone(&interrupt));
                interrupt
            }
        }
    })
}

/// Installs the carrier interrupt for the calling thread. Called once at
/// the top of every fork body.
pub(crate) fn install_carrier(interrupt: Arc<Interrupt>) {
    CARRIER.with(|slot| {
        *slot.borrow_mut() = Some(interrupt);
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_passes_until_set() {
        let interrupt = Interrupt::for_current_thread();
        assert!(interrupt.check().is_ok());
        interrupt.set();
        assert!(interrupt.check().expect_err("interrupted").is_interrupted());
    }

    #[test]
    fn masked_suppresses_check() {
        let interrupt = Interrupt::for_current_thread();
        interrupt.set();
        interrupt.masked(|| {
            assert!(interrupt.check().is_ok());
        });
        assert!(interrupt.check().is_err());
    }

    #[test]
    fn clear_consumes_interrupt() {
        let interrupt = Interrupt::for_current_thread();
        interrupt.set();
        interrupt.clear();
        assert!(interrupt.check().is_ok());
    }

    #[test]
    fn set_unparks_bound_thread() {
        let interrupt = Arc::new(Interrupt::new());
        let interrupt2 = Arc::clone(&interrupt);
        let handle = std::thread::spawn(move || {
            while !interrupt2.is_set() {
                std::thread::park();
            }
        });
        interrupt.bind(handle.thread().clone());
        interrupt.set();
        handle.join().expect("thread exits");
    }

    #[test]
    fn current_carrier_is_stable_per_thread() {
        let a = current_carrier();
        let b = current_carrier();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
