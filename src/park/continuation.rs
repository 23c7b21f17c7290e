//! Single-use parking cell for rendezvous suspension.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::Thread;

/// Slot is empty; the owner may be parked.
const EMPTY: u8 = 0;
/// A value was published; the owner will consume it.
const SET: u8 = 1;
/// The owner observed its interrupt flag and left.
const INTERRUPTED: u8 = 2;
/// The channel closed under the parked owner.
const CLOSED: u8 = 3;

/// How many times to spin on the slot before parking.
const SPIN_ITERATIONS: u32 = 1000;

/// Outcome of awaiting a continuation.
#[derive(Debug)]
pub(crate) enum AwaitOutcome<E> {
    /// A counterpart delivered a value.
    Resumed(E),
    /// The owning channel closed while parked.
    Closed,
    /// The carrier was interrupted while parked.
    Interrupted,
}

/// A single-owner, single-resume parking cell.
///
/// The owning thread creates the continuation, publishes it (inside a
/// channel cell), and parks in [`Continuation::await_resume`]. Exactly one
/// counterpart may later call [`Continuation::try_resume`]. All races are
/// decided by a CAS on the state slot, so a value is delivered at most once
/// and a resumer always learns whether the waiter is still there.
#[derive(Debug)]
pub(crate) struct Continuation<E> {
    state: AtomicU8,
    payload: Mutex<Option<E>>,
    owner: Thread,
}

impl<E> Continuation<E> {
    /// Creates a continuation owned by the calling thread.
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            payload: Mutex::new(None),
            owner: std::thread::current(),
        }
    }

    /// Delivers `value` and wakes the owner.
    ///
    /// Returns the value back if the owner already left (interrupted or
    /// closed-over), letting the caller retry elsewhere.
    pub(crate) fn try_resume(&self, value: E) -> Result<(), E> {
        *self.payload.lock() = Some(value);
        match self
            .state
            .compare_exchange(EMPTY, SET, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                self.owner.unpark();
                Ok(())
            }
            Err(_) => {
                let value = self
                    .payload
                    .lock()
                    .take()
                    .expect("resume payload still owned by the failed resumer");
                Err(value)
            }
        }
    }

    /// Marks the continuation closed and wakes the owner.
    ///
    /// Returns false if the owner already resumed or left.
    pub(crate) fn try_close(&self) -> bool {
        if self
            .state
            .compare_exchange(EMPTY, CLOSED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.owner.unpark();
            true
        } else {
            false
        }
    }

    /// Parks until resumed, closed, or interrupted.
    ///
    /// Spins briefly before parking. On interrupt, the EMPTY→INTERRUPTED
    /// transition is taken first and `on_interrupt` runs (publishing a
    /// tombstone into the owning cell) before the caller sees the outcome;
    /// a resume that wins the race instead delivers its value normally.
    pub(crate) fn await_resume(
        &self,
        interrupt: &crate::park::Interrupt,
        on_interrupt: impl FnOnce(),
    ) -> AwaitOutcome<E> {
        for _ in 0..SPIN_ITERATIONS {
            if self.state.load(Ordering::Acquire) != EMPTY {
                break;
            }
            std::hint::spin_loop();
        }

        loop {
            match self.state.load(Ordering::Acquire) {
                SET => {
                    let value = self
                        .payload
                        .lock()
                        .take()
                        .expect("resumed continuation holds a payload");
                    return AwaitOutcome::Resumed(value);
                }
                CLOSED => return AwaitOutcome::Closed,
                EMPTY => {
                    if interrupt.is_set() {
                        if self
                            .state
                            .compare_exchange(
                                EMPTY,
                                INTERRUPTED,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            on_interrupt();
                            return AwaitOutcome::Interrupted;
                        }
                        // Lost the race to a resumer or closer; re-read.
                        continue;
                    }
                    std::thread::park();
                }
                state => unreachable!("continuation observed its own tombstone: {state}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::park::Interrupt;
    use std::sync::Arc;

    #[test]
    fn resume_delivers_value() {
        let k = Arc::new(Continuation::<u32>::new());
        let k2 = Arc::clone(&k);
        let resumer = std::thread::spawn(move || {
            k2.try_resume(7).expect("owner is waiting");
        });
        let interrupt = Interrupt::for_current_thread();
        match k.await_resume(&interrupt, || {}) {
            AwaitOutcome::Resumed(v) => assert_eq!(v, 7),
            other => panic!("unexpected outcome: {other:?}"),
        }
        resumer.join().expect("resumer exits");
    }

    #[test]
    fn interrupt_returns_value_to_resumer() {
        let k = Continuation::<u32>::new();
        let interrupt = Interrupt::for_current_thread();
        interrupt.set();

        let mut tombstoned = false;
        match k.await_resume(&interrupt, || tombstoned = true) {
            AwaitOutcome::Interrupted => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(tombstoned);

        // A late resumer gets the value back.
        assert_eq!(k.try_resume(9), Err(9));
        interrupt.clear();
    }

    #[test]
    fn close_wakes_owner() {
        let k = Arc::new(Continuation::<u32>::new());
        let k2 = Arc::clone(&k);
        let closer = std::thread::spawn(move || {
            assert!(k2.try_close());
        });
        let interrupt = Interrupt::for_current_thread();
        match k.await_resume(&interrupt, || {}) {
            AwaitOutcome::Closed => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
        closer.join().expect("closer exits");
    }

    #[test]
    fn resume_is_single_shot() {
        let k = Continuation::<u32>::new();
        assert!(k.try_resume(1).is_ok());
        assert_eq!(k.try_resume(2), Err(2));
        assert!(!k.try_close());
    }
}
