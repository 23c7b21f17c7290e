//! Cells and segments backing the rendezvous channel.
//!
//! The channel's logical cell array is segmented: fixed-size blocks linked
//! in a singly-linked list. Every cell is visited by exactly one sender and
//! exactly one receiver (each side names cells by fetch-add on its own
//! counter), so per-cell value and waiter slots are one-shot; all races are
//! decided by a CAS on the cell's state byte.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use crate::park::Continuation;

/// Cell states. Terminal states (`DONE`, `BROKEN`, `INTERRUPTED_*`,
/// `CLOSED`) are monotone: a cell never transitions out of them.
pub(crate) mod state {
    /// Untouched; neither side has arrived.
    pub const EMPTY: u8 = 0;
    /// Marked buffered-eligible by a receiver's buffer expansion; the next
    /// sender stores its value without parking.
    pub const IN_BUFFER: u8 = 1;
    /// The sender stored a value and left.
    pub const BUFFERED: u8 = 2;
    /// A sender is parked here with its value.
    pub const SUSPENDED_SEND: u8 = 3;
    /// A receiver is parked here.
    pub const SUSPENDED_RECEIVE: u8 = 4;
    /// The value was delivered.
    pub const DONE: u8 = 5;
    /// A receiver found the cell claimed but unmaterialized; both sides
    /// move on to fresh indices.
    pub const BROKEN: u8 = 6;
    /// A parked sender was interrupted; its value was reclaimed.
    pub const INTERRUPTED_SEND: u8 = 7;
    /// A parked receiver was interrupted.
    pub const INTERRUPTED_RECEIVE: u8 = 8;
    /// The channel closed under this cell.
    pub const CLOSED: u8 = 9;
}

/// Cells per segment.
pub(crate) const SEGMENT_SIZE: u64 = 32;

/// One rendezvous slot.
pub(crate) struct Cell<T> {
    pub(crate) state: AtomicU8,
    /// Present in `BUFFERED` and `SUSPENDED_SEND`; taken exactly once.
    pub(crate) value: Mutex<Option<T>>,
    /// Taking the waiter is the arbitration point between a resuming
    /// counterpart and the channel's close sweep.
    pub(crate) send_waiter: Mutex<Option<Arc<Continuation<()>>>>,
    pub(crate) receive_waiter: Mutex<Option<Arc<Continuation<T>>>>,
}

impl<T> Cell<T> {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(state::EMPTY),
            value: Mutex::new(None),
            send_waiter: Mutex::new(None),
            receive_waiter: Mutex::new(None),
        }
    }
}

/// A fixed-size block of cells covering indices `base .. base + SEGMENT_SIZE`.
pub(crate) struct Segment<T> {
    pub(crate) base: u64,
    cells: Vec<Cell<T>>,
    next: OnceLock<Arc<Segment<T>>>,
}

impl<T> Segment<T> {
    pub(crate) fn new(base: u64) -> Self {
        Self {
            base,
            cells: (0..SEGMENT_SIZE).map(|_| Cell::new()).collect(),
            next: OnceLock::new(),
        }
    }

    /// The cell for a global index. The index must fall in this segment.
    pub(crate) fn cell(&self, index: u64) -> &Cell<T> {
        debug_assert!(index >= self.base && index < self.base + SEGMENT_SIZE);
        &self.cells[(index - self.base) as usize]
    }

    /// The following segment, if one has been linked.
    pub(crate) fn next_candidate(&self) -> Option<Arc<Segment<T>>> {
        self.next.get().map(Arc::clone)
    }

    /// The following segment, linking a fresh one if none exists yet.
    pub(crate) fn next_or_link(&self) -> Arc<Segment<T>> {
        Arc::clone(
            self.next
                .get_or_init(|| Arc::new(Segment::new(self.base + SEGMENT_SIZE))),
        )
    }

    /// Walks forward from `start` to the segment covering `index`,
    /// linking segments as needed. `start.base` must not exceed `index`.
    pub(crate) fn walk(start: Arc<Segment<T>>, index: u64) -> Arc<Segment<T>> {
        let mut segment = start;
        while segment.base + SEGMENT_SIZE <= index {
            segment = segment.next_or_link();
        }
        segment
    }
}

impl<T> Drop for Segment<T> {
    // Unlink iteratively so dropping a retired head cannot recurse
    // through a long chain.
    fn drop(&mut self) {
        let mut next = self.next.take();
        while let Some(segment) = next {
            next = match Arc::try_unwrap(segment) {
                Ok(mut inner) => inner.next.take(),
                Err(_) => None,
            };
        }
    }
}
