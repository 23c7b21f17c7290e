//! Rendezvous channel: ordered handoff between senders and receivers.
//!
//! A [`Channel`] pairs senders and receivers by cell index: each side claims
//! a unique index with a fetch-add on its own counter, then drives the cell
//! through a small CAS state machine. With capacity zero every `send` waits
//! for a matching `receive` (a rendezvous); with a positive capacity a
//! sender may instead store its value and leave while the buffer has room.
//!
//! # Guarantees
//!
//! - FIFO between senders and FIFO between receivers; pairing is by cell
//!   index, so per-sender program order is observed by receivers.
//! - A value is delivered exactly once; the delivering cell ends `DONE`.
//! - A parked party whose carrier is interrupted tombstones its cell; the
//!   counterpart observes the tombstone and retries at a fresh index.
//! - `done()` / `error(..)` close the channel first-writer-wins and wake
//!   every parked party. After `done()`, receivers drain whatever was
//!   buffered before observing the closed marker; after `error(..)` the
//!   error is observed immediately.
//!
//! # Example
//!
//! ```ignore
//! let ch = Channel::<u32>::buffered(4);
//! ch.send(1)?;
//! assert_eq!(ch.receive()?, 1);
//! ch.done();
//! ```

mod cell;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::error::{Error, ErrorKind, Result, TryReceiveError, TrySendError};
use crate::park::{self, AwaitOutcome, Continuation, Interrupt};
use crate::tracing_compat::trace;

use cell::{state, Cell, Segment, SEGMENT_SIZE};

/// Why a channel is closed.
#[derive(Debug, Clone)]
pub enum ChannelClosed {
    /// Closed with [`Channel::done`]; buffered values still drain.
    Done,
    /// Closed with [`Channel::error`]; observed immediately by all parties.
    Error(Arc<Error>),
}

impl ChannelClosed {
    fn to_error(&self) -> Error {
        match self {
            Self::Done => Error::new(ErrorKind::ChannelDone),
            Self::Error(e) => {
                Error::new(ErrorKind::ChannelError).with_shared_source(Arc::clone(e) as _)
            }
        }
    }
}

/// A received value or the channel's closed marker.
#[derive(Debug)]
pub enum ChannelValue<T> {
    /// A delivered element.
    Value(T),
    /// The channel was completed with `done()` and is drained.
    Done,
    /// The channel was closed with `error(..)`.
    Error(Arc<Error>),
}

/// Outcome of one pass of the send state machine over a cell.
enum SendPass<T> {
    Done,
    Retry(T),
    Full(T),
    Closed(T),
}

/// Outcome of one pass of the receive state machine over a cell.
enum ReceivePass<T> {
    Received(T),
    Retry,
    Empty,
    ClosedCell,
}

/// An ordered handoff channel with a fixed buffer capacity.
///
/// Shared by reference (typically inside an `Arc`) between any number of
/// senders and receivers. All coordination is via atomics on the two
/// sequence counters and the per-cell state bytes; parked parties wait on
/// [`Continuation`]s.
pub struct Channel<T> {
    capacity: u64,
    senders: AtomicU64,
    receivers: AtomicU64,
    closed: OnceLock<ChannelClosed>,
    /// Earliest segment either side may still need. Advanced as both
    /// counters leave a segment behind, which retires it.
    head: Mutex<Arc<Segment<T>>>,
}

impl<T> Channel<T> {
    /// Creates a rendezvous channel: every send waits for a receive.
    #[must_use]
    pub fn rendezvous() -> Self {
        Self::buffered(0)
    }

    /// Creates a channel with the given buffer capacity.
    #[must_use]
    pub fn buffered(capacity: u64) -> Self {
        Self {
            capacity,
            senders: AtomicU64::new(0),
            receivers: AtomicU64::new(0),
            closed: OnceLock::new(),
            head: Mutex::new(Arc::new(Segment::new(0))),
        }
    }

    /// The buffer capacity this channel was created with.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Returns the closed marker, if the channel has been closed.
    #[must_use]
    pub fn closed_for(&self) -> Option<&ChannelClosed> {
        self.closed.get()
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// Blocks until `value` is handed to a receiver or stored in the buffer.
    ///
    /// Fails with `ChannelDone`/`ChannelError` once the channel is closed
    /// and with `Interrupted` if the carrier is cancelled while parked.
    pub fn send(&self, value: T) -> Result<()> {
        let carrier = park::current_carrier();
        let mut value = value;
        loop {
            if let Some(closed) = self.closed.get() {
                return Err(closed.to_error());
            }
            let (index, segment) = self.claim(&self.senders);
            let cell = segment.cell(index);
            match self.update_cell_send(cell, index, value, &carrier, true)? {
                SendPass::Done => {
                    self.maybe_advance_head(index);
                    return Ok(());
                }
                SendPass::Retry(v) => value = v,
                SendPass::Closed(_) => {
                    return Err(self
                        .closed
                        .get()
                        .map_or_else(|| Error::new(ErrorKind::ChannelDone), ChannelClosed::to_error))
                }
                SendPass::Full(_) => unreachable!("blocking send reported full"),
            }
        }
    }

    /// Attempts to send without blocking.
    ///
    /// Succeeds iff a receiver is already waiting or the buffer has room.
    /// The value is handed back on failure.
    pub fn try_send(&self, value: T) -> core::result::Result<(), TrySendError<T>> {
        let carrier = park::current_carrier();
        let mut value = value;
        loop {
            if self.closed.get().is_some() {
                return Err(TrySendError::Closed(value));
            }
            let senders = self.senders.load(Ordering::SeqCst);
            let receivers = self.receivers.load(Ordering::SeqCst);
            if senders >= receivers && senders >= receivers.saturating_add(self.capacity) {
                // No waiting receiver and no buffer room.
                return Err(TrySendError::Full(value));
            }
            let (index, segment) = self.claim(&self.senders);
            let cell = segment.cell(index);
            match self.update_cell_send(cell, index, value, &carrier, false) {
                Ok(SendPass::Done) => {
                    self.maybe_advance_head(index);
                    return Ok(());
                }
                Ok(SendPass::Retry(v) | SendPass::Full(v)) => value = v,
                Ok(SendPass::Closed(v)) => return Err(TrySendError::Closed(v)),
                Err(_) => unreachable!("non-parking send pass cannot be interrupted"),
            }
        }
    }

    /// One pass of the send state machine over the claimed cell.
    #[allow(clippy::too_many_lines)]
    fn update_cell_send(
        &self,
        cell: &Cell<T>,
        index: u64,
        value: T,
        carrier: &Arc<Interrupt>,
        may_park: bool,
    ) -> Result<SendPass<T>> {
        let mut value = value;
        loop {
            let observed = cell.state.load(Ordering::Acquire);
            match observed {
                state::EMPTY | state::IN_BUFFER => {
                    let receivers = self.receivers.load(Ordering::SeqCst);
                    if observed == state::IN_BUFFER
                        || index < receivers.saturating_add(self.capacity)
                    {
                        // Buffered-eligible: store the value and leave.
                        *cell.value.lock() = Some(value);
                        if cell
                            .state
                            .compare_exchange(
                                observed,
                                state::BUFFERED,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            return Ok(SendPass::Done);
                        }
                        value = cell
                            .value
                            .lock()
                            .take()
                            .expect("unpublished value is still the sender's");
                    } else if may_park {
                        let waiter = Arc::new(Continuation::new());
                        *cell.send_waiter.lock() = Some(Arc::clone(&waiter));
                        *cell.value.lock() = Some(value);
                        if cell
                            .state
                            .compare_exchange(
                                state::EMPTY,
                                state::SUSPENDED_SEND,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            return match waiter.await_resume(carrier, || {
                                let _ = cell.state.compare_exchange(
                                    state::SUSPENDED_SEND,
                                    state::INTERRUPTED_SEND,
                                    Ordering::AcqRel,
                                    Ordering::Acquire,
                                );
                            }) {
                                AwaitOutcome::Resumed(()) => Ok(SendPass::Done),
                                AwaitOutcome::Closed => {
                                    let value = cell
                                        .value
                                        .lock()
                                        .take()
                                        .expect("closed-over send value is still present");
                                    Ok(SendPass::Closed(value))
                                }
                                AwaitOutcome::Interrupted => {
                                    let _ = cell.value.lock().take();
                                    Err(Error::interrupted()
                                        .with_context("send interrupted while parked"))
                                }
                            };
                        }
                        // Lost the publish race; reclaim and re-read.
                        let _ = cell.send_waiter.lock().take();
                        value = cell
                            .value
                            .lock()
                            .take()
                            .expect("unpublished value is still the sender's");
                    } else {
                        // Non-blocking send with no receiver and no room:
                        // tombstone the claimed index and report full.
                        if cell
                            .state
                            .compare_exchange(
                                state::EMPTY,
                                state::INTERRUPTED_SEND,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            return Ok(SendPass::Full(value));
                        }
                    }
                }
                state::SUSPENDED_RECEIVE => {
                    let Some(waiter) = cell.receive_waiter.lock().take() else {
                        // Claimed by the close sweep; the state is about to
                        // change, re-read it.
                        continue;
                    };
                    match waiter.try_resume(value) {
                        Ok(()) => {
                            cell.state.store(state::DONE, Ordering::Release);
                            return Ok(SendPass::Done);
                        }
                        // The receiver was interrupted and is tombstoning
                        // the cell; move to a fresh index.
                        Err(v) => return Ok(SendPass::Retry(v)),
                    }
                }
                state::BROKEN | state::INTERRUPTED_RECEIVE => return Ok(SendPass::Retry(value)),
                state::CLOSED => return Ok(SendPass::Closed(value)),
                other => unreachable!("sender observed cell state {other} at its own index"),
            }
        }
    }

    // =========================================================================
    // Receiving
    // =========================================================================

    /// Blocks until a value is available.
    ///
    /// Closure surfaces as an error here; use
    /// [`Channel::receive_or_closed`] to observe it as a value.
    pub fn receive(&self) -> Result<T> {
        match self.receive_or_closed()? {
            ChannelValue::Value(v) => Ok(v),
            ChannelValue::Done => Err(Error::new(ErrorKind::ChannelDone)),
            ChannelValue::Error(e) => {
                Err(Error::new(ErrorKind::ChannelError).with_shared_source(e as _))
            }
        }
    }

    /// Blocks until a value is available or the channel closes.
    ///
    /// After `done()`, values buffered before closure are still delivered;
    /// only then is [`ChannelValue::Done`] observed, forever after. An
    /// `error(..)` closure is observed immediately.
    pub fn receive_or_closed(&self) -> Result<ChannelValue<T>> {
        let carrier = park::current_carrier();
        loop {
            if let Some(closed) = self.closed.get() {
                match closed {
                    ChannelClosed::Error(e) => return Ok(ChannelValue::Error(Arc::clone(e))),
                    ChannelClosed::Done => {
                        if self.receivers.load(Ordering::SeqCst)
                            >= self.senders.load(Ordering::SeqCst)
                        {
                            return Ok(ChannelValue::Done);
                        }
                        // Values may still be draining; claim a cell.
                    }
                }
            }
            let (index, segment) = self.claim(&self.receivers);
            let cell = segment.cell(index);
            match self.update_cell_receive(cell, index, &carrier, true)? {
                ReceivePass::Received(v) => {
                    self.expand_buffer(&segment, index);
                    self.maybe_advance_head(index);
                    return Ok(ChannelValue::Value(v));
                }
                ReceivePass::Retry | ReceivePass::ClosedCell => {}
                ReceivePass::Empty => unreachable!("blocking receive reported empty"),
            }
        }
    }

    /// Attempts to receive without blocking.
    ///
    /// Succeeds iff a value is buffered or a sender is already waiting.
    pub fn try_receive(&self) -> core::result::Result<T, TryReceiveError> {
        let carrier = park::current_carrier();
        loop {
            if let Some(closed) = self.closed.get() {
                match closed {
                    ChannelClosed::Error(_) => return Err(TryReceiveError::Closed),
                    ChannelClosed::Done => {
                        if self.receivers.load(Ordering::SeqCst)
                            >= self.senders.load(Ordering::SeqCst)
                        {
                            return Err(TryReceiveError::Closed);
                        }
                    }
                }
            }
            if self.receivers.load(Ordering::SeqCst) >= self.senders.load(Ordering::SeqCst) {
                return Err(TryReceiveError::Empty);
            }
            let (index, segment) = self.claim(&self.receivers);
            let cell = segment.cell(index);
            match self.update_cell_receive(cell, index, &carrier, false) {
                Ok(ReceivePass::Received(v)) => {
                    self.expand_buffer(&segment, index);
                    self.maybe_advance_head(index);
                    return Ok(v);
                }
                Ok(ReceivePass::Retry | ReceivePass::ClosedCell) => {}
                Ok(ReceivePass::Empty) => return Err(TryReceiveError::Empty),
                Err(_) => unreachable!("non-parking receive pass cannot be interrupted"),
            }
        }
    }

    /// One pass of the receive state machine over the claimed cell.
    fn update_cell_receive(
        &self,
        cell: &Cell<T>,
        index: u64,
        carrier: &Arc<Interrupt>,
        may_park: bool,
    ) -> Result<ReceivePass<T>> {
        loop {
            let observed = cell.state.load(Ordering::Acquire);
            match observed {
                state::BUFFERED => {
                    let value = cell
                        .value
                        .lock()
                        .take()
                        .expect("buffered cell holds a value");
                    cell.state.store(state::DONE, Ordering::Release);
                    return Ok(ReceivePass::Received(value));
                }
                state::SUSPENDED_SEND => {
                    let Some(waiter) = cell.send_waiter.lock().take() else {
                        // Claimed by the close sweep or a buffer expansion;
                        // the state is about to change, re-read it.
                        continue;
                    };
                    if waiter.try_resume(()).is_ok() {
                        let value = cell
                            .value
                            .lock()
                            .take()
                            .expect("resumed sender left its value");
                        cell.state.store(state::DONE, Ordering::Release);
                        return Ok(ReceivePass::Received(value));
                    }
                    // The sender was interrupted and reclaims its value.
                    return Ok(ReceivePass::Retry);
                }
                state::EMPTY | state::IN_BUFFER => {
                    let senders = self.senders.load(Ordering::SeqCst);
                    if index < senders {
                        // The slot was claimed but the sender has not
                        // materialized a value; break the cell so both
                        // sides retry at fresh indices.
                        if cell
                            .state
                            .compare_exchange(
                                observed,
                                state::BROKEN,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            return Ok(ReceivePass::Retry);
                        }
                    } else if self.closed.get().is_some() {
                        if cell
                            .state
                            .compare_exchange(
                                observed,
                                state::CLOSED,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            return Ok(ReceivePass::ClosedCell);
                        }
                    } else if may_park {
                        let waiter = Arc::new(Continuation::new());
                        *cell.receive_waiter.lock() = Some(Arc::clone(&waiter));
                        if cell
                            .state
                            .compare_exchange(
                                observed,
                                state::SUSPENDED_RECEIVE,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            return match waiter.await_resume(carrier, || {
                                let _ = cell.state.compare_exchange(
                                    state::SUSPENDED_RECEIVE,
                                    state::INTERRUPTED_RECEIVE,
                                    Ordering::AcqRel,
                                    Ordering::Acquire,
                                );
                            }) {
                                AwaitOutcome::Resumed(value) => Ok(ReceivePass::Received(value)),
                                AwaitOutcome::Closed => Ok(ReceivePass::ClosedCell),
                                AwaitOutcome::Interrupted => Err(Error::interrupted()
                                    .with_context("receive interrupted while parked")),
                            };
                        }
                        let _ = cell.receive_waiter.lock().take();
                    } else {
                        // Non-blocking receive with no sender in sight:
                        // tombstone the claimed index and report empty.
                        if cell
                            .state
                            .compare_exchange(
                                observed,
                                state::INTERRUPTED_RECEIVE,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            return Ok(ReceivePass::Empty);
                        }
                    }
                }
                state::INTERRUPTED_SEND => return Ok(ReceivePass::Retry),
                state::CLOSED => return Ok(ReceivePass::ClosedCell),
                other => unreachable!("receiver observed cell state {other} at its own index"),
            }
        }
    }

    // =========================================================================
    // Closure
    // =========================================================================

    /// Completes the channel: no further sends; receivers drain the buffer
    /// and then observe [`ChannelValue::Done`] forever.
    pub fn done(&self) {
        self.close(ChannelClosed::Done);
    }

    /// Closes the channel with an error, observed by all parties.
    pub fn error(&self, error: Error) {
        self.close(ChannelClosed::Error(Arc::new(error)));
    }

    fn close(&self, closed: ChannelClosed) {
        if self.closed.set(closed).is_err() {
            // First closer wins.
            return;
        }
        trace!("channel closed");
        let senders = self.senders.load(Ordering::SeqCst);
        let receivers = self.receivers.load(Ordering::SeqCst);
        let lo = senders.min(receivers);
        let hi = senders.max(receivers);
        let mut segment = self.head.lock().clone();
        for index in lo..hi {
            segment = Segment::walk(segment, index);
            let cell = segment.cell(index);
            loop {
                let observed = cell.state.load(Ordering::Acquire);
                let resolved = match observed {
                    state::EMPTY | state::IN_BUFFER => cell
                        .state
                        .compare_exchange(
                            observed,
                            state::CLOSED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok(),
                    state::SUSPENDED_SEND => {
                        if cell
                            .state
                            .compare_exchange(
                                observed,
                                state::CLOSED,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            if let Some(waiter) = cell.send_waiter.lock().take() {
                                waiter.try_close();
                            }
                            true
                        } else {
                            false
                        }
                    }
                    state::SUSPENDED_RECEIVE => {
                        if cell
                            .state
                            .compare_exchange(
                                observed,
                                state::CLOSED,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            if let Some(waiter) = cell.receive_waiter.lock().take() {
                                waiter.try_close();
                            }
                            true
                        } else {
                            false
                        }
                    }
                    // Buffered values are preserved for draining; terminal
                    // states are final.
                    _ => true,
                };
                if resolved {
                    break;
                }
            }
        }
    }

    // =========================================================================
    // Cell bookkeeping
    // =========================================================================

    /// Claims a unique cell index on one side's counter and resolves its
    /// segment.
    ///
    /// The head is snapshotted *before* the fetch-add: the head never
    /// advances past the smaller counter, so the snapshot's base cannot
    /// exceed the claimed index and the walk always reaches it.
    fn claim(&self, counter: &AtomicU64) -> (u64, Arc<Segment<T>>) {
        let snapshot = self.head.lock().clone();
        let index = counter.fetch_add(1, Ordering::SeqCst);
        (index, Segment::walk(snapshot, index))
    }

    /// A completed receive at `index` makes `index + capacity` eligible for
    /// buffering: resume a sender already parked there, or mark the cell so
    /// the next sender stores its value without parking. Walks forward from
    /// the receive's own segment, which is always at or before the target.
    fn expand_buffer(&self, segment: &Arc<Segment<T>>, index: u64) {
        if self.capacity == 0 {
            return;
        }
        let target = index + self.capacity;
        let segment = Segment::walk(Arc::clone(segment), target);
        let cell = segment.cell(target);
        loop {
            match cell.state.load(Ordering::Acquire) {
                state::EMPTY => {
                    if cell
                        .state
                        .compare_exchange(
                            state::EMPTY,
                            state::IN_BUFFER,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return;
                    }
                }
                state::SUSPENDED_SEND => {
                    let Some(waiter) = cell.send_waiter.lock().take() else {
                        continue;
                    };
                    if waiter.try_resume(()).is_ok() {
                        // The sender's value stays in place for a future
                        // receiver at this index.
                        cell.state.store(state::BUFFERED, Ordering::Release);
                    }
                    return;
                }
                _ => return,
            }
        }
    }

    /// Retires segments that both counters have fully passed.
    fn maybe_advance_head(&self, index: u64) {
        if index % SEGMENT_SIZE != SEGMENT_SIZE - 1 {
            return;
        }
        let low_water = self
            .senders
            .load(Ordering::SeqCst)
            .min(self.receivers.load(Ordering::SeqCst));
        let mut head = self.head.lock();
        while head.base + SEGMENT_SIZE <= low_water {
            let Some(next) = head.next_candidate() else {
                break;
            };
            *head = next;
        }
    }
}

impl<T> std::fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("capacity", &self.capacity)
            .field("senders", &self.senders.load(Ordering::Relaxed))
            .field("receivers", &self.receivers.load(Ordering::Relaxed))
            .field("closed", &self.closed.get().is_some())
            .finish_non_exhaustive()
    }
}

impl<T> Default for Channel<T> {
    fn default() -> Self {
        Self::rendezvous()
    }
}
