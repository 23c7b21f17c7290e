//! The contract between this core and a stream-combinator library.
//!
//! Operator catalogs live elsewhere; what the core fixes is the shape of a
//! stage and the guarantees its sink can rely on:
//!
//! - callbacks are single-producer: a stage never invokes its sink from
//!   two threads at once;
//! - callbacks are ordered: every `on_next` happens-before the terminal
//!   `on_done` or `on_error`, after which the sink is not called again.
//!
//! A stage typically runs inside a scope and hands elements over a
//! [`crate::Channel`], which is what provides both guarantees.

use crate::error::{Error, Result};

/// Receiver of a stage's output.
pub trait FlowSink<T> {
    /// Delivers the next element.
    fn on_next(&mut self, value: T) -> Result<()>;

    /// Signals successful completion. Terminal.
    fn on_done(&mut self) -> Result<()>;

    /// Signals failure. Terminal.
    fn on_error(&mut self, error: Error) -> Result<()>;
}

/// A runnable stage of a flow.
pub trait FlowStage<T> {
    /// Drives the stage to completion, pushing its output into `sink`.
    fn run(self, sink: &mut dyn FlowSink<T>) -> Result<()>;
}
