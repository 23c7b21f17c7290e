//! Error types and error handling strategy for trellis.
//!
//! This module defines the core error types used throughout the crate.
//! Error handling follows these principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - Interruption is an error kind, not a panic: every suspension point
//!   returns `Result` and fails with [`ErrorKind::Interrupted`] when its
//!   carrier thread is cancelled
//! - Panics are isolated per fork and re-raised at the boundary that owns
//!   them (the scope exit, or `join` for unsupervised forks)

use core::fmt;
use std::sync::Arc;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // === Cancellation ===
    /// The carrier thread was interrupted while suspended.
    Interrupted,
    /// The operation targeted a scope that is already shutting down.
    ScopeCancelled,
    /// A deadline elapsed before the operation completed.
    DeadlineExceeded,

    // === Channels ===
    /// The channel was completed with `done()`.
    ChannelDone,
    /// The channel was closed with `error(..)`.
    ChannelError,
    /// The channel has no buffer space and no waiting receiver.
    ChannelFull,
    /// The channel has no value and no waiting sender.
    ChannelEmpty,

    // === Forks ===
    /// A fork panicked and the panic was propagated to its scope.
    ForkPanicked,

    // === Internal / state machine ===
    /// Internal invariant violation (bug).
    Internal,
}

/// The main error type for trellis operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
    suppressed: Vec<Error>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
            source: None,
            suppressed: Vec::new(),
        }
    }

    /// Creates an interruption error.
    #[must_use]
    pub const fn interrupted() -> Self {
        Self::new(ErrorKind::Interrupted)
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns true if this error represents carrier interruption.
    #[must_use]
    pub const fn is_interrupted(&self) -> bool {
        matches!(self.kind, ErrorKind::Interrupted)
    }

    /// Returns true if this error represents channel closure of either kind.
    #[must_use]
    pub const fn is_channel_closed(&self) -> bool {
        matches!(self.kind, ErrorKind::ChannelDone | ErrorKind::ChannelError)
    }

    /// Adds context text to the error.
    #[must_use]
    pub fn with_context(mut self, ctx: impl Into<String>) -> Self {
        self.context = Some(ctx.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Adds a pre-shared source error to the chain.
    #[must_use]
    pub fn with_shared_source(mut self, source: Arc<dyn std::error::Error + Send + Sync>) -> Self {
        self.source = Some(source);
        self
    }

    /// Attaches a later failure that lost the first-failure race.
    pub fn push_suppressed(&mut self, error: Error) {
        self.suppressed.push(error);
    }

    /// Failures recorded after this one on the same scope.
    #[must_use]
    pub fn suppressed(&self) -> &[Error] {
        &self.suppressed
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(ctx) = &self.context {
            write!(f, ": {ctx}")?;
        }
        if !self.suppressed.is_empty() {
            write!(f, " (+{} suppressed)", self.suppressed.len())?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

/// Error returned when `try_send` fails.
#[derive(Debug, thiserror::Error)]
pub enum TrySendError<T> {
    /// No buffer space and no waiting receiver; the value is handed back.
    #[error("channel is full")]
    Full(T),
    /// The channel is closed; the value is handed back.
    #[error("channel is closed")]
    Closed(T),
}

/// Error returned when `try_receive` fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TryReceiveError {
    /// No value buffered and no waiting sender.
    #[error("channel is empty")]
    Empty,
    /// The channel is closed.
    #[error("channel is closed")]
    Closed,
}

impl<T> From<TrySendError<T>> for Error {
    fn from(e: TrySendError<T>) -> Self {
        match e {
            TrySendError::Full(_) => Self::new(ErrorKind::ChannelFull),
            TrySendError::Closed(_) => Self::new(ErrorKind::ChannelDone),
        }
    }
}

impl From<TryReceiveError> for Error {
    fn from(e: TryReceiveError) -> Self {
        match e {
            TryReceiveError::Empty => Self::new(ErrorKind::ChannelEmpty),
            TryReceiveError::Closed => Self::new(ErrorKind::ChannelDone),
        }
    }
}

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Attach a context string on error.
    fn context(self, ctx: impl Into<String>) -> Result<T>;
    /// Attach context computed lazily on error.
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for core::result::Result<T, E> {
    fn context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(ctx))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| e.into().with_context(f()))
    }
}

/// A specialized Result type for trellis operations.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[derive(Debug)]
    struct Underlying;

    impl fmt::Display for Underlying {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "underlying")
        }
    }

    impl std::error::Error for Underlying {}

    #[test]
    fn display_without_context() {
        let err = Error::new(ErrorKind::Internal);
        assert_eq!(err.to_string(), "Internal");
    }

    #[test]
    fn display_with_context() {
        let err = Error::new(ErrorKind::ChannelEmpty).with_context("no messages");
        assert_eq!(err.to_string(), "ChannelEmpty: no messages");
    }

    #[test]
    fn display_counts_suppressed() {
        let mut err = Error::interrupted();
        err.push_suppressed(Error::new(ErrorKind::ChannelDone));
        assert_eq!(err.to_string(), "Interrupted (+1 suppressed)");
    }

    #[test]
    fn source_chain_is_exposed() {
        let err = Error::new(ErrorKind::ChannelError)
            .with_context("outer")
            .with_source(Underlying);
        let source = err.source().expect("source missing");
        assert_eq!(source.to_string(), "underlying");
    }

    #[test]
    fn from_try_errors() {
        let full: Error = TrySendError::Full(5).into();
        assert_eq!(full.kind(), ErrorKind::ChannelFull);

        let empty: Error = TryReceiveError::Empty.into();
        assert_eq!(empty.kind(), ErrorKind::ChannelEmpty);
    }

    #[test]
    fn result_ext_adds_context() {
        let res: core::result::Result<(), TryReceiveError> = Err(TryReceiveError::Empty);
        let err = res.context("receive failed").expect_err("expected err");
        assert_eq!(err.kind(), ErrorKind::ChannelEmpty);
        assert_eq!(err.to_string(), "ChannelEmpty: receive failed");
    }

    #[test]
    fn predicates_match_kind() {
        assert!(Error::interrupted().is_interrupted());
        assert!(Error::new(ErrorKind::ChannelDone).is_channel_closed());
        assert!(!Error::new(ErrorKind::ChannelFull).is_channel_closed());
    }
}
