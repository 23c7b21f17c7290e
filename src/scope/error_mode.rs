//! Error-mode adapters.
//!
//! An [`ErrorMode`] declares, for some container type `Container<T>`, how
//! to tell values from application errors and how to build either one. It
//! lets the same scope and schedule machinery drive `Result`-based code and
//! custom result containers (say, a response type whose status field
//! encodes failure) without reshaping them.

use std::marker::PhantomData;

/// Adapter between a computation's container type and its error type.
///
/// Contract: `get_error`/`peek_error` are only called on containers for
/// which [`ErrorMode::is_error`] returned true, and `get_value`/`peek_value`
/// only on containers for which it returned false.
pub trait ErrorMode<E>: Send + Sync + 'static {
    /// The container carrying either a value or an error.
    type Container<T>;

    /// Does this container hold an application error?
    fn is_error<T>(&self, container: &Self::Container<T>) -> bool;

    /// Extracts the error from an error container.
    fn get_error<T>(&self, container: Self::Container<T>) -> E;

    /// Extracts the value from a value container.
    fn get_value<T>(&self, container: Self::Container<T>) -> T;

    /// Borrows the error from an error container.
    fn peek_error<'c, T>(&self, container: &'c Self::Container<T>) -> &'c E;

    /// Borrows the value from a value container.
    fn peek_value<'c, T>(&self, container: &'c Self::Container<T>) -> &'c T;

    /// Wraps a value.
    fn pure<T>(&self, value: T) -> Self::Container<T>;

    /// Wraps an error.
    fn pure_error<T>(&self, error: E) -> Self::Container<T>;
}

/// The `Result`-valued error mode: `Container<T> = Result<T, E>`.
pub struct ResultMode<E>(PhantomData<fn() -> E>);

impl<E> ResultMode<E> {
    /// Creates the `Result` error mode.
    #[must_use]
    pub const fn new() -> Self {
        Self(PhantomData)
    }
}

impl<E> Default for ResultMode<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for ResultMode<E> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<E> Copy for ResultMode<E> {}

impl<E> std::fmt::Debug for ResultMode<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ResultMode")
    }
}

impl<E: Send + 'static> ErrorMode<E> for ResultMode<E> {
    type Container<T> = core::result::Result<T, E>;

    fn is_error<T>(&self, container: &Self::Container<T>) -> bool {
        container.is_err()
    }

    fn get_error<T>(&self, container: Self::Container<T>) -> E {
        match container {
            Err(e) => e,
            Ok(_) => unreachable!("get_error called on a value container"),
        }
    }

    fn get_value<T>(&self, container: Self::Container<T>) -> T {
        match container {
            Ok(t) => t,
            Err(_) => unreachable!("get_value called on an error container"),
        }
    }

    fn peek_error<'c, T>(&self, container: &'c Self::Container<T>) -> &'c E {
        match container {
            Err(e) => e,
            Ok(_) => unreachable!("peek_error called on a value container"),
        }
    }

    fn peek_value<'c, T>(&self, container: &'c Self::Container<T>) -> &'c T {
        match container {
            Ok(t) => t,
            Err(_) => unreachable!("peek_value called on an error container"),
        }
    }

    fn pure<T>(&self, value: T) -> Self::Container<T> {
        Ok(value)
    }

    fn pure_error<T>(&self, error: E) -> Self::Container<T> {
        Err(error)
    }
}
