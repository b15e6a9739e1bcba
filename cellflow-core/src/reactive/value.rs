//! Value-or-error updates.
//!
//! Every push a cell receives is a [`ValueOrError`]: exactly one of a value or a
//! [`Fault`]. Errors are ordinary updates, they are stored as the cell's current
//! value and fanned out to subscribers like any other.

use crate::error::Fault;

/// The tagged result of one update.
#[derive(Debug, Clone)]
pub enum ValueOrError<T> {
    /// The update carries a value.
    Value(T),
    /// The update carries a failure.
    Error(Fault),
}

impl<T> ValueOrError<T> {
    /// Build a value update.
    pub fn value(value: T) -> Self {
        Self::Value(value)
    }

    /// Build an error update.
    pub fn error(error: impl Into<Fault>) -> Self {
        Self::Error(error.into())
    }

    pub fn is_value(&self) -> bool {
        matches!(self, Self::Value(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// The carried value, if this update is not an error.
    pub fn as_value(&self) -> Option<&T> {
        match self {
            Self::Value(value) => Some(value),
            Self::Error(_) => None,
        }
    }

    /// The carried fault, if this update is an error.
    pub fn as_error(&self) -> Option<&Fault> {
        match self {
            Self::Value(_) => None,
            Self::Error(fault) => Some(fault),
        }
    }

    /// Query the update, re-raising the carried error as a failure.
    pub fn get(&self) -> Result<&T, Fault> {
        match self {
            Self::Value(value) => Ok(value),
            Self::Error(fault) => Err(fault.clone()),
        }
    }

    /// Consume the update, re-raising the carried error as a failure.
    pub fn into_result(self) -> Result<T, Fault> {
        match self {
            Self::Value(value) => Ok(value),
            Self::Error(fault) => Err(fault),
        }
    }

    /// Transform the carried value, leaving errors untouched.
    pub fn map<U, F>(self, f: F) -> ValueOrError<U>
    where
        F: FnOnce(T) -> U,
    {
        match self {
            Self::Value(value) => ValueOrError::Value(f(value)),
            Self::Error(fault) => ValueOrError::Error(fault),
        }
    }
}

impl<T> From<Result<T, Fault>> for ValueOrError<T> {
    fn from(result: Result<T, Fault>) -> Self {
        match result {
            Ok(value) => Self::Value(value),
            Err(fault) => Self::Error(fault),
        }
    }
}

/// Values compare by value; errors compare by identity of the underlying fault.
impl<T: PartialEq> PartialEq for ValueOrError<T> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Value(a), Self::Value(b)) => a == b,
            (Self::Error(a), Self::Error(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}
