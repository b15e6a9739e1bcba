//! Error types.
//!
//! Two kinds of failure flow through this crate:
//!
//! - [`Fault`] is the opaque payload a cell carries in its error channel. Producers
//!   and computations report failures as faults, and they travel to subscribers
//!   exactly like values.
//! - [`CellError`] covers failures raised by the crate itself: building a
//!   calculator outside a runtime, a read belonging to a torn-down run, and so on.
//!   A `CellError` converts into a `Fault` when it has to travel through a cell.

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Result alias for operations that fail with a [`CellError`].
pub type Result<T, E = CellError> = std::result::Result<T, E>;

/// Errors raised by the cell engine itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CellError {
    /// A calculator was built without a runtime handle outside a tokio runtime.
    #[error("no tokio runtime available to drive calculator `{name}`")]
    NoRuntime { name: String },

    /// A dependency read belonged to a run that was torn down before it settled.
    #[error("dependency read cancelled: its run was torn down")]
    Cancelled,

    /// The computation panicked instead of returning a result.
    #[error("computation panicked: {message}")]
    Panicked { message: String },

    /// A `next()` wait lost the subscription that was meant to resolve it.
    #[error("cell closed before emitting a value")]
    Closed,
}

/// Opaque error payload carried through a cell's error channel.
///
/// Cloning a fault is cheap; every subscriber of a failing cell receives a handle
/// to the same underlying error. Any `std::error::Error + Send + Sync` converts into
/// a fault, so `?` works inside computations.
#[derive(Clone)]
pub struct Fault(Arc<dyn StdError + Send + Sync + 'static>);

impl Fault {
    /// Wrap a concrete error.
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self(Arc::new(error))
    }

    /// Build a fault from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(Message(message.into()))
    }

    /// Borrow the underlying error.
    pub fn as_error(&self) -> &(dyn StdError + Send + Sync + 'static) {
        &*self.0
    }

    /// Attempt to view the underlying error as a concrete type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: StdError + 'static,
    {
        self.0.downcast_ref::<E>()
    }

    /// Whether two faults share the same underlying error.
    pub fn ptr_eq(&self, other: &Fault) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<E> From<E> for Fault
where
    E: StdError + Send + Sync + 'static,
{
    fn from(error: E) -> Self {
        Self::new(error)
    }
}

impl fmt::Debug for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Fault").field(&self.0).finish()
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
struct Message(String);

/// Render a panic payload for logging.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
