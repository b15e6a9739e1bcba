//! The producer contract a cell wraps.
//!
//! A producer is anything that can be started with a [`Sink`] and later stopped.
//! Once started it may push any number of updates into the sink, from any thread,
//! until its [`Stop`] handle runs. Pushing after stop is a caller error the cell
//! does not guard against.

use std::fmt;

use super::cell::Sink;

/// A source of updates that can be started and stopped.
pub trait Producer<T>: Send + 'static {
    /// Start producing into `sink`. The returned handle stops the producer.
    fn start(&mut self, sink: Sink<T>) -> Stop;
}

impl<T, F> Producer<T> for F
where
    F: FnMut(Sink<T>) -> Stop + Send + 'static,
{
    fn start(&mut self, sink: Sink<T>) -> Stop {
        self(sink)
    }
}

/// Stops one activation of a producer.
///
/// The owning cell runs it exactly once per activation cycle.
pub struct Stop(Box<dyn FnOnce() + Send>);

impl Stop {
    pub fn new<F>(stop: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self(Box::new(stop))
    }

    /// A handle for producers with nothing to tear down.
    pub fn noop() -> Self {
        Self::new(|| {})
    }

    pub(crate) fn stop(self) {
        (self.0)()
    }
}

impl Default for Stop {
    fn default() -> Self {
        Self::noop()
    }
}

impl fmt::Debug for Stop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Stop")
    }
}
