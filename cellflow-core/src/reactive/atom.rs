//! Settable source cells.
//!
//! An [`Atom`] holds a value that callers write directly. Its cell pushes the
//! value on activation and again on every write while active; writes made while
//! the cell is inactive are picked up on the next activation.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Fault;

use super::cell::{Cell, Sink};
use super::producer::Stop;
use super::value::ValueOrError;

struct Slot<T> {
    value: ValueOrError<T>,
    sink: Option<Sink<T>>,
}

/// A cell whose value is set by hand.
///
/// # Example
///
/// ```rust,ignore
/// let count = Atom::new(0);
/// let _sub = count.subscribe(|update| println!("{update:?}"));
/// // Prints: Some(Value(0))
///
/// count.set(5);
/// // Prints: Some(Value(5))
/// ```
pub struct Atom<T> {
    cell: Cell<T>,
    slot: Arc<Mutex<Slot<T>>>,
}

impl<T> Atom<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(value: T) -> Self {
        let slot = Arc::new(Mutex::new(Slot {
            value: ValueOrError::Value(value),
            sink: None,
        }));

        let producer_slot = Arc::clone(&slot);
        let cell = Cell::from_fn(move |sink: Sink<T>| {
            let value = {
                let mut slot = producer_slot.lock();
                slot.sink = Some(sink.clone());
                slot.value.clone()
            };
            sink.push(Some(value));

            let slot = Arc::clone(&producer_slot);
            Stop::new(move || {
                slot.lock().sink = None;
            })
        });

        Self { cell, slot }
    }

    /// The stored value, whether or not the cell is active.
    pub fn get(&self) -> ValueOrError<T> {
        self.slot.lock().value.clone()
    }

    /// Store a new value and notify subscribers.
    pub fn set(&self, value: T) {
        self.write(ValueOrError::Value(value));
    }

    /// Store a failure and notify subscribers.
    pub fn fail(&self, error: impl Into<Fault>) {
        self.write(ValueOrError::Error(error.into()));
    }

    /// Update the value using a function.
    ///
    /// Returns `false` without writing if the atom currently holds an error.
    pub fn update<F>(&self, f: F) -> bool
    where
        F: FnOnce(&T) -> T,
    {
        let current = self.slot.lock().value.clone();
        let next = match &current {
            ValueOrError::Value(value) => f(value),
            ValueOrError::Error(_) => return false,
        };
        self.set(next);
        true
    }

    /// The underlying cell.
    pub fn cell(&self) -> &Cell<T> {
        &self.cell
    }

    fn write(&self, value: ValueOrError<T>) {
        let sink = {
            let mut slot = self.slot.lock();
            slot.value = value.clone();
            slot.sink.clone()
        };
        if let Some(sink) = sink {
            sink.push(Some(value));
        }
    }
}

impl<T> Deref for Atom<T> {
    type Target = Cell<T>;

    fn deref(&self) -> &Cell<T> {
        &self.cell
    }
}

impl<T> Clone for Atom<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> fmt::Debug for Atom<T>
where
    T: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Atom")
            .field("value", &self.slot.lock().value)
            .field("cell", &self.cell)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pushes_on_activation_and_set() {
        let atom = Atom::new(1);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        let _sub = atom.subscribe(move |update| {
            if let Some(value) = update.and_then(ValueOrError::as_value) {
                seen_clone.lock().push(*value);
            }
        });
        atom.set(2);
        atom.update(|v| v * 10);

        assert_eq!(*seen.lock(), vec![1, 2, 20]);
    }

    #[test]
    fn writes_while_inactive_are_seen_on_activation() {
        let atom = Atom::new("idle");
        atom.set("configured");
        assert!(atom.current().is_none());
        assert_eq!(atom.get(), ValueOrError::Value("configured"));

        let _sub = atom.subscribe(|_| {});
        assert_eq!(atom.current(), Some(ValueOrError::Value("configured")));
    }

    #[test]
    fn update_refuses_error_state() {
        let atom = Atom::new(3);
        atom.fail(Fault::msg("sensor fault"));

        assert!(!atom.update(|v| v + 1));
        assert!(atom.get().is_error());
    }

    #[test]
    fn clone_shares_state() {
        let atom1 = Atom::new(0);
        let atom2 = atom1.clone();

        atom1.set(42);
        assert_eq!(atom2.get(), ValueOrError::Value(42));
        assert!(atom1.ptr_eq(&atom2));
    }
}
