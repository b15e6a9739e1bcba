//! Reactive Primitives
//!
//! This module implements the core reactive system: cells, atoms, and
//! calculators.
//!
//! # Concepts
//!
//! ## Cells
//!
//! A Cell wraps a producer and fans its updates out to subscribers. Cells are
//! lazy: the producer only runs while somebody is subscribed. An update is
//! either a value, an error, or "no value".
//!
//! ## Atoms
//!
//! An Atom is a cell whose value is set by hand. It is the usual source at the
//! edge of a graph.
//!
//! ## Calculators
//!
//! A Calculator is a cell whose value is computed, asynchronously, from other
//! cells. The cells a run reads become its dependencies; when any of them emits,
//! the calculator runs again and re-subscribes to exactly what the new run read.
//!
//! # Implementation Notes
//!
//! Dependencies are tracked explicitly: a computation receives a [`Tracker`] and
//! reads cells through it. Nothing is tracked through thread-local state, so a
//! run can be suspended and resumed on any worker thread.

mod atom;
mod calculator;
mod cell;
mod completer;
mod producer;
mod subscriber;
mod tracker;
mod value;

pub use atom::Atom;
pub use calculator::{Calculator, CalculatorBuilder, RunState};
pub use cell::{Cell, CellId, Next, Sink};
pub use producer::{Producer, Stop};
pub use subscriber::{SubscriberId, Subscription};
pub use tracker::Tracker;
pub use value::ValueOrError;
