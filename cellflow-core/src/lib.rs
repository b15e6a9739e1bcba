//! Cellflow Core
//!
//! This crate provides a small reactive-value graph built from two pieces:
//!
//! - Cells: lazily activated value sources with synchronous fan-out
//! - Calculators: derived cells recomputed asynchronously from the cells they read
//!
//! Every update carries either a value or an error, so failures propagate through
//! a graph exactly like values do.
//!
//! # Architecture
//!
//! The crate is organized into two modules:
//!
//! - `reactive`: cells, atoms, calculators and dependency tracking
//! - `error`: the crate error type and the opaque fault carried by cells
//!
//! # Example
//!
//! ```rust,ignore
//! use cellflow_core::reactive::{Atom, Calculator, Tracker};
//!
//! // Create a source
//! let count = Atom::new(1);
//!
//! // Create a derived value
//! let doubled = Calculator::new({
//!     let count = count.clone();
//!     move |cx: Tracker| {
//!         let count = count.clone();
//!         async move { Ok(cx.read(&count).await? * 2) }
//!     }
//! })?;
//!
//! // Subscribe to it
//! let _sub = doubled.subscribe(|update| println!("doubled: {update:?}"));
//!
//! // Update the source
//! count.set(5);
//! // Once the run settles, prints: "doubled: Some(Value(10))"
//! ```

pub mod error;
pub mod reactive;

pub use error::{CellError, Fault, Result};
pub use reactive::{Atom, Calculator, Cell, Sink, Stop, Subscription, Tracker, ValueOrError};
