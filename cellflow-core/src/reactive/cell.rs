//! Cell Implementation
//!
//! A Cell is the leaf reactive primitive. It wraps a [`Producer`] and exposes the
//! producer's latest update to any number of subscribers.
//!
//! # How Cells Work
//!
//! 1. A cell starts inactive: its producer has not been started.
//!
//! 2. The first subscriber activates it. The producer is started with a
//!    [`Sink`] and the returned [`Stop`] handle is retained.
//!
//! 3. Every push through the sink is stored as the cell's current value and
//!    delivered synchronously to every subscriber, in registration order.
//!
//! 4. When the last subscriber leaves, the stop handle runs and the cell is
//!    inactive again. The last value is kept and reported by `current()` until
//!    the producer pushes something new.
//!
//! # Thread Safety
//!
//! Cells are `Send + Sync`. State sits behind a `parking_lot::Mutex` that is never
//! held while user code runs. Emissions of a single cell are serialized by a
//! reentrant lock. A subscriber may push into the cell it is listening to; that
//! update is queued and delivered once the current round has reached everyone.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use indexmap::IndexMap;
use parking_lot::{Mutex, ReentrantMutex};
use smallvec::SmallVec;
use tokio::sync::oneshot;

use crate::error::{panic_message, CellError, Fault};

use super::completer::Completer;
use super::producer::{Producer, Stop};
use super::subscriber::{Callback, SubscriberId, Subscription};
use super::value::ValueOrError;

/// Counter for generating unique cell IDs.
static CELL_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Identity of a cell, shared by all of its clones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId(u64);

impl CellId {
    fn next() -> Self {
        Self(CELL_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// A lazily activated reactive value.
///
/// Clones share the same producer, subscribers and current value.
///
/// # Example
///
/// ```rust,ignore
/// let cell = Cell::from_fn(|sink| {
///     sink.value(5);
///     Stop::noop()
/// });
///
/// assert!(cell.current().is_none());
/// let _sub = cell.subscribe(|update| println!("{update:?}"));
/// // Prints: Some(Value(5))
/// ```
pub struct Cell<T> {
    inner: Arc<CellInner<T>>,
}

pub(crate) struct CellInner<T> {
    id: CellId,
    producer: Mutex<Box<dyn Producer<T>>>,
    state: Mutex<CellState<T>>,
    /// Held for the duration of one emission round.
    delivery: ReentrantMutex<()>,
}

struct CellState<T> {
    subscribers: IndexMap<SubscriberId, Callback<T>>,
    activation: Activation,
    last: Option<ValueOrError<T>>,
    /// Set while a delivery round runs; pushes made meanwhile wait in `queued`.
    delivering: bool,
    queued: VecDeque<Option<ValueOrError<T>>>,
}

enum Activation {
    Inactive,
    /// The producer is being started. `release` is set when the last subscriber
    /// left before `start` returned.
    Starting { release: bool },
    Active(Stop),
}

impl<T> Cell<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create an inactive cell around a producer.
    pub fn new(producer: impl Producer<T>) -> Self {
        Self {
            inner: Arc::new(CellInner {
                id: CellId::next(),
                producer: Mutex::new(Box::new(producer)),
                state: Mutex::new(CellState {
                    subscribers: IndexMap::new(),
                    activation: Activation::Inactive,
                    last: None,
                    delivering: false,
                    queued: VecDeque::new(),
                }),
                delivery: ReentrantMutex::new(()),
            }),
        }
    }

    /// Create a cell from a start function returning its stop handle.
    pub fn from_fn<F>(start: F) -> Self
    where
        F: FnMut(Sink<T>) -> Stop + Send + 'static,
    {
        Self::new(start)
    }

    /// A cell that pushes `value` each time it activates.
    pub fn constant(value: T) -> Self {
        Self::from_fn(move |sink| {
            sink.value(value.clone());
            Stop::noop()
        })
    }

    pub fn id(&self) -> CellId {
        self.inner.id
    }

    /// The most recent update, without activating the cell.
    ///
    /// `None` until the producer has pushed a defined update.
    pub fn current(&self) -> Option<ValueOrError<T>> {
        self.inner.state.lock().last.clone()
    }

    /// Wait for the next defined update pushed after this call.
    ///
    /// The update already reported by `current()` is not replayed. The returned
    /// future holds a subscription, so the cell stays active until it resolves or
    /// is dropped.
    pub fn next(&self) -> Next<T> {
        let (completer, receiver) = Completer::new();
        let id = SubscriberId::new();
        let cell = Arc::downgrade(&self.inner);

        let callback: Callback<T> = Arc::new(move |update| {
            // `None` is a reset; keep waiting for a defined update.
            let Some(update) = update else {
                return;
            };
            if completer.complete(update.clone().into_result()).resolved_now() {
                if let Some(cell) = cell.upgrade() {
                    cell.detach(id);
                }
            }
        });

        Next {
            receiver,
            subscription: self.inner.attach(id, callback),
        }
    }

    /// Register a listener, activating the cell if it is the first one.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(Option<&ValueOrError<T>>) + Send + Sync + 'static,
    {
        self.inner.attach(SubscriberId::new(), Arc::new(callback))
    }

    /// Get the number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.state.lock().subscribers.len()
    }

    /// Whether the producer is currently started.
    pub fn is_active(&self) -> bool {
        !matches!(self.inner.state.lock().activation, Activation::Inactive)
    }

    /// Whether two handles refer to the same cell.
    pub fn ptr_eq(&self, other: &Cell<T>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T> CellInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn attach(self: &Arc<Self>, id: SubscriberId, callback: Callback<T>) -> Subscription {
        let start = {
            let mut state = self.state.lock();
            state.subscribers.insert(id, callback);
            if state.subscribers.len() != 1 {
                false
            } else if matches!(state.activation, Activation::Inactive) {
                state.activation = Activation::Starting { release: false };
                true
            } else if let Activation::Starting { release } = &mut state.activation {
                // Resubscribed before the producer finished starting.
                *release = false;
                false
            } else {
                tracing::warn!(cell = ?self.id, "cell active with no subscribers");
                debug_assert!(false, "cell active with no subscribers");
                false
            }
        };

        if start {
            self.activate();
        }

        let cell = Arc::clone(self);
        Subscription::new(move || cell.detach(id))
    }

    fn activate(self: &Arc<Self>) {
        tracing::trace!(cell = ?self.id, "activating");

        let sink = Sink {
            cell: Arc::downgrade(self),
        };
        let stop = self.producer.lock().start(sink);

        let release = {
            let mut state = self.state.lock();
            match mem::replace(&mut state.activation, Activation::Inactive) {
                // Everyone left while the producer was starting.
                Activation::Starting { release: true } => Some(stop),
                Activation::Starting { release: false } => {
                    state.activation = Activation::Active(stop);
                    None
                }
                other => {
                    tracing::warn!(cell = ?self.id, "activation finished on a cell that was not starting");
                    debug_assert!(false, "double activation");
                    state.activation = other;
                    Some(stop)
                }
            }
        };

        if let Some(stop) = release {
            tracing::trace!(cell = ?self.id, "deactivating");
            stop.stop();
        }
    }

    fn detach(&self, id: SubscriberId) {
        let (removed, stop) = {
            let mut state = self.state.lock();
            let Some(removed) = state.subscribers.shift_remove(&id) else {
                return;
            };
            let stop = if state.subscribers.is_empty() {
                match mem::replace(&mut state.activation, Activation::Inactive) {
                    Activation::Active(stop) => Some(stop),
                    Activation::Starting { .. } => {
                        state.activation = Activation::Starting { release: true };
                        None
                    }
                    Activation::Inactive => {
                        tracing::warn!(cell = ?self.id, "deactivating an inactive cell");
                        debug_assert!(false, "double deactivation");
                        None
                    }
                }
            } else {
                None
            };
            (removed, stop)
        };

        // The callback may own subscriptions elsewhere; release it unlocked.
        drop(removed);

        if let Some(stop) = stop {
            tracing::trace!(cell = ?self.id, "deactivating");
            stop.stop();
        }
    }

    fn deliver(&self, update: Option<ValueOrError<T>>) {
        let _round = self.delivery.lock();

        {
            let mut state = self.state.lock();
            if state.delivering {
                // Pushed from inside a round on this thread.
                state.queued.push_back(update);
                return;
            }
            state.delivering = true;
        }

        let mut update = update;
        loop {
            self.deliver_round(&update);

            let mut state = self.state.lock();
            match state.queued.pop_front() {
                Some(queued) => update = queued,
                None => {
                    state.delivering = false;
                    break;
                }
            }
        }
    }

    fn deliver_round(&self, update: &Option<ValueOrError<T>>) {
        let listeners: SmallVec<[(SubscriberId, Callback<T>); 4]> = {
            let mut state = self.state.lock();
            state.last = update.clone();
            state
                .subscribers
                .iter()
                .map(|(id, callback)| (*id, Arc::clone(callback)))
                .collect()
        };

        for (id, callback) in listeners {
            // Listeners removed earlier in this round are skipped.
            if !self.state.lock().subscribers.contains_key(&id) {
                continue;
            }
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(update.as_ref())));
            if let Err(payload) = outcome {
                tracing::error!(
                    cell = ?self.id,
                    subscriber = ?id,
                    message = %panic_message(&*payload),
                    "subscriber panicked during delivery"
                );
            }
        }
    }
}

impl<T> Drop for CellInner<T> {
    fn drop(&mut self) {
        // Detached subscriptions can leave the last handle dropped while active.
        let activation = mem::replace(&mut self.state.get_mut().activation, Activation::Inactive);
        if let Activation::Active(stop) = activation {
            tracing::trace!(cell = ?self.id, "deactivating dropped cell");
            stop.stop();
        }
    }
}

impl<T> Clone for Cell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Cell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Cell")
            .field("id", &self.inner.id)
            .field("active", &!matches!(state.activation, Activation::Inactive))
            .field("subscriber_count", &state.subscribers.len())
            .field("has_value", &state.last.is_some())
            .finish()
    }
}

/// The push side of a cell, handed to its producer on activation.
///
/// A sink does not keep its cell alive; pushes into a dropped cell are ignored.
pub struct Sink<T> {
    cell: Weak<CellInner<T>>,
}

impl<T> Sink<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Push an update, or `None` to reset the cell to "no value".
    pub fn push(&self, update: Option<ValueOrError<T>>) {
        if let Some(cell) = self.cell.upgrade() {
            cell.deliver(update);
        }
    }

    pub fn value(&self, value: T) {
        self.push(Some(ValueOrError::Value(value)));
    }

    pub fn error(&self, error: impl Into<Fault>) {
        self.push(Some(ValueOrError::Error(error.into())));
    }

    pub fn reset(&self) {
        self.push(None);
    }

    /// Whether the cell behind this sink still exists.
    pub fn is_connected(&self) -> bool {
        self.cell.strong_count() > 0
    }
}

impl<T> Clone for Sink<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Weak::clone(&self.cell),
        }
    }
}

impl<T> fmt::Debug for Sink<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sink")
            .field("connected", &(self.cell.strong_count() > 0))
            .finish()
    }
}

/// Future returned by [`Cell::next`].
///
/// Resolves once, with the first defined update pushed after it was created.
/// Dropping it before then unsubscribes.
#[must_use = "futures do nothing unless polled"]
pub struct Next<T> {
    receiver: oneshot::Receiver<Result<T, Fault>>,
    subscription: Subscription,
}

impl<T> Future for Next<T> {
    type Output = Result<T, Fault>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|received| match received {
            Ok(result) => result,
            Err(_) => Err(CellError::Closed.into()),
        })
    }
}

impl<T> fmt::Debug for Next<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("subscription", &self.subscription)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
