//! Dependency Tracking
//!
//! A [`Tracker`] is handed to every calculator run. Reading a cell through it
//! returns the cell's value and records the cell as a dependency of the run.
//!
//! # Implementation
//!
//! The tracker starts with a snapshot of the listeners installed by the previous
//! run and builds an append-only record of the cells read in this one:
//!
//! - A cell the previous run also read is recorded as reused. Its subscription
//!   stays where it is.
//! - A new cell is subscribed immediately, but the subscription is parked in the
//!   record. The calculator moves it into its live dependency map only once the
//!   run settles, so the live map never holds a half-applied mix of two runs.
//!
//! Each dependency has one [`DepListener`]. Emissions either wake a read that is
//! waiting for the cell's first value, or invalidate the calculator. Values
//! pushed while a new subscription is still activating the cell are absorbed,
//! because the read picks them up from `current()` right after.

use std::fmt;
use std::mem;
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{CellError, Fault};

use super::cell::{Cell, CellId};
use super::subscriber::Subscription;
use super::value::ValueOrError;

/// Something a dependency listener can mark stale.
pub(crate) trait Invalidate: Send + Sync {
    fn invalidate(&self);
}

enum Mode {
    /// The subscription is still being established.
    Probing,
    /// Reads are parked until the next defined emission.
    Waiting(Vec<oneshot::Sender<()>>),
    /// Emissions invalidate the owner.
    Live,
    /// Torn down with its run; nothing resolves any more.
    Cancelled,
}

pub(crate) struct DepListener {
    owner: Weak<dyn Invalidate>,
    mode: Mutex<Mode>,
}

enum Lookup<D> {
    Ready(ValueOrError<D>),
    Wait(oneshot::Receiver<()>),
    Cancelled,
}

impl DepListener {
    fn new(owner: Weak<dyn Invalidate>) -> Self {
        Self {
            owner,
            mode: Mutex::new(Mode::Probing),
        }
    }

    fn on_emit(&self) {
        let forward = {
            let mut mode = self.mode.lock();
            match mem::replace(&mut *mode, Mode::Live) {
                Mode::Probing => {
                    *mode = Mode::Probing;
                    false
                }
                // The emission is consumed by the waiting reads, unless they all
                // went away in the meantime.
                Mode::Waiting(waiters) => waiters
                    .into_iter()
                    .fold(true, |forward, waiter| waiter.send(()).is_err() && forward),
                Mode::Live => true,
                Mode::Cancelled => {
                    *mode = Mode::Cancelled;
                    false
                }
            }
        };

        if forward {
            if let Some(owner) = self.owner.upgrade() {
                owner.invalidate();
            }
        }
    }

    fn lookup<D>(&self, cell: &Cell<D>) -> Lookup<D>
    where
        D: Clone + Send + Sync + 'static,
    {
        let mut mode = self.mode.lock();
        if matches!(*mode, Mode::Cancelled) {
            return Lookup::Cancelled;
        }

        match cell.current() {
            Some(update) => {
                if matches!(*mode, Mode::Probing) {
                    *mode = Mode::Live;
                }
                Lookup::Ready(update)
            }
            None => {
                let (sender, receiver) = oneshot::channel();
                if let Mode::Waiting(waiters) = &mut *mode {
                    waiters.push(sender);
                } else {
                    *mode = Mode::Waiting(vec![sender]);
                }
                Lookup::Wait(receiver)
            }
        }
    }

    /// Stop reacting. Parked reads resolve to [`CellError::Cancelled`].
    pub(crate) fn cancel(&self) {
        *self.mode.lock() = Mode::Cancelled;
    }
}

/// A live (or parked) subscription to one dependency.
pub(crate) struct Dependency {
    pub(crate) listener: Arc<DepListener>,
    pub(crate) subscription: Subscription,
}

/// How a run came to read a cell.
pub(crate) enum Read {
    /// The previous run read it too; its dependency stays in place.
    Reused(Arc<DepListener>),
    /// First read; the subscription is parked until the run settles.
    Fresh(Dependency),
}

impl Read {
    fn listener(&self) -> &Arc<DepListener> {
        match self {
            Read::Reused(listener) => listener,
            Read::Fresh(dependency) => &dependency.listener,
        }
    }
}

#[derive(Default)]
struct Record {
    reads: IndexMap<CellId, Read>,
    closed: bool,
}

struct TrackerInner {
    owner: Weak<dyn Invalidate>,
    previous: IndexMap<CellId, Arc<DepListener>>,
    record: Mutex<Record>,
}

/// The `use` helper handed to a calculator's computation.
///
/// Cheap to clone; clones record into the same run.
///
/// # Example
///
/// ```rust,ignore
/// let total = Calculator::new(move |cx: Tracker| {
///     let (a, b) = (a.clone(), b.clone());
///     async move { Ok(cx.read(&a).await? + cx.read(&b).await?) }
/// })?;
/// ```
#[derive(Clone)]
pub struct Tracker {
    inner: Arc<TrackerInner>,
}

impl Tracker {
    pub(crate) fn new(
        owner: Weak<dyn Invalidate>,
        previous: IndexMap<CellId, Arc<DepListener>>,
    ) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                owner,
                previous,
                record: Mutex::new(Record::default()),
            }),
        }
    }

    /// Read `cell` and record it as a dependency of this run.
    ///
    /// Resolves immediately from the cell's latest update. A cell that has never
    /// produced one is awaited until its first defined emission. The cell's
    /// error channel surfaces as `Err`.
    pub async fn read<D>(&self, cell: &Cell<D>) -> Result<D, Fault>
    where
        D: Clone + Send + Sync + 'static,
    {
        let listener = self.register(cell)?;
        loop {
            let wait = match listener.lookup(cell) {
                Lookup::Ready(update) => return update.into_result(),
                Lookup::Wait(wait) => wait,
                Lookup::Cancelled => return Err(CellError::Cancelled.into()),
            };
            if wait.await.is_err() {
                return Err(CellError::Cancelled.into());
            }
        }
    }

    /// Number of distinct cells read so far in this run.
    pub fn read_count(&self) -> usize {
        self.inner.record.lock().reads.len()
    }

    fn register<D>(&self, cell: &Cell<D>) -> Result<Arc<DepListener>, Fault>
    where
        D: Clone + Send + Sync + 'static,
    {
        let id = cell.id();
        {
            let mut record = self.inner.record.lock();
            if record.closed {
                return Err(CellError::Cancelled.into());
            }
            if let Some(read) = record.reads.get(&id) {
                return Ok(Arc::clone(read.listener()));
            }
            if let Some(listener) = self.inner.previous.get(&id) {
                record.reads.insert(id, Read::Reused(Arc::clone(listener)));
                return Ok(Arc::clone(listener));
            }
        }

        // Subscribing may activate the cell and run user code; keep the record
        // unlocked meanwhile.
        let listener = Arc::new(DepListener::new(Weak::clone(&self.inner.owner)));
        let notify = Arc::clone(&listener);
        let subscription = cell.subscribe(move |update| {
            if update.is_some() {
                notify.on_emit();
            }
        });

        let mut record = self.inner.record.lock();
        if record.closed {
            drop(record);
            listener.cancel();
            drop(subscription);
            return Err(CellError::Cancelled.into());
        }
        if let Some(read) = record.reads.get(&id) {
            // Another clone of this tracker got there first.
            let existing = Arc::clone(read.listener());
            drop(record);
            listener.cancel();
            drop(subscription);
            return Ok(existing);
        }
        record.reads.insert(
            id,
            Read::Fresh(Dependency {
                listener: Arc::clone(&listener),
                subscription,
            }),
        );
        Ok(listener)
    }

    /// Close the record and hand over everything read.
    pub(crate) fn finish(&self) -> IndexMap<CellId, Read> {
        let mut record = self.inner.record.lock();
        record.closed = true;
        mem::take(&mut record.reads)
    }

    /// Close the record and drop the subscriptions this run opened.
    pub(crate) fn cancel(&self) {
        discard(self.finish());
    }
}

/// Drop the subscriptions a run opened, leaving reused dependencies alone.
pub(crate) fn discard(reads: IndexMap<CellId, Read>) {
    for read in reads.values() {
        if let Read::Fresh(dependency) = read {
            dependency.listener.cancel();
        }
    }
    drop(reads);
}

impl fmt::Debug for Tracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let record = self.inner.record.lock();
        f.debug_struct("Tracker")
            .field("previous", &self.inner.previous.len())
            .field("reads", &record.reads.len())
            .field("closed", &record.closed)
            .finish()
    }
}
