//! Calculator Implementation
//!
//! A Calculator is a derived cell. Its producer runs an async computation that
//! reads other cells through a [`Tracker`], subscribes to exactly the cells the
//! last completed run read, and runs again whenever one of them emits.
//!
//! # How Calculators Work
//!
//! 1. The first subscriber activates the calculator's cell, which starts a run.
//!
//! 2. The run calls `read` on any number of cells. New cells are subscribed
//!    right away, but the subscriptions are parked in the run's record.
//!
//! 3. When the computation settles, its value or error is pushed to the
//!    calculator's subscribers, exactly once.
//!
//! 4. The record is diffed against the previous dependency set: cells no longer
//!    read are unsubscribed, new cells have their parked subscriptions moved in,
//!    cells read by both runs are left alone.
//!
//! 5. Any dependency emission while a run is in flight marks it stale. A stale
//!    run is followed by exactly one more run, however many emissions arrived.
//!
//! When the last subscriber leaves, the in-flight run is aborted, its pending
//! reads are cancelled and every dependency subscription is dropped.
//!
//! # Thread Safety
//!
//! Runs are spawned on a tokio runtime. Admission of a run happens under the
//! engine's mutex, so at most one run per calculator is in flight even on a
//! multi-threaded runtime.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::mem;
use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures_util::future::{AbortHandle, AbortRegistration, Abortable, BoxFuture, FutureExt};
use indexmap::IndexMap;
use parking_lot::{Mutex, ReentrantMutex};
use tokio::runtime::Handle;

use crate::error::{panic_message, CellError, Fault, Result};

use super::cell::{Cell, CellId, Sink};
use super::producer::{Producer, Stop};
use super::tracker::{discard, Dependency, Invalidate, Read, Tracker};

const DEFAULT_NAME: &str = "calculator";

type Computation<T> = Arc<dyn Fn(Tracker) -> BoxFuture<'static, Result<T, Fault>> + Send + Sync>;

/// Run admission state of a calculator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// No run in flight.
    Idle,
    /// A run is in flight and its inputs are unchanged so far.
    Running,
    /// A dependency emitted during the in-flight run; another run follows it.
    Stale,
}

/// A derived cell recomputed from the cells its computation reads.
///
/// Derefs to its [`Cell`], so `current()`, `next()` and `subscribe()` work as on
/// any other cell, and a calculator can be read by another calculator.
///
/// # Example
///
/// ```rust,ignore
/// let a = Atom::new(2);
/// let b = Atom::new(3);
///
/// let sum = Calculator::new({
///     let (a, b) = (a.clone(), b.clone());
///     move |cx: Tracker| {
///         let (a, b) = (a.clone(), b.clone());
///         async move { Ok(cx.read(&a).await? + cx.read(&b).await?) }
///     }
/// })?;
///
/// let _sub = sum.subscribe(|update| println!("{update:?}"));
/// // Prints: Some(Value(5))
///
/// a.set(10);
/// // Prints: Some(Value(13))
/// ```
pub struct Calculator<T> {
    cell: Cell<T>,
    engine: Arc<Engine<T>>,
}

/// Configuration for a [`Calculator`].
#[derive(Debug, Default)]
pub struct CalculatorBuilder {
    name: Option<String>,
    handle: Option<Handle>,
}

impl CalculatorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Diagnostic name, attached to every log event of the calculator.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Runtime that drives the calculator's runs.
    ///
    /// Defaults to the runtime the calculator is built on.
    pub fn handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn build<T, F, Fut>(self, computation: F) -> Result<Calculator<T>>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(Tracker) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, Fault>> + Send + 'static,
    {
        let name: Arc<str> = self.name.as_deref().unwrap_or(DEFAULT_NAME).into();
        let handle = match self.handle {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|_| CellError::NoRuntime {
                name: name.to_string(),
            })?,
        };
        let computation: Computation<T> = Arc::new(move |tracker| computation(tracker).boxed());

        let engine = Arc::new_cyclic(|me| Engine {
            me: Weak::clone(me),
            name,
            computation,
            handle,
            runs: AtomicU64::new(0),
            publish: ReentrantMutex::new(()),
            state: Mutex::new(EngineState {
                sink: None,
                run: RunState::Idle,
                dependencies: IndexMap::new(),
                in_flight: None,
                last_run: 0,
            }),
        });
        let cell = Cell::new(Activator {
            engine: Arc::clone(&engine),
        });

        Ok(Calculator { cell, engine })
    }
}

impl Calculator<()> {
    pub fn builder() -> CalculatorBuilder {
        CalculatorBuilder::new()
    }
}

impl<T> Calculator<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a calculator driven by the current tokio runtime.
    pub fn new<F, Fut>(computation: F) -> Result<Self>
    where
        F: Fn(Tracker) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, Fault>> + Send + 'static,
    {
        CalculatorBuilder::new().build(computation)
    }

    /// Start a run now, or mark the in-flight run stale.
    ///
    /// Has no effect while the calculator is inactive; activation always runs.
    pub fn calculate(&self) {
        self.engine.admit();
    }

    /// Mark the current result stale and recompute.
    pub fn invalidate(&self) {
        self.calculate();
    }

    pub fn name(&self) -> &str {
        &self.engine.name
    }

    pub fn run_state(&self) -> RunState {
        self.engine.state.lock().run
    }

    /// Number of runs started since creation.
    pub fn run_count(&self) -> u64 {
        self.engine.runs.load(Ordering::Relaxed)
    }

    /// Number of cells the last completed run subscribed to.
    pub fn dependency_count(&self) -> usize {
        self.engine.state.lock().dependencies.len()
    }

    /// The calculator's output cell.
    pub fn cell(&self) -> &Cell<T> {
        &self.cell
    }
}

impl<T> Deref for Calculator<T> {
    type Target = Cell<T>;

    fn deref(&self) -> &Cell<T> {
        &self.cell
    }
}

impl<T> Clone for Calculator<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            engine: Arc::clone(&self.engine),
        }
    }
}

impl<T> fmt::Debug for Calculator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.engine.state.lock();
        f.debug_struct("Calculator")
            .field("name", &self.engine.name)
            .field("run_state", &state.run)
            .field("runs", &self.engine.runs.load(Ordering::Relaxed))
            .field("dependency_count", &state.dependencies.len())
            .field("cell", &self.cell)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Engine
// ----------------------------------------------------------------------------

struct Engine<T> {
    me: Weak<Engine<T>>,
    name: Arc<str>,
    computation: Computation<T>,
    handle: Handle,
    runs: AtomicU64,
    /// Held from a settling run's id check until its result is pushed, so a
    /// deactivation cannot slip in between and let the result reach the next
    /// activation.
    publish: ReentrantMutex<()>,
    state: Mutex<EngineState<T>>,
}

struct EngineState<T> {
    /// Present while the calculator's cell is active.
    sink: Option<Sink<T>>,
    run: RunState,
    /// Subscriptions matching the cells read by the last completed run.
    dependencies: IndexMap<CellId, Dependency>,
    in_flight: Option<InFlight>,
    last_run: u64,
}

struct InFlight {
    id: u64,
    tracker: Tracker,
    abort: AbortHandle,
}

struct Launch {
    id: u64,
    tracker: Tracker,
    registration: AbortRegistration,
}

fn panicked(payload: &(dyn Any + Send)) -> Fault {
    Fault::new(CellError::Panicked {
        message: panic_message(payload),
    })
}

impl<T> Engine<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn activate(&self, sink: Sink<T>) {
        {
            let mut state = self.state.lock();
            if state.sink.is_some() {
                tracing::warn!(calculator = %self.name, "activated twice");
                debug_assert!(false, "calculator activated twice");
            }
            state.sink = Some(sink);
        }
        tracing::trace!(calculator = %self.name, "activated");
        self.admit();
    }

    fn deactivate(&self) {
        let (in_flight, dependencies) = {
            let _publish = self.publish.lock();
            let mut state = self.state.lock();
            state.sink = None;
            state.run = RunState::Idle;
            (state.in_flight.take(), mem::take(&mut state.dependencies))
        };

        if let Some(in_flight) = in_flight {
            tracing::trace!(calculator = %self.name, run = in_flight.id, "aborting in-flight run");
            in_flight.abort.abort();
            in_flight.tracker.cancel();
        }
        for dependency in dependencies.values() {
            dependency.listener.cancel();
        }
        drop(dependencies);

        tracing::trace!(calculator = %self.name, "deactivated");
    }

    /// Start a run unless one is in flight, in which case mark it stale.
    fn admit(&self) {
        let launch = {
            let mut state = self.state.lock();
            if state.sink.is_none() {
                return;
            }
            match state.run {
                RunState::Idle => {
                    state.run = RunState::Running;
                    Some(self.prepare(&mut state))
                }
                RunState::Running => {
                    state.run = RunState::Stale;
                    None
                }
                RunState::Stale => None,
            }
        };

        if let Some(launch) = launch {
            self.launch(launch);
        }
    }

    fn prepare(&self, state: &mut EngineState<T>) -> Launch {
        state.last_run += 1;
        let id = state.last_run;

        let previous = state
            .dependencies
            .iter()
            .map(|(cell, dependency)| (*cell, Arc::clone(&dependency.listener)))
            .collect();
        let owner: Weak<dyn Invalidate> = self.me.clone();
        let tracker = Tracker::new(owner, previous);

        let (abort, registration) = AbortHandle::new_pair();
        state.in_flight = Some(InFlight {
            id,
            tracker: tracker.clone(),
            abort,
        });

        Launch {
            id,
            tracker,
            registration,
        }
    }

    fn launch(&self, launch: Launch) {
        let Launch {
            id,
            tracker,
            registration,
        } = launch;
        self.runs.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(calculator = %self.name, run = id, "starting run");

        let run = match panic::catch_unwind(AssertUnwindSafe(|| (self.computation)(tracker.clone())))
        {
            Ok(run) => run,
            Err(payload) => {
                let fault = panicked(&*payload);
                async move { Err(fault) }.boxed()
            }
        };
        let run = Abortable::new(AssertUnwindSafe(run).catch_unwind(), registration);

        let engine = Weak::clone(&self.me);
        let name = Arc::clone(&self.name);
        self.handle.spawn(async move {
            let outcome = match run.await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(payload)) => Err(panicked(&*payload)),
                Err(_aborted) => {
                    tracing::trace!(calculator = %name, run = id, "run aborted");
                    return;
                }
            };
            if let Some(engine) = engine.upgrade() {
                engine.settle(id, tracker, outcome);
            }
        });
    }

    fn settle(&self, id: u64, tracker: Tracker, outcome: Result<T, Fault>) {
        let publishing = self.publish.lock();
        let sink = {
            let state = self.state.lock();
            let current = state.in_flight.as_ref().is_some_and(|in_flight| in_flight.id == id);
            state.sink.clone().filter(|_| current)
        };
        let Some(sink) = sink else {
            drop(publishing);
            tracing::trace!(calculator = %self.name, run = id, "discarding superseded run");
            tracker.cancel();
            return;
        };

        match &outcome {
            Ok(_) => tracing::debug!(calculator = %self.name, run = id, "run settled"),
            Err(fault) => {
                tracing::debug!(calculator = %self.name, run = id, error = %fault, "computation failed")
            }
        }
        sink.push(Some(outcome.into()));
        drop(publishing);

        // Delivery may have deactivated us; the run id tells.
        let reads = tracker.finish();
        let (released, relaunch) = {
            let mut state = self.state.lock();
            if !state.in_flight.as_ref().is_some_and(|in_flight| in_flight.id == id) {
                drop(state);
                discard(reads);
                return;
            }
            state.in_flight = None;

            let mut previous = mem::take(&mut state.dependencies);
            let mut next = IndexMap::with_capacity(reads.len());
            for (cell, read) in reads {
                match read {
                    Read::Reused(_) => {
                        if let Some(dependency) = previous.shift_remove(&cell) {
                            next.insert(cell, dependency);
                        }
                    }
                    Read::Fresh(dependency) => {
                        next.insert(cell, dependency);
                    }
                }
            }
            state.dependencies = next;

            let relaunch = if state.run == RunState::Stale {
                state.run = RunState::Running;
                Some(self.prepare(&mut state))
            } else {
                state.run = RunState::Idle;
                None
            };
            (previous, relaunch)
        };

        if !released.is_empty() {
            tracing::trace!(calculator = %self.name, released = released.len(), "dropping stale dependencies");
        }
        for dependency in released.values() {
            dependency.listener.cancel();
        }
        drop(released);

        if let Some(launch) = relaunch {
            self.launch(launch);
        }
    }
}

impl<T> Invalidate for Engine<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn invalidate(&self) {
        self.admit();
    }
}

/// Producer of the calculator's cell: activation starts the engine.
struct Activator<T> {
    engine: Arc<Engine<T>>,
}

impl<T> Producer<T> for Activator<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn start(&mut self, sink: Sink<T>) -> Stop {
        self.engine.activate(sink);
        let engine = Arc::clone(&self.engine);
        Stop::new(move || engine.deactivate())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
