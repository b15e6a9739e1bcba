//! Integration Tests for Reactive System
//!
//! These tests verify that cells, atoms, and calculators work together correctly.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::FutureExt;
use parking_lot::Mutex;

use cellflow_core::reactive::{Atom, Calculator, Cell, RunState, Sink, Stop, ValueOrError};
use cellflow_core::{CellError, Fault};

/// A cell driven by hand, counting its activations.
struct Probe {
    cell: Cell<i32>,
    sink: Arc<Mutex<Option<Sink<i32>>>>,
    starts: Arc<AtomicUsize>,
    stops: Arc<AtomicUsize>,
}

impl Probe {
    /// `initial` is pushed synchronously on every activation.
    fn new(initial: Option<i32>) -> Self {
        let sink = Arc::new(Mutex::new(None));
        let starts = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));

        let cell = Cell::from_fn({
            let (sink, starts, stops) = (sink.clone(), starts.clone(), stops.clone());
            move |new_sink: Sink<i32>| {
                starts.fetch_add(1, Ordering::SeqCst);
                *sink.lock() = Some(new_sink.clone());
                if let Some(value) = initial {
                    new_sink.value(value);
                }
                let (sink, stops) = (sink.clone(), stops.clone());
                Stop::new(move || {
                    stops.fetch_add(1, Ordering::SeqCst);
                    sink.lock().take();
                })
            }
        });

        Self {
            cell,
            sink,
            starts,
            stops,
        }
    }

    fn push(&self, update: ValueOrError<i32>) {
        let sink = self.sink.lock().clone();
        sink.expect("probe is not active").push(Some(update));
    }

    fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

fn record<T>(cell: &Cell<T>) -> (cellflow_core::Subscription, Arc<Mutex<Vec<Result<T, String>>>>)
where
    T: Clone + Send + Sync + 'static,
{
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    let subscription = cell.subscribe(move |update: Option<&ValueOrError<T>>| {
        if let Some(update) = update {
            seen_clone
                .lock()
                .push(update.get().cloned().map_err(|fault| fault.to_string()));
        }
    });
    (subscription, seen)
}

async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

/// Test that an immediate push is observed synchronously on subscribe.
#[test]
fn subscribe_observes_immediate_push() {
    let cell = Cell::constant(5);
    assert!(cell.current().is_none());

    let (_sub, seen) = record(&cell);
    assert_eq!(*seen.lock(), vec![Ok(5)]);
    assert_eq!(cell.current(), Some(ValueOrError::Value(5)));
}

/// Test that `next()` settles on the first update after the call.
#[test]
fn next_rejects_then_resolves() {
    let probe = Probe::new(None);
    let _keep = probe.cell.subscribe(|_| {});

    let failure = Fault::msg("E");
    let first = probe.cell.next();
    probe.push(ValueOrError::Error(failure.clone()));

    let second = probe.cell.next();
    probe.push(ValueOrError::Value(1));

    let err = first.now_or_never().unwrap().unwrap_err();
    assert!(err.ptr_eq(&failure));
    assert_eq!(second.now_or_never().unwrap().unwrap(), 1);
}

/// Test that `next()` does not replay history.
#[test]
fn next_ignores_past_updates() {
    let probe = Probe::new(Some(0));
    let _keep = probe.cell.subscribe(|_| {});
    for value in 1..=3 {
        probe.push(ValueOrError::Value(value));
    }

    let mut next = probe.cell.next();
    assert!((&mut next).now_or_never().is_none());

    probe.push(ValueOrError::Value(4));
    probe.push(ValueOrError::Value(5));
    assert_eq!(next.now_or_never().unwrap().unwrap(), 4);
}

/// Test that the producer runs only while there are subscribers.
#[test]
fn activation_follows_subscriber_count() {
    let probe = Probe::new(Some(1));

    for cycle in 1..=3 {
        let first = probe.cell.subscribe(|_| {});
        let second = probe.cell.subscribe(|_| {});
        assert!(probe.cell.is_active());
        assert_eq!(probe.starts(), cycle);

        first.unsubscribe();
        assert!(probe.cell.is_active());
        second.unsubscribe();
        second.unsubscribe();
        assert!(!probe.cell.is_active());
        assert_eq!(probe.stops(), cycle);
    }
}

/// Test that the last value survives a deactivation cycle.
#[test]
fn reactivation_retains_last_value() {
    let probe = Probe::new(None);

    let sub = probe.cell.subscribe(|_| {});
    probe.push(ValueOrError::Value(9));
    drop(sub);
    assert_eq!(probe.stops(), 1);

    let (_sub, seen) = record(&probe.cell);
    assert_eq!(probe.starts(), 2);
    assert!(seen.lock().is_empty());
    assert_eq!(probe.cell.current(), Some(ValueOrError::Value(9)));

    probe.push(ValueOrError::Value(10));
    assert_eq!(probe.cell.current(), Some(ValueOrError::Value(10)));
    assert_eq!(*seen.lock(), vec![Ok(10)]);
}

/// Test that a subscriber added mid-round waits for the next push.
#[test]
fn late_subscriber_skips_current_round() {
    let probe = Probe::new(None);
    let late_seen = Arc::new(Mutex::new(Vec::new()));
    let late_subs = Arc::new(Mutex::new(Vec::new()));

    let _first = probe.cell.subscribe({
        let (cell, late_seen, late_subs) = (probe.cell.clone(), late_seen.clone(), late_subs.clone());
        move |_| {
            if late_subs.lock().is_empty() {
                let late_seen = late_seen.clone();
                let sub = cell.subscribe(move |update: Option<&ValueOrError<i32>>| {
                    if let Some(value) = update.and_then(ValueOrError::as_value) {
                        late_seen.lock().push(*value);
                    }
                });
                late_subs.lock().push(sub);
            }
        }
    });

    probe.push(ValueOrError::Value(1));
    assert!(late_seen.lock().is_empty());

    probe.push(ValueOrError::Value(2));
    assert_eq!(*late_seen.lock(), vec![2]);
}

/// Test that a calculator recomputes without re-subscribing unchanged inputs.
#[tokio::test]
async fn calculator_sums_two_cells() {
    let a = Probe::new(Some(2));
    let b = Probe::new(Some(3));

    let sum = Calculator::new({
        let (a, b) = (a.cell.clone(), b.cell.clone());
        move |cx| {
            let (a, b) = (a.clone(), b.clone());
            async move { Ok(cx.read(&a).await? + cx.read(&b).await?) }
        }
    })
    .unwrap();

    let (_sub, seen) = record(&sum);
    settle().await;
    assert_eq!(*seen.lock(), vec![Ok(5)]);

    a.push(ValueOrError::Value(10));
    settle().await;
    assert_eq!(*seen.lock(), vec![Ok(5), Ok(13)]);
    assert_eq!(b.starts(), 1);
    assert_eq!(b.stops(), 0);
    assert_eq!(b.cell.subscriber_count(), 1);
}

/// Test that a dependency read only on one branch is dropped exactly once.
#[tokio::test]
async fn conditional_dependency_is_dropped_once() {
    let use_a = Atom::new(true);
    let a = Probe::new(Some(4));

    let calc = Calculator::new({
        let (use_a, a) = (use_a.clone(), a.cell.clone());
        move |cx| {
            let (use_a, a) = (use_a.clone(), a.clone());
            async move {
                if cx.read(&use_a).await? {
                    cx.read(&a).await
                } else {
                    Ok(-1)
                }
            }
        }
    })
    .unwrap();

    let (_sub, seen) = record(&calc);
    settle().await;
    assert_eq!(a.cell.subscriber_count(), 1);

    use_a.set(false);
    settle().await;
    use_a.set(false);
    settle().await;

    assert_eq!(a.stops(), 1);
    assert_eq!(a.cell.subscriber_count(), 0);
    assert_eq!(*seen.lock(), vec![Ok(4), Ok(-1), Ok(-1)]);
}

/// Test that switching dependency sets leaves exactly the new set subscribed.
#[tokio::test]
async fn dependency_sets_are_diffed() {
    let selector = Atom::new(0);
    let x = Probe::new(Some(1));
    let y = Probe::new(Some(10));
    let z = Probe::new(Some(100));

    let calc = Calculator::new({
        let selector = selector.clone();
        let (x, y, z) = (x.cell.clone(), y.cell.clone(), z.cell.clone());
        move |cx| {
            let selector = selector.clone();
            let (x, y, z) = (x.clone(), y.clone(), z.clone());
            async move {
                let first = if cx.read(&selector).await? == 0 { x } else { z };
                Ok(cx.read(&first).await? + cx.read(&y).await?)
            }
        }
    })
    .unwrap();

    let (_sub, seen) = record(&calc);
    settle().await;
    assert_eq!(calc.dependency_count(), 3);

    selector.set(1);
    settle().await;

    assert_eq!(*seen.lock(), vec![Ok(11), Ok(110)]);
    assert_eq!(x.cell.subscriber_count(), 0);
    assert_eq!(y.cell.subscriber_count(), 1);
    assert_eq!(z.cell.subscriber_count(), 1);
    assert_eq!((x.starts(), x.stops()), (1, 1));
    assert_eq!((y.starts(), y.stops()), (1, 0));
    assert_eq!((z.starts(), z.stops()), (1, 0));
    assert_eq!(calc.dependency_count(), 3);
}

/// Test that a burst of invalidations during a run causes one follow-up run.
#[tokio::test]
async fn invalidations_coalesce_into_one_rerun() {
    let value = Atom::new(0);
    let gate = Probe::new(None);

    let calc = Calculator::new({
        let (value, gate) = (value.clone(), gate.cell.clone());
        move |cx| {
            let (value, gate) = (value.clone(), gate.clone());
            async move {
                let value = cx.read(&value).await?;
                cx.read(&gate).await?;
                Ok(value)
            }
        }
    })
    .unwrap();

    let (_sub, seen) = record(&calc);
    settle().await;
    assert_eq!(calc.run_state(), RunState::Running);

    for next in 1..=5 {
        value.set(next);
    }
    assert_eq!(calc.run_state(), RunState::Stale);

    gate.push(ValueOrError::Value(0));
    settle().await;

    assert_eq!(*seen.lock(), vec![Ok(0), Ok(5)]);
    assert_eq!(calc.run_count(), 2);
    assert_eq!(calc.run_state(), RunState::Idle);
}

/// Test that calculators compose.
#[tokio::test]
async fn calculator_reads_calculator() {
    let base = Atom::new(3);

    let squared = Calculator::builder()
        .name("squared")
        .build({
            let base = base.clone();
            move |cx| {
                let base = base.clone();
                async move {
                    let base = cx.read(&base).await?;
                    Ok(base * base)
                }
            }
        })
        .unwrap();

    let label = Calculator::builder()
        .name("label")
        .build({
            let squared = squared.clone();
            move |cx| {
                let squared = squared.clone();
                async move { Ok(format!("squared={}", cx.read(&squared).await?)) }
            }
        })
        .unwrap();

    let (sub, seen) = record(&label);
    settle().await;
    base.set(4);
    settle().await;

    assert_eq!(
        *seen.lock(),
        vec![Ok("squared=9".to_string()), Ok("squared=16".to_string())]
    );

    drop(sub);
    assert!(!label.is_active());
    assert!(!squared.is_active());
    assert_eq!(base.subscriber_count(), 0);
}

/// Test that a failing run is reported once and the calculator keeps working.
#[tokio::test]
async fn calculator_recovers_after_error() {
    let input = Atom::new(0);

    let inverse = Calculator::new({
        let input = input.clone();
        move |cx| {
            let input = input.clone();
            async move {
                let value = cx.read(&input).await?;
                if value == 0 {
                    return Err(Fault::msg("division by zero"));
                }
                Ok(100 / value)
            }
        }
    })
    .unwrap();

    let (_sub, seen) = record(&inverse);
    settle().await;
    input.set(4);
    settle().await;

    assert_eq!(
        *seen.lock(),
        vec![Err("division by zero".to_string()), Ok(25)]
    );
    assert_eq!(inverse.dependency_count(), 1);
}

/// Test that tearing down a calculator cancels a read still waiting on its input.
#[tokio::test]
async fn deactivation_tears_down_pending_reads() {
    let input = Probe::new(None);
    let outcomes = Arc::new(Mutex::new(Vec::new()));

    let calc = Calculator::new({
        let (input, outcomes) = (input.cell.clone(), outcomes.clone());
        move |cx| {
            let (input, outcomes) = (input.clone(), outcomes.clone());
            async move {
                let result = cx.read(&input).await;
                outcomes.lock().push(result.is_ok());
                result
            }
        }
    })
    .unwrap();

    let sub = calc.subscribe(|_| {});
    settle().await;
    assert!(input.cell.is_active());

    sub.unsubscribe();
    settle().await;

    assert!(!input.cell.is_active());
    assert_eq!(input.stops(), 1);
    assert!(outcomes.lock().is_empty());
    assert_eq!(calc.run_state(), RunState::Idle);
    assert_eq!(calc.dependency_count(), 0);
}

/// Test that `next()` on an inactive calculator runs one activation cycle.
#[tokio::test]
async fn calculator_next_activates_once() {
    let input = Probe::new(Some(7));

    let calc = Calculator::new({
        let input = input.cell.clone();
        move |cx| {
            let input = input.clone();
            async move { Ok(cx.read(&input).await? + 1) }
        }
    })
    .unwrap();

    assert_eq!(calc.next().await.unwrap(), 8);
    settle().await;

    assert!(!calc.is_active());
    assert_eq!((input.starts(), input.stops()), (1, 1));
    assert_eq!(calc.current(), Some(ValueOrError::Value(8)));
}

/// Test that runs settle correctly on a multi-threaded runtime.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn calculator_on_worker_threads() {
    let input = Atom::new(1);

    let doubled = Calculator::new({
        let input = input.clone();
        move |cx| {
            let input = input.clone();
            async move { Ok(cx.read(&input).await? * 2) }
        }
    })
    .unwrap();

    let initial = doubled.next();
    let _keep = doubled.subscribe(|_| {});
    assert_eq!(initial.await.unwrap(), 2);

    for value in 2..=5 {
        let next = doubled.next();
        input.set(value);
        assert_eq!(next.await.unwrap(), value * 2);
    }
}

/// Test that building without a runtime reports the calculator by name.
#[test]
fn calculator_requires_runtime() {
    let result = Calculator::builder()
        .name("detached")
        .build(|_cx| async { Ok(()) });

    match result {
        Err(CellError::NoRuntime { name }) => assert_eq!(name, "detached"),
        other => panic!("expected NoRuntime, got {other:?}"),
    }
}
