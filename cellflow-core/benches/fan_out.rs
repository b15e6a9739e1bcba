//! Benchmarks for cell fan-out and calculator recomputation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use parking_lot::Mutex;

use cellflow_core::reactive::{Atom, Calculator, Cell, Sink, Stop};

fn manual_cell() -> (Cell<u64>, Arc<Mutex<Option<Sink<u64>>>>) {
    let slot = Arc::new(Mutex::new(None));
    let cell = Cell::from_fn({
        let slot = slot.clone();
        move |sink| {
            *slot.lock() = Some(sink);
            let slot = slot.clone();
            Stop::new(move || {
                slot.lock().take();
            })
        }
    });
    (cell, slot)
}

fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan_out");

    for subscribers in [1_usize, 16, 256] {
        let (cell, slot) = manual_cell();
        let total = Arc::new(AtomicU64::new(0));
        let subscriptions: Vec<_> = (0..subscribers)
            .map(|_| {
                let total = total.clone();
                cell.subscribe(move |update| {
                    if let Some(value) = update.and_then(|update| update.as_value()) {
                        total.fetch_add(*value, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        let sink = slot.lock().clone().expect("cell is active");

        group.bench_with_input(
            BenchmarkId::from_parameter(subscribers),
            &subscribers,
            |b, _| {
                let mut value = 0_u64;
                b.iter(|| {
                    value += 1;
                    sink.value(black_box(value));
                })
            },
        );

        drop(subscriptions);
    }

    group.finish();
}

fn bench_recompute(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime");

    let input = Atom::new(0_u64);
    let doubled = Calculator::builder()
        .name("doubled")
        .handle(runtime.handle().clone())
        .build({
            let input = input.clone();
            move |cx| {
                let input = input.clone();
                async move { Ok(cx.read(&input).await? * 2) }
            }
        })
        .expect("calculator");
    let _keep = doubled.subscribe(|_| {});

    c.bench_function("recompute", |b| {
        let mut value = 0_u64;
        b.iter(|| {
            value += 1;
            let next = doubled.next();
            input.set(value);
            black_box(runtime.block_on(next).expect("value"))
        })
    });
}

criterion_group!(benches, bench_fan_out, bench_recompute);
criterion_main!(benches);
