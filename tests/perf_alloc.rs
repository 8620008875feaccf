use std::alloc::System;
use std::collections::HashSet;
use std::hint::black_box;

use migratoor::convert::metrics::{convert_row, MetricExcludes};
use migratoor::metric::{MetricBatch, MetricPoint, MetricValue, Row};
use migratoor::BatchAccumulator;
use serde_json::json;
use serial_test::serial;
use stats_alloc::{Region, StatsAlloc, INSTRUMENTED_SYSTEM};

#[global_allocator]
static GLOBAL: &StatsAlloc<System> = &INSTRUMENTED_SYSTEM;

fn measure_alloc_counts<T>(f: impl FnOnce() -> T) -> (T, usize, usize) {
    // Calibrate for ambient allocator activity in the test harness process.
    let idle_region = Region::new(&GLOBAL);
    black_box(());
    let idle = idle_region.change();

    let region = Region::new(&GLOBAL);
    let output = f();
    let used = region.change();

    let allocations = used.allocations.saturating_sub(idle.allocations);
    let deallocations = used.deallocations.saturating_sub(idle.deallocations);
    (output, allocations, deallocations)
}

fn history_row() -> Row {
    json!({
        "_timestamp": 1_700_000_000.5,
        "_step": 42,
        "train.loss": 0.25,
        "train.lr": 0.001,
        "train.grad_norm": 1.5,
        "eval.loss": 0.5,
        "eval.acc.top1": 0.75,
        "throughput.samples_per_sec": 512.0,
    })
    .as_object()
    .expect("object")
    .clone()
}

fn points(n: usize) -> MetricBatch {
    (0..n)
        .map(|i| MetricPoint::new(format!("m{i}"), MetricValue::Int(i as i64), i as i64, i as i64))
        .collect()
}

#[test]
#[serial]
fn parse_persisted_value_allocates_zero() {
    let (_, allocations, deallocations) = measure_alloc_counts(|| {
        for _ in 0..512 {
            black_box(MetricValue::parse(black_box("3")));
            black_box(MetricValue::parse(black_box("3.25")));
            black_box(MetricValue::parse(black_box("bogus")));
        }
    });

    assert!(
        allocations <= 8,
        "value parse allocation budget exceeded: {}",
        allocations
    );
    assert!(
        deallocations <= 8,
        "value parse deallocation budget exceeded: {}",
        deallocations
    );
}

#[test]
#[serial]
fn convert_row_allocation_budget() {
    let row = history_row();
    let single = HashSet::new();
    let excludes = MetricExcludes::default();

    // Six emitted points: one key String each plus output vec growth.
    let (_, allocations, _deallocations) = measure_alloc_counts(|| {
        let points = convert_row(&row, &single, &excludes);
        black_box(points.len());
        black_box(points);
    });

    assert!(
        allocations <= 32,
        "row conversion allocation budget exceeded: {}",
        allocations
    );
}

#[test]
#[serial]
fn accumulator_flush_moves_the_buffer() {
    let mut acc = BatchAccumulator::new(1000);
    acc.append(points(999));
    let candidate = points(1);

    // The flush hands the buffered batch over by move; a clone of 999
    // owned keys would blow this budget a hundred times over.
    let ((), allocations, _deallocations) = measure_alloc_counts(|| {
        let flushed = acc.append(candidate);
        black_box(flushed.len());
        black_box(flushed);
    });

    assert!(
        allocations <= 8,
        "accumulator flush allocation budget exceeded: {}",
        allocations
    );
}

#[test]
#[serial]
fn accumulator_append_moves_not_clones() {
    let candidates: Vec<MetricBatch> = (0..64).map(|_| points(4)).collect();
    let mut acc = BatchAccumulator::new(1000);

    // 256 points carrying owned keys: per-point clones would cost 256+
    // allocations, moving them costs only buffer growth.
    let ((), allocations, _deallocations) = measure_alloc_counts(|| {
        for candidate in candidates {
            black_box(acc.append(candidate).len());
        }
    });

    assert!(
        allocations <= 32,
        "accumulator append allocation budget exceeded: {}",
        allocations
    );
    assert_eq!(acc.len(), 256);
}
