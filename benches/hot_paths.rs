use std::collections::HashSet;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use migratoor::convert::metrics::{convert_row, MetricExcludes, SingleObservationTracker};
use migratoor::convert::system::SystemMetricsMapper;
use migratoor::metric::{MetricBatch, Row};
use migratoor::BatchAccumulator;
use serde_json::json;

fn history_row(step: i64) -> Row {
    json!({
        "_timestamp": 1_700_000_000.0 + step as f64,
        "_step": step,
        "_run_time": step as f64,
        "train.loss": 0.25,
        "train.lr": 0.001,
        "train.grad_norm": 1.5,
        "eval.loss": 0.5,
        "eval.acc.top1": 0.75,
        "throughput.samples_per_sec": 512.0,
        "note": "not numeric, skipped",
    })
    .as_object()
    .expect("object")
    .clone()
}

fn telemetry_row() -> Row {
    json!({
        "system.cpu": 55.2,
        "system.memory": 61.0,
        "system.proc.memory.rssMB": 12_288.0,
        "system.network.recv": 2_500_000,
        "system.network.sent": 1_250_000,
        "system.gpu.0.memory": 87.5,
        "system.gpu.0.memoryAllocated": 40.0,
        "system.gpu.0.memoryAllocatedBytes": 8_589_934_592_i64,
        "system.gpu.0.powerWatts": 250.0,
        "system.gpu.1.memory": 12.0,
        "system.gpu.1.powerWatts": 180.0,
    })
    .as_object()
    .expect("object")
    .clone()
}

fn bench_convert(c: &mut Criterion) {
    let row = history_row(42);
    let single = HashSet::new();
    let excludes = MetricExcludes::default();

    c.bench_function("convert/history_row", |b| {
        b.iter(|| convert_row(black_box(&row), &single, &excludes))
    });

    let telemetry = telemetry_row();
    let mapper = SystemMetricsMapper::new();

    c.bench_function("convert/telemetry_row", |b| {
        b.iter(|| mapper.convert_row(black_box(&telemetry), black_box(7)))
    });

    let rows: Vec<Row> = (0..512).map(history_row).collect();

    c.bench_function("convert/classify_512_rows", |b| {
        b.iter(|| {
            let mut tracker = SingleObservationTracker::new();
            for row in &rows {
                tracker.observe_row(black_box(row));
            }
            black_box(tracker.finish().len())
        })
    });
}

fn bench_accumulate(c: &mut Criterion) {
    let excludes = MetricExcludes::default();
    let single = HashSet::new();
    let candidates: Vec<MetricBatch> = (0..512)
        .map(|step| convert_row(&history_row(step), &single, &excludes))
        .collect();

    c.bench_function("accumulator/pump_512_rows", |b| {
        b.iter(|| {
            let mut acc = BatchAccumulator::default();
            let mut flushed = 0usize;
            for candidate in &candidates {
                for batch in acc.append(candidate.clone()) {
                    flushed += batch.len();
                }
            }
            flushed += acc.finish().len();
            black_box(flushed)
        })
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_convert(c);
    bench_accumulate(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
