//! Benchmarks for transaction propagation.
//!
//! Run with: cargo bench -p natrium-core

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use natrium_core::{Cell, Stream, StreamSink, Transaction};
use std::hint::black_box;

/// A sink feeding a linear chain of `depth` mapped cells.
fn make_chain(depth: usize) -> (StreamSink<u64>, Cell<u64>) {
    let sink = StreamSink::new();
    let mut cell = sink.stream().hold(0);
    for _ in 0..depth {
        cell = cell.map(|v| v.wrapping_add(1));
    }
    (sink, cell)
}

/// `width` independent sinks combined by one `lift_all`.
fn make_fan_in(width: usize) -> (Vec<StreamSink<u64>>, Cell<u64>) {
    let sinks: Vec<StreamSink<u64>> = (0..width).map(|_| StreamSink::new()).collect();
    let cells: Vec<Cell<u64>> = sinks.iter().map(|s| s.stream().hold(0)).collect();
    let total = Cell::lift_all(&cells).map(|values| values.iter().sum());
    (sinks, total)
}

fn bench_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("propagation/chain");

    for depth in [1, 10, 100, 1000] {
        let (sink, cell) = make_chain(depth);
        let _listener = cell
            .listen(|v| {
                black_box(*v);
            })
            .expect("listen");
        let mut next = 0_u64;
        group.bench_with_input(BenchmarkId::new("send", depth), &sink, |b, sink| {
            b.iter(|| {
                next += 1;
                sink.send(black_box(next));
            })
        });
    }

    group.finish();
}

fn bench_fan_in(c: &mut Criterion) {
    let mut group = c.benchmark_group("propagation/fan_in");

    for width in [2, 16, 128] {
        let (sinks, total) = make_fan_in(width);
        let _listener = total
            .listen(|v| {
                black_box(*v);
            })
            .expect("listen");
        group.bench_with_input(BenchmarkId::new("one_input", width), &sinks, |b, sinks| {
            b.iter(|| sinks[0].send(black_box(1)))
        });
        group.bench_with_input(BenchmarkId::new("all_inputs", width), &sinks, |b, sinks| {
            b.iter(|| {
                Transaction::run(|| {
                    for sink in sinks {
                        sink.send(black_box(1));
                    }
                })
            })
        });
    }

    group.finish();
}

fn bench_merge_tree(c: &mut Criterion) {
    let mut group = c.benchmark_group("propagation/merge");

    for width in [4, 64] {
        let sinks: Vec<StreamSink<u64>> = (0..width).map(|_| StreamSink::new()).collect();
        let merged = Stream::merge_all(sinks.iter().map(StreamSink::stream), |a: &u64, b: &u64| {
            a.wrapping_add(*b)
        });
        let _listener = merged
            .listen(|v| {
                black_box(*v);
            })
            .expect("listen");
        group.bench_with_input(BenchmarkId::new("simultaneous", width), &sinks, |b, sinks| {
            b.iter(|| {
                Transaction::run(|| {
                    for sink in sinks {
                        sink.send(black_box(3));
                    }
                })
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_chain, bench_fan_in, bench_merge_tree);

criterion_main!(benches);
