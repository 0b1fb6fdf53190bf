//! Benchmarks for stream ordering and subscription translation
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use indexmap::IndexMap;
use scriptflow_rs::pipeline::{merge_by_receive_time, sort_by_receive_time, translate};
use scriptflow_rs::types::{MessageEvent, SubscribePayload, Time};
use serde_json::json;

fn events(topic: &str, count: usize, offset_nanos: u64) -> Vec<MessageEvent> {
    (0..count)
        .map(|i| {
            MessageEvent::new(
                topic,
                Time::from_nanos(i as u64 * 1_000_000 + offset_nanos),
                json!({ "value": i }),
                "Num",
            )
        })
        .collect()
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_by_receive_time");

    for size in [100, 1_000, 10_000].iter() {
        let left = events("/a", *size, 0);
        let right = events("/b", *size, 500_000);
        group.throughput(Throughput::Elements((*size * 2) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| merge_by_receive_time(black_box(left.clone()), black_box(right.clone())))
        });
    }

    group.finish();
}

fn bench_sort(c: &mut Criterion) {
    let mut group = c.benchmark_group("sort_by_receive_time");

    for size in [100, 1_000, 10_000].iter() {
        // Interleave two topics so every derived message lands out of order.
        let mut unsorted = events("/a", *size, 0);
        unsorted.extend(events("/b", *size, 500_000));
        group.throughput(Throughput::Elements((*size * 2) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                let mut batch = unsorted.clone();
                sort_by_receive_time(black_box(&mut batch));
                batch
            })
        });
    }

    group.finish();
}

fn bench_translate(c: &mut Criterion) {
    let mut group = c.benchmark_group("translate_subscriptions");

    for nodes in [10, 100].iter() {
        let outputs: IndexMap<String, Vec<String>> = (0..*nodes)
            .map(|i| (format!("/out/{}", i), vec![format!("/in/{}", i % 7)]))
            .collect();
        let subscriptions: Vec<SubscribePayload> = (0..*nodes)
            .map(|i| SubscribePayload::new(format!("/out/{}", i)))
            .chain((0..7).map(|i| SubscribePayload::new(format!("/in/{}", i))))
            .collect();
        group.bench_with_input(BenchmarkId::from_parameter(nodes), nodes, |b, _| {
            b.iter(|| translate(black_box(&subscriptions), black_box(&outputs)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_merge, bench_sort, bench_translate);
criterion_main!(benches);
