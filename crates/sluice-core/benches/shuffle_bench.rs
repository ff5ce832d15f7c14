//! Shuffle benchmarks
//!
//! Key encoding, payload encoding and policy comparison over a mixed-type
//! record layout.

use std::hint::black_box;
use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use sluice_common::types::{LogicalType, Record, Value};
use sluice_core::execution::operators::SortKey;
use sluice_core::shuffle::{
    BranchSchema, JoinPolicy, ShuffleCodec, ShufflePolicy, ShuffleSchema, TotalOrderPolicy,
};

fn codec() -> ShuffleCodec {
    ShuffleCodec::bound(Arc::new(ShuffleSchema::single(BranchSchema::new(
        vec![LogicalType::Int64, LogicalType::String, LogicalType::Float64],
        vec![SortKey::ascending(1), SortKey::descending(0)],
        0,
    ))))
}

fn records(n: usize) -> Vec<Record> {
    (0..n)
        .map(|i| {
            Record::new(vec![
                Value::Int64(i as i64),
                Value::from(format!("key-{}", i % 97)),
                Value::Float64(i as f64 * 0.5),
            ])
        })
        .collect()
}

fn encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("encoding");
    let codec = codec();

    for n in [100, 10_000] {
        let input = records(n);
        group.bench_with_input(BenchmarkId::new("encode_key", n), &input, |b, input| {
            b.iter(|| {
                for record in input {
                    black_box(codec.encode_key(record, None).unwrap());
                }
            });
        });
        group.bench_with_input(BenchmarkId::new("encode_record", n), &input, |b, input| {
            b.iter(|| {
                for record in input {
                    black_box(codec.encode_record(record, None).unwrap());
                }
            });
        });
    }

    let encoded: Vec<Vec<u8>> = records(1_000)
        .iter()
        .map(|r| codec.encode_key(r, None).unwrap())
        .collect();
    group.bench_function("decode_key", |b| {
        b.iter(|| {
            for key in &encoded {
                black_box(codec.decode_key(key).unwrap());
            }
        });
    });

    group.finish();
}

fn policies(c: &mut Criterion) {
    let mut group = c.benchmark_group("policy");
    let codec = codec();
    let keys: Vec<Vec<u8>> = records(1_000)
        .iter()
        .map(|r| codec.encode_key(r, None).unwrap())
        .collect();

    let total: Arc<dyn ShufflePolicy> = Arc::new(TotalOrderPolicy);
    let join: Arc<dyn ShufflePolicy> = Arc::new(JoinPolicy::new(5));
    for (name, policy) in [("total_order", total), ("join", join)] {
        group.bench_function(BenchmarkId::new("sort", name), |b| {
            b.iter(|| {
                let mut sorted = keys.clone();
                sorted.sort_by(|x, y| policy.compare(x, y));
                black_box(sorted)
            });
        });
        group.bench_function(BenchmarkId::new("partition", name), |b| {
            b.iter(|| {
                for key in &keys {
                    black_box(policy.partition(key, 16));
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, encoding, policies);
criterion_main!(benches);
