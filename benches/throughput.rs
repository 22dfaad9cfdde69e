//! Throughput Benchmark for VoltKV
//!
//! This benchmark measures the performance of the storage engine
//! under various workloads.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;
use std::time::Duration;
use voltkv::storage::{IdSpec, StorageEngine};

/// Benchmark SET operations
fn bench_set(c: &mut Criterion) {
    let engine = Arc::new(StorageEngine::new());

    let mut group = c.benchmark_group("set");
    group.throughput(Throughput::Elements(1));

    group.bench_function("set_small", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = Bytes::from(format!("key:{}", i));
            let value = Bytes::from("small_value");
            engine.set(key, value, None);
            i += 1;
        });
    });

    group.bench_function("set_medium", |b| {
        let mut i = 0u64;
        let value = Bytes::from("x".repeat(1024)); // 1KB value
        b.iter(|| {
            let key = Bytes::from(format!("key:{}", i));
            engine.set(key, value.clone(), None);
            i += 1;
        });
    });

    group.bench_function("set_with_ttl", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = Bytes::from(format!("ttl:{}", i));
            engine.set(key, Bytes::from("value"), Some(Duration::from_secs(3600)));
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark GET operations
fn bench_get(c: &mut Criterion) {
    let engine = Arc::new(StorageEngine::new());

    // Pre-populate with data
    for i in 0..100_000 {
        let key = Bytes::from(format!("key:{}", i));
        let value = Bytes::from(format!("value:{}", i));
        engine.set(key, value, None);
    }

    let mut group = c.benchmark_group("get");
    group.throughput(Throughput::Elements(1));

    group.bench_function("get_existing", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = Bytes::from(format!("key:{}", i % 100_000));
            black_box(engine.get(&key).unwrap());
            i += 1;
        });
    });

    group.bench_function("get_missing", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = Bytes::from(format!("missing:{}", i));
            black_box(engine.get(&key).unwrap());
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark INCR operations
fn bench_incr(c: &mut Criterion) {
    let engine = Arc::new(StorageEngine::new());

    let mut group = c.benchmark_group("incr");
    group.throughput(Throughput::Elements(1));

    // Single counter (high contention)
    group.bench_function("single_counter", |b| {
        let key = Bytes::from("counter");
        b.iter(|| {
            black_box(engine.incr_by(&key, 1).unwrap());
        });
    });

    // Multiple counters (low contention)
    group.bench_function("multiple_counters", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = Bytes::from(format!("counter:{}", i % 1000));
            black_box(engine.incr_by(&key, 1).unwrap());
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark stream appends and range scans
fn bench_streams(c: &mut Criterion) {
    let mut group = c.benchmark_group("streams");
    group.throughput(Throughput::Elements(1));

    group.bench_function("xadd_auto_id", |b| {
        let engine = Arc::new(StorageEngine::new());
        let key = Bytes::from("log");
        b.iter(|| {
            black_box(
                engine
                    .stream_add(
                        &key,
                        IdSpec::Auto,
                        vec![(Bytes::from("field"), Bytes::from("value"))],
                    )
                    .unwrap(),
            );
        });
    });

    group.bench_function("xrange_tail", |b| {
        use voltkv::storage::StreamId;

        let engine = Arc::new(StorageEngine::new());
        let key = Bytes::from("log");
        for i in 0..10_000u64 {
            engine
                .stream_add(
                    &key,
                    IdSpec::Explicit(StreamId::new(i + 1, 0)),
                    vec![(Bytes::from("field"), Bytes::from("value"))],
                )
                .unwrap();
        }

        b.iter(|| {
            black_box(
                engine
                    .stream_range(&key, StreamId::new(9_900, 0), StreamId::MAX)
                    .unwrap(),
            );
        });
    });

    group.finish();
}

/// Benchmark concurrent access
fn bench_concurrent(c: &mut Criterion) {
    use std::thread;

    let mut group = c.benchmark_group("concurrent");
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("4_threads_mixed", |b| {
        b.iter(|| {
            let engine = Arc::new(StorageEngine::new());
            let handles: Vec<_> = (0..4)
                .map(|t| {
                    let engine = Arc::clone(&engine);
                    thread::spawn(move || {
                        for i in 0..10_000 {
                            let key = Bytes::from(format!("key:{}:{}", t, i));
                            let value = Bytes::from("value");
                            engine.set(key.clone(), value, None);
                            engine.get(&key).unwrap();
                        }
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }

            black_box(engine.len());
        });
    });

    group.finish();
}

/// Benchmark KEYS pattern matching
fn bench_keys(c: &mut Criterion) {
    let engine = Arc::new(StorageEngine::new());

    // Pre-populate with various key patterns
    for i in 0..1_000 {
        engine.set(
            Bytes::from(format!("user:{}", i)),
            Bytes::from("user_data"),
            None,
        );
        engine.set(
            Bytes::from(format!("session:{}", i)),
            Bytes::from("session_data"),
            None,
        );
        engine.set(
            Bytes::from(format!("cache:{}", i)),
            Bytes::from("cache_data"),
            None,
        );
    }

    let mut group = c.benchmark_group("keys");

    group.bench_function("keys_pattern", |b| {
        b.iter(|| {
            black_box(engine.keys("user:*"));
        });
    });

    group.bench_function("keys_all", |b| {
        b.iter(|| {
            black_box(engine.keys("*"));
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_set,
    bench_get,
    bench_incr,
    bench_streams,
    bench_concurrent,
    bench_keys,
);

criterion_main!(benches);
