use std::collections::BTreeMap;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};

use dvpn_monitor::{CompositeRecord, Domain, FieldMap, MetricsCache, Snapshot, Timestamp};

fn record(secs: i64) -> CompositeRecord {
    let ts = Timestamp::from_secs(secs);
    let fields: FieldMap = [
        ("cpu".into(), 42.0),
        ("memory".into(), 61.5),
        ("disk".into(), 70.25),
    ]
    .into_iter()
    .collect();
    let mut by_domain = BTreeMap::new();
    by_domain.insert(Domain::System, Snapshot::new(Domain::System, ts, fields));
    CompositeRecord::new(ts, by_domain, Vec::new())
}

fn filled(count: i64) -> MetricsCache {
    let cache = MetricsCache::new(Duration::from_secs(3_600));
    for secs in 0..count {
        cache.insert(record(secs * 15));
    }
    cache
}

fn bench_insert(c: &mut Criterion) {
    let cache = filled(10_000);
    let mut next = 10_000 * 15;
    c.bench_function("cache_insert_append", |b| {
        b.iter(|| {
            next += 15;
            black_box(cache.insert(record(next)));
        })
    });
}

fn bench_evict(c: &mut Criterion) {
    c.bench_function("cache_evict_half", |b| {
        b.iter_batched(
            || filled(10_000),
            |cache| {
                let now = Timestamp::from_secs(10_000 * 15);
                black_box(cache.evict_older_than(Duration::from_secs(5_000 * 15), now))
            },
            BatchSize::LargeInput,
        )
    });
}

fn bench_latest(c: &mut Criterion) {
    let cache = filled(10_000);
    c.bench_function("cache_latest", |b| b.iter(|| black_box(cache.latest())));
}

criterion_group!(benches, bench_insert, bench_evict, bench_latest);
criterion_main!(benches);
