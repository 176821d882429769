//! Performance benchmarks for carry-client

use carry_client::{
    Cache, Filter, MemoryRemoteStore, MemoryStorage, NetworkMonitor, OfflineOperation,
    OfflineQueue, OperationKind, PersistedState, SyncConfig, SyncEngine,
};
use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use serde_json::json;
use std::sync::Arc;

fn populated_cache(size: u64) -> Cache {
    let mut cache = Cache::new();
    for i in 0..size {
        let path = format!("inv/item_{}", i);
        cache.put(
            &path,
            &path,
            json!({"name": format!("Item {}", i), "category": if i % 2 == 0 { "bakery" } else { "dairy" }}),
            1000,
        );
    }
    cache
}

fn populated_queue(size: u64) -> OfflineQueue {
    let mut queue = OfflineQueue::new();
    for i in 0..size {
        queue.enqueue(OfflineOperation::new(
            OperationKind::Update,
            format!("inv/item_{}", i % 50),
            Some(json!({"stock": i})),
            Some("cashier-1".to_string()),
            1000 + i,
            5,
        ));
    }
    queue
}

fn engine(online: bool) -> SyncEngine {
    SyncEngine::builder(
        Arc::new(MemoryRemoteStore::new()),
        Arc::new(MemoryStorage::new()),
    )
    .config(SyncConfig::default().with_replay_on_write(false))
    .network(NetworkMonitor::new(online))
    .build()
    .unwrap()
}

fn bench_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache");

    group.bench_function("put", |b| {
        let mut cache = Cache::new();
        let mut id = 0u64;
        b.iter(|| {
            id += 1;
            let path = format!("inv/item_{}", id);
            cache.put(black_box(&path), &path, json!({"stock": id}), 1000)
        })
    });

    group.bench_function("get", |b| {
        let cache = populated_cache(1000);
        b.iter(|| cache.get(black_box("inv/item_500")))
    });

    group.bench_function("children_filtered", |b| {
        let cache = populated_cache(1000);
        let filter = Filter::eq("category", json!("bakery"));
        b.iter(|| {
            cache
                .children(black_box("inv"))
                .filter(|e| filter.matches(&e.data))
                .count()
        })
    });

    group.finish();
}

fn bench_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue");

    group.bench_function("enqueue", |b| {
        let mut queue = OfflineQueue::new();
        let mut id = 0u64;
        b.iter(|| {
            id += 1;
            queue.enqueue(black_box(OfflineOperation::new(
                OperationKind::Update,
                "inv/item_1",
                Some(json!({"stock": id})),
                None,
                1000,
                5,
            )))
        })
    });

    group.bench_function("drain_oldest_first", |b| {
        b.iter_batched(
            || populated_queue(500),
            |mut queue| {
                while let Some(id) = queue.list_pending().first().map(|op| op.id.clone()) {
                    queue.record_success(&id);
                }
            },
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

fn bench_persistence(c: &mut Criterion) {
    let mut group = c.benchmark_group("persistence");

    for size in [10u64, 100, 1000].iter() {
        let mut state = PersistedState::new(1000);
        state.queue = populated_queue(*size);
        state.cache = populated_cache(*size);
        let encoded = state.to_json().unwrap();

        group.bench_with_input(BenchmarkId::new("encode", size), &state, |b, state| {
            b.iter(|| state.to_json().unwrap())
        });
        group.bench_with_input(BenchmarkId::new("decode", size), &encoded, |b, encoded| {
            b.iter(|| PersistedState::from_json(black_box(encoded)).unwrap())
        });
    }

    group.finish();
}

fn bench_engine(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine");

    // Each write persists the whole blob, so cost grows with the queue
    for backlog in [0u64, 100, 500].iter() {
        group.bench_with_input(
            BenchmarkId::new("offline_update", backlog),
            backlog,
            |b, &backlog| {
                let engine = engine(false);
                for i in 0..backlog {
                    engine
                        .update(&format!("inv/item_{}", i), json!({"stock": i}), None)
                        .unwrap();
                }
                b.iter(|| {
                    engine
                        .update(black_box("inv/item_0"), json!({"stock": 1}), None)
                        .unwrap()
                })
            },
        );
    }

    group.bench_function("replay_100", |b| {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        b.iter_batched(
            || {
                let engine = engine(true);
                for i in 0..100u64 {
                    engine
                        .update(&format!("inv/item_{}", i % 10), json!({"stock": i}), None)
                        .unwrap();
                }
                engine
            },
            |engine| runtime.block_on(engine.force_sync()),
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

criterion_group!(benches, bench_cache, bench_queue, bench_persistence, bench_engine);
criterion_main!(benches);
