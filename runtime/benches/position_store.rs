//! Position store and availability benchmarks
//!
//! - Apply throughput for fresh and duplicate events
//! - Reservation round trip including the ATP guard
//! - Contention across keys
//!
//! Run with: `cargo bench -p inventory-sync-runtime`

#![allow(missing_docs)] // Benchmarks don't need extensive docs
#![allow(clippy::expect_used)] // Benchmarks can use expect for setup

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use inventory_sync_core::environment::SystemClock;
use inventory_sync_core::event::{EventType, InventoryChangeEvent};
use inventory_sync_core::policy::NoPendingReceipts;
use inventory_sync_core::position::PositionKey;
use inventory_sync_runtime::{
    AvailabilityCalculator, IdempotencyLedger, PositionStore, SafetyStockTable,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("Failed to build runtime")
}

fn create_store() -> Arc<PositionStore> {
    Arc::new(PositionStore::new(
        Arc::new(IdempotencyLedger::new(Duration::from_secs(86_400))),
        Arc::new(SafetyStockTable::new(5)),
        Arc::new(SystemClock),
        Duration::from_secs(5),
    ))
}

fn receipt(id: u64, key: &PositionKey) -> InventoryChangeEvent {
    InventoryChangeEvent::new(
        format!("bench-{id}"),
        EventType::Receipt,
        key.clone(),
        1,
        "bench",
        chrono::Utc::now(),
        "bench",
    )
    .expect("valid receipt")
}

fn benchmark_apply(c: &mut Criterion) {
    let mut group = c.benchmark_group("apply");
    group.throughput(Throughput::Elements(1));
    let runtime = runtime();
    let key = PositionKey::new("store-1", "sku-1");

    group.bench_function("fresh_event", |b| {
        let store = create_store();
        let next = AtomicU64::new(0);
        b.to_async(&runtime).iter(|| {
            let event = receipt(next.fetch_add(1, Ordering::Relaxed), &key);
            let store = Arc::clone(&store);
            async move {
                let _ = black_box(store.apply(&event).await);
            }
        });
    });

    group.bench_function("duplicate_event", |b| {
        let store = create_store();
        let event = receipt(0, &key);
        runtime.block_on(async {
            let _ = store.apply(&event).await;
        });
        b.to_async(&runtime).iter(|| async {
            let _ = black_box(store.apply(&event).await);
        });
    });

    group.finish();
}

fn benchmark_reserve(c: &mut Criterion) {
    let mut group = c.benchmark_group("reserve");
    group.throughput(Throughput::Elements(1));
    let runtime = runtime();
    let key = PositionKey::new("store-1", "sku-1");

    let store = create_store();
    runtime.block_on(async {
        let stock = InventoryChangeEvent::new(
            "seed",
            EventType::Receipt,
            key.clone(),
            i64::MAX / 2,
            "bench",
            chrono::Utc::now(),
            "seed",
        )
        .expect("valid receipt");
        let _ = store.apply(&stock).await;
    });
    let calculator = AvailabilityCalculator::new(
        Arc::clone(&store),
        Arc::new(NoPendingReceipts),
        Arc::new(SystemClock),
        Duration::from_secs(86_400),
    );

    group.bench_function("reserve_one", |b| {
        b.to_async(&runtime).iter(|| async {
            let _ = black_box(calculator.reserve(&key, 1).await);
        });
    });

    group.bench_function("compute_atp", |b| {
        b.to_async(&runtime).iter(|| async {
            black_box(calculator.compute_atp(&key).await);
        });
    });

    group.finish();
}

fn benchmark_contention(c: &mut Criterion) {
    let mut group = c.benchmark_group("contention");
    let runtime = runtime();

    for keys in [1usize, 8, 64] {
        group.throughput(Throughput::Elements(256));
        group.bench_with_input(BenchmarkId::new("keys", keys), &keys, |b, &keys| {
            let store = create_store();
            let next = Arc::new(AtomicU64::new(0));
            let positions: Arc<Vec<PositionKey>> = Arc::new(
                (0..keys)
                    .map(|n| PositionKey::new("store-1", format!("sku-{n}")))
                    .collect(),
            );
            b.to_async(&runtime).iter(|| {
                let store = Arc::clone(&store);
                let next = Arc::clone(&next);
                let positions = Arc::clone(&positions);
                async move {
                    let tasks: Vec<_> = (0..256usize)
                        .map(|i| {
                            let store = Arc::clone(&store);
                            let event = receipt(
                                next.fetch_add(1, Ordering::Relaxed),
                                &positions[i % positions.len()],
                            );
                            tokio::spawn(async move { store.apply(&event).await })
                        })
                        .collect();
                    for task in tasks {
                        let _ = task.await;
                    }
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_apply, benchmark_reserve, benchmark_contention);
criterion_main!(benches);
