//! Performance benchmarks for the fact store.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use factstore::{
    Attempt, CatchupStrategy, Fact, FactInput, FactSpec, FactStore, StoreConfig,
    SubscriptionRequest,
};
use serde_json::json;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

fn create_store(dir: &TempDir, strategy: CatchupStrategy) -> FactStore {
    FactStore::create(StoreConfig {
        path: dir.path().join("store"),
        catchup_strategy: strategy,
        create_if_missing: true,
        ..Default::default()
    })
    .unwrap()
}

fn fact(i: usize) -> FactInput {
    FactInput::json("bench", &json!({ "i": i, "text": "some payload" }))
        .unwrap()
        .with_type(if i % 2 == 0 { "even" } else { "odd" })
}

/// Benchmark publish latency for varying batch sizes
fn bench_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish");

    for batch_size in [1, 10, 100] {
        group.bench_with_input(
            BenchmarkId::new("batch_size", batch_size),
            &batch_size,
            |b, &size| {
                let dir = TempDir::new().unwrap();
                let store = create_store(&dir, CatchupStrategy::Paged);

                b.iter(|| {
                    let batch = (0..size).map(fact).collect();
                    black_box(store.publish(batch).unwrap());
                });
            },
        );
    }

    group.finish();
}

/// Benchmark a full catchup over a pre-filled log
fn bench_catchup(c: &mut Criterion) {
    let mut group = c.benchmark_group("catchup");
    group.sample_size(20);

    for strategy in [CatchupStrategy::Paged, CatchupStrategy::Fetching] {
        for fact_count in [1_000, 10_000] {
            group.bench_with_input(
                BenchmarkId::new(format!("{:?}", strategy), fact_count),
                &fact_count,
                |b, &count| {
                    let dir = TempDir::new().unwrap();
                    let store = create_store(&dir, strategy);
                    for chunk in (0..count).collect::<Vec<_>>().chunks(500) {
                        store.publish(chunk.iter().map(|&i| fact(i)).collect()).unwrap();
                    }

                    b.iter(|| {
                        let request =
                            SubscriptionRequest::catchup(FactSpec::ns("bench").with_type("even"))
                                .from_scratch();
                        let sub = store
                            .subscribe(request, |f: Fact| {
                                black_box(f);
                            })
                            .unwrap();
                        sub.await_complete(Duration::from_secs(60)).unwrap();
                    });
                },
            );
        }
    }

    group.finish();
}

/// Benchmark an uncontended optimistic attempt
fn bench_optimistic_attempt(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let store = create_store(&dir, CatchupStrategy::Paged);
    let agg = Uuid::new_v4();
    for i in 0..1000 {
        store.publish_one(fact(i).with_agg_id(agg)).unwrap();
    }

    c.bench_function("optimistic_attempt", |b| {
        b.iter(|| {
            store
                .lock("bench")
                .unwrap()
                .on([agg])
                .unwrap()
                .optimistic()
                .attempt(|| Ok(Attempt::publish(fact(0).with_agg_id(agg))))
                .unwrap()
        });
    });
}

/// Benchmark point lookups
fn bench_fetch_by_id(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let store = create_store(&dir, CatchupStrategy::Paged);
    let ids: Vec<Uuid> = store
        .publish((0..1000).map(fact).collect())
        .unwrap()
        .iter()
        .map(Fact::id)
        .collect();

    c.bench_function("fetch_by_id", |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % ids.len();
            black_box(store.fetch_by_id(ids[i]).unwrap());
        });
    });
}

criterion_group!(
    benches,
    bench_publish,
    bench_catchup,
    bench_optimistic_attempt,
    bench_fetch_by_id
);
criterion_main!(benches);
