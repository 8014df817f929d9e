use criterion::{black_box, criterion_group, criterion_main, Criterion};
use graph_checkpoint::{GenerationEvent, GenerationStore, InMemoryGenerationStore};
use std::time::Duration;

fn publish_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("publish content chunk", |b| {
        b.to_async(&runtime).iter(|| async {
            let store = InMemoryGenerationStore::new(Duration::from_secs(60));
            store.create("m1", "bench-gen", "c1").await.unwrap();
            store
                .publish("bench-gen", black_box(GenerationEvent::ContentChunk { text: "hi".into() }))
                .await
                .unwrap();
        });
    });
}

fn subscribe_benchmark(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("subscribe with backlog", |b| {
        b.to_async(&runtime).iter(|| async {
            let store = InMemoryGenerationStore::new(Duration::from_secs(60));
            store.create("m1", "bench-gen", "c1").await.unwrap();
            for _ in 0..16 {
                store
                    .publish("bench-gen", GenerationEvent::ContentChunk { text: "hi".into() })
                    .await
                    .unwrap();
            }
            black_box(store.subscribe("bench-gen").await.unwrap());
        });
    });
}

criterion_group!(benches, publish_benchmark, subscribe_benchmark);
criterion_main!(benches);
