//! Performance benchmarks for route resolution
//!
//! Run with: cargo bench --package gamegate-router

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use gamegate_core::config::RoutingConfig;
use gamegate_core::types::ServiceInstance;
use gamegate_router::ring::{hash_key, ConsistentHashRing};
use gamegate_router::MessageRouter;

fn instances(n: usize) -> Vec<ServiceInstance> {
    (0..n)
        .map(|i| ServiceInstance::new("logic", format!("logic-{}", i), format!("10.0.0.{}:7000", i)))
        .collect()
}

fn bench_ring_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_build");
    for n in [3usize, 16, 64] {
        let members = instances(n);
        group.bench_with_input(BenchmarkId::from_parameter(n), &members, |b, members| {
            b.iter(|| black_box(ConsistentHashRing::build("logic", members, 160)));
        });
    }
    group.finish();
}

fn bench_resolve(c: &mut Criterion) {
    let router = MessageRouter::new(RoutingConfig::default()).expect("router");
    for instance in instances(8) {
        router.register_instance(instance);
    }
    let keys: Vec<String> = (0..1024).map(|i| format!("player-{}", i)).collect();

    c.bench_function("hash_key", |b| b.iter(|| black_box(hash_key(black_box("player-42")))));

    c.bench_function("resolve_cached", |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % keys.len();
            black_box(router.resolve("logic", &keys[i]).ok())
        });
    });

    c.bench_function("resolve_uncached", |b| {
        b.iter(|| {
            router.cache().clear();
            black_box(router.resolve("logic", "player-7").ok())
        });
    });
}

criterion_group!(benches, bench_ring_build, bench_resolve);
criterion_main!(benches);
