//! Event bus and state store throughput benchmark.
//!
//! Measures synchronous emit fan-out and the full notify path of a store
//! write using Criterion.

use canopy_core::types::StoreConfig;
use canopy_core::{EventBus, StateStore, Value};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn bench_emit_fanout(c: &mut Criterion) {
    let listener_counts: &[usize] = &[0, 1, 8, 64];

    let mut group = c.benchmark_group("emit_fanout");
    for &count in listener_counts {
        let bus = EventBus::with_defaults();
        for _ in 0..count {
            let _ = bus.on("track:selected", |v| {
                black_box(v);
                Ok(())
            });
        }
        let payload = Value::from_pairs([("id", Value::from("track-42"))]);
        group.bench_with_input(BenchmarkId::from_parameter(count), &payload, |b, p| {
            b.iter(|| bus.emit("track:selected", black_box(p.clone())).unwrap());
        });
    }
    group.finish();
}

fn bench_store_set(c: &mut Criterion) {
    let bus = EventBus::with_defaults();
    let store = StateStore::with_schema(bus, StoreConfig::default());
    let _ = store.subscribe("ui.zoom", |change| {
        black_box(change);
        Ok(())
    });

    let mut zoom = 1.0;
    c.bench_function("store_set_notify", |b| {
        b.iter(|| {
            zoom = if zoom > 9.0 { 1.0 } else { zoom + 0.5 };
            store.set("ui.zoom", black_box(zoom)).unwrap()
        });
    });
}

criterion_group!(benches, bench_emit_fanout, bench_store_set);
criterion_main!(benches);
