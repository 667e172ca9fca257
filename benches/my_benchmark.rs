use criterion::{criterion_group, criterion_main, Criterion};
use fault_injector::prelude::*;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::hint::black_box;

fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("fault_model");

    group.bench_function("choose and apply", |b| {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let snapshot = RegisterSnapshot::zeroed();
        b.iter(|| {
            let spec = choose_fault(&mut rng, REGISTER_FILE, REGISTER_WIDTH);
            black_box(apply(&snapshot, &spec));
        })
    });

    // The checkpoint is meant for hot loops; measure the armed fast path.
    group.bench_function("checkpoint armed", |b| {
        let mut state = FaultInjectorState::with_threshold(u64::MAX, 2);
        let mut value = 1.5f64;
        b.iter(|| {
            black_box(state.checkpoint(&mut value));
        })
    });

    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
