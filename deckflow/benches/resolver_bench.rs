//! Benchmarks for scheduling decisions and checkpoint sealing.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use deckflow::core::StageId;
use deckflow::pipeline::DependencyTable;
use deckflow::store::state_digest;
use deckflow::testing::{initial_state, state_with_completed};

fn resolver_benchmark(c: &mut Criterion) {
    let table = DependencyTable::standard();
    let fresh = initial_state("thread_bench");
    let halfway = state_with_completed("thread_bench", &StageId::ALL[..5], 1.0);
    let done = state_with_completed("thread_bench", &StageId::ALL, 1.0);

    c.bench_function("next_stage_fresh", |b| {
        b.iter(|| black_box(table.next_stage(black_box(&fresh))));
    });
    c.bench_function("next_stage_halfway", |b| {
        b.iter(|| black_box(table.next_stage(black_box(&halfway))));
    });
    c.bench_function("next_stage_done", |b| {
        b.iter(|| black_box(table.next_stage(black_box(&done))));
    });
}

fn digest_benchmark(c: &mut Criterion) {
    let state = state_with_completed("thread_bench", &StageId::ALL, 1.0);
    let encoded = serde_json::to_string(&state).unwrap_or_default();

    c.bench_function("state_digest", |b| {
        b.iter(|| black_box(state_digest(black_box(&encoded))));
    });
}

criterion_group!(benches, resolver_benchmark, digest_benchmark);
criterion_main!(benches);
