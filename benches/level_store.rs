/**
 *     ______   __  __     __         ______     ______
 *    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
 *    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
 *     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
 *      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
 *
 * Author: Colin MacRitchie / Ripple Group
 */

/* Benchmarks for level store and stat counters */

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mlfq_pulse::{CpuId, Level, LevelStore, StatCounters, StatIndex, TaskId};

fn bench_level_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("level_store/lookup");

    let store = LevelStore::new(65_536);
    for pid in 0..10_000u32 {
        store.set(TaskId(pid), if pid % 2 == 0 { Level::High } else { Level::Low });
    }

    group.bench_function("hit", |b| {
        b.iter(|| black_box(store.get(black_box(TaskId(4_242)))));
    });

    group.bench_function("miss", |b| {
        b.iter(|| black_box(store.get(black_box(TaskId(999_999)))));
    });

    group.bench_function("update_existing", |b| {
        b.iter(|| store.set(black_box(TaskId(4_242)), black_box(Level::Low)));
    });

    group.finish();
}

fn bench_eviction(c: &mut Criterion) {
    let mut group = c.benchmark_group("level_store/eviction");

    for capacity in [64usize, 1_024, 65_536].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(capacity), capacity, |b, &capacity| {
            let store = LevelStore::new(capacity);
            let mut pid = 0u32;
            b.iter(|| {
                store.set(TaskId(pid), Level::High);
                pid = pid.wrapping_add(1);
            });
        });
    }

    group.finish();
}

fn bench_stat_counters(c: &mut Criterion) {
    let mut group = c.benchmark_group("stat_counters");

    for units in [1usize, 8, 64].iter() {
        let counters = StatCounters::new(*units);

        group.bench_with_input(BenchmarkId::new("increment", units), units, |b, _| {
            b.iter(|| counters.increment(black_box(CpuId(0)), black_box(StatIndex::EnqHigh)));
        });

        group.bench_with_input(BenchmarkId::new("read_all", units), units, |b, _| {
            b.iter(|| black_box(counters.read_all()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_level_lookup, bench_eviction, bench_stat_counters);
criterion_main!(benches);
