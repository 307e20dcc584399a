//! Pair list and step benchmarks.
//!
//! Benchmarked operations:
//! - Cluster layout + full list rebuild
//! - In-place prune of a buffered list
//! - One complete two-stream step on the reference kernel
//!
//! ## Usage
//! ```bash
//! cargo bench --bench pairlist
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use prism_core::{ElectrostaticsModel, Float3, InteractionLocality, NonbondedConfig};
use prism_nb::{
    AtomSystem, ClusterLayout, ClusterPairList, DeviceContext, DeviceMemoryBudget, LjPair,
    LjParameters, NoExclusions, NonbondedPipeline,
};
use std::sync::Arc;

/// Water-density random box: ~100 atoms per nm³.
fn random_box(natoms: usize, seed: u64) -> AtomSystem {
    let edge = (natoms as f32 / 100.0).cbrt();
    let mut state = seed;
    let mut next = move || {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (state >> 40) as f32 / (1u64 << 24) as f32
    };
    let positions = (0..natoms)
        .map(|_| Float3::new(next() * edge, next() * edge, next() * edge))
        .collect();
    let charges = (0..natoms)
        .map(|i| if i % 3 == 0 { -0.8 } else { 0.4 })
        .collect();
    AtomSystem::new(positions, charges, vec![0; natoms]).with_box(Float3::splat(edge))
}

fn config() -> NonbondedConfig {
    NonbondedConfig::builder()
        .cutoffs(0.9, 0.9)
        .list_buffer(0.1)
        .electrostatics(ElectrostaticsModel::ReactionField)
        .build()
        .expect("valid benchmark configuration")
}

fn bench_rebuild(c: &mut Criterion) {
    let ctx = DeviceContext::new(DeviceMemoryBudget::from_bytes(1 << 30));
    let cutoffs = config().cutoffs;
    let mut group = c.benchmark_group("pairlist_rebuild");

    for natoms in [3_000, 12_000, 48_000] {
        let system = random_box(natoms, natoms as u64);
        group.throughput(Throughput::Elements(natoms as u64));
        group.bench_with_input(BenchmarkId::from_parameter(natoms), &system, |b, sys| {
            let mut list = ClusterPairList::new(&ctx, InteractionLocality::Local, 8);
            b.iter(|| {
                let layout = ClusterLayout::build(black_box(sys), 8).unwrap();
                list.rebuild(&layout, sys, &cutoffs, &NoExclusions).unwrap();
                black_box(list.quad_count())
            });
        });
    }

    group.finish();
}

fn bench_prune(c: &mut Criterion) {
    let ctx = DeviceContext::new(DeviceMemoryBudget::from_bytes(1 << 30));
    let cutoffs = config().cutoffs;
    let mut group = c.benchmark_group("pairlist_prune");

    for natoms in [3_000, 12_000, 48_000] {
        let system = random_box(natoms, natoms as u64 + 1);
        let layout = ClusterLayout::build(&system, 8).unwrap();
        let mut built = ClusterPairList::new(&ctx, InteractionLocality::Local, 8);
        built.rebuild(&layout, &system, &cutoffs, &NoExclusions).unwrap();

        group.throughput(Throughput::Elements(built.pair_count() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(natoms), &system, |b, sys| {
            b.iter(|| {
                let mut list = ClusterPairList::new(&ctx, InteractionLocality::Local, 8);
                list.rebuild(&layout, sys, &cutoffs, &NoExclusions).unwrap();
                black_box(list.prune(&layout, sys, cutoffs.prune_cutoff()))
            });
        });
    }

    group.finish();
}

fn bench_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("two_stream_step");
    group.sample_size(10);

    for natoms in [3_000, 12_000] {
        let system = random_box(natoms, 17).with_n_local(natoms * 3 / 4);
        let lj = LjParameters::geometric(&[LjPair::new(2.6e-3, 2.6e-6)]).unwrap();
        let mut pipeline = NonbondedPipeline::new(config(), lj, Arc::new(NoExclusions)).unwrap();

        group.throughput(Throughput::Elements(natoms as u64));
        group.bench_with_input(BenchmarkId::from_parameter(natoms), &system, |b, sys| {
            b.iter(|| black_box(pipeline.run_step(sys, true).unwrap().energy_el));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_rebuild, bench_prune, bench_step);
criterion_main!(benches);
