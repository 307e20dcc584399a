//! Structural properties of the clustered pair list on randomised systems.

use prism_core::{CutoffConfig, Float3, InteractionLocality};
use prism_nb::pairlist::{clusters_within, ClusterPair, ExclusionEntry, CENTRAL_SHIFT};
use prism_nb::{
    AtomSystem, ClusterLayout, ClusterPairList, DeviceContext, DeviceMemoryBudget, ExclusionLists,
    NoExclusions,
};
use std::collections::HashSet;

fn ctx() -> DeviceContext {
    DeviceContext::new(DeviceMemoryBudget::from_bytes(128 << 20))
}

fn cutoffs() -> CutoffConfig {
    CutoffConfig {
        rvdw: 0.8,
        rcoulomb: 0.8,
        list_buffer: 0.15,
        prune_buffer: 0.05,
    }
}

/// Uniformly scattered atoms in a cube of edge `edge`.
fn random_system(natoms: usize, edge: f32, seed: u64) -> AtomSystem {
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
    AtomSystem::new(positions, vec![0.0; natoms], vec![0; natoms])
}

fn build(
    ctx: &DeviceContext,
    layout: &ClusterLayout,
    system: &AtomSystem,
    locality: InteractionLocality,
) -> ClusterPairList {
    let mut list = ClusterPairList::new(ctx, locality, layout.cluster_size());
    list.rebuild(layout, system, &cutoffs(), &NoExclusions)
        .unwrap();
    list
}

#[test]
fn test_rebuild_is_deterministic() {
    let ctx = ctx();
    let sys = random_system(300, 3.0, 42).with_n_local(180);
    let layout = ClusterLayout::build(&sys, 8).unwrap();

    for loc in InteractionLocality::ALL {
        let a = build(&ctx, &layout, &sys, loc);
        let b = build(&ctx, &layout, &sys, loc);
        assert_eq!(a.superclusters(), b.superclusters());
        assert_eq!(a.quads(), b.quads());
        assert_eq!(a.exclusions(), b.exclusions());
    }
}

#[test]
fn test_pruned_pairs_are_subset_within_cutoff() {
    let ctx = ctx();
    let sys = random_system(400, 3.2, 7).with_box(Float3::splat(3.2));
    let layout = ClusterLayout::build(&sys, 4).unwrap();
    let mut list = build(&ctx, &layout, &sys, InteractionLocality::Local);
    let before: HashSet<ClusterPair> = list.cluster_pairs(&layout).into_iter().collect();

    let cutoff = cutoffs().prune_cutoff();
    let stats = list.prune(&layout, &sys, cutoff);
    let after = list.cluster_pairs(&layout);

    assert!(stats.pairs_after <= stats.pairs_before);
    assert_eq!(stats.pairs_after, after.len());
    assert!(after.len() < before.len());

    let slot_positions = layout.slot_positions(&sys.positions);
    let shifts = layout.shift_vectors();
    for pair in &after {
        assert!(before.contains(pair), "{pair:?} appeared during prune");
        assert!(clusters_within(
            &layout,
            &slot_positions,
            pair.ci as usize,
            pair.cj as usize,
            shifts[pair.shift as usize],
            cutoff * cutoff,
        ));
    }
}

#[test]
fn test_every_close_pair_is_listed() {
    let ctx = ctx();
    let sys = random_system(250, 2.5, 99).with_n_local(120);
    let layout = ClusterLayout::build(&sys, 4).unwrap();
    let na_c = layout.cluster_size();

    let mut listed = HashSet::new();
    for loc in InteractionLocality::ALL {
        for pair in build(&ctx, &layout, &sys, loc).cluster_pairs(&layout) {
            assert_eq!(pair.shift as usize, CENTRAL_SHIFT);
            listed.insert((pair.ci.min(pair.cj), pair.ci.max(pair.cj)));
        }
    }

    let rc2 = cutoffs().interaction_cutoff().powi(2);
    let slots = layout.atom_slots();
    for i in 0..sys.natoms() {
        for j in i + 1..sys.natoms() {
            if (sys.positions[i] - sys.positions[j]).norm_sq() >= rc2 {
                continue;
            }
            let ci = slots[i] / na_c as u32;
            let cj = slots[j] / na_c as u32;
            assert!(
                listed.contains(&(ci.min(cj), ci.max(cj))),
                "atoms {i} and {j} (clusters {ci}, {cj}) missing from lists"
            );
        }
    }
}

#[test]
fn test_locality_split() {
    let ctx = ctx();
    let sys = random_system(320, 3.0, 5)
        .with_box(Float3::splat(3.0))
        .with_n_local(200);
    let layout = ClusterLayout::build(&sys, 8).unwrap();

    let local = build(&ctx, &layout, &sys, InteractionLocality::Local);
    for pair in local.cluster_pairs(&layout) {
        assert_eq!(layout.cluster_locality(pair.ci as usize), InteractionLocality::Local);
        assert_eq!(layout.cluster_locality(pair.cj as usize), InteractionLocality::Local);
    }

    let non_local = build(&ctx, &layout, &sys, InteractionLocality::NonLocal);
    assert!(!non_local.is_empty());
    for pair in non_local.cluster_pairs(&layout) {
        let either_remote = layout.cluster_locality(pair.ci as usize) == InteractionLocality::NonLocal
            || layout.cluster_locality(pair.cj as usize) == InteractionLocality::NonLocal;
        assert!(either_remote, "{pair:?} belongs to the local list");
    }
}

#[test]
fn test_first_exclusion_entry_is_all_interacting() {
    let ctx = ctx();
    let sys = random_system(64, 1.2, 3);
    let bonds: Vec<(usize, usize)> = (0..63).step_by(2).map(|i| (i, i + 1)).collect();
    let excl = ExclusionLists::from_pairs(64, &bonds);
    let layout = ClusterLayout::build(&sys, 8).unwrap();

    let mut list = ClusterPairList::new(&ctx, InteractionLocality::Local, 8);
    list.rebuild(&layout, &sys, &cutoffs(), &excl).unwrap();
    assert_eq!(list.exclusions()[0], ExclusionEntry::all_interacting(8));
    assert!(list.exclusion_count() > 1);

    let unique: HashSet<ExclusionEntry> = list.exclusions().iter().copied().collect();
    assert_eq!(unique.len(), list.exclusion_count());
}

#[test]
fn test_device_capacity_never_shrinks() {
    let ctx = ctx();
    let stream = ctx.new_stream("local").unwrap();
    let big = random_system(400, 3.0, 1);
    let small = random_system(40, 3.0, 2);

    let layout = ClusterLayout::build(&big, 4).unwrap();
    let mut list = build(&ctx, &layout, &big, InteractionLocality::Local);
    list.upload(&stream).unwrap();
    let grown = list.device().quad_capacity();
    assert!(grown >= list.quad_count());

    let layout = ClusterLayout::build(&small, 4).unwrap();
    list.rebuild(&layout, &small, &cutoffs(), &NoExclusions)
        .unwrap();
    list.upload(&stream).unwrap();
    stream.synchronize().unwrap();
    assert!(list.quad_count() < grown);
    assert_eq!(list.device().quad_capacity(), grown);
}
