//! Clustered pair list.
//!
//! One list per interaction locality. A list is an array of supercluster
//! entries, each owning a contiguous run of packed quads; a quad names four
//! j-clusters and carries a 32-bit interaction mask (4 j-slots × 8 i-clusters)
//! plus, per j-slot, an index into the deduplicated exclusion masks.
//!
//! Lifecycle per epoch: [`ClusterPairList::rebuild`] searches with the buffered
//! cutoff `rlist`, [`ClusterPairList::prune`] tightens the list in place, and
//! the kernels only ever read the uploaded device copy.

pub mod exclusions;
pub mod layout;
pub mod prune;
mod search;

pub use exclusions::{full_mask, ExclusionEntry};
pub use layout::{
    shift_index, shift_vectors, BoundingBox, ClusterLayout, SuperclusterSpan, CENTRAL_SHIFT,
    CLUSTERS_PER_SUPERCLUSTER, FILLER, NUM_SHIFTS,
};
pub use prune::{clusters_within, PruneStats};

use crate::device::{DeviceBuffer, DeviceContext, Stream};
use crate::system::{AtomSystem, ExclusionProvider};
use exclusions::{pair_mask, ExclusionTable};
use prism_core::{CutoffConfig, InteractionLocality, NbError, Result};
use rayon::prelude::*;
use std::ops::Range;

/// j-clusters per packed quad.
pub const J_PER_QUAD: usize = 4;

/// Four j-clusters processed together by one kernel work unit.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PackedQuad {
    /// j-cluster indices, [`FILLER`] for unused slots
    pub cj: [u32; J_PER_QUAD],
    /// Bit `k * 8 + m`: j-slot `k` interacts with i-cluster `m` of the supercluster
    pub imask: u32,
    /// Exclusion entry per j-slot
    pub excl_index: [u32; J_PER_QUAD],
}

impl Default for PackedQuad {
    fn default() -> Self {
        Self {
            cj: [FILLER; J_PER_QUAD],
            imask: 0,
            excl_index: [0; J_PER_QUAD],
        }
    }
}

impl PackedQuad {
    #[inline]
    const fn bit(k: usize, m: usize) -> u32 {
        1u32 << (k * CLUSTERS_PER_SUPERCLUSTER + m)
    }

    #[inline]
    pub fn interacts(&self, k: usize, m: usize) -> bool {
        self.imask & Self::bit(k, m) != 0
    }

    #[inline]
    pub fn clear(&mut self, k: usize, m: usize) {
        self.imask &= !Self::bit(k, m);
    }
}

/// List entry of one supercluster under one periodic shift.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Supercluster {
    /// Supercluster index in the layout
    pub sci: u32,
    /// Periodic shift applied to the i-clusters
    pub shift: u32,
    pub quad_start: u32,
    pub quad_end: u32,
}

impl Supercluster {
    pub fn quad_range(&self) -> Range<usize> {
        self.quad_start as usize..self.quad_end as usize
    }

    pub fn quad_count(&self) -> usize {
        (self.quad_end - self.quad_start) as usize
    }
}

/// Device copies of the three list arrays.
#[derive(Debug)]
pub struct DevicePairList {
    pub(crate) superclusters: DeviceBuffer<Supercluster>,
    pub(crate) quads: DeviceBuffer<PackedQuad>,
    pub(crate) exclusions: DeviceBuffer<ExclusionEntry>,
}

impl DevicePairList {
    fn new(ctx: &DeviceContext) -> Self {
        Self {
            superclusters: ctx.buffer("pairlist superclusters"),
            quads: ctx.buffer("pairlist quads"),
            exclusions: ctx.buffer("pairlist exclusions"),
        }
    }

    pub fn quad_capacity(&self) -> usize {
        self.quads.capacity()
    }

    pub fn exclusion_capacity(&self) -> usize {
        self.exclusions.capacity()
    }
}

/// One cluster pair of a list, resolved to cluster indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClusterPair {
    pub ci: u32,
    pub cj: u32,
    pub shift: u32,
}

/// Pair list of one interaction locality.
#[derive(Debug)]
pub struct ClusterPairList {
    locality: InteractionLocality,
    cluster_size: usize,
    superclusters: Vec<Supercluster>,
    quads: Vec<PackedQuad>,
    exclusions: Vec<ExclusionEntry>,
    prune_needed: bool,
    rlist: f32,
    rebuilds: u64,
    device: DevicePairList,
}

/// Quad block of one (supercluster, shift) before exclusion interning.
struct ShiftBlock {
    shift: u32,
    quads: Vec<(PackedQuad, [ExclusionEntry; J_PER_QUAD])>,
}

impl ClusterPairList {
    pub fn new(ctx: &DeviceContext, locality: InteractionLocality, cluster_size: usize) -> Self {
        Self {
            locality,
            cluster_size,
            superclusters: Vec::new(),
            quads: Vec::new(),
            exclusions: vec![ExclusionEntry::all_interacting(cluster_size)],
            prune_needed: false,
            rlist: 0.0,
            rebuilds: 0,
            device: DevicePairList::new(ctx),
        }
    }

    /// Full search with the buffered cutoff `cutoffs.rlist()`.
    ///
    /// Replaces the previous contents entirely. The result depends only on
    /// the layout, positions and exclusions: repeated rebuilds are identical.
    pub fn rebuild(
        &mut self,
        layout: &ClusterLayout,
        system: &AtomSystem,
        cutoffs: &CutoffConfig,
        exclusions: &dyn ExclusionProvider,
    ) -> Result<()> {
        if layout.cluster_size() != self.cluster_size {
            return Err(NbError::config(format!(
                "layout cluster size {} does not match list cluster size {}",
                layout.cluster_size(),
                self.cluster_size
            )));
        }

        let rlist = cutoffs.rlist();
        let slot_positions = layout.slot_positions(&system.positions);
        let bounds = layout.cluster_bounds(&slot_positions);
        let candidates = search::search_cluster_pairs(layout, &bounds, rlist, self.locality);
        let spans = layout.superclusters();
        let na_c = self.cluster_size;

        let blocks: Vec<(u32, Vec<ShiftBlock>)> = candidates
            .into_par_iter()
            .map(|cand| {
                let span = spans[cand.sci as usize];
                let blocks = cand
                    .shifts
                    .into_iter()
                    .filter_map(|sc| {
                        let shift = sc.shift;
                        let masked: Vec<(u32, u8, ExclusionEntry)> = sc
                            .j_clusters
                            .into_iter()
                            .filter_map(|(cj, ibits)| {
                                let mut entry = ExclusionEntry::all_interacting(na_c);
                                let mut bits = ibits;
                                for (m, ci) in span.clusters().enumerate() {
                                    if ibits & (1 << m) == 0 {
                                        continue;
                                    }
                                    let mask = pair_mask(
                                        layout,
                                        &slot_positions,
                                        ci,
                                        cj as usize,
                                        shift,
                                        exclusions,
                                    );
                                    if mask == 0 {
                                        bits &= !(1 << m);
                                    }
                                    entry.masks[m] = mask;
                                }
                                (bits != 0).then_some((cj, bits, entry))
                            })
                            .collect();
                        if masked.is_empty() {
                            return None;
                        }
                        let quads = masked
                            .chunks(J_PER_QUAD)
                            .map(|chunk| {
                                let mut quad = PackedQuad::default();
                                let mut entries =
                                    [ExclusionEntry::all_interacting(na_c); J_PER_QUAD];
                                for (k, &(cj, bits, entry)) in chunk.iter().enumerate() {
                                    quad.cj[k] = cj;
                                    quad.imask |= (bits as u32) << (k * CLUSTERS_PER_SUPERCLUSTER);
                                    entries[k] = entry;
                                }
                                (quad, entries)
                            })
                            .collect();
                        Some(ShiftBlock {
                            shift: shift as u32,
                            quads,
                        })
                    })
                    .collect();
                (cand.sci, blocks)
            })
            .collect();

        let own = layout.supercluster_range(self.locality);
        let mut table = ExclusionTable::new(na_c);
        let mut superclusters = Vec::with_capacity(blocks.len());
        let mut quads = Vec::new();
        for (sci, shift_blocks) in blocks {
            if shift_blocks.is_empty() {
                // An isolated supercluster of this partition keeps an empty slot.
                if !own.contains(&(sci as usize)) {
                    continue;
                }
                let at = quads.len() as u32;
                superclusters.push(Supercluster {
                    sci,
                    shift: CENTRAL_SHIFT as u32,
                    quad_start: at,
                    quad_end: at,
                });
                continue;
            }
            for block in shift_blocks {
                let quad_start = quads.len() as u32;
                for (mut quad, entries) in block.quads {
                    for k in 0..J_PER_QUAD {
                        if quad.cj[k] != FILLER {
                            quad.excl_index[k] = table.intern(entries[k]);
                        }
                    }
                    quads.push(quad);
                }
                superclusters.push(Supercluster {
                    sci,
                    shift: block.shift,
                    quad_start,
                    quad_end: quads.len() as u32,
                });
            }
        }

        self.superclusters = superclusters;
        self.quads = quads;
        self.exclusions = table.into_entries();
        self.rlist = rlist;
        self.prune_needed = rlist > cutoffs.interaction_cutoff();
        self.rebuilds += 1;

        log::debug!(
            "Rebuilt {} pair list: {} supercluster entries, {} quads, {} cluster pairs, {} exclusion masks (rlist {:.3} nm)",
            self.locality,
            self.superclusters.len(),
            self.quads.len(),
            self.pair_count(),
            self.exclusions.len(),
            rlist
        );
        Ok(())
    }

    /// Drop cluster pairs with no atom pair inside `cutoff` at the current
    /// positions. Only valid on a list built from `layout`.
    pub fn prune(
        &mut self,
        layout: &ClusterLayout,
        system: &AtomSystem,
        cutoff: f32,
    ) -> PruneStats {
        let slot_positions = layout.slot_positions(&system.positions);
        let (superclusters, quads, stats) =
            prune::prune_quads(layout, &slot_positions, &self.superclusters, &self.quads, cutoff);
        self.superclusters = superclusters;
        self.quads = quads;
        self.prune_needed = false;

        log::debug!(
            "Pruned {} pair list to {:.3} nm: {} -> {} cluster pairs, {} -> {} quads",
            self.locality,
            cutoff,
            stats.pairs_before,
            stats.pairs_after,
            stats.quads_before,
            stats.quads_after
        );
        stats
    }

    /// Whether the list was built with a buffered cutoff and not pruned since.
    pub fn is_prune_needed(&self) -> bool {
        self.prune_needed
    }

    /// Copy the three arrays into their device mirrors, growing them as needed.
    ///
    /// Reallocation is only legal while no kernel referencing the list is in
    /// flight; the pipeline calls this at the start of a step.
    pub fn upload(&mut self, stream: &Stream) -> Result<()> {
        self.device.superclusters.reserve(self.superclusters.len())?;
        self.device.quads.reserve(self.quads.len())?;
        self.device.exclusions.reserve(self.exclusions.len())?;

        if !self.superclusters.is_empty() {
            stream.copy_to_device(&self.device.superclusters, 0, self.superclusters.clone())?;
        }
        if !self.quads.is_empty() {
            stream.copy_to_device(&self.device.quads, 0, self.quads.clone())?;
        }
        stream.copy_to_device(&self.device.exclusions, 0, self.exclusions.clone())?;
        Ok(())
    }

    /// Fail when a list built `age` steps ago has outlived its `lifetime`.
    pub fn check_fresh(&self, age: u32, lifetime: u32) -> Result<()> {
        if age >= lifetime {
            return Err(NbError::stale_list(
                self.locality,
                format!(
                    "list is {} steps old but only valid for {} steps",
                    age, lifetime
                ),
            ));
        }
        Ok(())
    }

    /// Fail when the list was searched with a shorter cutoff than `rlist_sq` needs.
    pub fn check_covers(&self, rlist_sq: f32) -> Result<()> {
        if self.rlist * self.rlist < rlist_sq * (1.0 - 1e-6) {
            return Err(NbError::stale_list(
                self.locality,
                format!(
                    "list built with rlist {:.4} nm, parameters need {:.4} nm",
                    self.rlist,
                    rlist_sq.sqrt()
                ),
            ));
        }
        Ok(())
    }

    pub fn locality(&self) -> InteractionLocality {
        self.locality
    }

    pub fn cluster_size(&self) -> usize {
        self.cluster_size
    }

    pub fn superclusters(&self) -> &[Supercluster] {
        &self.superclusters
    }

    pub fn quads(&self) -> &[PackedQuad] {
        &self.quads
    }

    pub fn exclusions(&self) -> &[ExclusionEntry] {
        &self.exclusions
    }

    pub fn supercluster_count(&self) -> usize {
        self.superclusters.len()
    }

    pub fn quad_count(&self) -> usize {
        self.quads.len()
    }

    pub fn exclusion_count(&self) -> usize {
        self.exclusions.len()
    }

    /// Number of set i-mask bits (interacting cluster pairs).
    pub fn pair_count(&self) -> usize {
        self.quads.iter().map(|q| q.imask.count_ones() as usize).sum()
    }

    /// True when no cluster pair would be evaluated.
    pub fn is_empty(&self) -> bool {
        self.quads.is_empty()
    }

    /// Cutoff of the last rebuild.
    pub fn rlist(&self) -> f32 {
        self.rlist
    }

    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds
    }

    pub fn device(&self) -> &DevicePairList {
        &self.device
    }

    /// Interacting cluster pairs, sorted.
    pub fn cluster_pairs(&self, layout: &ClusterLayout) -> Vec<ClusterPair> {
        let spans = layout.superclusters();
        let mut pairs = Vec::with_capacity(self.pair_count());
        for sc in &self.superclusters {
            let span = spans[sc.sci as usize];
            for quad in &self.quads[sc.quad_range()] {
                for k in 0..J_PER_QUAD {
                    for (m, ci) in span.clusters().enumerate() {
                        if quad.interacts(k, m) {
                            pairs.push(ClusterPair {
                                ci: ci as u32,
                                cj: quad.cj[k],
                                shift: sc.shift,
                            });
                        }
                    }
                }
            }
        }
        pairs.sort_unstable();
        pairs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::DeviceMemoryBudget;
    use crate::system::NoExclusions;
    use prism_core::Float3;

    fn ctx() -> DeviceContext {
        DeviceContext::new(DeviceMemoryBudget::from_bytes(64 << 20))
    }

    fn cutoffs(rc: f32, buffer: f32) -> CutoffConfig {
        CutoffConfig {
            rvdw: rc,
            rcoulomb: rc,
            list_buffer: buffer,
            prune_buffer: 0.0,
        }
    }

    fn grid_system(n_side: usize, spacing: f32, n_local: usize) -> AtomSystem {
        let mut positions = Vec::new();
        for i in 0..n_side {
            for j in 0..n_side {
                for k in 0..n_side {
                    positions.push(Float3::new(
                        i as f32 * spacing,
                        j as f32 * spacing,
                        k as f32 * spacing,
                    ));
                }
            }
        }
        let n = positions.len();
        AtomSystem::new(positions, vec![0.0; n], vec![0; n]).with_n_local(n_local)
    }

    #[test]
    fn test_quad_bits() {
        let mut q = PackedQuad {
            imask: PackedQuad::bit(2, 5) | PackedQuad::bit(0, 0),
            ..Default::default()
        };
        assert!(q.interacts(2, 5));
        assert!(!q.interacts(1, 5));
        q.clear(2, 5);
        assert_eq!(q.imask, 1);
    }

    #[test]
    fn test_rebuild_sets_prune_needed_with_buffer() {
        let ctx = ctx();
        let sys = grid_system(4, 0.25, 64);
        let layout = ClusterLayout::build(&sys, 4).unwrap();

        let mut list = ClusterPairList::new(&ctx, InteractionLocality::Local, 4);
        list.rebuild(&layout, &sys, &cutoffs(0.5, 0.1), &NoExclusions).unwrap();
        assert!(list.is_prune_needed());
        assert!(list.pair_count() > 0);

        list.rebuild(&layout, &sys, &cutoffs(0.5, 0.0), &NoExclusions).unwrap();
        assert!(!list.is_prune_needed());
    }

    #[test]
    fn test_supercluster_quads_contiguous() {
        let ctx = ctx();
        let sys = grid_system(5, 0.2, 125);
        let layout = ClusterLayout::build(&sys, 4).unwrap();
        let mut list = ClusterPairList::new(&ctx, InteractionLocality::Local, 4);
        list.rebuild(&layout, &sys, &cutoffs(0.4, 0.1), &NoExclusions).unwrap();

        let mut expected_start = 0;
        for sc in list.superclusters() {
            assert_eq!(sc.quad_start, expected_start);
            assert!(sc.quad_end >= sc.quad_start);
            expected_start = sc.quad_end;
        }
        assert_eq!(expected_start as usize, list.quad_count());
        for q in list.quads() {
            for k in 0..J_PER_QUAD {
                assert!((q.excl_index[k] as usize) < list.exclusion_count());
            }
        }
    }

    #[test]
    fn test_empty_partition_gives_empty_list() {
        let ctx = ctx();
        let sys = grid_system(2, 0.3, 8);
        let layout = ClusterLayout::build(&sys, 4).unwrap();
        let mut list = ClusterPairList::new(&ctx, InteractionLocality::NonLocal, 4);
        list.rebuild(&layout, &sys, &cutoffs(0.5, 0.1), &NoExclusions).unwrap();
        assert!(list.is_empty());
        assert_eq!(list.supercluster_count(), 0);
    }

    #[test]
    fn test_check_fresh() {
        let ctx = ctx();
        let list = ClusterPairList::new(&ctx, InteractionLocality::Local, 8);
        assert!(list.check_fresh(9, 10).is_ok());
        let err = list.check_fresh(10, 10).unwrap_err();
        assert!(matches!(err, NbError::StaleList { .. }));
    }

    #[test]
    fn test_upload_grows_device_mirrors() {
        let ctx = ctx();
        let stream = ctx.new_stream("local").unwrap();
        let sys = grid_system(4, 0.25, 64);
        let layout = ClusterLayout::build(&sys, 4).unwrap();
        let mut list = ClusterPairList::new(&ctx, InteractionLocality::Local, 4);
        list.rebuild(&layout, &sys, &cutoffs(0.5, 0.1), &NoExclusions).unwrap();
        list.upload(&stream).unwrap();
        stream.synchronize().unwrap();

        assert!(list.device().quad_capacity() >= list.quad_count());
        assert!(list.device().exclusion_capacity() >= list.exclusion_count());
    }
}
