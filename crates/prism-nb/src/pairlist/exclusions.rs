//! Atom-pair interaction masks.
//!
//! Every j-slot of a packed quad points at an [`ExclusionEntry`]: one 64-bit
//! mask per i-cluster of the supercluster, bit `ai * cluster_size + aj` set
//! when atom `ai` of the i-cluster interacts with atom `aj` of the j-cluster.
//! Cleared bits cover bonded exclusions, filler slots and the lower triangle
//! (including self pairs) of a cluster paired with itself at the zero shift.
//! A bonded exclusion only removes the minimum-image copy of a pair; farther
//! periodic images of the same two atoms still interact.
//! Identical entries are stored once; entry 0 is the all-interacting mask.

use super::layout::{ClusterLayout, CENTRAL_SHIFT, CLUSTERS_PER_SUPERCLUSTER};
use crate::system::ExclusionProvider;
use prism_core::Float3;
use std::collections::HashMap;

/// Masks of one j-cluster against every i-cluster of a supercluster.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ExclusionEntry {
    pub masks: [u64; CLUSTERS_PER_SUPERCLUSTER],
}

impl ExclusionEntry {
    /// Every atom pair interacts.
    pub fn all_interacting(cluster_size: usize) -> Self {
        Self {
            masks: [full_mask(cluster_size); CLUSTERS_PER_SUPERCLUSTER],
        }
    }

    #[inline]
    pub fn interacts(&self, i_cluster: usize, ai: usize, aj: usize, cluster_size: usize) -> bool {
        self.masks[i_cluster] & (1u64 << (ai * cluster_size + aj)) != 0
    }
}

/// Mask with all `cluster_size²` pair bits set.
#[inline]
pub fn full_mask(cluster_size: usize) -> u64 {
    let bits = cluster_size * cluster_size;
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

/// Whether `d` is the shortest periodic displacement between its endpoints.
#[inline]
fn is_minimum_image(d: Float3, periodic_box: Option<Float3>) -> bool {
    match periodic_box {
        Some(b) => d.x.abs() <= 0.5 * b.x && d.y.abs() <= 0.5 * b.y && d.z.abs() <= 0.5 * b.z,
        None => true,
    }
}

/// Interaction mask between clusters `ci` and `cj` under `shift`.
pub(crate) fn pair_mask(
    layout: &ClusterLayout,
    slot_positions: &[Float3],
    ci: usize,
    cj: usize,
    shift: usize,
    exclusions: &dyn ExclusionProvider,
) -> u64 {
    let na_c = layout.cluster_size();
    let same_cluster = ci == cj && shift == CENTRAL_SHIFT;
    let sv = layout.shift_vectors()[shift];
    let periodic_box = layout.periodic_box();
    let mut mask = 0u64;
    for ai in 0..na_c {
        let Some(atom_i) = layout.slot_atom(ci * na_c + ai) else {
            continue;
        };
        for aj in 0..na_c {
            if same_cluster && aj <= ai {
                continue;
            }
            let Some(atom_j) = layout.slot_atom(cj * na_c + aj) else {
                continue;
            };
            if exclusions.is_excluded(atom_i, atom_j) {
                let d = slot_positions[ci * na_c + ai] + sv - slot_positions[cj * na_c + aj];
                if is_minimum_image(d, periodic_box) {
                    continue;
                }
            }
            mask |= 1u64 << (ai * na_c + aj);
        }
    }
    mask
}

/// Deduplicating store of exclusion entries, entry 0 all-interacting.
#[derive(Debug)]
pub(crate) struct ExclusionTable {
    entries: Vec<ExclusionEntry>,
    index: HashMap<ExclusionEntry, u32>,
}

impl ExclusionTable {
    pub(crate) fn new(cluster_size: usize) -> Self {
        let default = ExclusionEntry::all_interacting(cluster_size);
        let mut index = HashMap::new();
        index.insert(default, 0);
        Self {
            entries: vec![default],
            index,
        }
    }

    pub(crate) fn intern(&mut self, entry: ExclusionEntry) -> u32 {
        if let Some(&idx) = self.index.get(&entry) {
            return idx;
        }
        let idx = self.entries.len() as u32;
        self.entries.push(entry);
        self.index.insert(entry, idx);
        idx
    }

    pub(crate) fn into_entries(self) -> Vec<ExclusionEntry> {
        self.entries
    }
}
