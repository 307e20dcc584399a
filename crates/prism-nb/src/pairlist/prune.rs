//! In-place tightening of a pair list against a shorter cutoff.
//!
//! Each set i-mask bit is re-tested at atom level with the current positions;
//! bits with no real atom pair inside the cutoff are cleared and quads left
//! without any bit are dropped. Supercluster quad ranges are recomputed so
//! they stay contiguous. No spatial search takes place.

use super::layout::ClusterLayout;
use super::{PackedQuad, Supercluster, J_PER_QUAD};
use prism_core::Float3;
use rayon::prelude::*;

/// Outcome of one prune pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneStats {
    pub pairs_before: usize,
    pub pairs_after: usize,
    pub quads_before: usize,
    pub quads_after: usize,
}

/// True when any real atom of `ci` shifted by `shift` lies within the cutoff of
/// any real atom of `cj`.
pub fn clusters_within(
    layout: &ClusterLayout,
    slot_positions: &[Float3],
    ci: usize,
    cj: usize,
    shift: Float3,
    cutoff_sq: f32,
) -> bool {
    let na_c = layout.cluster_size();
    for si in ci * na_c..(ci + 1) * na_c {
        if layout.slot_atom(si).is_none() {
            continue;
        }
        let xi = slot_positions[si] + shift;
        for sj in cj * na_c..(cj + 1) * na_c {
            if layout.slot_atom(sj).is_none() {
                continue;
            }
            if (xi - slot_positions[sj]).norm_sq() < cutoff_sq {
                return true;
            }
        }
    }
    false
}

pub(crate) fn prune_quads(
    layout: &ClusterLayout,
    slot_positions: &[Float3],
    superclusters: &[Supercluster],
    quads: &[PackedQuad],
    cutoff: f32,
) -> (Vec<Supercluster>, Vec<PackedQuad>, PruneStats) {
    let cutoff_sq = cutoff * cutoff;
    let shift_vec = layout.shift_vectors();
    let spans = layout.superclusters();

    let kept: Vec<Vec<PackedQuad>> = superclusters
        .par_iter()
        .map(|sc| {
            let span = spans[sc.sci as usize];
            let sv = shift_vec[sc.shift as usize];
            quads[sc.quad_range()]
                .iter()
                .filter_map(|quad| {
                    let mut q = *quad;
                    for k in 0..J_PER_QUAD {
                        if q.cj[k] == super::layout::FILLER {
                            continue;
                        }
                        let cj = q.cj[k] as usize;
                        for (m, ci) in span.clusters().enumerate() {
                            if q.interacts(k, m)
                                && !clusters_within(layout, slot_positions, ci, cj, sv, cutoff_sq)
                            {
                                q.clear(k, m);
                            }
                        }
                    }
                    (q.imask != 0).then_some(q)
                })
                .collect()
        })
        .collect();

    let mut new_sc = Vec::with_capacity(superclusters.len());
    let mut new_quads = Vec::with_capacity(quads.len());
    for (sc, sc_quads) in superclusters.iter().zip(kept) {
        let quad_start = new_quads.len() as u32;
        new_quads.extend(sc_quads);
        new_sc.push(Supercluster {
            quad_start,
            quad_end: new_quads.len() as u32,
            ..*sc
        });
    }

    let stats = PruneStats {
        pairs_before: quads.iter().map(|q| q.imask.count_ones() as usize).sum(),
        pairs_after: new_quads.iter().map(|q| q.imask.count_ones() as usize).sum(),
        quads_before: quads.len(),
        quads_after: new_quads.len(),
    };
    (new_sc, new_quads, stats)
}
