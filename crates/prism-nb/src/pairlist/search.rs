//! Cluster-pair search.
//!
//! j-clusters are binned by bounding-box center on a grid whose cells are at
//! least `rlist` plus the largest cluster diameter wide, so every j-cluster
//! within range of a (shifted) i-cluster sits in the 3 × 3 × 3 block of cells
//! around it. Superclusters are searched in parallel and collected in order,
//! which keeps the result identical run to run.

use super::layout::{BoundingBox, ClusterLayout, CENTRAL_SHIFT};
use prism_core::{Float3, InteractionLocality};
use rayon::prelude::*;
use std::ops::Range;

/// In-range j-clusters of one supercluster under one shift.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ShiftCandidates {
    pub shift: usize,
    /// `(cj, imask)` sorted by `cj`; bit `m` of `imask` marks the supercluster's
    /// m-th i-cluster as in range
    pub j_clusters: Vec<(u32, u8)>,
}

/// Search result of one supercluster.
#[derive(Debug, Clone)]
pub(crate) struct SuperclusterCandidates {
    pub sci: u32,
    pub shifts: Vec<ShiftCandidates>,
}

struct ClusterGrid {
    origin: Float3,
    cell: Float3,
    dims: [usize; 3],
    cells: Vec<Vec<u32>>,
}

impl ClusterGrid {
    fn build(bounds: &[BoundingBox], j_range: Range<usize>, rlist: f32) -> Self {
        let mut region = BoundingBox::empty();
        let mut max_half = 0.0f32;
        for bb in &bounds[j_range.clone()] {
            region.include(bb.center());
            let h = bb.half_extent();
            max_half = max_half.max(h.x).max(h.y).max(h.z);
        }
        let min_edge = rlist + 2.0 * max_half;

        // Pad the region so no center lands on its upper face.
        let pad = Float3::splat(1e-3);
        let (origin, extent) = if region.is_empty() {
            (Float3::ZERO, Float3::splat(min_edge))
        } else {
            (
                region.lo - pad,
                (region.hi - region.lo + pad * 2.0).max(Float3::splat(min_edge)),
            )
        };
        // Sparse regions get wider cells: at most about one cell per j-cluster.
        let max_cells = j_range.len().max(1);
        let mut edge = min_edge;
        let mut dims = grid_dims(extent, edge);
        while dims.iter().product::<usize>() > max_cells {
            let ratio = dims.iter().product::<usize>() as f32 / max_cells as f32;
            edge *= ratio.cbrt().max(1.1);
            dims = grid_dims(extent, edge);
        }
        let cell = Float3::new(
            extent.x / dims[0] as f32,
            extent.y / dims[1] as f32,
            extent.z / dims[2] as f32,
        );

        let mut grid = Self {
            origin,
            cell,
            dims,
            cells: vec![Vec::new(); dims[0] * dims[1] * dims[2]],
        };
        for cj in j_range {
            let c = grid.cell_coords(bounds[cj].center());
            let idx = grid.flat(
                c[0].clamp(0, dims[0] as i64 - 1) as usize,
                c[1].clamp(0, dims[1] as i64 - 1) as usize,
                c[2].clamp(0, dims[2] as i64 - 1) as usize,
            );
            grid.cells[idx].push(cj as u32);
        }
        grid
    }

    fn cell_coords(&self, p: Float3) -> [i64; 3] {
        [
            ((p.x - self.origin.x) / self.cell.x).floor() as i64,
            ((p.y - self.origin.y) / self.cell.y).floor() as i64,
            ((p.z - self.origin.z) / self.cell.z).floor() as i64,
        ]
    }

    fn flat(&self, ix: usize, iy: usize, iz: usize) -> usize {
        (ix * self.dims[1] + iy) * self.dims[2] + iz
    }

    /// Sorted j-clusters in the cells neighbouring `p`.
    fn neighbours(&self, p: Float3, out: &mut Vec<u32>) {
        out.clear();
        let c = self.cell_coords(p);
        let span = |c: i64, d: usize| -> Option<Range<usize>> {
            let lo = (c - 1).max(0);
            let hi = (c + 1).min(d as i64 - 1);
            (lo <= hi).then(|| lo as usize..hi as usize + 1)
        };
        let (Some(rx), Some(ry), Some(rz)) = (
            span(c[0], self.dims[0]),
            span(c[1], self.dims[1]),
            span(c[2], self.dims[2]),
        ) else {
            return;
        };
        for ix in rx {
            for iy in ry.clone() {
                for iz in rz.clone() {
                    out.extend_from_slice(&self.cells[self.flat(ix, iy, iz)]);
                }
            }
        }
        out.sort_unstable();
    }
}

/// Cells per axis for cells at least `edge` wide.
fn grid_dims(extent: Float3, edge: f32) -> [usize; 3] {
    let dim = |e: f32| ((e / edge).floor() as usize).max(1);
    [dim(extent.x), dim(extent.y), dim(extent.z)]
}

/// Whether the pair `(ci, cj)` under `shift` belongs to the half list of `locality`.
#[inline]
pub(crate) fn pair_in_list(
    layout: &ClusterLayout,
    locality: InteractionLocality,
    ci: usize,
    cj: usize,
    shift: usize,
) -> bool {
    let half = shift > CENTRAL_SHIFT || (shift == CENTRAL_SHIFT && cj >= ci);
    if !half {
        return false;
    }
    match locality {
        InteractionLocality::Local => {
            layout.cluster_locality(ci) == InteractionLocality::Local
                && layout.cluster_locality(cj) == InteractionLocality::Local
        }
        InteractionLocality::NonLocal => {
            layout.cluster_locality(ci) == InteractionLocality::NonLocal
                || layout.cluster_locality(cj) == InteractionLocality::NonLocal
        }
    }
}

/// i-superclusters and j-clusters a list of `locality` draws from.
pub(crate) fn search_ranges(
    layout: &ClusterLayout,
    locality: InteractionLocality,
) -> (Range<usize>, Range<usize>) {
    match locality {
        InteractionLocality::Local => (
            layout.supercluster_range(InteractionLocality::Local),
            layout.cluster_range(InteractionLocality::Local),
        ),
        InteractionLocality::NonLocal => (0..layout.superclusters().len(), 0..layout.n_clusters()),
    }
}

/// Enumerate every in-range cluster pair of the `locality` list.
pub(crate) fn search_cluster_pairs(
    layout: &ClusterLayout,
    bounds: &[BoundingBox],
    rlist: f32,
    locality: InteractionLocality,
) -> Vec<SuperclusterCandidates> {
    let (sci_range, j_range) = search_ranges(layout, locality);
    if sci_range.is_empty() || j_range.is_empty() {
        return Vec::new();
    }

    let grid = ClusterGrid::build(bounds, j_range, rlist);
    let rlist_sq = rlist * rlist;
    let shifts = layout.active_shifts();
    let shift_vec = layout.shift_vectors();
    let spans = layout.superclusters();

    sci_range
        .into_par_iter()
        .map(|sci| {
            let span = spans[sci];
            let mut scratch = Vec::new();
            let mut per_shift = Vec::new();

            for &shift in &shifts {
                let sv = shift_vec[shift];
                let mut found: Vec<(u32, u8)> = Vec::new();
                for (m, ci) in span.clusters().enumerate() {
                    grid.neighbours(bounds[ci].center() + sv, &mut scratch);
                    for &cj in &scratch {
                        let cj_us = cj as usize;
                        if !pair_in_list(layout, locality, ci, cj_us, shift) {
                            continue;
                        }
                        if bounds[ci].distance_sq(sv, &bounds[cj_us]) >= rlist_sq {
                            continue;
                        }
                        found.push((cj, 1u8 << m));
                    }
                }
                if found.is_empty() {
                    continue;
                }
                found.sort_unstable_by_key(|&(cj, _)| cj);
                let mut merged: Vec<(u32, u8)> = Vec::with_capacity(found.len());
                for (cj, bit) in found {
                    match merged.last_mut() {
                        Some(last) if last.0 == cj => last.1 |= bit,
                        _ => merged.push((cj, bit)),
                    }
                }
                per_shift.push(ShiftCandidates {
                    shift,
                    j_clusters: merged,
                });
            }

            SuperclusterCandidates {
                sci: sci as u32,
                shifts: per_shift,
            }
        })
        .collect()
}
