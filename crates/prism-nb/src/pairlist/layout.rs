//! Spatial clustering of atoms.
//!
//! Atoms of each partition are binned on a 3-D grid sized for roughly one
//! cluster per cell, sorted by (cell, z, atom index) and cut into fixed-size
//! clusters. Local clusters come first, then non-local clusters; each
//! partition is padded to a whole number of clusters with filler slots.
//! Superclusters group up to [`CLUSTERS_PER_SUPERCLUSTER`] consecutive
//! clusters of one partition.
//!
//! Periodic images are frozen when the layout is built: every atom keeps the
//! image translation it was assigned at build time until the next rebuild, so
//! cluster geometry stays continuous while atoms drift across box faces.

use crate::system::AtomSystem;
use prism_core::{Float3, Float4, InteractionLocality, NbError, PerLocality, Result};
use std::ops::Range;

/// Clusters per supercluster (the i-unit of the pair list).
pub const CLUSTERS_PER_SUPERCLUSTER: usize = 8;

/// Periodic shift vectors of a rectangular box (3 × 3 × 3).
pub const NUM_SHIFTS: usize = 27;

/// Index of the zero shift.
pub const CENTRAL_SHIFT: usize = 13;

/// Slot marker for padding atoms.
pub const FILLER: u32 = u32::MAX;

/// Shift index of image offsets `(ix, iy, iz)` in `-1..=1`.
pub const fn shift_index(ix: i32, iy: i32, iz: i32) -> usize {
    ((ix + 1) + 3 * (iy + 1) + 9 * (iz + 1)) as usize
}

/// All 27 shift vectors of `periodic_box`, or zeros without periodicity.
pub fn shift_vectors(periodic_box: Option<Float3>) -> Vec<Float3> {
    let mut shifts = vec![Float3::ZERO; NUM_SHIFTS];
    if let Some(b) = periodic_box {
        for iz in -1..=1 {
            for iy in -1..=1 {
                for ix in -1..=1 {
                    shifts[shift_index(ix, iy, iz)] =
                        Float3::new(ix as f32 * b.x, iy as f32 * b.y, iz as f32 * b.z);
                }
            }
        }
    }
    shifts
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub lo: Float3,
    pub hi: Float3,
}

impl BoundingBox {
    pub fn empty() -> Self {
        Self {
            lo: Float3::splat(f32::INFINITY),
            hi: Float3::splat(f32::NEG_INFINITY),
        }
    }

    pub fn include(&mut self, p: Float3) {
        self.lo = self.lo.min(p);
        self.hi = self.hi.max(p);
    }

    pub fn is_empty(&self) -> bool {
        self.lo.x > self.hi.x
    }

    pub fn center(&self) -> Float3 {
        (self.lo + self.hi) * 0.5
    }

    pub fn half_extent(&self) -> Float3 {
        (self.hi - self.lo) * 0.5
    }

    /// Squared distance between this box translated by `shift` and `other`.
    pub fn distance_sq(&self, shift: Float3, other: &BoundingBox) -> f32 {
        let lo = self.lo + shift;
        let hi = self.hi + shift;
        let gap = |alo: f32, ahi: f32, blo: f32, bhi: f32| (blo - ahi).max(alo - bhi).max(0.0);
        let dx = gap(lo.x, hi.x, other.lo.x, other.hi.x);
        let dy = gap(lo.y, hi.y, other.lo.y, other.hi.y);
        let dz = gap(lo.z, hi.z, other.lo.z, other.hi.z);
        dx * dx + dy * dy + dz * dz
    }
}

/// Contiguous run of clusters forming one supercluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperclusterSpan {
    pub first_cluster: u32,
    pub cluster_count: u32,
}

impl SuperclusterSpan {
    pub fn clusters(&self) -> Range<usize> {
        let first = self.first_cluster as usize;
        first..first + self.cluster_count as usize
    }
}

/// Atom-to-slot assignment for one list epoch.
#[derive(Debug, Clone)]
pub struct ClusterLayout {
    cluster_size: usize,
    slot_atom: Vec<u32>,
    atom_slot: Vec<u32>,
    images: Vec<Float3>,
    reference: Vec<Float3>,
    n_local_clusters: usize,
    spans: Vec<SuperclusterSpan>,
    n_local_superclusters: usize,
    periodic_box: Option<Float3>,
    shift_vectors: Vec<Float3>,
}

impl ClusterLayout {
    /// Cluster the atoms of `system`, local partition first.
    pub fn build(system: &AtomSystem, cluster_size: usize) -> Result<Self> {
        if !prism_core::SUPPORTED_CLUSTER_SIZES.contains(&cluster_size) {
            return Err(NbError::config(format!(
                "cluster size {} unsupported",
                cluster_size
            )));
        }

        let natoms = system.natoms();
        if system.n_local > natoms {
            return Err(NbError::config(format!(
                "n_local {} exceeds atom count {}",
                system.n_local, natoms
            )));
        }
        let images = wrap_images(&system.positions, system.periodic_box);
        let wrapped: Vec<Float3> = system
            .positions
            .iter()
            .zip(&images)
            .map(|(&p, &img)| p + img)
            .collect();

        let mut slot_atom = Vec::with_capacity(natoms + 2 * cluster_size);
        let mut spans = Vec::new();
        let mut n_local_clusters = 0;
        let mut n_local_superclusters = 0;

        for loc in InteractionLocality::ALL {
            let range = match loc {
                InteractionLocality::Local => 0..system.n_local,
                InteractionLocality::NonLocal => system.n_local..natoms,
            };
            let first_cluster = slot_atom.len() / cluster_size;
            let order = spatial_order(&wrapped, range, cluster_size, system.periodic_box);

            for chunk in order.chunks(cluster_size) {
                slot_atom.extend(chunk.iter().map(|&a| a as u32));
                slot_atom.extend(std::iter::repeat(FILLER).take(cluster_size - chunk.len()));
            }

            let end_cluster = slot_atom.len() / cluster_size;
            let mut c = first_cluster;
            while c < end_cluster {
                let count = CLUSTERS_PER_SUPERCLUSTER.min(end_cluster - c);
                spans.push(SuperclusterSpan {
                    first_cluster: c as u32,
                    cluster_count: count as u32,
                });
                c += count;
            }

            if loc == InteractionLocality::Local {
                n_local_clusters = end_cluster;
                n_local_superclusters = spans.len();
            }
        }

        let mut atom_slot = vec![FILLER; natoms];
        for (slot, &atom) in slot_atom.iter().enumerate() {
            if atom != FILLER {
                atom_slot[atom as usize] = slot as u32;
            }
        }

        Ok(Self {
            cluster_size,
            slot_atom,
            atom_slot,
            images,
            reference: system.positions.clone(),
            n_local_clusters,
            spans,
            n_local_superclusters,
            periodic_box: system.periodic_box,
            shift_vectors: shift_vectors(system.periodic_box),
        })
    }

    pub fn cluster_size(&self) -> usize {
        self.cluster_size
    }

    pub fn natoms(&self) -> usize {
        self.atom_slot.len()
    }

    /// Total slots including filler.
    pub fn n_slots(&self) -> usize {
        self.slot_atom.len()
    }

    pub fn n_local_slots(&self) -> usize {
        self.n_local_clusters * self.cluster_size
    }

    pub fn n_clusters(&self) -> usize {
        self.slot_atom.len() / self.cluster_size
    }

    pub fn n_local_clusters(&self) -> usize {
        self.n_local_clusters
    }

    pub fn cluster_locality(&self, cluster: usize) -> InteractionLocality {
        if cluster < self.n_local_clusters {
            InteractionLocality::Local
        } else {
            InteractionLocality::NonLocal
        }
    }

    pub fn cluster_range(&self, loc: InteractionLocality) -> Range<usize> {
        match loc {
            InteractionLocality::Local => 0..self.n_local_clusters,
            InteractionLocality::NonLocal => self.n_local_clusters..self.n_clusters(),
        }
    }

    pub fn slot_range(&self, loc: InteractionLocality) -> Range<usize> {
        let clusters = self.cluster_range(loc);
        clusters.start * self.cluster_size..clusters.end * self.cluster_size
    }

    pub fn superclusters(&self) -> &[SuperclusterSpan] {
        &self.spans
    }

    pub fn supercluster_range(&self, loc: InteractionLocality) -> Range<usize> {
        match loc {
            InteractionLocality::Local => 0..self.n_local_superclusters,
            InteractionLocality::NonLocal => self.n_local_superclusters..self.spans.len(),
        }
    }

    /// Atom in `slot`, `None` for filler.
    #[inline]
    pub fn slot_atom(&self, slot: usize) -> Option<usize> {
        match self.slot_atom[slot] {
            FILLER => None,
            atom => Some(atom as usize),
        }
    }

    /// Slot of each atom, in the caller's atom order.
    pub fn atom_slots(&self) -> &[u32] {
        &self.atom_slot
    }

    pub fn periodic_box(&self) -> Option<Float3> {
        self.periodic_box
    }

    pub fn shift_vectors(&self) -> &[Float3] {
        &self.shift_vectors
    }

    /// Shifts the search visits: all 27 with periodicity, else only the central one.
    pub fn active_shifts(&self) -> Vec<usize> {
        if self.periodic_box.is_some() {
            (0..NUM_SHIFTS).collect()
        } else {
            vec![CENTRAL_SHIFT]
        }
    }

    /// Slot-ordered positions in this epoch's image frame (filler at the origin).
    pub fn slot_positions(&self, positions: &[Float3]) -> Vec<Float3> {
        self.slot_atom
            .iter()
            .map(|&atom| match atom {
                FILLER => Float3::ZERO,
                a => positions[a as usize] + self.images[a as usize],
            })
            .collect()
    }

    /// Coordinates and charges of `slots`, ready for upload.
    pub fn gather_xq(&self, system: &AtomSystem, slots: Range<usize>) -> Vec<Float4> {
        self.slot_atom[slots]
            .iter()
            .map(|&atom| match atom {
                FILLER => Float4::default(),
                a => {
                    let a = a as usize;
                    Float4::from_xyz_q(system.positions[a] + self.images[a], system.charges[a])
                }
            })
            .collect()
    }

    /// Type index per slot (filler takes type 0; it never interacts).
    pub fn gather_types(&self, system: &AtomSystem) -> Vec<u32> {
        self.slot_atom
            .iter()
            .map(|&atom| match atom {
                FILLER => 0,
                a => system.type_indices[a as usize],
            })
            .collect()
    }

    /// Bounding box of every cluster's real atoms.
    pub fn cluster_bounds(&self, slot_positions: &[Float3]) -> Vec<BoundingBox> {
        (0..self.n_clusters())
            .map(|c| {
                let mut bb = BoundingBox::empty();
                for slot in c * self.cluster_size..(c + 1) * self.cluster_size {
                    if self.slot_atom[slot] != FILLER {
                        bb.include(slot_positions[slot]);
                    }
                }
                bb
            })
            .collect()
    }

    /// Largest displacement of any atom since the layout was built (nm).
    pub fn max_displacement(&self, positions: &[Float3]) -> f32 {
        if positions.len() != self.reference.len() {
            return f32::INFINITY;
        }
        positions
            .iter()
            .zip(&self.reference)
            .map(|(&p, &r)| (p - r).norm_sq())
            .fold(0.0f32, f32::max)
            .sqrt()
    }

    /// Whether `system` still matches the atom count and partition of this layout.
    pub fn matches(&self, system: &AtomSystem) -> bool {
        let local_atoms = (0..self.n_local_slots())
            .filter(|&s| self.slot_atom[s] != FILLER)
            .count();
        system.natoms() == self.natoms()
            && system.n_local == local_atoms
            && system.periodic_box == self.periodic_box
    }

    /// Local atom count per partition, for diagnostics.
    pub fn atoms_per_partition(&self) -> PerLocality<usize> {
        PerLocality::from_fn(|loc| {
            self.slot_atom[self.slot_range(loc)]
                .iter()
                .filter(|&&a| a != FILLER)
                .count()
        })
    }
}

/// Translation moving each atom into the primary box.
fn wrap_images(positions: &[Float3], periodic_box: Option<Float3>) -> Vec<Float3> {
    match periodic_box {
        None => vec![Float3::ZERO; positions.len()],
        Some(b) => positions
            .iter()
            .map(|p| {
                Float3::new(
                    -(p.x / b.x).floor() * b.x,
                    -(p.y / b.y).floor() * b.y,
                    -(p.z / b.z).floor() * b.z,
                )
            })
            .collect(),
    }
}

/// Atoms of `range` in grid order.
fn spatial_order(
    wrapped: &[Float3],
    range: Range<usize>,
    cluster_size: usize,
    periodic_box: Option<Float3>,
) -> Vec<usize> {
    let n = range.len();
    if n == 0 {
        return Vec::new();
    }

    let (lo, hi) = match periodic_box {
        Some(b) => (Float3::ZERO, b),
        None => {
            let mut bb = BoundingBox::empty();
            for &p in &wrapped[range.clone()] {
                bb.include(p);
            }
            (bb.lo, bb.hi)
        }
    };
    let extent = (hi - lo).max(Float3::splat(1e-6));
    let target_cells = n.div_ceil(cluster_size).max(1) as f32;
    let edge = (extent.x * extent.y * extent.z / target_cells).cbrt();
    let dims = [
        ((extent.x / edge).round() as usize).max(1),
        ((extent.y / edge).round() as usize).max(1),
        ((extent.z / edge).round() as usize).max(1),
    ];

    let cell_of = |p: Float3| -> usize {
        let idx = |v: f32, lo: f32, ext: f32, d: usize| -> usize {
            (((v - lo) / ext * d as f32).floor().max(0.0) as usize).min(d - 1)
        };
        let ix = idx(p.x, lo.x, extent.x, dims[0]);
        let iy = idx(p.y, lo.y, extent.y, dims[1]);
        let iz = idx(p.z, lo.z, extent.z, dims[2]);
        (ix * dims[1] + iy) * dims[2] + iz
    };

    let mut keyed: Vec<(usize, f32, usize)> = range
        .map(|a| (cell_of(wrapped[a]), wrapped[a].z, a))
        .collect();
    keyed.sort_by(|a, b| {
        a.0.cmp(&b.0)
            .then_with(|| a.1.total_cmp(&b.1))
            .then_with(|| a.2.cmp(&b.2))
    });
    keyed.into_iter().map(|(_, _, a)| a).collect()
}
