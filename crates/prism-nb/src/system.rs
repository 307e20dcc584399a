//! Collaborator-facing types: the partitioned atom system consumed each step,
//! the exclusion provider consulted at rebuild time, and the per-step results
//! handed back to the integrator.

use prism_core::{Float3, NbError, Result};
use std::collections::HashSet;

/// Atoms of one step as partitioned by the domain decomposition.
///
/// Atoms `0..n_local` are local to this rank, the rest are non-local halo
/// atoms received from neighbours.
#[derive(Debug, Clone, Default)]
pub struct AtomSystem {
    /// Positions (nm)
    pub positions: Vec<Float3>,
    /// Partial charges (e)
    pub charges: Vec<f32>,
    /// Lennard-Jones type per atom
    pub type_indices: Vec<u32>,
    /// Number of local atoms (prefix of the arrays)
    pub n_local: usize,
    /// Rectangular periodic box edges, `None` without periodic boundaries
    pub periodic_box: Option<Float3>,
    /// True when the run is spatially decomposed across ranks
    pub decomposition_active: bool,
}

impl AtomSystem {
    /// System with every atom local and no periodic boundaries.
    pub fn new(positions: Vec<Float3>, charges: Vec<f32>, type_indices: Vec<u32>) -> Self {
        let n_local = positions.len();
        Self {
            positions,
            charges,
            type_indices,
            n_local,
            periodic_box: None,
            decomposition_active: false,
        }
    }

    pub fn with_n_local(mut self, n_local: usize) -> Self {
        self.n_local = n_local;
        self
    }

    pub fn with_box(mut self, edges: Float3) -> Self {
        self.periodic_box = Some(edges);
        self
    }

    pub fn with_decomposition(mut self, active: bool) -> Self {
        self.decomposition_active = active;
        self
    }

    pub fn natoms(&self) -> usize {
        self.positions.len()
    }

    pub fn n_nonlocal(&self) -> usize {
        self.natoms() - self.n_local
    }

    /// Check array lengths, partition bounds, types and the box.
    pub fn validate(&self, ntypes: usize) -> Result<()> {
        let n = self.positions.len();
        if self.charges.len() != n || self.type_indices.len() != n {
            return Err(NbError::config(format!(
                "atom arrays disagree: {} positions, {} charges, {} types",
                n,
                self.charges.len(),
                self.type_indices.len()
            )));
        }
        if self.n_local > n {
            return Err(NbError::config(format!(
                "n_local {} exceeds atom count {}",
                self.n_local, n
            )));
        }
        if let Some(t) = self.type_indices.iter().find(|&&t| t as usize >= ntypes) {
            return Err(NbError::config(format!(
                "atom type {} out of range ({} types)",
                t, ntypes
            )));
        }
        if let Some(b) = self.periodic_box {
            if !(b.x > 0.0 && b.y > 0.0 && b.z > 0.0) {
                return Err(NbError::config(format!("invalid periodic box {:?}", b)));
            }
        }
        Ok(())
    }

    /// Reject periodic boxes too small for the single-image search at `rlist`.
    pub fn validate_box(&self, rlist: f32) -> Result<()> {
        if let Some(b) = self.periodic_box {
            let shortest = b.x.min(b.y).min(b.z);
            if shortest < 2.0 * rlist * (1.0 - 1e-6) {
                return Err(NbError::config(format!(
                    "periodic box edge {:.4} nm is shorter than twice the list cutoff {:.4} nm",
                    shortest, rlist
                )));
            }
        }
        Ok(())
    }
}

/// Source of bonded exclusions, consulted only when a pair list is rebuilt.
pub trait ExclusionProvider: Send + Sync {
    /// True when the interaction between atoms `i` and `j` must be skipped.
    fn is_excluded(&self, i: usize, j: usize) -> bool;
}

/// No bonded exclusions.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoExclusions;

impl ExclusionProvider for NoExclusions {
    fn is_excluded(&self, _i: usize, _j: usize) -> bool {
        false
    }
}

/// Per-atom exclusion sets (symmetric).
#[derive(Debug, Clone, Default)]
pub struct ExclusionLists {
    lists: Vec<HashSet<usize>>,
}

impl ExclusionLists {
    pub fn new(natoms: usize) -> Self {
        Self {
            lists: vec![HashSet::new(); natoms],
        }
    }

    /// Build from bonded pairs, excluding each pair in both directions.
    pub fn from_pairs(natoms: usize, pairs: &[(usize, usize)]) -> Self {
        let mut lists = Self::new(natoms);
        for &(i, j) in pairs {
            lists.exclude(i, j);
        }
        lists
    }

    /// 1-2 exclusions from `bonds` and 1-3 exclusions from the end atoms of
    /// `angles`. Out-of-range indices are ignored.
    pub fn from_topology(
        natoms: usize,
        bonds: &[(usize, usize)],
        angles: &[(usize, usize, usize)],
    ) -> Self {
        let mut lists = Self::new(natoms);
        for &(i, j) in bonds {
            if i < natoms && j < natoms {
                lists.exclude(i, j);
            }
        }
        for &(i, _, k) in angles {
            if i < natoms && k < natoms {
                lists.exclude(i, k);
            }
        }
        lists
    }

    pub fn exclude(&mut self, i: usize, j: usize) {
        let needed = i.max(j) + 1;
        if self.lists.len() < needed {
            self.lists.resize(needed, HashSet::new());
        }
        self.lists[i].insert(j);
        self.lists[j].insert(i);
    }

    pub fn count(&self) -> usize {
        self.lists.iter().map(HashSet::len).sum::<usize>() / 2
    }
}

impl ExclusionProvider for ExclusionLists {
    fn is_excluded(&self, i: usize, j: usize) -> bool {
        self.lists.get(i).is_some_and(|set| set.contains(&j))
    }
}

/// Forces and energies of one completed step.
///
/// Only produced by the end-of-step wait, so its contents are always final.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepResults {
    /// Force on every atom, in the caller's atom order (kJ mol⁻¹ nm⁻¹)
    pub forces: Vec<Float3>,
    /// Lennard-Jones energy of this step (kJ/mol), zero unless requested
    pub energy_lj: f64,
    /// Electrostatic energy of this step (kJ/mol), zero unless requested
    pub energy_el: f64,
    /// Force summed per periodic shift vector, for the virial
    pub shift_forces: Vec<Float3>,
}
