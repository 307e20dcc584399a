//! Non-bonded force kernels.
//!
//! A kernel walks one locality's pair list: for every supercluster entry it
//! loops over the packed quads, and for every set i-mask bit over the
//! `cluster_size²` atom pairs allowed by the exclusion mask. Forces go into the
//! locality's own accumulator; energies and shift forces only into its own
//! output buffers, so the two localities never write the same memory.
//!
//! [`dispatch`] captures buffer handles and the parameter snapshot at issue
//! time and enqueues the evaluation on a stream. Kernels are pluggable through
//! [`NonbondedKernel`]; [`ReferenceKernel`] is the scalar implementation.

use crate::atoms::DeviceAtomStore;
use crate::device::{CommandResult, Stream};
use crate::pairlist::{
    ClusterLayout, ClusterPairList, ExclusionEntry, PackedQuad, Supercluster, SuperclusterSpan,
    FILLER, J_PER_QUAD,
};
use crate::params::InteractionParams;
use prism_core::{ElectrostaticsModel, Float3, Float4, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Closest approach allowed in a kernel (nm²); avoids a division by zero for
/// coincident atoms.
const MIN_DISTANCE_SQ: f32 = 3.82e-7;

/// Kernel variant selected per dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KernelFlavor {
    /// Accumulate LJ and electrostatic energies
    pub energy: bool,
    /// First dispatch on a freshly rebuilt or pruned list
    pub prune: bool,
}

impl KernelFlavor {
    pub const ALL: [KernelFlavor; 4] = [
        KernelFlavor::new(false, false),
        KernelFlavor::new(true, false),
        KernelFlavor::new(false, true),
        KernelFlavor::new(true, true),
    ];

    pub const fn new(energy: bool, prune: bool) -> Self {
        Self { energy, prune }
    }

    /// Position in [`KernelFlavor::ALL`].
    pub fn index(self) -> usize {
        (self.prune as usize) * 2 + self.energy as usize
    }

    pub fn name(self) -> &'static str {
        match (self.energy, self.prune) {
            (false, false) => "force",
            (true, false) => "force_energy",
            (false, true) => "force_prune",
            (true, true) => "force_energy_prune",
        }
    }
}

/// Read-only kernel inputs.
pub struct KernelInputs<'a> {
    pub flavor: KernelFlavor,
    pub params: &'a InteractionParams,
    pub cluster_size: usize,
    pub spans: &'a [SuperclusterSpan],
    pub xq: &'a [Float4],
    pub atom_types: &'a [u32],
    pub shift_vec: &'a [Float3],
    pub superclusters: &'a [Supercluster],
    pub quads: &'a [PackedQuad],
    pub exclusions: &'a [ExclusionEntry],
}

/// Accumulators written by the kernel of one locality.
pub struct KernelOutputs<'a> {
    pub f: &'a mut [Float3],
    pub e_lj: &'a mut f32,
    pub e_el: &'a mut f32,
    pub fshift: &'a mut [Float3],
}

/// Force kernel run on a stream worker.
///
/// Returning `Err` marks the stream as failed; the pipeline surfaces it as
/// `NbError::DeviceOperation` at the next synchronization.
pub trait NonbondedKernel: Send + Sync {
    fn name(&self) -> &str;

    fn compute(&self, inputs: &KernelInputs<'_>, outputs: &mut KernelOutputs<'_>) -> CommandResult;
}

/// Scalar reference implementation of the cluster-pair kernel.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceKernel;

impl NonbondedKernel for ReferenceKernel {
    fn name(&self) -> &str {
        "reference"
    }

    fn compute(&self, inputs: &KernelInputs<'_>, outputs: &mut KernelOutputs<'_>) -> CommandResult {
        let p = inputs.params;
        let na_c = inputs.cluster_size;
        let ntypes = p.lj.ntypes() as u32;
        let n_slots = inputs.xq.len().min(inputs.atom_types.len()).min(outputs.f.len());

        let mut e_lj = 0.0f64;
        let mut e_el = 0.0f64;

        for sc in inputs.superclusters {
            let span = inputs
                .spans
                .get(sc.sci as usize)
                .ok_or_else(|| format!("supercluster {} outside layout", sc.sci))?;
            let shift = *inputs
                .shift_vec
                .get(sc.shift as usize)
                .ok_or_else(|| format!("shift {} outside shift table", sc.shift))?;
            let quads = inputs
                .quads
                .get(sc.quad_range())
                .ok_or_else(|| format!("quad range {:?} outside list", sc.quad_range()))?;
            let mut fshift = Float3::ZERO;

            for quad in quads {
                for k in 0..J_PER_QUAD {
                    let cj = quad.cj[k];
                    if cj == FILLER {
                        continue;
                    }
                    let excl = inputs
                        .exclusions
                        .get(quad.excl_index[k] as usize)
                        .ok_or_else(|| format!("exclusion index {} out of range", quad.excl_index[k]))?;
                    let cj = cj as usize;
                    if (cj + 1) * na_c > n_slots {
                        return Err(format!("j-cluster {} outside atom store", cj));
                    }

                    for (m, ci) in span.clusters().enumerate() {
                        if !quad.interacts(k, m) {
                            continue;
                        }
                        if (ci + 1) * na_c > n_slots {
                            return Err(format!("i-cluster {} outside atom store", ci));
                        }
                        for ai in 0..na_c {
                            let si = ci * na_c + ai;
                            let xi = inputs.xq[si];
                            let pos_i = xi.xyz() + shift;
                            let ti = inputs.atom_types[si];
                            let mut fi = Float3::ZERO;

                            for aj in 0..na_c {
                                if !excl.interacts(m, ai, aj, na_c) {
                                    continue;
                                }
                                let sj = cj * na_c + aj;
                                let xj = inputs.xq[sj];
                                let tj = inputs.atom_types[sj];
                                if ti >= ntypes || tj >= ntypes {
                                    return Err(format!("atom type {} or {} out of range", ti, tj));
                                }

                                let dx = pos_i - xj.xyz();
                                let r2 = dx.norm_sq();
                                if r2 >= p.rlist_sq {
                                    continue;
                                }
                                let r2 = r2.max(MIN_DISTANCE_SQ);
                                let rinv2 = 1.0 / r2;
                                let rinv = rinv2.sqrt();
                                let mut fscal = 0.0f32;

                                if r2 < p.rvdw_sq {
                                    let lj = p.lj.pair(ti, tj);
                                    let rinv6 = rinv2 * rinv2 * rinv2;
                                    let rep = lj.c12 * rinv6 * rinv6;
                                    let disp = lj.c6 * rinv6;
                                    fscal += (12.0 * rep - 6.0 * disp) * rinv2;
                                    if inputs.flavor.energy {
                                        let sh = p.lj_shift;
                                        e_lj += (lj.c12 * (rinv6 * rinv6 - sh * sh)
                                            - lj.c6 * (rinv6 - sh)) as f64;
                                    }
                                }

                                let qq = xi.w * xj.w * p.epsfac;
                                if qq != 0.0 && r2 < p.rcoulomb_sq {
                                    let (f, v) = coulomb(p, r2, rinv, rinv2);
                                    fscal += qq * f;
                                    if inputs.flavor.energy {
                                        e_el += (qq * v) as f64;
                                    }
                                }

                                let fij = dx * fscal;
                                fi += fij;
                                outputs.f[sj] += -fij;
                            }

                            outputs.f[si] += fi;
                            fshift += fi;
                        }
                    }
                }
            }

            if let Some(slot) = outputs.fshift.get_mut(sc.shift as usize) {
                *slot += fshift;
            }
        }

        if inputs.flavor.energy {
            *outputs.e_lj += e_lj as f32;
            *outputs.e_el += e_el as f32;
        }
        Ok(())
    }
}

/// Coulomb `(force / r, energy)` per unit charge product, without `epsfac`.
#[inline]
fn coulomb(p: &InteractionParams, r2: f32, rinv: f32, rinv2: f32) -> (f32, f32) {
    match p.electrostatics {
        ElectrostaticsModel::ReactionField | ElectrostaticsModel::Cutoff => (
            rinv * rinv2 - p.two_k_rf,
            rinv + p.k_rf * r2 - p.c_rf,
        ),
        ElectrostaticsModel::Ewald => {
            let (fcorr, vcorr) = match &p.coulomb_table {
                Some(table) => table.interpolate(r2.sqrt()),
                None => (0.0, 0.0),
            };
            ((rinv2 - fcorr) * rinv, rinv - vcorr - p.ewald_shift)
        }
    }
}

/// Enqueue `kernel` over `list` on `stream`.
///
/// Returns `Ok(false)` without issuing anything when the list is empty. The
/// closure owns the parameter snapshot and the buffer generations current at
/// issue time, so a later `replace()` or reallocation does not affect it.
pub fn dispatch(
    stream: &Stream,
    kernel: &Arc<dyn NonbondedKernel>,
    flavor: KernelFlavor,
    params: Arc<InteractionParams>,
    layout: &Arc<ClusterLayout>,
    atoms: &DeviceAtomStore,
    list: &ClusterPairList,
) -> Result<bool> {
    list.check_covers(params.rlist_sq)?;
    if list.is_empty() {
        return Ok(false);
    }

    let locality = list.locality();
    let device = list.device();
    let n_sc = device.superclusters.len();
    let n_quads = device.quads.len();
    let n_excl = device.exclusions.len();
    let n_slots = atoms.natoms();
    let cluster_size = list.cluster_size();

    let kernel = Arc::clone(kernel);
    let layout = Arc::clone(layout);
    let xq = atoms.xq.handle();
    let atom_types = atoms.atom_types.handle();
    let shift_vec = atoms.shift_vec.handle();
    let superclusters = device.superclusters.handle();
    let quads = device.quads.handle();
    let exclusions = device.exclusions.handle();
    let f = atoms.f[locality].handle();
    let out = atoms.outputs(locality);
    let e_lj = out.e_lj.handle();
    let e_el = out.e_el.handle();
    let fshift = out.fshift.handle();

    let label = format!("{} kernel ({})", kernel.name(), flavor.name());
    stream.enqueue(label, move || {
        let xq = xq.read();
        let atom_types = atom_types.read();
        let shift_vec = shift_vec.read();
        let superclusters = superclusters.read();
        let quads = quads.read();
        let exclusions = exclusions.read();
        let mut f = f.write();
        let mut e_lj = e_lj.write();
        let mut e_el = e_el.write();
        let mut fshift = fshift.write();

        let (Some(xq), Some(atom_types), Some(f)) = (
            xq.get(..n_slots),
            atom_types.get(..n_slots),
            f.get_mut(..n_slots),
        ) else {
            return Err(format!("atom buffers shorter than {} slots", n_slots));
        };
        let (Some(superclusters), Some(quads), Some(exclusions)) = (
            superclusters.get(..n_sc),
            quads.get(..n_quads),
            exclusions.get(..n_excl),
        ) else {
            return Err("pair list buffers shorter than uploaded list".to_string());
        };
        let (Some(e_lj), Some(e_el)) = (e_lj.first_mut(), e_el.first_mut()) else {
            return Err("energy buffers not allocated".to_string());
        };

        let inputs = KernelInputs {
            flavor,
            params: &params,
            cluster_size,
            spans: layout.superclusters(),
            xq,
            atom_types,
            shift_vec: &shift_vec,
            superclusters,
            quads,
            exclusions,
        };
        let mut outputs = KernelOutputs {
            f,
            e_lj,
            e_el,
            fshift: &mut fshift,
        };
        kernel.compute(&inputs, &mut outputs)
    })?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceContext, HostBuffer};
    use crate::memory::DeviceMemoryBudget;
    use crate::params::{LjPair, LjParameters};
    use crate::system::{AtomSystem, NoExclusions};
    use approx::assert_relative_eq;
    use prism_core::{AtomLocality, InteractionLocality, NbError, NonbondedConfig};

    struct Evaluated {
        forces: Vec<Float3>,
        e_lj: f32,
        e_el: f32,
        fshift: Vec<Float3>,
        launched: bool,
    }

    fn evaluate(system: &AtomSystem, config: &NonbondedConfig, lj: LjParameters) -> Evaluated {
        let ctx = DeviceContext::new(DeviceMemoryBudget::from_bytes(64 << 20));
        let stream = ctx.new_stream("local").unwrap();
        let layout = Arc::new(ClusterLayout::build(system, config.cluster_size).unwrap());
        let mut list = ClusterPairList::new(&ctx, InteractionLocality::Local, config.cluster_size);
        list.rebuild(&layout, system, &config.cutoffs, &NoExclusions)
            .unwrap();
        list.upload(&stream).unwrap();

        let mut atoms = DeviceAtomStore::new(&ctx, 0).unwrap();
        atoms.reserve(layout.n_slots(), layout.n_local_slots()).unwrap();
        atoms.upload_atom_types(&stream, &layout, system).unwrap();
        atoms
            .upload_shift_vectors(&stream, layout.shift_vectors())
            .unwrap();
        atoms
            .upload_coordinates(&stream, AtomLocality::All, &layout, system)
            .unwrap();
        atoms.clear_outputs(&stream).unwrap();

        let params = Arc::new(InteractionParams::from_config(config, lj).unwrap());
        let kernel: Arc<dyn NonbondedKernel> = Arc::new(ReferenceKernel);
        let launched = dispatch(
            &stream,
            &kernel,
            KernelFlavor::new(true, false),
            params,
            &layout,
            &atoms,
            &list,
        )
        .unwrap();

        let host_f = HostBuffer::new(0);
        atoms.download_forces(&stream, &host_f).unwrap();
        let e_lj = HostBuffer::new(1);
        let e_el = HostBuffer::new(1);
        let fshift = HostBuffer::new(27);
        let out = atoms.outputs(InteractionLocality::Local);
        stream.copy_to_host(&out.e_lj, 0..1, &e_lj, 0).unwrap();
        stream.copy_to_host(&out.e_el, 0..1, &e_el, 0).unwrap();
        stream.copy_to_host(&out.fshift, 0..27, &fshift, 0).unwrap();
        stream.synchronize().unwrap();

        let slots = host_f.to_vec();
        let forces = layout
            .atom_slots()
            .iter()
            .map(|&s| slots[s as usize])
            .collect();
        Evaluated {
            forces,
            e_lj: e_lj.to_vec()[0],
            e_el: e_el.to_vec()[0],
            fshift: fshift.to_vec(),
            launched,
        }
    }

    fn rf_config() -> NonbondedConfig {
        NonbondedConfig::builder()
            .cutoffs(1.0, 1.0)
            .list_buffer(0.1)
            .electrostatics(ElectrostaticsModel::ReactionField)
            .build()
            .unwrap()
    }

    #[test]
    fn test_flavor_indices_are_distinct() {
        for (i, flavor) in KernelFlavor::ALL.iter().enumerate() {
            assert_eq!(flavor.index(), i);
        }
    }

    #[test]
    fn test_lj_pair_energy_and_newton_third_law() {
        let r = 0.4f32;
        let system = AtomSystem::new(
            vec![Float3::new(1.0, 1.0, 1.0), Float3::new(1.0 + r, 1.0, 1.0)],
            vec![0.0, 0.0],
            vec![0, 0],
        );
        let pair = LjPair::new(1e-3, 1e-6);
        let out = evaluate(&system, &rf_config(), LjParameters::geometric(&[pair]).unwrap());
        assert!(out.launched);

        let rinv6 = r.powi(-6);
        let expected = pair.c12 * rinv6 * rinv6 - pair.c6 * rinv6;
        assert_relative_eq!(out.e_lj, expected, max_relative = 1e-4);
        assert_eq!(out.e_el, 0.0);

        let fscal = (12.0 * pair.c12 * rinv6 * rinv6 - 6.0 * pair.c6 * rinv6) / (r * r);
        assert_relative_eq!(out.forces[0].x, -fscal * r, max_relative = 1e-4);
        assert_relative_eq!(out.forces[0].x, -out.forces[1].x, max_relative = 1e-6);
        assert_eq!(out.forces[0].y, 0.0);
    }

    #[test]
    fn test_reaction_field_energy() {
        let r = 0.5f32;
        let system = AtomSystem::new(
            vec![Float3::new(1.0, 1.0, 1.0), Float3::new(1.0, 1.0 + r, 1.0)],
            vec![1.0, -1.0],
            vec![0, 0],
        );
        let config = rf_config();
        let params = InteractionParams::from_config(&config, LjParameters::none()).unwrap();
        let out = evaluate(&system, &config, LjParameters::none());

        let expected = -params.epsfac * (1.0 / r + params.k_rf * r * r - params.c_rf);
        assert_relative_eq!(out.e_el, expected, max_relative = 1e-4);
        // opposite charges attract
        assert!(out.forces[0].y > 0.0);
        assert_relative_eq!(out.forces[0].y, -out.forces[1].y, max_relative = 1e-6);
    }

    #[test]
    fn test_pairs_beyond_cutoff_do_not_interact() {
        let system = AtomSystem::new(
            vec![Float3::new(0.0, 0.0, 0.0), Float3::new(1.05, 0.0, 0.0)],
            vec![1.0, 1.0],
            vec![0, 0],
        );
        // within rlist (1.1) but beyond rcoulomb (1.0)
        let out = evaluate(&system, &rf_config(), LjParameters::none());
        assert_eq!(out.e_el, 0.0);
        assert_eq!(out.forces, vec![Float3::ZERO; 2]);
    }

    #[test]
    fn test_periodic_image_force_lands_in_shift_slot() {
        let system = AtomSystem::new(
            vec![Float3::new(0.1, 1.5, 1.5), Float3::new(2.9, 1.5, 1.5)],
            vec![1.0, 1.0],
            vec![0, 0],
        )
        .with_box(Float3::splat(3.0));
        let out = evaluate(&system, &rf_config(), LjParameters::none());

        // like charges 0.2 nm apart across the box face push each other apart
        assert!(out.forces[0].x > 0.0);
        assert_relative_eq!(out.forces[0].x, -out.forces[1].x, max_relative = 1e-5);
        let total: Float3 = out
            .fshift
            .iter()
            .fold(Float3::ZERO, |acc, &f| acc + f);
        assert!(total.norm_sq() > 0.0);
        assert_eq!(out.fshift[crate::pairlist::CENTRAL_SHIFT], Float3::ZERO);
    }

    #[test]
    fn test_ewald_energy_matches_erfc() {
        let r = 0.6f32;
        let system = AtomSystem::new(
            vec![Float3::new(1.0, 1.0, 1.0), Float3::new(1.0, 1.0, 1.0 + r)],
            vec![0.5, 0.5],
            vec![0, 0],
        );
        let config = NonbondedConfig::builder()
            .cutoffs(1.0, 1.0)
            .list_buffer(0.1)
            .electrostatics(ElectrostaticsModel::Ewald)
            .build()
            .unwrap();
        let params = InteractionParams::from_config(&config, LjParameters::none()).unwrap();
        let out = evaluate(&system, &config, LjParameters::none());

        let beta = params.ewald_beta as f64;
        let v = statrs::function::erf::erfc(beta * r as f64) / r as f64 - params.ewald_shift as f64;
        let expected = 0.25 * params.epsfac as f64 * v;
        assert_relative_eq!(out.e_el as f64, expected, max_relative = 1e-3);
    }

    #[test]
    fn test_empty_list_is_not_dispatched() {
        let system = AtomSystem::new(
            vec![Float3::new(0.0, 0.0, 0.0), Float3::new(5.0, 0.0, 0.0)],
            vec![1.0, 1.0],
            vec![0, 0],
        );
        let config = rf_config();
        let ctx = DeviceContext::new(DeviceMemoryBudget::from_bytes(16 << 20));
        let stream = ctx.new_stream("nonlocal").unwrap();
        let layout = Arc::new(ClusterLayout::build(&system, 4).unwrap());
        let mut list = ClusterPairList::new(&ctx, InteractionLocality::NonLocal, 4);
        list.rebuild(&layout, &system, &config.cutoffs, &NoExclusions)
            .unwrap();
        assert!(list.is_empty());

        let mut atoms = DeviceAtomStore::new(&ctx, 0).unwrap();
        atoms.reserve(layout.n_slots(), layout.n_local_slots()).unwrap();
        let kernel: Arc<dyn NonbondedKernel> = Arc::new(ReferenceKernel);
        let params = Arc::new(InteractionParams::from_config(&config, LjParameters::none()).unwrap());
        let launched = dispatch(
            &stream,
            &kernel,
            KernelFlavor::default(),
            params,
            &layout,
            &atoms,
            &list,
        )
        .unwrap();
        assert!(!launched);
        assert!(stream.query());
    }

    #[test]
    fn test_list_shorter_than_parameters_is_stale() {
        let system = AtomSystem::new(
            vec![Float3::new(0.0, 0.0, 0.0), Float3::new(0.5, 0.0, 0.0)],
            vec![1.0, 1.0],
            vec![0, 0],
        );
        let config = rf_config();
        let ctx = DeviceContext::new(DeviceMemoryBudget::from_bytes(16 << 20));
        let stream = ctx.new_stream("local").unwrap();
        let layout = Arc::new(ClusterLayout::build(&system, 4).unwrap());
        let mut list = ClusterPairList::new(&ctx, InteractionLocality::Local, 4);
        list.rebuild(&layout, &system, &config.cutoffs, &NoExclusions)
            .unwrap();
        list.upload(&stream).unwrap();
        let mut atoms = DeviceAtomStore::new(&ctx, 0).unwrap();
        atoms.reserve(layout.n_slots(), layout.n_local_slots()).unwrap();

        let longer = NonbondedConfig::builder()
            .cutoffs(1.5, 1.5)
            .list_buffer(0.1)
            .electrostatics(ElectrostaticsModel::ReactionField)
            .build()
            .unwrap();
        let params = Arc::new(InteractionParams::from_config(&longer, LjParameters::none()).unwrap());
        let kernel: Arc<dyn NonbondedKernel> = Arc::new(ReferenceKernel);
        let err = dispatch(
            &stream,
            &kernel,
            KernelFlavor::default(),
            params,
            &layout,
            &atoms,
            &list,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            NbError::StaleList {
                locality: InteractionLocality::Local,
                ..
            }
        ));
        assert!(stream.query());
    }
}
