//! Interaction parameter table.
//!
//! [`InteractionParams`] bundles everything a force kernel reads besides the
//! atoms and the list: the electrostatics model and its constants, squared
//! cutoffs, the Lennard-Jones coefficient matrix and, for Ewald, a tabulated
//! long-range correction. A parameter set is immutable; [`ParameterTable`]
//! swaps whole snapshots, and a dispatched kernel keeps the snapshot it
//! captured.

use parking_lot::RwLock;
use prism_core::{
    CutoffConfig, ElectrostaticsModel, NbError, NonbondedConfig, Result, ONE_4PI_EPS0,
};
use statrs::function::erf::{erf, erfc};
use std::f64::consts::PI;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Lennard-Jones coefficients of one type pair: V = c12/r¹² - c6/r⁶.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LjPair {
    pub c6: f32,
    pub c12: f32,
}

impl LjPair {
    pub const fn new(c6: f32, c12: f32) -> Self {
        Self { c6, c12 }
    }

    /// From σ (nm) and ε (kJ/mol).
    pub fn from_sigma_epsilon(sigma: f32, epsilon: f32) -> Self {
        let s6 = sigma.powi(6);
        Self {
            c6: 4.0 * epsilon * s6,
            c12: 4.0 * epsilon * s6 * s6,
        }
    }
}

/// Dense type-pair coefficient matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct LjParameters {
    ntypes: usize,
    nbfp: Vec<LjPair>,
}

impl LjParameters {
    /// From a row-major `ntypes × ntypes` matrix.
    pub fn new(ntypes: usize, nbfp: Vec<LjPair>) -> Result<Self> {
        if ntypes == 0 {
            return Err(NbError::config("at least one atom type is required"));
        }
        if nbfp.len() != ntypes * ntypes {
            return Err(NbError::config(format!(
                "nbfp table has {} entries, expected {} for {} types",
                nbfp.len(),
                ntypes * ntypes,
                ntypes
            )));
        }
        for i in 0..ntypes {
            for j in 0..i {
                if nbfp[i * ntypes + j] != nbfp[j * ntypes + i] {
                    return Err(NbError::config(format!(
                        "nbfp table not symmetric for types {} and {}",
                        i, j
                    )));
                }
            }
        }
        Ok(Self { ntypes, nbfp })
    }

    /// Geometric-mean combination of per-type coefficients.
    pub fn geometric(per_type: &[LjPair]) -> Result<Self> {
        let n = per_type.len();
        let mut nbfp = Vec::with_capacity(n * n);
        for a in per_type {
            for b in per_type {
                nbfp.push(LjPair::new((a.c6 * b.c6).sqrt(), (a.c12 * b.c12).sqrt()));
            }
        }
        Self::new(n, nbfp)
    }

    /// Single type without dispersion (charges only).
    pub fn none() -> Self {
        Self {
            ntypes: 1,
            nbfp: vec![LjPair::default()],
        }
    }

    pub fn ntypes(&self) -> usize {
        self.ntypes
    }

    #[inline]
    pub fn pair(&self, ti: u32, tj: u32) -> LjPair {
        self.nbfp[ti as usize * self.ntypes + tj as usize]
    }

    pub fn as_slice(&self) -> &[LjPair] {
        &self.nbfp
    }
}

/// Tabulated Ewald correction, sampled every `1/scale` nm.
///
/// `energy[i]` holds erf(βr)/r and `force[i]` its `-dV/dr`; the kernel
/// subtracts both from the plain Coulomb `1/r` and `1/r²`.
#[derive(Debug, Clone, PartialEq)]
pub struct CoulombTable {
    pub scale: f32,
    pub force: Vec<f32>,
    pub energy: Vec<f32>,
}

impl CoulombTable {
    pub fn ewald(beta: f64, r_max: f32, scale: f32) -> Self {
        let n = (r_max * scale).ceil() as usize + 2;
        let two_beta_sqrt_pi = 2.0 * beta / PI.sqrt();
        let mut force = Vec::with_capacity(n);
        let mut energy = Vec::with_capacity(n);
        for i in 0..n {
            let r = i as f64 / scale as f64;
            if i == 0 {
                force.push(0.0);
                energy.push(two_beta_sqrt_pi as f32);
                continue;
            }
            let br = beta * r;
            let v = erf(br) / r;
            let f = erf(br) / (r * r) - two_beta_sqrt_pi * (-br * br).exp() / r;
            force.push(f as f32);
            energy.push(v as f32);
        }
        Self {
            scale,
            force,
            energy,
        }
    }

    pub fn len(&self) -> usize {
        self.force.len()
    }

    pub fn is_empty(&self) -> bool {
        self.force.is_empty()
    }

    /// Linearly interpolated `(force, energy)` correction at `r`.
    #[inline]
    pub fn interpolate(&self, r: f32) -> (f32, f32) {
        let x = r * self.scale;
        let i = (x as usize).min(self.force.len() - 2);
        let frac = x - i as f32;
        let lerp = |t: &[f32]| t[i] + frac * (t[i + 1] - t[i]);
        (lerp(&self.force), lerp(&self.energy))
    }
}

/// Ewald splitting coefficient β with erfc(β·rc) = rtol, found by bisection.
pub fn ewald_coefficient(rc: f64, rtol: f64) -> f64 {
    let mut beta = 5.0;
    while erfc(beta * rc) > rtol {
        beta *= 2.0;
    }
    let (mut low, mut high) = (0.0, beta);
    for _ in 0..60 {
        beta = 0.5 * (low + high);
        if erfc(beta * rc) > rtol {
            low = beta;
        } else {
            high = beta;
        }
    }
    beta
}

/// Immutable parameter snapshot read by the force kernels.
#[derive(Debug, Clone, PartialEq)]
pub struct InteractionParams {
    pub electrostatics: ElectrostaticsModel,
    /// Coulomb prefactor 1/(4πε₀ε_r)
    pub epsfac: f32,
    /// Reaction-field constants
    pub k_rf: f32,
    pub two_k_rf: f32,
    pub c_rf: f32,
    /// Ewald splitting coefficient (nm⁻¹)
    pub ewald_beta: f32,
    /// erfc(β·rc)/rc, shifting the Ewald potential to zero at the cutoff
    pub ewald_shift: f32,
    pub rvdw_sq: f32,
    pub rcoulomb_sq: f32,
    pub rlist_sq: f32,
    /// rvdw⁻⁶ when the LJ potential is shifted, else 0
    pub lj_shift: f32,
    pub lj: LjParameters,
    pub coulomb_table: Option<CoulombTable>,
    /// Radii the pair lists are built and pruned with under this snapshot
    pub cutoffs: CutoffConfig,
}

impl InteractionParams {
    /// Derive every kernel constant from the configuration.
    pub fn from_config(config: &NonbondedConfig, lj: LjParameters) -> Result<Self> {
        config.validate()?;
        let c = &config.cutoffs;
        let e = &config.electrostatics;
        let rc = c.rcoulomb;

        let epsfac = ONE_4PI_EPS0 / e.epsilon_r;
        let (k_rf, c_rf) = match e.model {
            ElectrostaticsModel::ReactionField => reaction_field(e.epsilon_r, e.epsilon_rf, rc),
            ElectrostaticsModel::Cutoff => reaction_field(e.epsilon_r, 1.0, rc),
            ElectrostaticsModel::Ewald => (0.0, 0.0),
        };

        let (ewald_beta, ewald_shift, coulomb_table) = match e.model {
            ElectrostaticsModel::Ewald => {
                let beta = ewald_coefficient(rc as f64, e.ewald_rtol);
                let shift = (erfc(beta * rc as f64) / rc as f64) as f32;
                let table = CoulombTable::ewald(beta, rc, e.table_scale);
                log::info!(
                    "Ewald coefficient {:.5} nm^-1 (rc {:.3} nm, rtol {:e}), correction table {} points",
                    beta,
                    rc,
                    e.ewald_rtol,
                    table.len()
                );
                (beta as f32, shift, Some(table))
            }
            _ => (0.0, 0.0, None),
        };

        let lj_shift = if config.vdw.potential_shift {
            c.rvdw.powi(-6)
        } else {
            0.0
        };

        let params = Self {
            electrostatics: e.model,
            epsfac,
            k_rf,
            two_k_rf: 2.0 * k_rf,
            c_rf,
            ewald_beta,
            ewald_shift,
            rvdw_sq: c.rvdw * c.rvdw,
            rcoulomb_sq: rc * rc,
            rlist_sq: c.rlist() * c.rlist(),
            lj_shift,
            lj,
            coulomb_table,
            cutoffs: *c,
        };
        params.validate()?;
        Ok(params)
    }

    /// Reject parameter sets a kernel cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !(self.rvdw_sq > 0.0) || !(self.rcoulomb_sq > 0.0) {
            return Err(NbError::config("cutoffs must be positive"));
        }
        if self.rlist_sq < self.rvdw_sq.max(self.rcoulomb_sq) {
            return Err(NbError::config("list cutoff is shorter than an interaction cutoff"));
        }
        let rlist = self.cutoffs.rlist();
        if (rlist * rlist - self.rlist_sq).abs() > 1e-5 * self.rlist_sq {
            return Err(NbError::config(format!(
                "list cutoffs give rlist {:.4} nm, kernel constants {:.4} nm",
                rlist,
                self.rlist_sq.sqrt()
            )));
        }
        match self.electrostatics {
            ElectrostaticsModel::ReactionField | ElectrostaticsModel::Cutoff => {
                if self.rvdw_sq != self.rcoulomb_sq {
                    return Err(NbError::config(format!(
                        "{} electrostatics requires rcoulomb == rvdw",
                        self.electrostatics
                    )));
                }
            }
            ElectrostaticsModel::Ewald => {
                let table = self.coulomb_table.as_ref().ok_or_else(|| {
                    NbError::config("Ewald electrostatics requires a correction table")
                })?;
                if !(table.scale > 0.0) || table.len() < 2 {
                    return Err(NbError::config("Ewald correction table is empty"));
                }
                let reach = (table.len() - 1) as f32 / table.scale;
                if reach * reach < self.rcoulomb_sq {
                    return Err(NbError::config("Ewald correction table shorter than rcoulomb"));
                }
            }
        }
        Ok(())
    }

    pub fn ntypes(&self) -> usize {
        self.lj.ntypes()
    }

    pub fn rcoulomb(&self) -> f32 {
        self.rcoulomb_sq.sqrt()
    }

    pub fn rvdw(&self) -> f32 {
        self.rvdw_sq.sqrt()
    }
}

/// `(k_rf, c_rf)` for dielectric `eps_r` inside and `eps_rf` beyond `rc`
/// (`eps_rf == 0` means a conducting continuum).
fn reaction_field(eps_r: f32, eps_rf: f32, rc: f32) -> (f32, f32) {
    let rc3 = rc * rc * rc;
    let k_rf = if eps_rf == 0.0 {
        1.0 / (2.0 * rc3)
    } else {
        (eps_rf - eps_r) / ((2.0 * eps_rf + eps_r) * rc3)
    };
    (k_rf, 1.0 / rc + k_rf * rc * rc)
}

/// Holder of the active parameter snapshot.
#[derive(Debug)]
pub struct ParameterTable {
    active: RwLock<Arc<InteractionParams>>,
    generation: AtomicU64,
}

impl ParameterTable {
    pub fn new(params: InteractionParams) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            active: RwLock::new(Arc::new(params)),
            generation: AtomicU64::new(1),
        })
    }

    /// Snapshot for a dispatch; stays valid whatever is replaced later.
    pub fn snapshot(&self) -> Arc<InteractionParams> {
        Arc::clone(&self.active.read())
    }

    /// Validate and install a new parameter set for subsequent dispatches.
    pub fn replace(&self, params: InteractionParams) -> Result<()> {
        params.validate()?;
        let mut active = self.active.write();
        log::info!(
            "Replacing interaction parameters: {} -> {} electrostatics, rcoulomb {:.3} nm",
            active.electrostatics,
            params.electrostatics,
            params.rcoulomb()
        );
        *active = Arc::new(params);
        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Number of snapshots installed so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn config(model: ElectrostaticsModel) -> NonbondedConfig {
        NonbondedConfig::builder()
            .electrostatics(model)
            .cutoffs(1.0, 1.0)
            .build()
            .unwrap()
    }

    #[test]
    fn test_ewald_coefficient_meets_tolerance() {
        let beta = ewald_coefficient(1.0, 1e-5);
        assert_relative_eq!(erfc(beta), 1e-5, max_relative = 1e-6);
        // Known value for rc = 1 nm, rtol = 1e-5
        assert_relative_eq!(beta, 3.123_413, epsilon = 1e-3);
    }

    #[test]
    fn test_reaction_field_constants() {
        let params =
            InteractionParams::from_config(&config(ElectrostaticsModel::ReactionField), LjParameters::none())
                .unwrap();
        // eps_rf = 0 (conducting): k_rf = 1/(2 rc^3), c_rf = 1/rc + k_rf rc^2
        assert_relative_eq!(params.k_rf, 0.5);
        assert_relative_eq!(params.two_k_rf, 1.0);
        assert_relative_eq!(params.c_rf, 1.5);
        assert!(params.coulomb_table.is_none());
    }

    #[test]
    fn test_plain_cutoff_is_reaction_field_with_unit_dielectric() {
        let params =
            InteractionParams::from_config(&config(ElectrostaticsModel::Cutoff), LjParameters::none())
                .unwrap();
        assert_relative_eq!(params.k_rf, 0.0);
        assert_relative_eq!(params.c_rf, 1.0);
    }

    #[test]
    fn test_ewald_table_matches_analytic() {
        let params =
            InteractionParams::from_config(&config(ElectrostaticsModel::Ewald), LjParameters::none())
                .unwrap();
        let table = params.coulomb_table.as_ref().unwrap();
        let beta = params.ewald_beta as f64;
        for &r in &[0.1f32, 0.37, 0.8, 0.99] {
            let (_, v) = table.interpolate(r);
            let expected = erf(beta * r as f64) / r as f64;
            assert_relative_eq!(v as f64, expected, max_relative = 1e-3);
        }
        let (f0, v0) = table.interpolate(0.0);
        assert_eq!(f0, 0.0);
        assert_relative_eq!(v0 as f64, 2.0 * beta / PI.sqrt(), max_relative = 1e-6);
    }

    #[test]
    fn test_lj_table_validation() {
        assert!(LjParameters::new(2, vec![LjPair::default(); 3]).is_err());
        let asym = vec![
            LjPair::new(1.0, 1.0),
            LjPair::new(2.0, 1.0),
            LjPair::new(3.0, 1.0),
            LjPair::new(1.0, 1.0),
        ];
        assert!(LjParameters::new(2, asym).is_err());

        let lj = LjParameters::geometric(&[LjPair::new(4.0, 1.0), LjPair::new(1.0, 9.0)]).unwrap();
        assert_eq!(lj.pair(0, 1), LjPair::new(2.0, 3.0));
        assert_eq!(lj.pair(1, 0), lj.pair(0, 1));
    }

    #[test]
    fn test_snapshot_survives_replace() {
        let table = ParameterTable::new(
            InteractionParams::from_config(&config(ElectrostaticsModel::Cutoff), LjParameters::none())
                .unwrap(),
        )
        .unwrap();
        let before = table.snapshot();

        let wider = NonbondedConfig::builder()
            .electrostatics(ElectrostaticsModel::Cutoff)
            .cutoffs(1.2, 1.2)
            .build()
            .unwrap();
        table
            .replace(InteractionParams::from_config(&wider, LjParameters::none()).unwrap())
            .unwrap();

        assert_relative_eq!(before.rcoulomb(), 1.0);
        assert_relative_eq!(table.snapshot().rcoulomb(), 1.2, epsilon = 1e-6);
        assert_eq!(table.snapshot().cutoffs, wider.cutoffs);
        assert_relative_eq!(before.cutoffs.rvdw, 1.0);
        assert_eq!(table.generation(), 2);
    }

    #[test]
    fn test_replace_rejects_invalid() {
        let params =
            InteractionParams::from_config(&config(ElectrostaticsModel::Cutoff), LjParameters::none())
                .unwrap();
        let table = ParameterTable::new(params.clone()).unwrap();
        let mut bad = params.clone();
        bad.rvdw_sq = 0.81;
        assert!(table.replace(bad).is_err());

        // list radii must agree with the kernel's list cutoff
        let mut bad = params;
        bad.cutoffs.list_buffer += 0.3;
        assert!(table.replace(bad).is_err());
        assert_eq!(table.generation(), 1);
    }
}
