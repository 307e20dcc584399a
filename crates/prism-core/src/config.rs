//! Non-bonded pipeline configuration and validation.
//!
//! Loaded from TOML; every section is optional and falls back to the defaults
//! below. `validate()` rejects contradictory settings before any step runs.

use crate::errors::{NbError, Result};
use crate::types::ElectrostaticsModel;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Cluster sizes the packed exclusion masks can represent (na_c × na_c ≤ 64 bits).
pub const SUPPORTED_CLUSTER_SIZES: [usize; 2] = [4, 8];

/// How the controlling thread waits for the end of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitPolicy {
    /// Block on the completion event.
    #[default]
    Blocking,
    /// Poll the completion event, yielding between polls.
    Polling,
}

/// Top-level configuration of the non-bonded offload pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NonbondedConfig {
    /// Atoms per cluster (4 or 8)
    #[serde(default = "default_cluster_size")]
    pub cluster_size: usize,

    #[serde(default)]
    pub cutoffs: CutoffConfig,

    #[serde(default)]
    pub electrostatics: ElectrostaticsConfig,

    #[serde(default)]
    pub vdw: VdwConfig,

    #[serde(default)]
    pub cadence: CadenceConfig,

    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub timing: TimingConfig,
}

/// Interaction and list radii (nm).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CutoffConfig {
    #[serde(default = "default_cutoff")]
    pub rvdw: f32,

    #[serde(default = "default_cutoff")]
    pub rcoulomb: f32,

    /// Margin added to the interaction cutoff when the list is searched.
    #[serde(default = "default_list_buffer")]
    pub list_buffer: f32,

    /// Margin kept when a list is pruned (0 prunes to the interaction cutoff).
    #[serde(default)]
    pub prune_buffer: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ElectrostaticsConfig {
    #[serde(default = "default_model")]
    pub model: ElectrostaticsModel,

    /// Relative dielectric constant
    #[serde(default = "default_one")]
    pub epsilon_r: f32,

    /// Reaction-field dielectric; 0 means infinity
    #[serde(default)]
    pub epsilon_rf: f32,

    /// Relative strength of the Ewald direct-space potential at the cutoff
    #[serde(default = "default_ewald_rtol")]
    pub ewald_rtol: f64,

    /// Correction table points per nm
    #[serde(default = "default_table_scale")]
    pub table_scale: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct VdwConfig {
    /// Shift the LJ potential to zero at the cutoff
    #[serde(default)]
    pub potential_shift: bool,
}

/// Pair-list rebuild and prune cadence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CadenceConfig {
    /// Steps between full rebuilds
    #[serde(default = "default_rebuild_interval")]
    pub rebuild_interval: u32,

    /// Steps after a rebuild before the list is pruned
    #[serde(default = "default_prune_delay")]
    pub prune_delay: u32,

    /// Check atom displacement against the list buffer before each dispatch
    #[serde(default)]
    pub verify_list_displacement: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device memory available to this pipeline
    #[serde(default = "default_memory_budget")]
    pub memory_budget_bytes: usize,

    #[serde(default)]
    pub wait_policy: WaitPolicy,

    /// Atom capacity allocated up front (0 sizes on the first step)
    #[serde(default)]
    pub initial_atom_capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Event-based phase timing (ignored while decomposition is active)
    #[serde(default)]
    pub enabled: bool,
}

fn default_cluster_size() -> usize {
    8
}

fn default_cutoff() -> f32 {
    1.0
}

fn default_list_buffer() -> f32 {
    0.1
}

fn default_model() -> ElectrostaticsModel {
    ElectrostaticsModel::Ewald
}

fn default_one() -> f32 {
    1.0
}

fn default_ewald_rtol() -> f64 {
    1e-5
}

fn default_table_scale() -> f32 {
    500.0
}

fn default_rebuild_interval() -> u32 {
    10
}

fn default_prune_delay() -> u32 {
    1
}

fn default_memory_budget() -> usize {
    1 << 30 // 1 GiB
}

impl Default for CutoffConfig {
    fn default() -> Self {
        Self {
            rvdw: default_cutoff(),
            rcoulomb: default_cutoff(),
            list_buffer: default_list_buffer(),
            prune_buffer: 0.0,
        }
    }
}

impl CutoffConfig {
    /// Largest interaction cutoff.
    pub fn interaction_cutoff(&self) -> f32 {
        self.rvdw.max(self.rcoulomb)
    }

    /// Effective cutoff the list is searched with.
    pub fn rlist(&self) -> f32 {
        self.interaction_cutoff() + self.list_buffer
    }

    /// Cutoff a list is pruned down to.
    pub fn prune_cutoff(&self) -> f32 {
        self.interaction_cutoff() + self.prune_buffer
    }
}

impl Default for ElectrostaticsConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            epsilon_r: default_one(),
            epsilon_rf: 0.0,
            ewald_rtol: default_ewald_rtol(),
            table_scale: default_table_scale(),
        }
    }
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            rebuild_interval: default_rebuild_interval(),
            prune_delay: default_prune_delay(),
            verify_list_displacement: false,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            memory_budget_bytes: default_memory_budget(),
            wait_policy: WaitPolicy::Blocking,
            initial_atom_capacity: 0,
        }
    }
}

impl Default for NonbondedConfig {
    fn default() -> Self {
        Self {
            cluster_size: default_cluster_size(),
            cutoffs: CutoffConfig::default(),
            electrostatics: ElectrostaticsConfig::default(),
            vdw: VdwConfig::default(),
            cadence: CadenceConfig::default(),
            device: DeviceConfig::default(),
            timing: TimingConfig::default(),
        }
    }
}

impl NonbondedConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> NonbondedConfigBuilder {
        NonbondedConfigBuilder::default()
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_str(&content)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Validates the configuration.
    ///
    /// Returns an error if any constraint is violated.
    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_CLUSTER_SIZES.contains(&self.cluster_size) {
            return Err(NbError::config(format!(
                "cluster_size {} unsupported (expected one of {:?})",
                self.cluster_size, SUPPORTED_CLUSTER_SIZES
            )));
        }

        let c = &self.cutoffs;
        if !(c.rvdw > 0.0) || !(c.rcoulomb > 0.0) {
            return Err(NbError::config(format!(
                "cutoffs must be positive (rvdw = {}, rcoulomb = {})",
                c.rvdw, c.rcoulomb
            )));
        }
        if !(c.list_buffer >= 0.0) || !(c.prune_buffer >= 0.0) {
            return Err(NbError::config("list and prune buffers must be non-negative"));
        }
        if c.prune_buffer > c.list_buffer {
            return Err(NbError::config(format!(
                "prune_buffer ({}) exceeds list_buffer ({})",
                c.prune_buffer, c.list_buffer
            )));
        }

        let e = &self.electrostatics;
        match e.model {
            ElectrostaticsModel::ReactionField | ElectrostaticsModel::Cutoff => {
                if c.rcoulomb != c.rvdw {
                    return Err(NbError::config(format!(
                        "{} electrostatics requires rcoulomb == rvdw ({} != {})",
                        e.model, c.rcoulomb, c.rvdw
                    )));
                }
            }
            ElectrostaticsModel::Ewald => {
                if c.rcoulomb < c.rvdw {
                    return Err(NbError::config(format!(
                        "Ewald requires rcoulomb >= rvdw ({} < {})",
                        c.rcoulomb, c.rvdw
                    )));
                }
                if !(e.ewald_rtol > 0.0 && e.ewald_rtol < 1.0) {
                    return Err(NbError::config(format!(
                        "ewald_rtol {} must lie in (0, 1)",
                        e.ewald_rtol
                    )));
                }
                if !(e.table_scale > 0.0) {
                    return Err(NbError::config("table_scale must be positive"));
                }
            }
        }
        if !(e.epsilon_r > 0.0) {
            return Err(NbError::config("epsilon_r must be positive"));
        }
        if e.epsilon_rf != 0.0 && e.epsilon_rf < 1.0 {
            return Err(NbError::config(format!(
                "epsilon_rf {} must be 0 (infinity) or >= 1",
                e.epsilon_rf
            )));
        }

        if self.cadence.rebuild_interval == 0 {
            return Err(NbError::config("rebuild_interval must be greater than 0"));
        }
        if self.cadence.prune_delay == 0 {
            return Err(NbError::config("prune_delay must be greater than 0"));
        }
        if self.cadence.prune_delay >= self.cadence.rebuild_interval && c.list_buffer > 0.0 {
            log::warn!(
                "prune_delay {} >= rebuild_interval {}: lists will never be pruned",
                self.cadence.prune_delay,
                self.cadence.rebuild_interval
            );
        }

        if self.device.memory_budget_bytes == 0 {
            return Err(NbError::config("memory_budget_bytes must be greater than 0"));
        }

        Ok(())
    }
}

/// Builder for [`NonbondedConfig`].
#[derive(Debug, Default)]
pub struct NonbondedConfigBuilder {
    config: NonbondedConfig,
}

impl NonbondedConfigBuilder {
    pub fn cluster_size(mut self, size: usize) -> Self {
        self.config.cluster_size = size;
        self
    }

    pub fn cutoffs(mut self, rvdw: f32, rcoulomb: f32) -> Self {
        self.config.cutoffs.rvdw = rvdw;
        self.config.cutoffs.rcoulomb = rcoulomb;
        self
    }

    pub fn list_buffer(mut self, buffer: f32) -> Self {
        self.config.cutoffs.list_buffer = buffer;
        self
    }

    pub fn prune_buffer(mut self, buffer: f32) -> Self {
        self.config.cutoffs.prune_buffer = buffer;
        self
    }

    pub fn electrostatics(mut self, model: ElectrostaticsModel) -> Self {
        self.config.electrostatics.model = model;
        self
    }

    pub fn epsilon_rf(mut self, epsilon_rf: f32) -> Self {
        self.config.electrostatics.epsilon_rf = epsilon_rf;
        self
    }

    pub fn rebuild_interval(mut self, steps: u32) -> Self {
        self.config.cadence.rebuild_interval = steps;
        self
    }

    pub fn prune_delay(mut self, steps: u32) -> Self {
        self.config.cadence.prune_delay = steps;
        self
    }

    pub fn verify_list_displacement(mut self, enabled: bool) -> Self {
        self.config.cadence.verify_list_displacement = enabled;
        self
    }

    pub fn memory_budget_bytes(mut self, bytes: usize) -> Self {
        self.config.device.memory_budget_bytes = bytes;
        self
    }

    pub fn wait_policy(mut self, policy: WaitPolicy) -> Self {
        self.config.device.wait_policy = policy;
        self
    }

    pub fn timing(mut self, enabled: bool) -> Self {
        self.config.timing.enabled = enabled;
        self
    }

    pub fn potential_shift(mut self, enabled: bool) -> Self {
        self.config.vdw.potential_shift = enabled;
        self
    }

    /// Validates and returns the configuration.
    pub fn build(self) -> Result<NonbondedConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = NonbondedConfig::default();
        config.validate().unwrap();
        assert_eq!(config.cluster_size, 8);
        assert!((config.cutoffs.rlist() - 1.1).abs() < 1e-6);
        assert!((config.cutoffs.prune_cutoff() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = NonbondedConfig::from_str(
            r#"
            cluster_size = 4

            [cutoffs]
            rvdw = 0.9
            rcoulomb = 0.9

            [electrostatics]
            model = "reaction_field"
            epsilon_rf = 78.0
            "#,
        )
        .unwrap();

        config.validate().unwrap();
        assert_eq!(config.cluster_size, 4);
        assert_eq!(config.electrostatics.model, ElectrostaticsModel::ReactionField);
        assert_eq!(config.cadence.rebuild_interval, 10);
        assert_eq!(config.device.wait_policy, WaitPolicy::Blocking);
    }

    #[test]
    fn test_rejects_unsupported_cluster_size() {
        let err = NonbondedConfig::builder().cluster_size(6).build().unwrap_err();
        assert!(matches!(err, NbError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_rejects_mismatched_reaction_field_cutoffs() {
        let err = NonbondedConfig::builder()
            .electrostatics(ElectrostaticsModel::ReactionField)
            .cutoffs(1.0, 1.2)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("rcoulomb == rvdw"));
    }

    #[test]
    fn test_rejects_prune_buffer_larger_than_list_buffer() {
        let err = NonbondedConfig::builder()
            .list_buffer(0.05)
            .prune_buffer(0.1)
            .build()
            .unwrap_err();
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_rejects_zero_rebuild_interval() {
        assert!(NonbondedConfig::builder().rebuild_interval(0).build().is_err());
    }

    #[test]
    fn test_unknown_model_is_parse_error() {
        let err = NonbondedConfig::from_str("[electrostatics]\nmodel = \"pme-gpu\"\n").unwrap_err();
        assert!(matches!(err, NbError::ConfigParse(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[cadence]\nrebuild_interval = 20\nprune_delay = 2").unwrap();

        let config = NonbondedConfig::from_file(file.path()).unwrap();
        assert_eq!(config.cadence.rebuild_interval, 20);
        assert_eq!(config.cadence.prune_delay, 2);
    }

    #[test]
    fn test_shipped_default_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("configs/default.toml");
        let config = NonbondedConfig::from_file(&path).expect("load default config");
        config.validate().unwrap();
        assert_eq!(config.electrostatics.model, ElectrostaticsModel::Ewald);
        assert!((config.cutoffs.list_buffer - 0.1).abs() < f32::EPSILON);
    }
}
