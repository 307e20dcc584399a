//! # prism-core
//!
//! Core types, configuration and errors for the PRISM non-bonded offload pipeline.
//!
//! - **Types**: device vector types, interaction localities, energy totals
//! - **Config**: TOML-backed `NonbondedConfig` with validation
//! - **Errors**: unified error handling with `NbError`
//!
//! ```text
//! ┌─────────────────┐
//! │  prism-core     │  ← types / config / errors
//! └─────────────────┘
//!         ▲
//!         │
//! ┌───────┴─────────┐
//! │  prism-nb       │  ← device, pair lists, two-stream pipeline
//! └─────────────────┘
//! ```

pub mod config;
pub mod errors;
pub mod types;

pub use config::{
    CadenceConfig, CutoffConfig, DeviceConfig, ElectrostaticsConfig, NonbondedConfig,
    NonbondedConfigBuilder, TimingConfig, VdwConfig, WaitPolicy, SUPPORTED_CLUSTER_SIZES,
};
pub use errors::{NbError, Result};
pub use types::{
    AtomLocality, ElectrostaticsModel, EnergyTotals, Float3, Float4, InteractionLocality,
    PerLocality, ONE_4PI_EPS0,
};
