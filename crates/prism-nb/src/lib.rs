//! # prism-nb
//!
//! Accelerator offload of short-range non-bonded forces.
//!
//! Atoms are packed into fixed-size clusters, cluster pairs within a buffered
//! cutoff are stored as packed quads in one pair list per interaction
//! locality, and a force kernel per locality runs on its own stream so the
//! local work overlaps the non-local coordinate exchange.

// Emulated device: buffers, in-order streams, cross-stream events
pub mod device;
pub mod memory;

// Device-resident state
pub mod atoms;
pub mod params;

// Clustered pair lists: layout, search, prune, exclusion masks
pub mod pairlist;

// Force evaluation and result handling
pub mod kernel;
pub mod staging;
pub mod timing;

// Per-step orchestration over the local and non-local streams
pub mod pipeline;

// Collaborator interfaces: atom system, exclusions, step results
pub mod system;

pub use atoms::{DeviceAtomStore, OutputBuffers};
pub use device::{DeviceBuffer, DeviceContext, Event, HostBuffer, Stream};
pub use kernel::{KernelFlavor, KernelInputs, KernelOutputs, NonbondedKernel, ReferenceKernel};
pub use memory::{DeviceMemoryBudget, MemoryLedger};
pub use pairlist::{ClusterLayout, ClusterPairList, PackedQuad, PruneStats, Supercluster};
pub use params::{CoulombTable, InteractionParams, LjPair, LjParameters, ParameterTable};
pub use pipeline::{ListCadence, NonbondedPipeline, PipelineState, PipelineStats};
pub use staging::EnergyStaging;
pub use system::{AtomSystem, ExclusionLists, ExclusionProvider, NoExclusions, StepResults};
pub use timing::{GpuTimers, PhaseTiming, TimingPhase, TimingSummary};

pub use prism_core::{
    ElectrostaticsModel, EnergyTotals, Float3, Float4, InteractionLocality, NbError,
    NonbondedConfig, Result,
};
