//! Two-stream execution pipeline.
//!
//! ```text
//!  local stream                            non-local stream
//!  ────────────                            ────────────────
//!  atom types / shift vectors (new epoch)
//!  clear outputs
//!  H2D local x,q
//!  record aux_ops_done ──────────────────► wait aux_ops_done
//!  H2D local list (rebuilt / pruned)       H2D non-local x,q
//!  local kernel                            H2D non-local list
//!  D2H local energies                      non-local kernel
//!                                          D2H non-local energies
//!  wait nonlocal_done ◄─────────────────── record nonlocal_done
//!  reduce non-local forces
//!  D2H forces
//!  record aux_ops_done ──► host wait_step
//! ```
//!
//! Each partition walks `Idle → AtomsUploaded → (ListRebuilt | ListPruned) →
//! ParametersBound → KernelDispatched → ResultsDownloaded → Idle` once per
//! step; reallocation only happens while both partitions are `Idle`.

use crate::atoms::DeviceAtomStore;
use crate::device::{DeviceContext, Event, HostBuffer, Stream};
use crate::kernel::{self, KernelFlavor, NonbondedKernel, ReferenceKernel};
use crate::memory::DeviceMemoryBudget;
use crate::pairlist::{ClusterLayout, ClusterPairList, NUM_SHIFTS};
use crate::params::{InteractionParams, LjParameters, ParameterTable};
use crate::staging::EnergyStaging;
use crate::system::{AtomSystem, ExclusionProvider, StepResults};
use crate::timing::{GpuTimers, HostPhase, TimingPhase, TimingSummary};
use prism_core::{
    AtomLocality, CutoffConfig, ElectrostaticsModel, EnergyTotals, Float3, InteractionLocality,
    NbError, NonbondedConfig, PerLocality, Result, WaitPolicy,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Per-partition position in the step sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineState {
    #[default]
    Idle,
    AtomsUploaded,
    ListRebuilt,
    ListPruned,
    ParametersBound,
    KernelDispatched,
    ResultsDownloaded,
}

impl PipelineState {
    pub fn name(self) -> &'static str {
        match self {
            PipelineState::Idle => "Idle",
            PipelineState::AtomsUploaded => "AtomsUploaded",
            PipelineState::ListRebuilt => "ListRebuilt",
            PipelineState::ListPruned => "ListPruned",
            PipelineState::ParametersBound => "ParametersBound",
            PipelineState::KernelDispatched => "KernelDispatched",
            PipelineState::ResultsDownloaded => "ResultsDownloaded",
        }
    }

    /// Whether `next` may follow `self`. A reused list goes straight from
    /// `AtomsUploaded` to `ParametersBound`.
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Idle, AtomsUploaded)
                | (AtomsUploaded, ListRebuilt)
                | (AtomsUploaded, ListPruned)
                | (AtomsUploaded, ParametersBound)
                | (ListRebuilt, ParametersBound)
                | (ListPruned, ParametersBound)
                | (ParametersBound, KernelDispatched)
                | (KernelDispatched, ResultsDownloaded)
                | (ResultsDownloaded, Idle)
        )
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn advance(
    states: &mut PerLocality<PipelineState>,
    locality: InteractionLocality,
    next: PipelineState,
) -> Result<()> {
    let current = states[locality];
    if !current.can_transition_to(next) {
        return Err(NbError::transition(locality, current.name(), next.name()));
    }
    log::trace!("{} partition: {} -> {}", locality, current, next);
    states[locality] = next;
    Ok(())
}

/// When pair lists are rebuilt and pruned, in steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListCadence {
    /// Steps a list is used before a full rebuild
    pub rebuild_interval: u32,
    /// Steps after a rebuild before the list is pruned
    pub prune_delay: u32,
}

impl ListCadence {
    pub fn new(rebuild_interval: u32, prune_delay: u32) -> Result<Self> {
        if rebuild_interval == 0 || prune_delay == 0 {
            return Err(NbError::config(format!(
                "rebuild_interval ({}) and prune_delay ({}) must be positive",
                rebuild_interval, prune_delay
            )));
        }
        Ok(Self {
            rebuild_interval,
            prune_delay,
        })
    }

    pub fn from_config(config: &NonbondedConfig) -> Result<Self> {
        Self::new(config.cadence.rebuild_interval, config.cadence.prune_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListAction {
    Rebuild,
    Prune,
    Reuse,
}

/// Pipeline counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub steps: u64,
    pub list_rebuilds: u64,
    pub list_prunes: u64,
    pub kernel_launches: u64,
    /// Dispatches skipped because the partition's list was empty
    pub empty_dispatches: u64,
    pub atom_store_reallocations: u64,
    pub shift_vector_uploads: u64,
}

#[derive(Debug, Clone, Copy)]
struct InFlightStep {
    step: u64,
    compute_energy: bool,
}

/// Non-bonded force offload over a local and a non-local stream.
pub struct NonbondedPipeline {
    config: NonbondedConfig,
    ctx: DeviceContext,
    streams: PerLocality<Stream>,
    /// Non-local work done; the local stream waits on it before reducing
    nonlocal_done: Event,
    /// Outputs cleared and local coordinates uploaded, then again at step end
    aux_ops_done: Event,
    atoms: DeviceAtomStore,
    params: ParameterTable,
    lj: LjParameters,
    lists: PerLocality<ClusterPairList>,
    layout: Option<Arc<ClusterLayout>>,
    /// Radii the current lists were built with
    list_cutoffs: Option<CutoffConfig>,
    exclusions: Arc<dyn ExclusionProvider>,
    kernel: Arc<dyn NonbondedKernel>,
    states: PerLocality<PipelineState>,
    cadence: ListCadence,
    rebuild_requested: bool,
    pruned_since_rebuild: bool,
    /// Steps completed on the current lists
    list_age: u32,
    step: u64,
    staging: EnergyStaging,
    timers: GpuTimers,
    forces_host: HostBuffer<Float3>,
    in_flight: Option<InFlightStep>,
    stats: PipelineStats,
}

impl NonbondedPipeline {
    /// Pipeline on an emulated device with the configured memory budget.
    pub fn new(
        config: NonbondedConfig,
        lj: LjParameters,
        exclusions: Arc<dyn ExclusionProvider>,
    ) -> Result<Self> {
        config.validate()?;
        let budget = DeviceMemoryBudget::from_bytes(config.device.memory_budget_bytes);
        Self::with_budget(config, lj, exclusions, budget)
    }

    /// Pipeline whose budget is the smaller of the configured one and the
    /// free memory of CUDA device `ordinal`.
    #[cfg(feature = "cuda")]
    pub fn on_cuda_device(
        config: NonbondedConfig,
        lj: LjParameters,
        exclusions: Arc<dyn ExclusionProvider>,
        ordinal: usize,
    ) -> Result<Self> {
        config.validate()?;
        let device = DeviceMemoryBudget::query_cuda(ordinal)?;
        let bytes = device
            .safe_limit_bytes
            .min(config.device.memory_budget_bytes);
        Self::with_budget(config, lj, exclusions, DeviceMemoryBudget::from_bytes(bytes))
    }

    pub fn with_budget(
        config: NonbondedConfig,
        lj: LjParameters,
        exclusions: Arc<dyn ExclusionProvider>,
        budget: DeviceMemoryBudget,
    ) -> Result<Self> {
        config.validate()?;
        let cadence = ListCadence::from_config(&config)?;
        let params = ParameterTable::new(InteractionParams::from_config(&config, lj.clone())?)?;

        let ctx = DeviceContext::new(budget);
        let streams = PerLocality::new(ctx.new_stream("local")?, ctx.new_stream("nonlocal")?);
        let atoms = DeviceAtomStore::new(&ctx, config.device.initial_atom_capacity)?;
        let lists = PerLocality::from_fn(|loc| ClusterPairList::new(&ctx, loc, config.cluster_size));
        let timers = GpuTimers::new(config.timing.enabled);

        log::info!(
            "Non-bonded pipeline ready: cluster size {}, {} electrostatics, rlist {:.3} nm, rebuild every {} steps",
            config.cluster_size,
            config.electrostatics.model,
            config.cutoffs.rlist(),
            cadence.rebuild_interval
        );

        Ok(Self {
            config,
            ctx,
            streams,
            nonlocal_done: Event::new("nonlocal_done"),
            aux_ops_done: Event::new("aux_ops_done"),
            atoms,
            params,
            lj,
            lists,
            layout: None,
            list_cutoffs: None,
            exclusions,
            kernel: Arc::new(ReferenceKernel),
            states: PerLocality::default(),
            cadence,
            rebuild_requested: true,
            pruned_since_rebuild: false,
            list_age: 0,
            step: 0,
            staging: EnergyStaging::new(),
            timers,
            forces_host: HostBuffer::new(0),
            in_flight: None,
            stats: PipelineStats::default(),
        })
    }

    /// Replace the force kernel used by later steps.
    pub fn with_kernel(mut self, kernel: Arc<dyn NonbondedKernel>) -> Self {
        log::info!("Using non-bonded kernel '{}'", kernel.name());
        self.kernel = kernel;
        self
    }

    /// Issue one step for `system` on both streams and return immediately.
    ///
    /// The host may do other work until [`wait_step`](Self::wait_step).
    pub fn launch_step(&mut self, system: &AtomSystem, compute_energy: bool) -> Result<()> {
        if self.in_flight.is_some() {
            return Err(NbError::transition(
                InteractionLocality::Local,
                self.states.local.name(),
                PipelineState::AtomsUploaded.name(),
            ));
        }
        for (loc, state) in self.states.iter() {
            if *state != PipelineState::Idle {
                return Err(NbError::transition(
                    loc,
                    state.name(),
                    PipelineState::AtomsUploaded.name(),
                ));
            }
        }

        let params = self.params.snapshot();
        system.validate(params.ntypes())?;
        system.validate_box(params.cutoffs.rlist())?;
        self.timers.set_decomposition(system.decomposition_active);
        let actions = self.plan_list_actions(system, &params.cutoffs)?;

        let step = self.step;
        match self.issue_step(system, compute_energy, actions, params, step) {
            Ok(()) => {
                self.in_flight = Some(InFlightStep {
                    step,
                    compute_energy,
                });
                Ok(())
            }
            Err(err) => {
                log::error!("Non-bonded step {} aborted while issuing: {}", step, err);
                self.abort_step();
                Err(err)
            }
        }
    }

    /// Block until the launched step completes and collect its results.
    pub fn wait_step(&mut self) -> Result<StepResults> {
        let Some(flight) = self.in_flight.take() else {
            return Err(NbError::transition(
                InteractionLocality::Local,
                self.states.local.name(),
                PipelineState::ResultsDownloaded.name(),
            ));
        };

        match self.config.device.wait_policy {
            WaitPolicy::Blocking => self.aux_ops_done.synchronize(),
            WaitPolicy::Polling => self.aux_ops_done.synchronize_polling(),
        }
        for loc in InteractionLocality::ALL {
            if let Err(err) = self.streams[loc].check_error() {
                log::error!("Non-bonded step {} failed: {}", flight.step, err);
                self.abort_step();
                return Err(err);
            }
        }

        let mut totals = EnergyTotals::default();
        for loc in InteractionLocality::ALL {
            advance(&mut self.states, loc, PipelineState::ResultsDownloaded)?;
            if flight.compute_energy {
                self.staging.fold_into(loc, &mut totals);
            }
            advance(&mut self.states, loc, PipelineState::Idle)?;
        }

        let forces = match &self.layout {
            Some(layout) => {
                let slots = self.forces_host.lock();
                layout
                    .atom_slots()
                    .iter()
                    .map(|&s| slots.get(s as usize).copied().unwrap_or(Float3::ZERO))
                    .collect()
            }
            None => Vec::new(),
        };
        let shift_forces = if flight.compute_energy {
            self.staging.shift_forces()
        } else {
            vec![Float3::ZERO; NUM_SHIFTS]
        };

        self.timers.collect();
        self.stats.steps += 1;
        self.step += 1;
        self.list_age = self.list_age.saturating_add(1);

        Ok(StepResults {
            forces,
            energy_lj: totals.lj,
            energy_el: totals.electrostatic,
            shift_forces,
        })
    }

    /// [`launch_step`](Self::launch_step) followed by [`wait_step`](Self::wait_step).
    pub fn run_step(&mut self, system: &AtomSystem, compute_energy: bool) -> Result<StepResults> {
        self.launch_step(system, compute_energy)?;
        self.wait_step()
    }

    fn plan_list_actions(
        &self,
        system: &AtomSystem,
        cutoffs: &CutoffConfig,
    ) -> Result<PerLocality<ListAction>> {
        if let Some(built) = &self.list_cutoffs {
            if built != cutoffs {
                log::info!(
                    "List cutoffs changed (rlist {:.3} -> {:.3} nm), rebuilding pair lists",
                    built.rlist(),
                    cutoffs.rlist()
                );
                return Ok(PerLocality::new(ListAction::Rebuild, ListAction::Rebuild));
            }
        }
        let layout = match &self.layout {
            Some(layout)
                if !self.rebuild_requested
                    && self.list_age < self.cadence.rebuild_interval
                    && layout.matches(system) =>
            {
                layout
            }
            _ => return Ok(PerLocality::new(ListAction::Rebuild, ListAction::Rebuild)),
        };

        if self.config.cadence.verify_list_displacement {
            let buffer = if self.pruned_since_rebuild {
                cutoffs.prune_buffer
            } else {
                cutoffs.list_buffer
            };
            let displacement = layout.max_displacement(&system.positions);
            if 2.0 * displacement > buffer {
                return Err(NbError::stale_list(
                    InteractionLocality::Local,
                    format!(
                        "atoms moved up to {:.4} nm since the last rebuild, more than half the {:.4} nm buffer",
                        displacement, buffer
                    ),
                ));
            }
        }

        let prune_due = self.list_age >= self.cadence.prune_delay;
        Ok(PerLocality::from_fn(|loc| {
            if prune_due && self.lists[loc].is_prune_needed() {
                ListAction::Prune
            } else {
                ListAction::Reuse
            }
        }))
    }

    /// Host-side list work, then every device command of the step.
    fn issue_step(
        &mut self,
        system: &AtomSystem,
        compute_energy: bool,
        actions: PerLocality<ListAction>,
        params: Arc<InteractionParams>,
        step: u64,
    ) -> Result<()> {
        let rebuild = actions.local == ListAction::Rebuild;
        if rebuild {
            self.rebuild_lists(system, &params.cutoffs)?;
        }
        let layout = match &self.layout {
            Some(layout) => Arc::clone(layout),
            None => return Err(NbError::config("no cluster layout was built")),
        };
        if actions.iter().any(|(_, &a)| a == ListAction::Prune) {
            let started = Instant::now();
            for loc in InteractionLocality::ALL {
                if actions[loc] == ListAction::Prune {
                    self.lists[loc].prune(&layout, system, params.cutoffs.prune_cutoff());
                }
            }
            self.timers
                .record_host(HostPhase::ListPrune, started.elapsed().as_secs_f64() * 1e3);
            self.pruned_since_rebuild = true;
            self.stats.list_prunes += 1;
        }

        let local = InteractionLocality::Local;
        let non_local = InteractionLocality::NonLocal;

        // Local stream: per-epoch atom data, cleared outputs, local coordinates.
        let stream = &self.streams.local;
        if rebuild || !self.atoms.shift_vectors_uploaded() {
            self.timers
                .begin_phase(stream, local, TimingPhase::AtomDataTransfer)?;
            if rebuild {
                self.atoms.upload_atom_types(stream, &layout, system)?;
            }
            if self
                .atoms
                .upload_shift_vectors(stream, layout.shift_vectors())?
            {
                self.stats.shift_vector_uploads += 1;
            }
            self.timers
                .end_phase(stream, local, TimingPhase::AtomDataTransfer)?;
        }
        self.atoms.clear_outputs(stream)?;
        self.timers
            .begin_phase(stream, local, TimingPhase::CoordinateUpload)?;
        self.atoms
            .upload_coordinates(stream, AtomLocality::Local, &layout, system)?;
        self.timers
            .end_phase(stream, local, TimingPhase::CoordinateUpload)?;
        advance(&mut self.states, local, PipelineState::AtomsUploaded)?;
        stream.record_event(&self.aux_ops_done)?;

        // Non-local stream starts once outputs are cleared and local x is in place.
        let stream = &self.streams.non_local;
        stream.wait_event(&self.aux_ops_done)?;
        self.timers
            .begin_phase(stream, non_local, TimingPhase::CoordinateUpload)?;
        self.atoms
            .upload_coordinates(stream, AtomLocality::NonLocal, &layout, system)?;
        self.timers
            .end_phase(stream, non_local, TimingPhase::CoordinateUpload)?;
        advance(&mut self.states, non_local, PipelineState::AtomsUploaded)?;

        for loc in InteractionLocality::ALL {
            let stream = &self.streams[loc];
            let action = actions[loc];

            if action != ListAction::Reuse {
                self.timers
                    .begin_phase(stream, loc, TimingPhase::PairListUpload)?;
                self.lists[loc].upload(stream)?;
                self.timers
                    .end_phase(stream, loc, TimingPhase::PairListUpload)?;
                let next = if action == ListAction::Prune {
                    PipelineState::ListPruned
                } else {
                    PipelineState::ListRebuilt
                };
                advance(&mut self.states, loc, next)?;
            }

            self.lists[loc].check_fresh(self.list_age, self.cadence.rebuild_interval)?;
            advance(&mut self.states, loc, PipelineState::ParametersBound)?;

            let flavor = KernelFlavor::new(compute_energy, action != ListAction::Reuse);
            self.timers.begin_phase(stream, loc, TimingPhase::Kernel)?;
            let launched = kernel::dispatch(
                stream,
                &self.kernel,
                flavor,
                Arc::clone(&params),
                &layout,
                &self.atoms,
                &self.lists[loc],
            )?;
            self.timers.end_kernel(stream, loc, flavor)?;
            if launched {
                self.stats.kernel_launches += 1;
            } else {
                self.stats.empty_dispatches += 1;
            }
            advance(&mut self.states, loc, PipelineState::KernelDispatched)?;

            self.timers
                .begin_phase(stream, loc, TimingPhase::ForceDownload)?;
            if compute_energy {
                self.staging
                    .download_energies(stream, loc, self.atoms.outputs(loc), step)?;
            }
            if loc == non_local {
                self.timers
                    .end_phase(stream, loc, TimingPhase::ForceDownload)?;
                stream.record_event(&self.nonlocal_done)?;
            }
        }

        // Local stream: fold in the non-local forces, then hand back to the host.
        let stream = &self.streams.local;
        stream.wait_event(&self.nonlocal_done)?;
        self.atoms.reduce_nonlocal_forces(stream)?;
        self.atoms.download_forces(stream, &self.forces_host)?;
        self.timers
            .end_phase(stream, local, TimingPhase::ForceDownload)?;
        stream.record_event(&self.aux_ops_done)?;
        Ok(())
    }

    /// New layout, both lists, and a store sized for it.
    fn rebuild_lists(&mut self, system: &AtomSystem, cutoffs: &CutoffConfig) -> Result<()> {
        let started = Instant::now();
        let layout = Arc::new(ClusterLayout::build(system, self.config.cluster_size)?);
        for loc in InteractionLocality::ALL {
            self.lists[loc].rebuild(&layout, system, cutoffs, self.exclusions.as_ref())?;
        }
        self.list_cutoffs = Some(*cutoffs);
        self.timers
            .record_host(HostPhase::ListBuild, started.elapsed().as_secs_f64() * 1e3);

        let box_changed = self
            .layout
            .as_ref()
            .map_or(true, |old| old.periodic_box() != layout.periodic_box());
        if box_changed {
            self.atoms.invalidate_shift_vectors();
        }
        if self
            .atoms
            .reserve(layout.n_slots(), layout.n_local_slots())?
        {
            self.stats.atom_store_reallocations += 1;
        }

        let atoms = layout.atoms_per_partition();
        log::debug!(
            "Step {}: new layout with {} local / {} non-local atoms in {} clusters",
            self.step,
            atoms.local,
            atoms.non_local,
            layout.n_clusters()
        );

        self.layout = Some(layout);
        self.list_age = 0;
        self.rebuild_requested = false;
        self.pruned_since_rebuild = false;
        self.stats.list_rebuilds += 1;
        Ok(())
    }

    /// Drain both streams and return to `Idle` after a failed step.
    fn abort_step(&mut self) {
        for loc in InteractionLocality::ALL {
            if let Err(err) = self.streams[loc].synchronize() {
                log::debug!("{} stream drained with error: {}", loc, err);
            }
        }
        self.states = PerLocality::default();
        self.in_flight = None;
        self.rebuild_requested = true;
    }

    /// Change the rebuild interval and prune delay for later steps.
    pub fn set_prune_cadence(&mut self, rebuild_interval: u32, prune_delay: u32) -> Result<()> {
        self.cadence = ListCadence::new(rebuild_interval, prune_delay)?;
        self.config.cadence.rebuild_interval = rebuild_interval;
        self.config.cadence.prune_delay = prune_delay;
        log::info!(
            "Pair-list cadence: rebuild every {} steps, prune after {}",
            rebuild_interval,
            prune_delay
        );
        Ok(())
    }

    /// Rebuild both lists at the next step regardless of cadence.
    pub fn force_rebuild(&mut self) {
        self.rebuild_requested = true;
    }

    /// Switch electrostatics; only between steps.
    pub fn set_electrostatics_model(&mut self, model: ElectrostaticsModel) -> Result<()> {
        for (loc, state) in self.states.iter() {
            if *state != PipelineState::Idle || self.in_flight.is_some() {
                return Err(NbError::transition(
                    loc,
                    state.name(),
                    PipelineState::ParametersBound.name(),
                ));
            }
        }
        let mut config = self.config.clone();
        config.electrostatics.model = model;
        config.cutoffs = self.params.snapshot().cutoffs;
        let params = InteractionParams::from_config(&config, self.lj.clone())?;
        self.params.replace(params)?;
        self.config = config;
        Ok(())
    }

    /// Request event timing; it stays off while decomposition is active.
    pub fn enable_timing(&mut self, enabled: bool) {
        self.timers.set_requested(enabled);
    }

    pub fn timing_enabled(&self) -> bool {
        self.timers.is_enabled()
    }

    pub fn timing_summary(&self) -> TimingSummary {
        self.timers.summary().clone()
    }

    pub fn reset_timings(&mut self) {
        self.timers.reset();
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn state(&self, locality: InteractionLocality) -> PipelineState {
        self.states[locality]
    }

    pub fn cadence(&self) -> ListCadence {
        self.cadence
    }

    /// Active parameters; `replace` affects only later dispatches.
    pub fn parameters(&self) -> &ParameterTable {
        &self.params
    }

    pub fn config(&self) -> &NonbondedConfig {
        &self.config
    }

    pub fn pair_list(&self, locality: InteractionLocality) -> &ClusterPairList {
        &self.lists[locality]
    }

    pub fn layout(&self) -> Option<&ClusterLayout> {
        self.layout.as_deref()
    }

    pub fn atom_store(&self) -> &DeviceAtomStore {
        &self.atoms
    }

    pub fn device(&self) -> &DeviceContext {
        &self.ctx
    }

    /// Index of the next step to launch.
    pub fn current_step(&self) -> u64 {
        self.step
    }

    pub fn is_step_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::NoExclusions;

    fn config() -> NonbondedConfig {
        NonbondedConfig::builder()
            .cutoffs(0.9, 0.9)
            .list_buffer(0.1)
            .electrostatics(ElectrostaticsModel::ReactionField)
            .memory_budget_bytes(64 << 20)
            .build()
            .unwrap()
    }

    fn pipeline() -> NonbondedPipeline {
        NonbondedPipeline::new(config(), LjParameters::none(), Arc::new(NoExclusions)).unwrap()
    }

    fn pair_system() -> AtomSystem {
        AtomSystem::new(
            vec![Float3::new(1.0, 1.0, 1.0), Float3::new(1.3, 1.0, 1.0)],
            vec![1.0, -1.0],
            vec![0, 0],
        )
    }

    #[test]
    fn test_state_transitions() {
        use PipelineState::*;
        assert!(Idle.can_transition_to(AtomsUploaded));
        assert!(AtomsUploaded.can_transition_to(ParametersBound));
        assert!(ListPruned.can_transition_to(ParametersBound));
        assert!(!Idle.can_transition_to(KernelDispatched));
        assert!(!KernelDispatched.can_transition_to(Idle));
        assert!(!ResultsDownloaded.can_transition_to(AtomsUploaded));

        let mut states = PerLocality::default();
        let err = advance(&mut states, InteractionLocality::NonLocal, ParametersBound).unwrap_err();
        assert!(matches!(err, NbError::InvalidTransition { .. }));
        assert_eq!(states.non_local, Idle);
    }

    #[test]
    fn test_wait_without_launch_is_rejected() {
        let mut pipe = pipeline();
        assert!(matches!(
            pipe.wait_step(),
            Err(NbError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_double_launch_is_rejected() {
        let mut pipe = pipeline();
        let sys = pair_system();
        pipe.launch_step(&sys, true).unwrap();
        assert!(matches!(
            pipe.launch_step(&sys, true),
            Err(NbError::InvalidTransition { .. })
        ));
        pipe.wait_step().unwrap();
        assert_eq!(pipe.state(InteractionLocality::Local), PipelineState::Idle);
        assert_eq!(pipe.state(InteractionLocality::NonLocal), PipelineState::Idle);
    }

    #[test]
    fn test_cadence_rebuilds_and_prunes() {
        let mut pipe = pipeline();
        pipe.set_prune_cadence(3, 1).unwrap();
        let sys = pair_system();
        for _ in 0..7 {
            pipe.run_step(&sys, false).unwrap();
        }
        // rebuilds at steps 0, 3, 6; prunes at steps 1, 4
        assert_eq!(pipe.stats().list_rebuilds, 3);
        assert_eq!(pipe.stats().list_prunes, 2);
        assert_eq!(pipe.stats().steps, 7);
        assert!(!pipe.pair_list(InteractionLocality::Local).is_prune_needed());
    }

    #[test]
    fn test_force_rebuild() {
        let mut pipe = pipeline();
        let sys = pair_system();
        pipe.run_step(&sys, false).unwrap();
        pipe.run_step(&sys, false).unwrap();
        assert_eq!(pipe.stats().list_rebuilds, 1);
        pipe.force_rebuild();
        pipe.run_step(&sys, false).unwrap();
        assert_eq!(pipe.stats().list_rebuilds, 2);
    }

    #[test]
    fn test_invalid_cadence_rejected() {
        let mut pipe = pipeline();
        assert!(pipe.set_prune_cadence(0, 1).is_err());
        assert_eq!(pipe.cadence().rebuild_interval, 10);
    }

    #[test]
    fn test_switch_electrostatics_between_steps() {
        let mut pipe = pipeline();
        let sys = pair_system();
        let rf = pipe.run_step(&sys, true).unwrap();
        pipe.set_electrostatics_model(ElectrostaticsModel::Ewald)
            .unwrap();
        assert_eq!(
            pipe.parameters().snapshot().electrostatics,
            ElectrostaticsModel::Ewald
        );
        let ewald = pipe.run_step(&sys, true).unwrap();
        assert!(rf.energy_el < 0.0);
        assert!(ewald.energy_el < 0.0);
        assert_ne!(rf.energy_el, ewald.energy_el);
    }

    #[test]
    fn test_switch_electrostatics_mid_step_rejected() {
        let mut pipe = pipeline();
        pipe.launch_step(&pair_system(), false).unwrap();
        assert!(pipe
            .set_electrostatics_model(ElectrostaticsModel::Cutoff)
            .is_err());
        pipe.wait_step().unwrap();
    }
}
