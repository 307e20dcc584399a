//! Device-side timing of pipeline phases.
//!
//! A phase is bracketed by a start and a stop event recorded on the stream
//! doing the work; the elapsed time is read back only after the step has been
//! synchronized, so timing never adds a host wait of its own. Kernel time is
//! additionally split by [`KernelFlavor`].
//!
//! Event-based timing on two concurrent streams is only meaningful when the
//! streams are not interleaved with work from other ranks, so timing is
//! switched off whenever domain decomposition is active.

use crate::device::{Event, Stream};
use crate::kernel::KernelFlavor;
use prism_core::{InteractionLocality, PerLocality, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Timed pipeline phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimingPhase {
    /// Atom type and shift-vector uploads after a layout change
    AtomDataTransfer,
    CoordinateUpload,
    PairListUpload,
    Kernel,
    /// Energy, shift-force and force downloads
    ForceDownload,
}

impl TimingPhase {
    pub const ALL: [TimingPhase; 5] = [
        TimingPhase::AtomDataTransfer,
        TimingPhase::CoordinateUpload,
        TimingPhase::PairListUpload,
        TimingPhase::Kernel,
        TimingPhase::ForceDownload,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            TimingPhase::AtomDataTransfer => "atom_data_transfer",
            TimingPhase::CoordinateUpload => "coordinate_upload",
            TimingPhase::PairListUpload => "pairlist_upload",
            TimingPhase::Kernel => "kernel",
            TimingPhase::ForceDownload => "force_download",
        }
    }
}

impl std::fmt::Display for TimingPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Accumulated time and call count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseTiming {
    pub total_ms: f64,
    pub calls: u64,
}

impl PhaseTiming {
    fn add(&mut self, ms: f64) {
        self.total_ms += ms;
        self.calls += 1;
    }

    pub fn average_ms(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.total_ms / self.calls as f64
        }
    }
}

/// Per-phase totals of one locality.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalityTimings {
    pub atom_data_transfer: PhaseTiming,
    pub coordinate_upload: PhaseTiming,
    pub pairlist_upload: PhaseTiming,
    pub kernel: PhaseTiming,
    pub force_download: PhaseTiming,
    /// Kernel time indexed by [`KernelFlavor::index`]
    pub kernel_by_flavor: [PhaseTiming; 4],
}

impl LocalityTimings {
    pub fn phase(&self, phase: TimingPhase) -> &PhaseTiming {
        match phase {
            TimingPhase::AtomDataTransfer => &self.atom_data_transfer,
            TimingPhase::CoordinateUpload => &self.coordinate_upload,
            TimingPhase::PairListUpload => &self.pairlist_upload,
            TimingPhase::Kernel => &self.kernel,
            TimingPhase::ForceDownload => &self.force_download,
        }
    }

    fn phase_mut(&mut self, phase: TimingPhase) -> &mut PhaseTiming {
        match phase {
            TimingPhase::AtomDataTransfer => &mut self.atom_data_transfer,
            TimingPhase::CoordinateUpload => &mut self.coordinate_upload,
            TimingPhase::PairListUpload => &mut self.pairlist_upload,
            TimingPhase::Kernel => &mut self.kernel,
            TimingPhase::ForceDownload => &mut self.force_download,
        }
    }

    pub fn kernel_flavor(&self, flavor: KernelFlavor) -> &PhaseTiming {
        &self.kernel_by_flavor[flavor.index()]
    }

    pub fn total_ms(&self) -> f64 {
        TimingPhase::ALL.iter().map(|&p| self.phase(p).total_ms).sum()
    }
}

/// Aggregated timings, exported as JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimingSummary {
    pub enabled: bool,
    /// Steps whose timings were collected
    pub steps: u64,
    /// Host time spent searching pair lists
    pub list_build: PhaseTiming,
    /// Host time spent pruning pair lists
    pub list_prune: PhaseTiming,
    pub localities: PerLocality<LocalityTimings>,
}

impl TimingSummary {
    /// Device time over both localities and all phases.
    pub fn device_total_ms(&self) -> f64 {
        self.localities.local.total_ms() + self.localities.non_local.total_ms()
    }

    pub fn locality(&self, locality: InteractionLocality) -> &LocalityTimings {
        &self.localities[locality]
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Write the summary as pretty-printed JSON.
    pub fn export_json(&self, path: &Path) -> Result<()> {
        let json = self.to_json().map_err(std::io::Error::from)?;
        std::fs::write(path, json)?;
        log::info!("Exported non-bonded timings to {}", path.display());
        Ok(())
    }
}

/// Host-side phases timed with the wall clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPhase {
    ListBuild,
    ListPrune,
}

/// A closed phase waiting for its events to retire.
#[derive(Debug)]
struct PhaseTimer {
    locality: InteractionLocality,
    phase: TimingPhase,
    flavor: Option<KernelFlavor>,
    start: Event,
    stop: Event,
}

/// Event-pair timers for both localities.
#[derive(Debug, Default)]
pub struct GpuTimers {
    requested: bool,
    decomposition_active: bool,
    open: PerLocality<[Option<Event>; 5]>,
    closed: Vec<PhaseTimer>,
    summary: TimingSummary,
}

impl GpuTimers {
    pub fn new(requested: bool) -> Self {
        let mut timers = Self {
            requested,
            ..Self::default()
        };
        timers.summary.enabled = requested;
        timers
    }

    pub fn is_enabled(&self) -> bool {
        self.requested && !self.decomposition_active
    }

    /// Turn timing on or off; it stays off while decomposition is active.
    pub fn set_requested(&mut self, requested: bool) {
        self.requested = requested;
        if requested && self.decomposition_active {
            log::warn!("Non-bonded timing requested but disabled: domain decomposition is active");
        }
        self.summary.enabled = self.is_enabled();
    }

    /// Track the decomposition state of the system being stepped.
    pub fn set_decomposition(&mut self, active: bool) {
        if active == self.decomposition_active {
            return;
        }
        if active && self.requested {
            log::warn!("Disabling non-bonded timing: domain decomposition is active");
        }
        self.decomposition_active = active;
        self.summary.enabled = self.is_enabled();
        if active {
            self.open = PerLocality::default();
            self.closed.clear();
        }
    }

    /// Record the start event of `phase` on `stream`. No-op when disabled.
    pub fn begin_phase(
        &mut self,
        stream: &Stream,
        locality: InteractionLocality,
        phase: TimingPhase,
    ) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let start = Event::new(format!("{}_{}_start", locality.name(), phase.name()));
        stream.record_event(&start)?;
        self.open[locality][phase.index()] = Some(start);
        Ok(())
    }

    /// Record the stop event of `phase`. No-op when disabled or never begun.
    pub fn end_phase(
        &mut self,
        stream: &Stream,
        locality: InteractionLocality,
        phase: TimingPhase,
    ) -> Result<()> {
        self.close(stream, locality, phase, None)
    }

    /// [`end_phase`](Self::end_phase) for the kernel, attributing it to `flavor`.
    pub fn end_kernel(
        &mut self,
        stream: &Stream,
        locality: InteractionLocality,
        flavor: KernelFlavor,
    ) -> Result<()> {
        self.close(stream, locality, TimingPhase::Kernel, Some(flavor))
    }

    fn close(
        &mut self,
        stream: &Stream,
        locality: InteractionLocality,
        phase: TimingPhase,
        flavor: Option<KernelFlavor>,
    ) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let Some(start) = self.open[locality][phase.index()].take() else {
            return Ok(());
        };
        let stop = Event::new(format!("{}_{}_stop", locality.name(), phase.name()));
        stream.record_event(&stop)?;
        self.closed.push(PhaseTimer {
            locality,
            phase,
            flavor,
            start,
            stop,
        });
        Ok(())
    }

    /// Account a host-side phase measured with the wall clock.
    pub fn record_host(&mut self, phase: HostPhase, ms: f64) {
        if !self.is_enabled() {
            return;
        }
        match phase {
            HostPhase::ListBuild => self.summary.list_build.add(ms),
            HostPhase::ListPrune => self.summary.list_prune.add(ms),
        }
    }

    /// Fold every retired phase into the summary; call after synchronizing.
    ///
    /// Phases whose events are still pending stay queued. Returns the number
    /// of phases collected.
    pub fn collect(&mut self) -> usize {
        let mut collected = 0;
        let mut still_pending = Vec::new();
        for timer in self.closed.drain(..) {
            let Some(ms) = timer.start.elapsed_ms(&timer.stop) else {
                still_pending.push(timer);
                continue;
            };
            let loc = &mut self.summary.localities[timer.locality];
            loc.phase_mut(timer.phase).add(ms);
            if let Some(flavor) = timer.flavor {
                loc.kernel_by_flavor[flavor.index()].add(ms);
            }
            collected += 1;
        }
        self.closed = still_pending;
        if collected > 0 {
            self.summary.steps += 1;
        }
        collected
    }

    pub fn summary(&self) -> &TimingSummary {
        &self.summary
    }

    /// Discard accumulated timings, keeping the enabled state.
    pub fn reset(&mut self) {
        self.summary = TimingSummary {
            enabled: self.is_enabled(),
            ..TimingSummary::default()
        };
        self.closed.clear();
    }
}
