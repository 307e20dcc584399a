//! Energy and shift-force staging.
//!
//! Each locality's kernel outputs are copied into host-visible slots on that
//! locality's stream. Once the step's completion event has been observed the
//! controlling thread folds the slots into the caller's totals, at most once
//! per step and locality.

use crate::atoms::OutputBuffers;
use crate::device::{HostBuffer, Stream};
use crate::pairlist::NUM_SHIFTS;
use prism_core::{EnergyTotals, Float3, InteractionLocality, PerLocality, Result};

#[derive(Debug)]
struct StagingSlot {
    e_lj: HostBuffer<f32>,
    e_el: HostBuffer<f32>,
    fshift: HostBuffer<Float3>,
    /// Step whose values were last staged
    staged_step: Option<u64>,
    /// Step whose values were last folded
    folded_step: Option<u64>,
}

impl StagingSlot {
    fn new() -> Self {
        Self {
            e_lj: HostBuffer::new(1),
            e_el: HostBuffer::new(1),
            fshift: HostBuffer::new(NUM_SHIFTS),
            staged_step: None,
            folded_step: None,
        }
    }

    fn energies(&self) -> (f32, f32) {
        let lj = self.e_lj.lock().first().copied().unwrap_or(0.0);
        let el = self.e_el.lock().first().copied().unwrap_or(0.0);
        (lj, el)
    }
}

/// Host-visible copies of both localities' energy and shift-force outputs.
#[derive(Debug)]
pub struct EnergyStaging {
    slots: PerLocality<StagingSlot>,
}

impl Default for EnergyStaging {
    fn default() -> Self {
        Self::new()
    }
}

impl EnergyStaging {
    pub fn new() -> Self {
        Self {
            slots: PerLocality::from_fn(|_| StagingSlot::new()),
        }
    }

    /// Enqueue the copies of `outputs` on `stream` for `step`.
    ///
    /// The values are only readable after the stream has passed this point.
    pub fn download_energies(
        &mut self,
        stream: &Stream,
        locality: InteractionLocality,
        outputs: &OutputBuffers,
        step: u64,
    ) -> Result<()> {
        let slot = &mut self.slots[locality];
        stream.copy_to_host(&outputs.e_lj, 0..1, &slot.e_lj, 0)?;
        stream.copy_to_host(&outputs.e_el, 0..1, &slot.e_el, 0)?;
        stream.copy_to_host(&outputs.fshift, 0..NUM_SHIFTS, &slot.fshift, 0)?;
        slot.staged_step = Some(step);
        Ok(())
    }

    /// Place values directly into a slot, as a completed download would.
    pub fn stage(
        &mut self,
        locality: InteractionLocality,
        e_lj: f32,
        e_el: f32,
        fshift: &[Float3],
        step: u64,
    ) {
        let slot = &mut self.slots[locality];
        *slot.e_lj.lock() = vec![e_lj];
        *slot.e_el.lock() = vec![e_el];
        let mut shifts = slot.fshift.lock();
        shifts.fill(Float3::ZERO);
        for (dst, src) in shifts.iter_mut().zip(fshift) {
            *dst = *src;
        }
        slot.staged_step = Some(step);
    }

    /// Add the staged energies of `locality` to `totals`.
    ///
    /// Returns false, leaving `totals` untouched, when nothing is staged or the
    /// staged step was already folded.
    pub fn fold_into(&mut self, locality: InteractionLocality, totals: &mut EnergyTotals) -> bool {
        let slot = &mut self.slots[locality];
        let Some(step) = slot.staged_step else {
            return false;
        };
        if slot.folded_step == Some(step) {
            return false;
        }
        let (lj, el) = slot.energies();
        totals.lj += lj as f64;
        totals.electrostatic += el as f64;
        slot.folded_step = Some(step);
        true
    }

    /// Staged `(e_lj, e_el)` of `locality`.
    pub fn energies(&self, locality: InteractionLocality) -> (f32, f32) {
        self.slots[locality].energies()
    }

    /// Shift forces summed over both localities.
    pub fn shift_forces(&self) -> Vec<Float3> {
        let mut total = vec![Float3::ZERO; NUM_SHIFTS];
        for (_, slot) in self.slots.iter() {
            if slot.staged_step.is_none() {
                continue;
            }
            for (t, f) in total.iter_mut().zip(slot.fshift.lock().iter()) {
                *t += *f;
            }
        }
        total
    }

    pub fn staged_step(&self, locality: InteractionLocality) -> Option<u64> {
        self.slots[locality].staged_step
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atoms::DeviceAtomStore;
    use crate::device::DeviceContext;
    use crate::memory::DeviceMemoryBudget;

    #[test]
    fn test_fold_sums_both_localities_once() {
        let mut staging = EnergyStaging::new();
        staging.stage(InteractionLocality::Local, 2.0, 1.0, &[], 7);
        staging.stage(InteractionLocality::NonLocal, 0.5, 0.25, &[], 7);

        let mut totals = EnergyTotals::default();
        assert!(staging.fold_into(InteractionLocality::Local, &mut totals));
        assert!(staging.fold_into(InteractionLocality::NonLocal, &mut totals));
        assert_eq!(totals.lj, 2.5);
        assert_eq!(totals.electrostatic, 1.25);

        assert!(!staging.fold_into(InteractionLocality::Local, &mut totals));
        assert!(!staging.fold_into(InteractionLocality::NonLocal, &mut totals));
        assert_eq!(totals.lj, 2.5);
        assert_eq!(totals.electrostatic, 1.25);
    }

    #[test]
    fn test_nothing_staged_folds_nothing() {
        let mut staging = EnergyStaging::new();
        let mut totals = EnergyTotals::default();
        assert!(!staging.fold_into(InteractionLocality::Local, &mut totals));
        assert_eq!(totals.total(), 0.0);
    }

    #[test]
    fn test_next_step_folds_again() {
        let mut staging = EnergyStaging::new();
        let mut totals = EnergyTotals::default();
        staging.stage(InteractionLocality::Local, 1.0, 0.0, &[], 1);
        assert!(staging.fold_into(InteractionLocality::Local, &mut totals));
        staging.stage(InteractionLocality::Local, 1.0, 0.0, &[], 2);
        assert!(staging.fold_into(InteractionLocality::Local, &mut totals));
        assert_eq!(totals.lj, 2.0);
    }

    #[test]
    fn test_download_copies_device_outputs() {
        let ctx = DeviceContext::new(DeviceMemoryBudget::from_bytes(16 << 20));
        let stream = ctx.new_stream("local").unwrap();
        let store = DeviceAtomStore::new(&ctx, 0).unwrap();
        let out = store.outputs(InteractionLocality::Local);
        stream.copy_to_device(&out.e_lj, 0, vec![-3.5]).unwrap();
        stream.copy_to_device(&out.e_el, 0, vec![1.5]).unwrap();
        stream.fill(&out.fshift, 0..NUM_SHIFTS, Float3::ZERO).unwrap();
        stream
            .copy_to_device(&out.fshift, 13, vec![Float3::new(1.0, 0.0, 0.0)])
            .unwrap();

        let mut staging = EnergyStaging::new();
        staging
            .download_energies(&stream, InteractionLocality::Local, out, 0)
            .unwrap();
        stream.synchronize().unwrap();

        assert_eq!(staging.energies(InteractionLocality::Local), (-3.5, 1.5));
        assert_eq!(staging.shift_forces()[13], Float3::new(1.0, 0.0, 0.0));
        let mut totals = EnergyTotals::default();
        assert!(staging.fold_into(InteractionLocality::Local, &mut totals));
        assert_eq!(totals.total(), -2.0);
    }
}
