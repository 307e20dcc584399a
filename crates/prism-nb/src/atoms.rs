//! Device atom store.
//!
//! Per-slot coordinates with charges, per-locality force accumulators, type
//! indices, energy and shift-force outputs and the periodic shift vectors.
//! Per-atom buffers grow together through [`DeviceAtomStore::reserve`] and
//! never shrink. The store is only resized at a step boundary, never while a
//! kernel referencing it is queued.

use crate::device::{DeviceBuffer, DeviceContext, HostBuffer, Stream};
use crate::pairlist::{ClusterLayout, NUM_SHIFTS};
use crate::system::AtomSystem;
use prism_core::{AtomLocality, Float3, Float4, InteractionLocality, PerLocality, Result};

/// Energy and shift-force accumulators written by one locality's kernel.
#[derive(Debug)]
pub struct OutputBuffers {
    pub e_lj: DeviceBuffer<f32>,
    pub e_el: DeviceBuffer<f32>,
    pub fshift: DeviceBuffer<Float3>,
}

impl OutputBuffers {
    fn new(ctx: &DeviceContext) -> Result<Self> {
        let mut out = Self {
            e_lj: ctx.alloc("e_lj", 1)?,
            e_el: ctx.alloc("e_el", 1)?,
            fshift: ctx.alloc("fshift", NUM_SHIFTS)?,
        };
        out.e_lj.reserve(1)?;
        out.e_el.reserve(1)?;
        out.fshift.reserve(NUM_SHIFTS)?;
        Ok(out)
    }

    fn clear(&self, stream: &Stream) -> Result<()> {
        stream.fill(&self.e_lj, 0..1, 0.0)?;
        stream.fill(&self.e_el, 0..1, 0.0)?;
        stream.fill(&self.fshift, 0..NUM_SHIFTS, Float3::ZERO)
    }
}

/// Device-resident atom data.
#[derive(Debug)]
pub struct DeviceAtomStore {
    natoms: usize,
    natoms_local: usize,
    pub(crate) xq: DeviceBuffer<Float4>,
    pub(crate) f: PerLocality<DeviceBuffer<Float3>>,
    pub(crate) atom_types: DeviceBuffer<u32>,
    pub(crate) outputs: PerLocality<OutputBuffers>,
    pub(crate) shift_vec: DeviceBuffer<Float3>,
    shift_vec_uploaded: bool,
}

impl DeviceAtomStore {
    /// Store with `initial_capacity` atom slots (0 defers allocation).
    pub fn new(ctx: &DeviceContext, initial_capacity: usize) -> Result<Self> {
        let mut shift_vec = ctx.alloc("shift_vec", NUM_SHIFTS)?;
        shift_vec.reserve(NUM_SHIFTS)?;
        Ok(Self {
            natoms: 0,
            natoms_local: 0,
            xq: ctx.alloc("xq", initial_capacity)?,
            f: PerLocality::new(
                ctx.alloc("f_local", initial_capacity)?,
                ctx.alloc("f_nonlocal", initial_capacity)?,
            ),
            atom_types: ctx.alloc("atom_types", initial_capacity)?,
            outputs: PerLocality::try_from_fn(|_| OutputBuffers::new(ctx))?,
            shift_vec,
            shift_vec_uploaded: false,
        })
    }

    /// Size the per-atom buffers for `natoms` slots, `natoms_local` of them local.
    ///
    /// Grows by doubling when `natoms` exceeds the capacity, discarding the
    /// old contents and invalidating the uploaded shift vectors. Returns
    /// whether anything was reallocated.
    pub fn reserve(&mut self, natoms: usize, natoms_local: usize) -> Result<bool> {
        let mut realloc = self.xq.reserve(natoms)?;
        realloc |= self.f.local.reserve(natoms)?;
        realloc |= self.f.non_local.reserve(natoms)?;
        realloc |= self.atom_types.reserve(natoms)?;
        self.natoms = natoms;
        self.natoms_local = natoms_local.min(natoms);
        if realloc {
            self.shift_vec_uploaded = false;
            log::debug!(
                "Atom store grown to {} slots ({} requested)",
                self.capacity(),
                natoms
            );
        }
        Ok(realloc)
    }

    pub fn natoms(&self) -> usize {
        self.natoms
    }

    pub fn natoms_local(&self) -> usize {
        self.natoms_local
    }

    pub fn capacity(&self) -> usize {
        self.xq.capacity()
    }

    fn slot_range(&self, locality: AtomLocality) -> std::ops::Range<usize> {
        match locality {
            AtomLocality::Local => 0..self.natoms_local,
            AtomLocality::NonLocal => self.natoms_local..self.natoms,
            AtomLocality::All => 0..self.natoms,
        }
    }

    /// Upload coordinates and charges of the slots of `locality` only.
    ///
    /// Other regions of `xq` are untouched, so a kernel of the other locality
    /// already queued keeps reading consistent data.
    pub fn upload_coordinates(
        &self,
        stream: &Stream,
        locality: AtomLocality,
        layout: &ClusterLayout,
        system: &AtomSystem,
    ) -> Result<()> {
        let range = self.slot_range(locality);
        if range.is_empty() {
            return Ok(());
        }
        let start = range.start;
        let staged = layout.gather_xq(system, range);
        stream.copy_to_device(&self.xq, start, staged)
    }

    /// Upload per-slot atom types (once per layout).
    pub fn upload_atom_types(
        &self,
        stream: &Stream,
        layout: &ClusterLayout,
        system: &AtomSystem,
    ) -> Result<()> {
        if self.natoms == 0 {
            return Ok(());
        }
        stream.copy_to_device(&self.atom_types, 0, layout.gather_types(system))
    }

    /// Upload the periodic shift vectors unless already uploaded this epoch.
    ///
    /// Returns whether a transfer was issued.
    pub fn upload_shift_vectors(&mut self, stream: &Stream, shifts: &[Float3]) -> Result<bool> {
        if self.shift_vec_uploaded {
            return Ok(false);
        }
        stream.copy_to_device(&self.shift_vec, 0, shifts.to_vec())?;
        self.shift_vec_uploaded = true;
        Ok(true)
    }

    /// Force the next [`upload_shift_vectors`](Self::upload_shift_vectors) to transfer.
    pub fn invalidate_shift_vectors(&mut self) {
        self.shift_vec_uploaded = false;
    }

    pub fn shift_vectors_uploaded(&self) -> bool {
        self.shift_vec_uploaded
    }

    /// Zero both force accumulators and the outputs of both localities.
    pub fn clear_outputs(&self, stream: &Stream) -> Result<()> {
        for loc in InteractionLocality::ALL {
            if self.natoms > 0 {
                stream.fill(&self.f[loc], 0..self.natoms, Float3::ZERO)?;
            }
            self.outputs[loc].clear(stream)?;
        }
        Ok(())
    }

    /// Fold the non-local force accumulator into the local one.
    ///
    /// Must be ordered after every non-local write through an event wait.
    pub fn reduce_nonlocal_forces(&self, stream: &Stream) -> Result<()> {
        if self.natoms == 0 {
            return Ok(());
        }
        let n = self.natoms;
        let local = self.f.local.handle();
        let non_local = self.f.non_local.handle();
        stream.enqueue("reduce non-local forces", move || {
            let from = non_local.read();
            let mut into = local.write();
            let (Some(src), Some(dst)) = (from.get(..n), into.get_mut(..n)) else {
                return Err("force buffers shorter than atom count".to_string());
            };
            for (d, s) in dst.iter_mut().zip(src) {
                *d += *s;
            }
            Ok(())
        })
    }

    /// Copy the reduced per-slot forces into `host`.
    pub fn download_forces(&self, stream: &Stream, host: &HostBuffer<Float3>) -> Result<()> {
        if self.natoms == 0 {
            return Ok(());
        }
        host.resize(self.natoms);
        stream.copy_to_host(&self.f.local, 0..self.natoms, host, 0)
    }

    pub fn outputs(&self, locality: InteractionLocality) -> &OutputBuffers {
        &self.outputs[locality]
    }
}
