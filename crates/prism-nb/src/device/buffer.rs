//! Device and host-visible buffers.
//!
//! A [`DeviceBuffer`] is an owned handle with an explicit element count and
//! capacity. Storage lives in a reference-counted allocation: commands already
//! queued on a stream hold the generation they captured, so a reallocation
//! never pulls memory out from under an in-flight operation. Bytes are charged
//! against the device [`MemoryLedger`] for as long as any generation is alive.

use crate::memory::MemoryLedger;
use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use prism_core::Result;
use std::sync::Arc;

/// Plain-old-data element types that can live in device memory.
pub trait DeviceRepr: Copy + Default + Send + Sync + 'static {}

impl<T: Copy + Default + Send + Sync + 'static> DeviceRepr for T {}

/// Capacity after growing a buffer of `current` elements to hold `requested`.
///
/// The first allocation is exact; later growth at least doubles.
pub fn grow_capacity(current: usize, requested: usize) -> usize {
    if current == 0 {
        requested
    } else {
        requested.max(current * 2)
    }
}

pub(crate) struct Allocation<T: DeviceRepr> {
    data: RwLock<Vec<T>>,
    bytes: usize,
    ledger: Arc<MemoryLedger>,
}

impl<T: DeviceRepr> Allocation<T> {
    fn new(ledger: &Arc<MemoryLedger>, label: &str, capacity: usize) -> Result<Self> {
        let bytes = capacity * std::mem::size_of::<T>();
        ledger.try_reserve(label, bytes)?;
        Ok(Self {
            data: RwLock::new(vec![T::default(); capacity]),
            bytes,
            ledger: Arc::clone(ledger),
        })
    }

    fn empty(ledger: &Arc<MemoryLedger>) -> Self {
        Self {
            data: RwLock::new(Vec::new()),
            bytes: 0,
            ledger: Arc::clone(ledger),
        }
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Vec<T>> {
        self.data.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Vec<T>> {
        self.data.write()
    }
}

impl<T: DeviceRepr> Drop for Allocation<T> {
    fn drop(&mut self) {
        self.ledger.release(self.bytes);
    }
}

/// Shared reference to one allocation generation, captured by stream commands.
pub(crate) type BufferHandle<T> = Arc<Allocation<T>>;

/// Growable device array.
pub struct DeviceBuffer<T: DeviceRepr> {
    label: &'static str,
    alloc: BufferHandle<T>,
    capacity: usize,
    len: usize,
    generation: u64,
    ledger: Arc<MemoryLedger>,
}

impl<T: DeviceRepr> DeviceBuffer<T> {
    /// Unallocated buffer; the first `reserve` allocates exactly.
    pub(crate) fn unallocated(ledger: &Arc<MemoryLedger>, label: &'static str) -> Self {
        Self {
            label,
            alloc: Arc::new(Allocation::empty(ledger)),
            capacity: 0,
            len: 0,
            generation: 0,
            ledger: Arc::clone(ledger),
        }
    }

    pub(crate) fn with_capacity(
        ledger: &Arc<MemoryLedger>,
        label: &'static str,
        capacity: usize,
    ) -> Result<Self> {
        let mut buf = Self::unallocated(ledger, label);
        if capacity > 0 {
            buf.alloc = Arc::new(Allocation::new(ledger, label, capacity)?);
            buf.capacity = capacity;
            buf.generation = 1;
        }
        Ok(buf)
    }

    /// Make room for `len` elements and set the logical length.
    ///
    /// Grows by [`grow_capacity`] when `len` exceeds the capacity; old
    /// contents are not preserved. Never shrinks. Returns whether a new
    /// generation was allocated.
    pub fn reserve(&mut self, len: usize) -> Result<bool> {
        let mut reallocated = false;
        if len > self.capacity {
            let new_capacity = grow_capacity(self.capacity, len);
            // Release our reference first so the old generation is freed
            // unless a queued command still holds it.
            self.alloc = Arc::new(Allocation::empty(&self.ledger));
            self.capacity = 0;
            self.len = 0;
            self.alloc = Arc::new(Allocation::new(&self.ledger, self.label, new_capacity)?);
            self.capacity = new_capacity;
            self.generation += 1;
            reallocated = true;
            log::debug!(
                "Reallocated device buffer '{}' to {} elements ({} bytes)",
                self.label,
                new_capacity,
                new_capacity * std::mem::size_of::<T>()
            );
        }
        self.len = len;
        Ok(reallocated)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    /// Allocation generation (incremented on every reallocation).
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn handle(&self) -> BufferHandle<T> {
        Arc::clone(&self.alloc)
    }
}

impl<T: DeviceRepr> std::fmt::Debug for DeviceBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("label", &self.label)
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Host-visible buffer that device-to-host copies land in.
#[derive(Debug)]
pub struct HostBuffer<T: DeviceRepr> {
    data: Arc<Mutex<Vec<T>>>,
}

impl<T: DeviceRepr> Clone for HostBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            data: Arc::clone(&self.data),
        }
    }
}

impl<T: DeviceRepr> HostBuffer<T> {
    pub fn new(len: usize) -> Self {
        Self {
            data: Arc::new(Mutex::new(vec![T::default(); len])),
        }
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resize, zero-filling new elements.
    pub fn resize(&self, len: usize) {
        self.data.lock().resize(len, T::default());
    }

    pub fn lock(&self) -> MutexGuard<'_, Vec<T>> {
        self.data.lock()
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.data.lock().clone()
    }

    pub(crate) fn shared(&self) -> Arc<Mutex<Vec<T>>> {
        Arc::clone(&self.data)
    }
}
