//! Host-emulated accelerator device.
//!
//! Mirrors the subset of a CUDA-style driver the offload pipeline needs:
//! budgeted allocations, in-order streams and completion events.
//!
//! ```text
//!   controlling thread ──issue──► Stream (local)     ──► worker thread
//!                       ──issue──► Stream (non-local) ──► worker thread
//!                                        │   ▲
//!                                 record │   │ wait
//!                                        ▼   │
//!                                       Event
//! ```

pub mod buffer;
pub mod event;
pub mod stream;

pub use buffer::{grow_capacity, DeviceBuffer, DeviceRepr, HostBuffer};
pub use event::Event;
pub use stream::{CommandResult, Stream};

use crate::memory::{DeviceMemoryBudget, MemoryLedger};
use prism_core::Result;
use std::sync::Arc;

/// Handle to the device: owns the memory ledger and creates streams and buffers.
#[derive(Debug, Clone)]
pub struct DeviceContext {
    name: Arc<str>,
    ledger: Arc<MemoryLedger>,
}

impl DeviceContext {
    pub fn new(budget: DeviceMemoryBudget) -> Self {
        log::info!(
            "Initialized emulated device with {} MB budget",
            budget.safe_limit_mb()
        );
        Self {
            name: Arc::from("emulated"),
            ledger: Arc::new(MemoryLedger::new(budget)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn new_stream(&self, name: &str) -> Result<Stream> {
        Stream::spawn(name)
    }

    /// Buffer with no storage; the first `reserve` allocates exactly.
    pub fn buffer<T: DeviceRepr>(&self, label: &'static str) -> DeviceBuffer<T> {
        DeviceBuffer::unallocated(&self.ledger, label)
    }

    pub fn alloc<T: DeviceRepr>(
        &self,
        label: &'static str,
        capacity: usize,
    ) -> Result<DeviceBuffer<T>> {
        DeviceBuffer::with_capacity(&self.ledger, label, capacity)
    }

    pub fn memory_in_use(&self) -> usize {
        self.ledger.in_use()
    }

    pub fn memory_available(&self) -> usize {
        self.ledger.available()
    }

    pub fn peak_memory(&self) -> usize {
        self.ledger.peak()
    }
}
