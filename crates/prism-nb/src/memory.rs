//! Device memory budget guard.
//!
//! Every device allocation is charged against a [`MemoryLedger`]. A request
//! that would exceed the budget fails with `NbError::ResourceExhausted`; there
//! is no fallback path. The budget comes from configuration or, with the
//! `cuda` feature, from a live `cuMemGetInfo` query.

use prism_core::{NbError, Result};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Fraction of free device memory the pipeline may claim when the budget is
/// queried from hardware.
const SAFETY_THRESHOLD: f64 = 0.9;

/// Device memory available to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceMemoryBudget {
    /// Total device memory in bytes
    pub total_bytes: usize,
    /// Free device memory at query time
    pub free_bytes: usize,
    /// Bytes the pipeline may allocate
    pub safe_limit_bytes: usize,
}

impl DeviceMemoryBudget {
    /// Budget from an explicit byte count (configuration).
    pub fn from_bytes(bytes: usize) -> Self {
        Self {
            total_bytes: bytes,
            free_bytes: bytes,
            safe_limit_bytes: bytes,
        }
    }

    /// Budget from a CUDA device: 90% of its currently free memory.
    #[cfg(feature = "cuda")]
    pub fn query_cuda(ordinal: usize) -> Result<Self> {
        let _context = cudarc::driver::CudaContext::new(ordinal)
            .map_err(|e| NbError::device("host", "cuInit", e.to_string()))?;
        let (free_bytes, total_bytes) = cudarc::driver::result::mem_get_info()
            .map_err(|e| NbError::device("host", "cuMemGetInfo", e.to_string()))?;

        let safe_limit_bytes = (free_bytes as f64 * SAFETY_THRESHOLD) as usize;
        log::info!(
            "Device {} memory: {}/{} MB free, pipeline budget {} MB",
            ordinal,
            free_bytes / (1024 * 1024),
            total_bytes / (1024 * 1024),
            safe_limit_bytes / (1024 * 1024)
        );

        Ok(Self {
            total_bytes,
            free_bytes,
            safe_limit_bytes,
        })
    }

    /// Budget with the safety threshold applied to a known free amount.
    pub fn with_safety_margin(total_bytes: usize, free_bytes: usize) -> Self {
        Self {
            total_bytes,
            free_bytes,
            safe_limit_bytes: (free_bytes as f64 * SAFETY_THRESHOLD) as usize,
        }
    }

    pub fn safe_limit_mb(&self) -> u64 {
        (self.safe_limit_bytes / (1024 * 1024)) as u64
    }
}

/// Running account of device allocations against a budget.
#[derive(Debug)]
pub struct MemoryLedger {
    limit_bytes: usize,
    in_use: AtomicUsize,
    peak: AtomicUsize,
}

impl MemoryLedger {
    pub fn new(budget: DeviceMemoryBudget) -> Self {
        Self {
            limit_bytes: budget.safe_limit_bytes,
            in_use: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Charge `bytes` for the allocation named `context`.
    pub fn try_reserve(&self, context: &str, bytes: usize) -> Result<()> {
        let mut current = self.in_use.load(Ordering::Acquire);
        loop {
            let available = self.limit_bytes.saturating_sub(current);
            if bytes > available {
                log::error!(
                    "Device allocation of {} bytes for {} exceeds budget ({} of {} bytes in use)",
                    bytes,
                    context,
                    current,
                    self.limit_bytes
                );
                return Err(NbError::resource_exhausted(context, bytes, available));
            }
            match self.in_use.compare_exchange_weak(
                current,
                current + bytes,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.peak.fetch_max(current + bytes, Ordering::AcqRel);
                    return Ok(());
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn release(&self, bytes: usize) {
        self.in_use.fetch_sub(bytes, Ordering::AcqRel);
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> usize {
        self.limit_bytes
    }

    pub fn available(&self) -> usize {
        self.limit_bytes.saturating_sub(self.in_use())
    }
}
