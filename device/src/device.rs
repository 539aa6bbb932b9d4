//! Devices known to a registry.
//!
//! A [`Device`] bundles everything the coherence core needs from one memory
//! space: an allocator for its replicas, a queue to order transfers into
//! them, and the addressing mode that says whether the host can touch them
//! directly.

use std::sync::Arc;

use tessel_dtype::DeviceSpec;

use crate::allocator::{Allocator, BufferOptions, CpuAllocator, LruAllocator};
use crate::error::{InvalidDeviceSnafu, Result};
use crate::memory::{Addressing, DeviceMemory};
use crate::queue::{DeviceQueue, HostQueue, WorkerQueue};

/// Extension trait for DeviceSpec to add parsing functionality.
pub trait DeviceSpecExt {
    /// Parse a device string into a DeviceSpec.
    ///
    /// Examples:
    /// - "HOST" / "cpu" -> DeviceSpec::Host
    /// - "ACCEL:0" / "gpu:0" -> DeviceSpec::Accelerator { ordinal: 0 }
    /// - "accel" -> DeviceSpec::Accelerator { ordinal: 0 }
    fn parse(s: &str) -> Result<DeviceSpec>;
}

impl DeviceSpecExt for DeviceSpec {
    fn parse(s: &str) -> Result<Self> {
        let upper = s.trim().to_uppercase();
        let (kind, ordinal) = match upper.split_once(':') {
            Some((kind, ordinal)) => (kind, Some(ordinal)),
            None => (upper.as_str(), None),
        };

        match (kind, ordinal) {
            ("HOST" | "CPU", None) => Ok(DeviceSpec::Host),
            ("ACCEL" | "GPU", None) => Ok(DeviceSpec::Accelerator { ordinal: 0 }),
            ("ACCEL" | "GPU", Some(ordinal)) => match ordinal.parse() {
                Ok(ordinal) => Ok(DeviceSpec::Accelerator { ordinal }),
                Err(_) => InvalidDeviceSnafu { device: s }.fail(),
            },
            _ => InvalidDeviceSnafu { device: s }.fail(),
        }
    }
}

/// One memory space and its command queue.
#[derive(Debug, Clone)]
pub struct Device {
    index: usize,
    spec: DeviceSpec,
    addressing: Addressing,
    allocator: Arc<dyn Allocator>,
    queue: Arc<dyn DeviceQueue>,
}

impl Device {
    /// Assemble a device from its parts.
    pub fn new(
        index: usize,
        addressing: Addressing,
        allocator: Arc<dyn Allocator>,
        queue: Arc<dyn DeviceQueue>,
    ) -> Self {
        Self { index, spec: DeviceSpec::for_index(index), addressing, allocator, queue }
    }

    /// The host device: unified addressing, inline queue.
    pub fn host(capacity: Option<usize>, lru_depth: usize) -> Self {
        Self::new(0, Addressing::Unified, Self::build_allocator(0, capacity, lru_depth), Arc::new(HostQueue::new(0)))
    }

    /// A host-simulated accelerator: discrete addressing, worker-thread queue.
    pub fn accelerator(index: usize, capacity: Option<usize>, lru_depth: usize) -> Self {
        Self::new(
            index,
            Addressing::Discrete,
            Self::build_allocator(index, capacity, lru_depth),
            Arc::new(WorkerQueue::new(index)),
        )
    }

    fn build_allocator(index: usize, capacity: Option<usize>, lru_depth: usize) -> Arc<dyn Allocator> {
        let base = match capacity {
            Some(capacity) => CpuAllocator::with_capacity(index, capacity),
            None => CpuAllocator::new(index),
        };
        Arc::new(LruAllocator::with_capacity(Box::new(base), lru_depth))
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn spec(&self) -> DeviceSpec {
        self.spec
    }

    pub fn addressing(&self) -> Addressing {
        self.addressing
    }

    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }

    pub fn queue(&self) -> &Arc<dyn DeviceQueue> {
        &self.queue
    }

    /// Allocate a record of `bytes` bytes on this device.
    pub(crate) fn allocate(&self, bytes: usize, options: &BufferOptions) -> Result<Arc<DeviceMemory>> {
        let raw = self.allocator.alloc(bytes, options)?;
        tracing::debug!(device = self.index, bytes, zero_init = options.zero_init, "allocated device memory");
        Ok(Arc::new(DeviceMemory::owned(self.index, self.addressing, raw, Arc::clone(&self.allocator))))
    }
}
