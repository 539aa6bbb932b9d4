use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::{AllocationFailureSnafu, Result};

/// One raw allocation of host-addressable memory.
///
/// Backed by 64-bit words so every [`Element`](tessel_dtype::Element) type can be
/// viewed in place without realignment.
#[derive(Debug)]
pub struct RawBuffer {
    words: Box<[u64]>,
    len: usize,
}

impl RawBuffer {
    fn zeroed(len: usize) -> Self {
        Self { words: vec![0u64; len.div_ceil(8)].into_boxed_slice(), len }
    }

    /// Size of the buffer in bytes.
    pub fn size(&self) -> usize {
        self.len
    }

    pub fn as_bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u64, u8>(&self.words)[..self.len]
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut::<u64, u8>(&mut self.words)[..self.len]
    }

    fn fill_zero(&mut self) {
        self.words.fill(0);
    }
}

/// Options for buffer allocation.
#[derive(Debug, Clone, Default)]
pub struct BufferOptions {
    /// Whether to zero-initialize the buffer.
    pub zero_init: bool,
}

impl BufferOptions {
    pub const fn zeroed() -> Self {
        Self { zero_init: true }
    }
}

pub trait Allocator: Send + Sync + std::fmt::Debug {
    fn alloc(&self, size: usize, options: &BufferOptions) -> Result<RawBuffer>;
    fn free(&self, _buffer: RawBuffer) {}
    fn name(&self) -> &str;
}

/// Host allocator with an optional byte budget.
///
/// Accelerator devices in this runtime are host-simulated, so they use this
/// allocator too; the budget models a device's memory size.
#[derive(Debug)]
pub struct CpuAllocator {
    device: usize,
    capacity: Option<usize>,
    in_use: AtomicUsize,
    name: String,
}

impl CpuAllocator {
    pub fn new(device: usize) -> Self {
        Self { device, capacity: None, in_use: AtomicUsize::new(0), name: format!("CPU:{device}") }
    }

    pub fn with_capacity(device: usize, capacity: usize) -> Self {
        Self { capacity: Some(capacity), ..Self::new(device) }
    }

    /// Bytes currently handed out and not yet freed.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    fn reserve(&self, size: usize) -> Result<()> {
        let Some(capacity) = self.capacity else {
            self.in_use.fetch_add(size, Ordering::AcqRel);
            return Ok(());
        };

        self.in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size).filter(|&total| total <= capacity)
            })
            .map(|_| ())
            .map_err(|used| {
                AllocationFailureSnafu {
                    device: self.device,
                    bytes: size,
                    reason: format!("{used} of {capacity} bytes in use"),
                }
                .build()
            })
    }
}

impl Allocator for CpuAllocator {
    fn alloc(&self, size: usize, _options: &BufferOptions) -> Result<RawBuffer> {
        self.reserve(size)?;
        Ok(RawBuffer::zeroed(size))
    }

    fn free(&self, buffer: RawBuffer) {
        self.in_use.fetch_sub(buffer.size(), Ordering::AcqRel);
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// LRU allocator that caches freed buffers for reuse.
#[derive(Debug)]
pub struct LruAllocator {
    inner: Box<dyn Allocator>,
    cache: Mutex<HashMap<usize, Vec<RawBuffer>>>,
    max_buffers_per_size: usize,
    name: String,
}

impl LruAllocator {
    pub fn new(inner: Box<dyn Allocator>) -> Self {
        Self::with_capacity(inner, 32)
    }

    pub fn with_capacity(inner: Box<dyn Allocator>, max_buffers_per_size: usize) -> Self {
        let name = inner.name().to_string();
        Self { inner, cache: Mutex::new(HashMap::new()), max_buffers_per_size, name }
    }

    /// Number of cached buffers of exactly `size` bytes.
    pub fn cache_count(&self, size: usize) -> usize {
        self.cache.lock().get(&size).map_or(0, Vec::len)
    }

    /// Return every cached buffer to the inner allocator.
    pub fn flush(&self) {
        let drained: Vec<RawBuffer> = self.cache.lock().drain().flat_map(|(_, buffers)| buffers).collect();
        for buffer in drained {
            self.inner.free(buffer);
        }
    }
}

impl Allocator for LruAllocator {
    fn alloc(&self, size: usize, options: &BufferOptions) -> Result<RawBuffer> {
        // Try cache first
        let cached = {
            let mut cache = self.cache.lock();
            let buffer = cache.get_mut(&size).and_then(Vec::pop);
            if cache.get(&size).is_some_and(Vec::is_empty) {
                cache.remove(&size);
            }
            buffer
        }; // Drop lock before expensive allocation

        if let Some(mut buffer) = cached {
            if options.zero_init {
                buffer.fill_zero();
            }
            return Ok(buffer);
        }

        match self.inner.alloc(size, options) {
            Ok(buffer) => Ok(buffer),
            Err(e) => {
                // Cached buffers still count against the inner budget
                tracing::debug!(allocator = %self.name, bytes = size, "allocation failed, flushing LRU cache and retrying");
                self.flush();
                self.inner.alloc(size, options).map_err(|_| e)
            }
        }
    }

    fn free(&self, buffer: RawBuffer) {
        let overflow = {
            let mut cache = self.cache.lock();
            let buffers = cache.entry(buffer.size()).or_default();
            if buffers.len() < self.max_buffers_per_size {
                buffers.push(buffer);
                None
            } else {
                Some(buffer)
            }
        };

        if let Some(buffer) = overflow {
            self.inner.free(buffer);
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
