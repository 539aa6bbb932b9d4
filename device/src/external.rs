//! Zero-copy wrappers for memory the runtime does not own.
//!
//! Host arrays, memory-mapped files and foreign buffers can back a buffer's
//! host replica directly. The registry never frees such memory; dropping the
//! wrapper only drops the registry's handle to it (an `Arc` clone, a mapping,
//! or nothing at all for [`RawRegion`]).

use std::sync::Arc;

use tessel_dtype::Element;

/// Read-only external memory.
pub trait ExternalMemory: Send + Sync + 'static {
    fn as_bytes(&self) -> &[u8];
}

/// Writable external memory.
pub trait ExternalMemoryMut: ExternalMemory {
    fn as_bytes_mut(&mut self) -> &mut [u8];
}

impl<T: Element> ExternalMemory for Vec<T> {
    fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(self.as_slice())
    }
}

impl<T: Element> ExternalMemoryMut for Vec<T> {
    fn as_bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(self.as_mut_slice())
    }
}

impl<T: Element> ExternalMemory for Box<[T]> {
    fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self[..])
    }
}

impl<T: Element> ExternalMemoryMut for Box<[T]> {
    fn as_bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(&mut self[..])
    }
}

impl<T: Element> ExternalMemory for Arc<[T]> {
    fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self[..])
    }
}

impl<T: Element> ExternalMemory for &'static [T] {
    fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(self)
    }
}

impl ExternalMemory for memmap2::Mmap {
    fn as_bytes(&self) -> &[u8] {
        self
    }
}

impl ExternalMemory for memmap2::MmapMut {
    fn as_bytes(&self) -> &[u8] {
        self
    }
}

impl ExternalMemoryMut for memmap2::MmapMut {
    fn as_bytes_mut(&mut self) -> &mut [u8] {
        self
    }
}

/// A foreign memory region described by a pointer and a byte length.
#[derive(Debug)]
pub struct RawRegion {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the constructor's contract makes the region valid for shared and
// exclusive access from any thread for as long as the wrapper lives.
unsafe impl Send for RawRegion {}
unsafe impl Sync for RawRegion {}

impl RawRegion {
    /// Describe `len` bytes starting at `ptr`.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    /// - `ptr` is non-null and valid for reads (and writes, if wrapped as mutable) of `len` bytes
    /// - the region outlives every buffer created from it and every view of those buffers
    /// - nothing outside the registry mutates the region while a buffer references it
    pub unsafe fn new(ptr: *mut u8, len: usize) -> Self {
        Self { ptr, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl ExternalMemory for RawRegion {
    fn as_bytes(&self) -> &[u8] {
        // SAFETY: guaranteed by the contract of `RawRegion::new`.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl ExternalMemoryMut for RawRegion {
    fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: guaranteed by the contract of `RawRegion::new`.
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}
