//! Physical device memory records.

use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::allocator::{Allocator, RawBuffer};
use crate::external::{ExternalMemory, ExternalMemoryMut};

/// How a device addresses a memory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Addressing {
    /// Host-resident memory, directly usable by device 0.
    Unified,
    /// Memory private to an accelerator.
    Discrete,
}

/// Backing bytes of a [`DeviceMemory`].
pub(crate) enum Storage {
    Owned(RawBuffer),
    External(Box<dyn ExternalMemory>),
    ExternalMut(Box<dyn ExternalMemoryMut>),
    Released,
}

impl Storage {
    pub(crate) fn as_bytes(&self) -> &[u8] {
        match self {
            Storage::Owned(raw) => raw.as_bytes(),
            Storage::External(memory) => memory.as_bytes(),
            Storage::ExternalMut(memory) => memory.as_bytes(),
            Storage::Released => &[],
        }
    }

    /// Mutable bytes, or `None` for immutable external memory.
    pub(crate) fn as_bytes_mut(&mut self) -> Option<&mut [u8]> {
        match self {
            Storage::Owned(raw) => Some(raw.as_bytes_mut()),
            Storage::ExternalMut(memory) => Some(memory.as_bytes_mut()),
            Storage::External(_) | Storage::Released => None,
        }
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Storage::Owned(raw) => f.debug_tuple("Owned").field(&raw.size()).finish(),
            Storage::External(memory) => f.debug_tuple("External").field(&memory.as_bytes().len()).finish(),
            Storage::ExternalMut(memory) => f.debug_tuple("ExternalMut").field(&memory.as_bytes().len()).finish(),
            Storage::Released => f.write_str("Released"),
        }
    }
}

/// One physical allocation on one device.
///
/// Records are shared through `Arc` by the owning descriptor, by outstanding
/// views, and by queued copies. The release action runs exactly once, when the
/// last of them lets go: owned allocations go back to the device allocator,
/// external references are left untouched.
#[derive(Debug)]
pub struct DeviceMemory {
    device: usize,
    addressing: Addressing,
    len: usize,
    storage: RwLock<Storage>,
    allocator: Option<Arc<dyn Allocator>>,
}

impl DeviceMemory {
    pub(crate) fn owned(device: usize, addressing: Addressing, raw: RawBuffer, allocator: Arc<dyn Allocator>) -> Self {
        Self { device, addressing, len: raw.size(), storage: RwLock::new(Storage::Owned(raw)), allocator: Some(allocator) }
    }

    /// Wrap caller-owned memory on the host device without copying.
    pub(crate) fn external(memory: Box<dyn ExternalMemory>) -> Self {
        let len = memory.as_bytes().len();
        Self { device: 0, addressing: Addressing::Unified, len, storage: RwLock::new(Storage::External(memory)), allocator: None }
    }

    pub(crate) fn external_mut(memory: Box<dyn ExternalMemoryMut>) -> Self {
        let len = memory.as_bytes().len();
        Self {
            device: 0,
            addressing: Addressing::Unified,
            len,
            storage: RwLock::new(Storage::ExternalMut(memory)),
            allocator: None,
        }
    }

    pub fn device(&self) -> usize {
        self.device
    }

    pub fn addressing(&self) -> Addressing {
        self.addressing
    }

    /// Size of the record in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the record wraps memory the runtime does not own.
    pub fn is_external(&self) -> bool {
        self.allocator.is_none()
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Storage> {
        self.storage.read()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Storage> {
        self.storage.write()
    }

    /// Copy the full contents of `src` into this record.
    pub(crate) fn copy_from(&self, src: &DeviceMemory) -> Result<(), String> {
        if self.len != src.len {
            return Err(format!("size mismatch: source {} bytes, destination {} bytes", src.len, self.len));
        }
        let source = src.read();
        let mut target = self.write();
        let Some(dst) = target.as_bytes_mut() else {
            return Err(format!("destination on device {} is immutable", self.device));
        };
        dst.copy_from_slice(source.as_bytes());
        Ok(())
    }
}

impl Drop for DeviceMemory {
    fn drop(&mut self) {
        let storage = std::mem::replace(self.storage.get_mut(), Storage::Released);
        // External memory stays with its owner
        if let (Storage::Owned(raw), Some(allocator)) = (storage, self.allocator.take()) {
            tracing::trace!(device = self.device, bytes = raw.size(), "returning device memory to allocator");
            allocator.free(raw);
        }
    }
}
