//! Typed views returned by `read` and `read_write`.
//!
//! A view pins the device memory record it points into and remembers the
//! transfers that must finish before its bytes are valid. Nothing blocks until
//! the caller asks for the data: [`ReadView::lock`] and [`WriteView::lock_mut`]
//! wait for those transfers, then take the record's storage lock for as long
//! as the returned guard lives.

use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};
use smallvec::SmallVec;
use snafu::ensure;
use tessel_dtype::Element;

use crate::error::{MisalignedSnafu, OutOfBoundsSnafu, Result, UnsupportedSnafu};
use crate::memory::{DeviceMemory, Storage};
use crate::queue::Completion;

/// Callback run once when a view is dropped.
pub(crate) type ReleaseHook = Box<dyn FnOnce() + Send + Sync>;

/// Byte window shared by both view kinds.
struct Window {
    memory: Arc<DeviceMemory>,
    dependencies: SmallVec<[Completion; 2]>,
    /// Transfers reading the bytes a writer is about to change.
    readers: SmallVec<[Completion; 2]>,
    offset: usize,
    len: usize,
    on_release: Option<ReleaseHook>,
}

impl Window {
    fn wait(&self) -> Result<()> {
        self.dependencies.iter().try_for_each(Completion::wait)?;
        for reader in &self.readers {
            // A failed reader is reported to whoever waits for its destination
            if let Err(e) = reader.wait() {
                tracing::trace!(error = %e, "transfer out of a written replica failed");
            }
        }
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.dependencies.iter().chain(&self.readers).all(Completion::is_complete)
    }

    fn byte_range<T: Element>(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.len * size_of::<T>()
    }

    fn check<T: Element>(&self, bytes: &[u8]) -> Result<()> {
        let range = self.byte_range::<T>();
        ensure!(
            range.end <= bytes.len(),
            OutOfBoundsSnafu { offset: self.offset / size_of::<T>(), count: self.len, len: bytes.len() / size_of::<T>() }
        );
        ensure!(
            bytemuck::try_cast_slice::<u8, T>(&bytes[range]).is_ok(),
            MisalignedSnafu { offset: self.offset, align: align_of::<T>() }
        );
        Ok(())
    }
}

impl Drop for Window {
    fn drop(&mut self) {
        if let Some(hook) = self.on_release.take() {
            hook();
        }
    }
}

impl std::fmt::Debug for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Window")
            .field("device", &self.memory.device())
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("pending", &self.dependencies.iter().chain(&self.readers).filter(|c| !c.is_complete()).count())
            .finish()
    }
}

/// Immutable, synchronized view of `len` elements of a buffer on one device.
#[derive(Debug)]
pub struct ReadView<T: Element> {
    window: Window,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Element> ReadView<T> {
    pub(crate) fn new(
        memory: Arc<DeviceMemory>,
        dependencies: SmallVec<[Completion; 2]>,
        offset: usize,
        len: usize,
        on_release: Option<ReleaseHook>,
    ) -> Self {
        let readers = SmallVec::new();
        Self { window: Window { memory, dependencies, readers, offset, len, on_release }, _marker: PhantomData }
    }

    /// Device the viewed replica lives on.
    pub fn device(&self) -> usize {
        self.window.memory.device()
    }

    /// Number of elements in the view.
    pub fn len(&self) -> usize {
        self.window.len
    }

    pub fn is_empty(&self) -> bool {
        self.window.len == 0
    }

    /// Whether every transfer into the viewed replica has completed.
    pub fn is_ready(&self) -> bool {
        self.window.is_ready()
    }

    /// Block until pending transfers into the replica have landed.
    pub fn wait(&self) -> Result<()> {
        self.window.wait()
    }

    /// Wait, then borrow the elements.
    pub fn lock(&self) -> Result<ReadGuard<'_, T>> {
        self.window.wait()?;
        let storage = self.window.memory.read();
        self.window.check::<T>(storage.as_bytes())?;
        Ok(ReadGuard { storage, range: self.window.byte_range::<T>(), _marker: PhantomData })
    }

    pub fn to_vec(&self) -> Result<Vec<T>> {
        Ok(self.lock()?.to_vec())
    }
}

/// Mutable view of `len` elements of a buffer on one device.
///
/// Obtained from `read_write`, which already made this replica the master;
/// the data written through the view is what other devices synchronize to.
#[derive(Debug)]
pub struct WriteView<T: Element> {
    window: Window,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Element> WriteView<T> {
    pub(crate) fn new(
        memory: Arc<DeviceMemory>,
        dependencies: SmallVec<[Completion; 2]>,
        readers: SmallVec<[Completion; 2]>,
        offset: usize,
        len: usize,
        on_release: Option<ReleaseHook>,
    ) -> Self {
        Self { window: Window { memory, dependencies, readers, offset, len, on_release }, _marker: PhantomData }
    }

    pub fn device(&self) -> usize {
        self.window.memory.device()
    }

    pub fn len(&self) -> usize {
        self.window.len
    }

    pub fn is_empty(&self) -> bool {
        self.window.len == 0
    }

    pub fn is_ready(&self) -> bool {
        self.window.is_ready()
    }

    pub fn wait(&self) -> Result<()> {
        self.window.wait()
    }

    pub fn lock(&self) -> Result<ReadGuard<'_, T>> {
        self.window.wait()?;
        let storage = self.window.memory.read();
        self.window.check::<T>(storage.as_bytes())?;
        Ok(ReadGuard { storage, range: self.window.byte_range::<T>(), _marker: PhantomData })
    }

    /// Wait, then borrow the elements mutably.
    pub fn lock_mut(&self) -> Result<WriteGuard<'_, T>> {
        self.window.wait()?;
        let mut storage = self.window.memory.write();
        let Some(bytes) = storage.as_bytes_mut() else {
            return UnsupportedSnafu { operation: "writing to immutable external memory" }.fail();
        };
        self.window.check::<T>(bytes)?;
        Ok(WriteGuard { storage, range: self.window.byte_range::<T>(), _marker: PhantomData })
    }

    pub fn to_vec(&self) -> Result<Vec<T>> {
        Ok(self.lock()?.to_vec())
    }

    /// Overwrite the whole view with `values`.
    pub fn copy_from_slice(&self, values: &[T]) -> Result<()> {
        ensure!(
            values.len() == self.window.len,
            OutOfBoundsSnafu { offset: 0usize, count: values.len(), len: self.window.len }
        );
        self.lock_mut()?.copy_from_slice(values);
        Ok(())
    }
}

/// Shared borrow of a view's elements.
pub struct ReadGuard<'a, T: Element> {
    storage: RwLockReadGuard<'a, Storage>,
    range: std::ops::Range<usize>,
    _marker: PhantomData<&'a [T]>,
}

impl<T: Element> Deref for ReadGuard<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // Bounds and alignment were checked when the guard was created
        bytemuck::cast_slice(&self.storage.as_bytes()[self.range.clone()])
    }
}

/// Exclusive borrow of a view's elements.
pub struct WriteGuard<'a, T: Element> {
    storage: RwLockWriteGuard<'a, Storage>,
    range: std::ops::Range<usize>,
    _marker: PhantomData<&'a mut [T]>,
}

impl<T: Element> Deref for WriteGuard<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        bytemuck::cast_slice(&self.storage.as_bytes()[self.range.clone()])
    }
}

impl<T: Element> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        let range = self.range.clone();
        match self.storage.as_bytes_mut() {
            Some(bytes) => bytemuck::cast_slice_mut(&mut bytes[range]),
            None => &mut [],
        }
    }
}
