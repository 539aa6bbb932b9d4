use std::sync::Arc;

use tessel_dtype::Element;

use crate::error::Result;
use crate::registry::{BufferId, BufferRegistry};
use crate::view::{ReadView, WriteView};

/// Reference-counted handle for the tensor layer.
///
/// Cloning retains the buffer and dropping releases it, so the registry frees
/// the replicas once the last tensor view referencing the buffer is gone.
#[derive(Debug)]
pub struct SharedBuffer {
    registry: Arc<BufferRegistry>,
    id: BufferId,
}

impl SharedBuffer {
    /// Take ownership of one reference to `id`.
    pub fn new(registry: Arc<BufferRegistry>, id: BufferId) -> Self {
        Self { registry, id }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn registry(&self) -> &Arc<BufferRegistry> {
        &self.registry
    }

    /// Whether other handles reference the same buffer.
    pub fn is_shared(&self) -> Result<bool> {
        Ok(self.registry.ref_count(self.id)? > 1)
    }

    pub fn read<T: Element>(&self, offset: usize, count: usize, device: usize) -> Result<ReadView<T>> {
        self.registry.read(self.id, offset, count, device)
    }

    pub fn read_write<T: Element>(
        &self,
        offset: usize,
        count: usize,
        device: usize,
        will_overwrite: bool,
    ) -> Result<WriteView<T>> {
        self.registry.read_write(self.id, offset, count, device, will_overwrite)
    }

    /// Copy-on-write: give this handle its own buffer if the current one is shared.
    ///
    /// The private copy is placed on `device`. Returns whether a copy was made.
    pub fn make_unique(&mut self, device: usize) -> Result<bool> {
        if !self.is_shared()? {
            return Ok(false);
        }
        let unique = self.registry.duplicate(self.id, Some(device))?;
        let shared = std::mem::replace(&mut self.id, unique);
        self.registry.release(shared)?;
        Ok(true)
    }
}

impl Clone for SharedBuffer {
    fn clone(&self) -> Self {
        if let Err(e) = self.registry.retain(self.id) {
            tracing::error!(buffer = %self.id, error = %e, "cloning a released buffer handle");
        }
        Self { registry: Arc::clone(&self.registry), id: self.id }
    }
}

impl Drop for SharedBuffer {
    fn drop(&mut self) {
        // Failures are already logged by the registry
        let _ = self.registry.release(self.id);
    }
}
