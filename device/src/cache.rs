//! Constant cache: one read-only buffer per distinct scalar value.

use tessel_dtype::{Element, ScalarDType};

use crate::error::Result;
use crate::registry::{BufferId, BufferRegistry};

impl BufferRegistry {
    /// One-element buffer holding `value`, shared by every caller asking for it.
    ///
    /// See [`cached_buffer_bits`](Self::cached_buffer_bits).
    pub fn cached_buffer<T: Element>(&self, value: T) -> Result<BufferId> {
        self.cached_buffer_bits(T::DTYPE, value.to_bits())
    }

    /// One-element buffer of `dtype` holding the value with bit pattern `bits`.
    ///
    /// The first request for a `(dtype, bits)` pair creates the buffer, stores
    /// the value on the host, and marks the buffer read-only; later requests
    /// return the same id. The cache keeps one reference for the registry's
    /// lifetime and every call hands one more to the caller, who releases it as
    /// usual.
    pub fn cached_buffer_bits(&self, dtype: ScalarDType, bits: u64) -> Result<BufferId> {
        let bytes = dtype.bits_to_bytes(bits);
        let key = (dtype, dtype.bytes_to_bits(&bytes));

        {
            let mut table = self.table.lock();
            if let Some(id) = table.constants.get(&key).copied() {
                table.get_mut(id)?.ref_count += 1;
                table.stats.cache_hits += 1;
                tracing::trace!(buffer = %id, %dtype, bits = key.1, "constant cache hit");
                return Ok(id);
            }
            table.stats.cache_misses += 1;
        }

        let id = self.create_buffer(dtype, 1, format!("const {dtype} {:#x}", key.1))?;
        self.store_constant(id, &bytes).or_else(|e| {
            self.release(id)?;
            Err(e)
        })?;

        let mut table = self.table.lock();
        if let Some(existing) = table.constants.get(&key).copied() {
            // Another thread cached the same value first
            table.get_mut(existing)?.ref_count += 1;
            drop(table);
            self.release(id)?;
            return Ok(existing);
        }

        let descriptor = table.get_mut(id)?;
        descriptor.read_only = true;
        descriptor.ref_count += 1;
        table.constants.insert(key, id);
        tracing::debug!(buffer = %id, %dtype, bits = key.1, "constant cached");
        Ok(id)
    }

    fn store_constant(&self, id: BufferId, bytes: &[u8]) -> Result<()> {
        let view = self.read_write::<u8>(id, 0, bytes.len(), 0, true)?;
        view.copy_from_slice(bytes)
    }

    /// Number of distinct constants cached.
    pub fn cached_constants(&self) -> usize {
        self.table.lock().constants.len()
    }
}

