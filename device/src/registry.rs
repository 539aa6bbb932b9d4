//! The buffer registry: handles, replicas, and the coherence protocol.
//!
//! Every logical buffer is a [`BufferDescriptor`] in the registry's table,
//! keyed by a [`BufferId`]. Physical replicas are allocated lazily, on the
//! first `read`/`read_write` that targets a device, and brought up to date by
//! comparing their version with the descriptor's master version.
//!
//! # Locking
//!
//! One mutex guards the whole table. It is held for bookkeeping only:
//! transfers are submitted to device queues and return a [`Completion`] that
//! the returned view waits on, so a slow copy never blocks unrelated buffer
//! operations. Transfers that involve an accelerator run on the
//! accelerator's queue; the host has no copy engine of its own.
//!
//! Queues that run commands inline get a placeholder [`Completion`] under the
//! lock; the copy itself runs once the lock is released.
//!
//! # Failed transfers
//!
//! A copy that fails leaves its destination replica current but faulted, and
//! every view of it reports the failure. The next access to the buffer marks
//! such replicas stale so they are copied again, and hands the master back to
//! the newest intact replica if the master's own replica is the faulted one.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;
use snafu::{OptionExt, ensure};
use tessel_dtype::{Element, ScalarDType};

use crate::allocator::BufferOptions;
use crate::config::RegistryConfig;
use crate::descriptor::{BufferDescriptor, Replica, STALE_VERSION};
use crate::device::Device;
use crate::error::{
    Error, InvalidDeviceSnafu, InvalidHandleSnafu, OutOfBoundsSnafu, ReadOnlyViolationSnafu, Result, SizeOverflowSnafu,
    UnsupportedSnafu,
};
use crate::external::{ExternalMemory, ExternalMemoryMut};
use crate::memory::{Addressing, DeviceMemory};
use crate::queue::{Command, Completion, DeviceQueue};
use crate::streaming::{BufferStream, StreamPipeline};
use crate::sync::{QueueSignal, TimelineSignal};
use crate::view::{ReadView, ReleaseHook, WriteView};

/// Opaque handle of a logical buffer.
///
/// Ids are issued from a per-registry counter and never reused, so a released
/// id stays invalid for the registry's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl BufferId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for BufferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

/// Counters for tooling and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Device memory records allocated by the registry.
    pub allocations: u64,
    /// Device-to-device transfers submitted.
    pub copies: u64,
    pub bytes_copied: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Table {
    next_id: u64,
    pub buffers: HashMap<BufferId, BufferDescriptor>,
    /// Constant cache, keyed by element type and zero-extended bit pattern.
    pub constants: HashMap<(ScalarDType, u64), BufferId>,
    pub stats: RegistryStats,
}

impl Table {
    fn next_id(&mut self) -> BufferId {
        let id = BufferId(self.next_id);
        self.next_id += 1;
        id
    }

    fn insert(&mut self, descriptor: BufferDescriptor) -> BufferId {
        let id = self.next_id();
        self.buffers.insert(id, descriptor);
        id
    }

    pub fn get(&self, id: BufferId) -> Result<&BufferDescriptor> {
        self.buffers.get(&id).context(InvalidHandleSnafu { id })
    }

    pub fn get_mut(&mut self, id: BufferId) -> Result<&mut BufferDescriptor> {
        self.buffers.get_mut(&id).context(InvalidHandleSnafu { id })
    }
}

/// A copy bound for an inline queue, run after the table lock is released.
///
/// Its placeholder completion is already recorded in the table; running the
/// copy completes or faults it. Dropping an unrun copy faults it.
#[must_use]
struct PendingCopy {
    queue: Arc<dyn DeviceQueue>,
    command: Option<Command>,
    signal: Arc<QueueSignal>,
}

impl PendingCopy {
    fn run(mut self) -> Result<()> {
        let Some(command) = self.command.take() else {
            return Ok(());
        };
        match self.queue.submit(command).and_then(|completion| completion.wait()) {
            Ok(()) => {
                self.signal.set(1);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(device = self.queue.device(), error = %e, "inline copy failed");
                let reason = match &e {
                    Error::DeviceTransferFailure { reason } => reason.clone(),
                    other => other.to_string(),
                };
                self.signal.fail(1, reason);
                Err(e)
            }
        }
    }
}

impl Drop for PendingCopy {
    fn drop(&mut self) {
        if self.command.take().is_some() {
            self.signal.fail(1, "copy abandoned before it ran");
        }
    }
}

/// Table of logical buffers shared by every device of one runtime.
pub struct BufferRegistry {
    devices: Vec<Device>,
    pub(crate) table: Mutex<Table>,
}

impl std::fmt::Debug for BufferRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.table.lock();
        f.debug_struct("BufferRegistry")
            .field("devices", &self.devices.len())
            .field("buffers", &table.buffers.len())
            .field("stats", &table.stats)
            .finish()
    }
}

impl Default for BufferRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl BufferRegistry {
    /// Create a registry with a host device and `config.accelerators` accelerators.
    pub fn new(config: RegistryConfig) -> Self {
        let mut devices = Vec::with_capacity(config.accelerators + 1);
        devices.push(Device::host(config.host_capacity, config.lru_depth));
        devices.extend(
            (1..=config.accelerators).map(|index| Device::accelerator(index, config.device_capacity, config.lru_depth)),
        );
        tracing::debug!(devices = devices.len(), "buffer registry created");
        Self { devices, table: Mutex::new(Table::default()) }
    }

    /// Create a registry over custom devices.
    ///
    /// Device `i` must have index `i`, and device 0 must be a unified host device.
    pub fn with_devices(devices: Vec<Device>) -> Result<Self> {
        let host = devices.first().context(InvalidDeviceSnafu { device: "registry needs a host device" })?;
        ensure!(
            host.addressing() == Addressing::Unified,
            InvalidDeviceSnafu { device: format!("device 0 ({}) is not host-addressable", host.spec()) }
        );
        if let Some((position, device)) = devices.iter().enumerate().find(|(position, device)| device.index() != *position)
        {
            return InvalidDeviceSnafu { device: format!("device {} registered at position {position}", device.index()) }
                .fail();
        }
        Ok(Self { devices, table: Mutex::new(Table::default()) })
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device(&self, index: usize) -> Result<&Device> {
        self.devices.get(index).context(InvalidDeviceSnafu { device: index.to_string() })
    }

    /// Queue a transfer between two devices runs on.
    fn transfer_queue(&self, src: usize, dst: usize) -> &Arc<dyn DeviceQueue> {
        let device = if dst != 0 { dst } else { src };
        self.devices[device].queue()
    }

    /// Register a buffer of `count` elements. No memory is allocated until first access.
    pub fn create_buffer(&self, dtype: ScalarDType, count: usize, name: impl Into<String>) -> Result<BufferId> {
        let byte_count = dtype.byte_count(count).context(SizeOverflowSnafu { count, element_size: dtype.bytes() })?;
        let name = name.into();
        let id = self.table.lock().insert(BufferDescriptor::new(name.clone(), byte_count));
        tracing::debug!(buffer = %id, %name, %dtype, count, byte_count, "buffer created");
        Ok(id)
    }

    /// Register caller-owned memory as an immutable buffer, without copying.
    pub fn create_reference(&self, memory: impl ExternalMemory, name: impl Into<String>) -> BufferId {
        let memory = Arc::new(DeviceMemory::external(Box::new(memory)));
        self.insert_reference(memory, name.into(), true)
    }

    /// Register caller-owned memory as a writable buffer, without copying.
    pub fn create_mutable_reference(&self, memory: impl ExternalMemoryMut, name: impl Into<String>) -> BufferId {
        let memory = Arc::new(DeviceMemory::external_mut(Box::new(memory)));
        self.insert_reference(memory, name.into(), false)
    }

    fn insert_reference(&self, memory: Arc<DeviceMemory>, name: String, read_only: bool) -> BufferId {
        let byte_count = memory.len();
        let id = self.table.lock().insert(BufferDescriptor::reference(name.clone(), memory, read_only));
        tracing::debug!(buffer = %id, %name, byte_count, read_only, "external reference created");
        id
    }

    /// Create an independent copy of `id` on `device` (default: its master device).
    ///
    /// The copy is queued; views of the duplicate wait for it. The duplicate starts
    /// at version 0 with a reference count of 1.
    pub fn duplicate(&self, id: BufferId, device: Option<usize>) -> Result<BufferId> {
        let (duplicate, pending) = {
            let mut table = self.table.lock();
            let Table { buffers, stats, .. } = &mut *table;
            let descriptor = buffers.get_mut(&id).context(InvalidHandleSnafu { id })?;
            ensure!(
                descriptor.stream.is_none(),
                UnsupportedSnafu { operation: format!("duplicating streaming buffer {id}") }
            );

            let target = device.unwrap_or(descriptor.master_device);
            self.device(target)?;
            Self::discard_failed(id, descriptor);
            let source = descriptor.source();
            let options = BufferOptions { zero_init: source.is_none() };
            let memory = self.devices[target].allocate(descriptor.byte_count, &options)?;
            stats.allocations += 1;

            let mut replica = Replica::new(target, Arc::clone(&memory), 0);
            let mut pending = None;
            if let Some(index) = source {
                let src = &descriptor.replicas[index];
                let from = src.device;
                let (ready, copy) = self.submit_copy(
                    from,
                    target,
                    Command::Copy { src: Arc::clone(&src.memory), dst: memory, after: src.ready.clone() },
                )?;
                stats.copies += 1;
                stats.bytes_copied += descriptor.byte_count as u64;
                tracing::debug!(buffer = %id, from, to = target, bytes = descriptor.byte_count, "duplicate copy submitted");

                // Writers of the source wait until the copy has read it
                descriptor.replicas[index].outstanding.push(ready.clone());
                replica.ready = ready;
                pending = copy;
            }

            let mut fresh = BufferDescriptor::new(descriptor.name.clone(), descriptor.byte_count);
            fresh.read_only = descriptor.read_only;
            fresh.master_device = target;
            fresh.replicas.push(replica);
            (table.insert(fresh), pending)
        };

        if let Some(copy) = pending
            && let Err(e) = copy.run()
        {
            if let Err(release) = self.release(duplicate) {
                tracing::warn!(buffer = %duplicate, error = %release, "releasing failed duplicate failed");
            }
            return Err(e);
        }
        tracing::debug!(source = %id, buffer = %duplicate, "buffer duplicated");
        Ok(duplicate)
    }

    /// Add a reference to `id`.
    pub fn retain(&self, id: BufferId) -> Result<()> {
        let mut table = self.table.lock();
        let descriptor = table.get_mut(id)?;
        descriptor.ref_count += 1;
        tracing::trace!(buffer = %id, ref_count = descriptor.ref_count, "buffer retained");
        Ok(())
    }

    /// Drop a reference to `id`; the last one frees every replica.
    ///
    /// Releasing an id that is no longer registered is a double free and
    /// reports [`InvalidHandle`](crate::Error::InvalidHandle).
    pub fn release(&self, id: BufferId) -> Result<()> {
        let descriptor = {
            let mut table = self.table.lock();
            let Table { buffers, constants, .. } = &mut *table;
            match buffers.entry(id) {
                Entry::Vacant(_) => {
                    tracing::error!(buffer = %id, "release of unknown or already released buffer");
                    return InvalidHandleSnafu { id }.fail();
                }
                Entry::Occupied(mut entry) => {
                    let descriptor = entry.get_mut();
                    descriptor.ref_count -= 1;
                    if descriptor.ref_count > 0 {
                        tracing::trace!(buffer = %id, ref_count = descriptor.ref_count, "buffer reference dropped");
                        return Ok(());
                    }
                    let descriptor = entry.remove();
                    constants.retain(|_, cached| *cached != id);
                    descriptor
                }
            }
        };

        let name = descriptor.name.clone();
        let result = match &descriptor.stream {
            Some(stream) => stream.close(format!("buffer {id} released")),
            None => Ok(()),
        };
        let replicas = descriptor.replicas.len();
        for replica in descriptor.replicas {
            self.free_replica(id, replica);
        }
        tracing::debug!(buffer = %id, %name, replicas, "buffer released");
        result
    }

    /// Hand a replica's memory back, after any work already queued on its device.
    fn free_replica(&self, id: BufferId, replica: Replica) {
        if replica.memory.addressing() == Addressing::Unified {
            return;
        }
        if let Err(e) = self.devices[replica.device].queue().submit(Command::Free { memory: replica.memory }) {
            tracing::warn!(buffer = %id, device = replica.device, error = %e, "deferred free failed, freeing now");
        }
    }

    /// Free the replica of `id` on `device`. Returns whether one existed.
    ///
    /// The only current replica cannot be evicted; evicting the master's replica
    /// moves the master to another current replica.
    pub fn evict(&self, id: BufferId, device: usize) -> Result<bool> {
        self.device(device)?;
        let replica = {
            let mut table = self.table.lock();
            let descriptor = table.get_mut(id)?;
            ensure!(
                descriptor.stream.is_none(),
                UnsupportedSnafu { operation: format!("evicting from streaming buffer {id}") }
            );
            Self::discard_failed(id, descriptor);
            let Some(index) = descriptor.position(device) else {
                return Ok(false);
            };

            if descriptor.is_current(&descriptor.replicas[index]) {
                let fallback = descriptor
                    .replicas
                    .iter()
                    .find(|replica| replica.device != device && descriptor.is_current(replica))
                    .map(|replica| replica.device)
                    .context(UnsupportedSnafu { operation: format!("evicting the only current replica of {id}") })?;
                if descriptor.master_device == device {
                    descriptor.master_device = fallback;
                }
            }
            descriptor.replicas.remove(index)
        };

        tracing::debug!(buffer = %id, device, bytes = replica.memory.len(), "replica evicted");
        self.free_replica(id, replica);
        Ok(true)
    }

    /// Synchronized immutable view of `count` elements starting at `offset`.
    ///
    /// Allocates the replica on `device` if it has none, and queues a copy from
    /// the current master if it is stale. Master device and version are unchanged.
    pub fn read<T: Element>(&self, id: BufferId, offset: usize, count: usize, device: usize) -> Result<ReadView<T>> {
        self.device(device)?;
        let mut table = self.table.lock();
        let Table { buffers, stats, .. } = &mut *table;
        let descriptor = buffers.get_mut(&id).context(InvalidHandleSnafu { id })?;
        if let Some(stream) = descriptor.stream.clone() {
            drop(table);
            return self.read_stream(&stream, offset, count, device);
        }

        Self::check_range::<T>(descriptor, offset, count)?;
        Self::discard_failed(id, descriptor);
        let index = self.ensure_replica(id, descriptor, stats, device)?;
        let pending = self.refresh(id, descriptor, stats, index)?;

        let replica = &descriptor.replicas[index];
        let view = ReadView::new(
            Arc::clone(&replica.memory),
            replica.read_dependencies(),
            offset * size_of::<T>(),
            count,
            None,
        );
        drop(table);
        if let Some(copy) = pending {
            copy.run()?;
        }
        Ok(view)
    }

    /// Mutable view of `count` elements starting at `offset`, making `device` the master.
    ///
    /// Unless `will_overwrite` is set, the replica is synchronized first so the
    /// bytes outside (and inside) the range stay coherent. With `will_overwrite`
    /// the caller promises to overwrite the whole range and synchronization is
    /// skipped.
    pub fn read_write<T: Element>(
        &self,
        id: BufferId,
        offset: usize,
        count: usize,
        device: usize,
        will_overwrite: bool,
    ) -> Result<WriteView<T>> {
        self.device(device)?;
        let mut table = self.table.lock();
        let Table { buffers, stats, .. } = &mut *table;
        let descriptor = buffers.get_mut(&id).context(InvalidHandleSnafu { id })?;
        ensure!(!descriptor.read_only, ReadOnlyViolationSnafu { name: descriptor.name.clone() });
        if let Some(stream) = descriptor.stream.clone() {
            drop(table);
            return self.write_stream(&stream, offset, count, device);
        }

        let len = Self::check_range::<T>(descriptor, offset, count)?;
        if will_overwrite && (offset != 0 || count != len) {
            tracing::warn!(
                buffer = %id,
                offset,
                count,
                len,
                "partial overwrite skips synchronization, bytes outside the range are unspecified"
            );
        }

        Self::discard_failed(id, descriptor);
        let index = self.ensure_replica(id, descriptor, stats, device)?;
        let pending = if will_overwrite { None } else { self.refresh(id, descriptor, stats, index)? };

        descriptor.master_device = device;
        descriptor.master_version += 1;
        let version = descriptor.master_version;
        let replica = &mut descriptor.replicas[index];
        replica.version = version;
        tracing::trace!(buffer = %id, device, version, "write access granted");

        let view = WriteView::new(
            Arc::clone(&replica.memory),
            replica.read_dependencies(),
            replica.pending_readers(),
            offset * size_of::<T>(),
            count,
            None,
        );
        drop(table);
        if let Some(copy) = pending {
            copy.run()?;
        }
        Ok(view)
    }

    /// Element count of the descriptor for `T`, after checking `offset + count` against it.
    fn check_range<T: Element>(descriptor: &BufferDescriptor, offset: usize, count: usize) -> Result<usize> {
        let len = descriptor.byte_count / size_of::<T>();
        ensure!(offset.checked_add(count).is_some_and(|end| end <= len), OutOfBoundsSnafu { offset, count, len });
        Ok(len)
    }

    fn discard_failed(id: BufferId, descriptor: &mut BufferDescriptor) {
        let reset = descriptor.discard_failed();
        if !reset.is_empty() {
            tracing::warn!(
                buffer = %id,
                devices = ?reset.as_slice(),
                master = descriptor.master_device,
                "replicas behind failed transfers marked stale"
            );
        }
    }

    /// Index of the replica on `device`, allocating it if absent.
    fn ensure_replica(
        &self,
        id: BufferId,
        descriptor: &mut BufferDescriptor,
        stats: &mut RegistryStats,
        device: usize,
    ) -> Result<usize> {
        if let Some(index) = descriptor.position(device) {
            return Ok(index);
        }

        // Never-written buffers read as zeros
        let zeroed = descriptor.source().is_none();
        let memory = self.devices[device].allocate(descriptor.byte_count, &BufferOptions { zero_init: zeroed })?;
        stats.allocations += 1;
        let version = if zeroed { descriptor.master_version } else { STALE_VERSION };
        descriptor.replicas.push(Replica::new(device, memory, version));
        tracing::debug!(buffer = %id, device, bytes = descriptor.byte_count, zeroed, "replica allocated");
        Ok(descriptor.replicas.len() - 1)
    }

    /// Queue a copy that brings the replica at `index` to the master version.
    ///
    /// Returns the copy when its queue runs inline; the caller runs it after
    /// unlocking the table.
    fn refresh(
        &self,
        id: BufferId,
        descriptor: &mut BufferDescriptor,
        stats: &mut RegistryStats,
        index: usize,
    ) -> Result<Option<PendingCopy>> {
        let target = &descriptor.replicas[index];
        if descriptor.is_current(target) {
            tracing::trace!(buffer = %id, device = target.device, "replica current");
            return Ok(None);
        }
        let Some(source) = descriptor.source() else {
            descriptor.replicas[index].version = descriptor.master_version;
            return Ok(None);
        };

        let (src, dst) = (&descriptor.replicas[source], &descriptor.replicas[index]);
        let (from, to) = (src.device, dst.device);
        let (completion, pending) = self.submit_copy(
            from,
            to,
            Command::Copy { src: Arc::clone(&src.memory), dst: Arc::clone(&dst.memory), after: src.ready.clone() },
        )?;
        stats.copies += 1;
        stats.bytes_copied += descriptor.byte_count as u64;
        tracing::debug!(buffer = %id, from, to, bytes = descriptor.byte_count, "replica synchronization submitted");

        descriptor.replicas[source].outstanding.push(completion.clone());
        let version = descriptor.master_version;
        let replica = &mut descriptor.replicas[index];
        replica.ready = completion;
        replica.version = version;
        Ok(pending)
    }

    /// Submit a copy from device `from` to device `to`, or defer it if its queue runs inline.
    fn submit_copy(&self, from: usize, to: usize, command: Command) -> Result<(Completion, Option<PendingCopy>)> {
        let queue = self.transfer_queue(from, to);
        if !queue.runs_inline() {
            return Ok((queue.submit(command)?, None));
        }
        let signal = Arc::new(QueueSignal::new());
        let completion = Completion::pending(Arc::clone(&signal), 1);
        Ok((completion, Some(PendingCopy { queue: Arc::clone(queue), command: Some(command), signal })))
    }

    /// Diagnostic name of `id`.
    pub fn buffer_name(&self, id: BufferId) -> Result<String> {
        Ok(self.table.lock().get(id)?.name.clone())
    }

    pub fn byte_count(&self, id: BufferId) -> Result<usize> {
        Ok(self.table.lock().get(id)?.byte_count)
    }

    pub fn is_read_only(&self, id: BufferId) -> Result<bool> {
        Ok(self.table.lock().get(id)?.read_only)
    }

    pub fn master_device(&self, id: BufferId) -> Result<usize> {
        Ok(self.table.lock().get(id)?.master_device)
    }

    pub fn master_version(&self, id: BufferId) -> Result<i64> {
        Ok(self.table.lock().get(id)?.master_version)
    }

    /// Devices holding a replica of `id`, ascending.
    pub fn replica_devices(&self, id: BufferId) -> Result<Vec<usize>> {
        let table = self.table.lock();
        let mut devices: Vec<usize> = table.get(id)?.replicas.iter().map(|replica| replica.device).collect();
        devices.sort_unstable();
        Ok(devices)
    }

    /// Version of the replica of `id` on `device`, if allocated.
    pub fn replica_version(&self, id: BufferId, device: usize) -> Result<Option<i64>> {
        Ok(self.table.lock().get(id)?.replica(device).map(|replica| replica.version))
    }

    pub fn ref_count(&self, id: BufferId) -> Result<usize> {
        Ok(self.table.lock().get(id)?.ref_count)
    }

    pub fn contains(&self, id: BufferId) -> bool {
        self.table.lock().buffers.contains_key(&id)
    }

    /// Number of live buffers.
    pub fn len(&self) -> usize {
        self.table.lock().buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> RegistryStats {
        self.table.lock().stats
    }

    /// Wait for every queued transfer on every device.
    pub fn synchronize(&self) -> Result<()> {
        self.devices.iter().try_for_each(|device| device.queue().synchronize())
    }

    /// Register a streaming buffer over `stream`.
    ///
    /// Each block holds `block_shape`'s element count of `dtype`; the ring keeps
    /// `buffered_blocks` of them on the host. Returns the handle and the stream's
    /// block count ([`UNBOUNDED_BLOCKS`](crate::UNBOUNDED_BLOCKS) for endless streams).
    pub fn create_streaming_buffer(
        &self,
        dtype: ScalarDType,
        block_shape: &[usize],
        buffered_blocks: usize,
        stream: impl BufferStream,
    ) -> Result<(BufferId, usize)> {
        let elements = block_shape
            .iter()
            .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
            .context(SizeOverflowSnafu { count: usize::MAX, element_size: dtype.bytes() })?;
        let block_bytes =
            dtype.byte_count(elements).context(SizeOverflowSnafu { count: elements, element_size: dtype.bytes() })?;
        ensure!(
            buffered_blocks > 0 && block_bytes > 0,
            UnsupportedSnafu { operation: "streaming buffer with empty blocks or no buffered blocks" }
        );
        let read_only = !stream.is_mutable();

        let (id, slots) = {
            let mut table = self.table.lock();
            let slots = (0..buffered_blocks)
                .map(|_| self.devices[0].allocate(block_bytes, &BufferOptions::zeroed()))
                .collect::<Result<Vec<_>>>()?;
            table.stats.allocations += buffered_blocks as u64;
            (table.next_id(), slots)
        };

        let pipeline = StreamPipeline::start(id, slots, block_bytes, Box::new(stream))?;
        let total_blocks = pipeline.total_blocks();
        let mut descriptor = BufferDescriptor::new(format!("stream {id}"), block_bytes.saturating_mul(total_blocks));
        descriptor.read_only = read_only;
        descriptor.stream = Some(pipeline);
        self.table.lock().buffers.insert(id, descriptor);
        Ok((id, total_blocks))
    }

    fn stream(&self, id: BufferId) -> Result<Arc<StreamPipeline>> {
        let table = self.table.lock();
        let descriptor = table.get(id)?;
        descriptor
            .stream
            .clone()
            .context(UnsupportedSnafu { operation: format!("block access on non-streaming buffer {id}") })
    }

    /// Block index and byte offset inside it of an element range of a streaming buffer.
    fn block_window<T: Element>(stream: &StreamPipeline, offset: usize, count: usize) -> Result<(usize, usize)> {
        let block_bytes = stream.block_bytes();
        let len = block_bytes / size_of::<T>();
        let byte_offset = offset.checked_mul(size_of::<T>()).context(OutOfBoundsSnafu { offset, count, len })?;
        let start = byte_offset % block_bytes;
        ensure!(
            count.checked_mul(size_of::<T>()).is_some_and(|bytes| start + bytes <= block_bytes),
            OutOfBoundsSnafu { offset: start / size_of::<T>(), count, len }
        );
        Ok((byte_offset / block_bytes, start))
    }

    fn check_stream_device(device: usize) -> Result<()> {
        ensure!(device == 0, InvalidDeviceSnafu { device: format!("{device} (streaming buffers live on the host)") });
        Ok(())
    }

    fn release_hook(stream: &Arc<StreamPipeline>, slot: usize, write: bool) -> Option<ReleaseHook> {
        let stream = Arc::clone(stream);
        Some(Box::new(move || stream.unpin(slot, write)))
    }

    fn read_stream<T: Element>(
        &self,
        stream: &Arc<StreamPipeline>,
        offset: usize,
        count: usize,
        device: usize,
    ) -> Result<ReadView<T>> {
        Self::check_stream_device(device)?;
        let (block, start) = Self::block_window::<T>(stream, offset, count)?;
        let slot = stream.acquire(block, false)?;
        let memory = Arc::clone(stream.slot_memory(slot));
        Ok(ReadView::new(memory, SmallVec::new(), start, count, Self::release_hook(stream, slot, false)))
    }

    fn write_stream<T: Element>(
        &self,
        stream: &Arc<StreamPipeline>,
        offset: usize,
        count: usize,
        device: usize,
    ) -> Result<WriteView<T>> {
        Self::check_stream_device(device)?;
        let (block, start) = Self::block_window::<T>(stream, offset, count)?;
        let slot = stream.acquire(block, true)?;
        let memory = Arc::clone(stream.slot_memory(slot));
        Ok(WriteView::new(memory, SmallVec::new(), SmallVec::new(), start, count, Self::release_hook(stream, slot, true)))
    }

    /// View of block `block` of a streaming buffer, waiting until it is produced.
    ///
    /// Dropping the view retires the block.
    pub fn read_block<T: Element>(&self, id: BufferId, block: usize) -> Result<ReadView<T>> {
        let stream = self.stream(id)?;
        let count = stream.block_bytes() / size_of::<T>();
        let slot = stream.acquire(block, false)?;
        let memory = Arc::clone(stream.slot_memory(slot));
        Ok(ReadView::new(memory, SmallVec::new(), 0, count, Self::release_hook(&stream, slot, false)))
    }

    /// Mutable view of block `block` of a mutable streaming buffer.
    ///
    /// Waits until the block is resident and unpinned; dropping the view marks it
    /// dirty for write back.
    pub fn read_write_block<T: Element>(&self, id: BufferId, block: usize) -> Result<WriteView<T>> {
        let stream = {
            let table = self.table.lock();
            let descriptor = table.get(id)?;
            ensure!(!descriptor.read_only, ReadOnlyViolationSnafu { name: descriptor.name.clone() });
            descriptor
                .stream
                .clone()
                .context(UnsupportedSnafu { operation: format!("block access on non-streaming buffer {id}") })?
        };
        let count = stream.block_bytes() / size_of::<T>();
        let slot = stream.acquire(block, true)?;
        let memory = Arc::clone(stream.slot_memory(slot));
        Ok(WriteView::new(memory, SmallVec::new(), SmallVec::new(), 0, count, Self::release_hook(&stream, slot, true)))
    }

    /// Write modified blocks of a streaming buffer back to its stream.
    pub fn flush_stream(&self, id: BufferId) -> Result<()> {
        self.stream(id)?.flush()
    }

    /// Close a streaming buffer's pipeline without releasing the handle.
    ///
    /// Blocked and later block requests fail with `StreamClosed`.
    pub fn close_stream(&self, id: BufferId) -> Result<()> {
        self.stream(id)?.close(format!("buffer {id} closed"))
    }
}

impl Drop for BufferRegistry {
    fn drop(&mut self) {
        let streams: Vec<(BufferId, Arc<StreamPipeline>)> = self
            .table
            .get_mut()
            .buffers
            .iter()
            .filter_map(|(id, descriptor)| descriptor.stream.clone().map(|stream| (*id, stream)))
            .collect();
        for (id, stream) in streams {
            if let Err(e) = stream.close("registry dropped") {
                tracing::warn!(buffer = %id, error = %e, "closing stream on registry drop failed");
            }
        }
    }
}
