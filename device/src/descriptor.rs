//! Logical buffer descriptors.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::memory::DeviceMemory;
use crate::queue::Completion;
use crate::streaming::StreamPipeline;

/// Version stamp of replicas and descriptors created from external memory.
///
/// Lower than any version a write produces, so the first write anywhere is
/// always newer.
pub const REFERENCE_VERSION: i64 = -1;

/// Version of a replica whose contents are not valid and must be synchronized.
pub(crate) const STALE_VERSION: i64 = i64::MIN;

/// One device's copy of a logical buffer.
#[derive(Debug)]
pub(crate) struct Replica {
    pub device: usize,
    pub memory: Arc<DeviceMemory>,
    pub version: i64,
    /// Completes once the last transfer into `memory` has landed.
    pub ready: Completion,
    /// Transfers still reading from `memory`.
    pub outstanding: SmallVec<[Completion; 2]>,
}

impl Replica {
    pub fn new(device: usize, memory: Arc<DeviceMemory>, version: i64) -> Self {
        Self { device, memory, version, ready: Completion::ready(), outstanding: SmallVec::new() }
    }

    /// Transfers into this replica a view must see succeed.
    ///
    /// A failed transfer stays a dependency, so every view reports it.
    pub fn read_dependencies(&self) -> SmallVec<[Completion; 2]> {
        let mut dependencies = SmallVec::new();
        if !self.ready.succeeded() {
            dependencies.push(self.ready.clone());
        }
        dependencies
    }

    /// Transfers still reading from this replica. A writer waits for them to
    /// finish whatever their outcome.
    pub fn pending_readers(&mut self) -> SmallVec<[Completion; 2]> {
        self.outstanding.retain(|completion| !completion.is_complete());
        self.outstanding.clone()
    }
}

/// The logical buffer behind a [`BufferId`](crate::BufferId).
#[derive(Debug)]
pub(crate) struct BufferDescriptor {
    pub name: String,
    pub byte_count: usize,
    pub read_only: bool,
    /// At most one replica per device.
    pub replicas: SmallVec<[Replica; 2]>,
    pub master_device: usize,
    pub master_version: i64,
    pub ref_count: usize,
    pub stream: Option<Arc<StreamPipeline>>,
}

impl BufferDescriptor {
    pub fn new(name: String, byte_count: usize) -> Self {
        Self {
            name,
            byte_count,
            read_only: false,
            replicas: SmallVec::new(),
            master_device: 0,
            master_version: 0,
            ref_count: 1,
            stream: None,
        }
    }

    /// Descriptor wrapping external memory as its host replica.
    pub fn reference(name: String, memory: Arc<DeviceMemory>, read_only: bool) -> Self {
        let mut descriptor = Self::new(name, memory.len());
        descriptor.read_only = read_only;
        descriptor.master_version = REFERENCE_VERSION;
        descriptor.replicas.push(Replica::new(0, memory, REFERENCE_VERSION));
        descriptor
    }

    pub fn position(&self, device: usize) -> Option<usize> {
        self.replicas.iter().position(|replica| replica.device == device)
    }

    pub fn replica(&self, device: usize) -> Option<&Replica> {
        self.replicas.iter().find(|replica| replica.device == device)
    }

    pub fn is_current(&self, replica: &Replica) -> bool {
        replica.version == self.master_version
    }

    /// Mark replicas whose last transfer failed as stale so the next access copies again.
    ///
    /// When the master's replica failed, the newest intact replica becomes the
    /// master again: the write that made the failed replica master could not
    /// have happened, since its view waits for the transfer. Without such a
    /// replica the failed master is kept and keeps reporting the failure.
    /// Returns the devices that were reset.
    pub fn discard_failed(&mut self) -> SmallVec<[usize; 2]> {
        let mut reset = SmallVec::new();
        if !self.replicas.iter().any(|replica| replica.ready.failed()) {
            return reset;
        }

        let master_failed = self.replica(self.master_device).is_some_and(|replica| replica.ready.failed());
        let fallback = self
            .replicas
            .iter()
            .enumerate()
            .filter(|(_, replica)| !replica.ready.failed() && replica.version != STALE_VERSION)
            .max_by_key(|(_, replica)| replica.version)
            .map(|(index, _)| index);
        let master = self.master_device;
        let keep_master = master_failed && fallback.is_none();

        for replica in self
            .replicas
            .iter_mut()
            .filter(|replica| replica.ready.failed() && !(keep_master && replica.device == master))
        {
            replica.version = STALE_VERSION;
            replica.ready = Completion::ready();
            reset.push(replica.device);
        }
        if master_failed && let Some(index) = fallback {
            let replica = &mut self.replicas[index];
            replica.version = self.master_version;
            self.master_device = replica.device;
        }
        reset
    }

    /// Index of the replica a stale device synchronizes from.
    ///
    /// The master's replica when it is current, otherwise any current replica.
    /// `None` when no replica holds the current version: the buffer was never
    /// written and reads as zeros.
    pub fn source(&self) -> Option<usize> {
        self.position(self.master_device)
            .filter(|&index| self.is_current(&self.replicas[index]))
            .or_else(|| self.replicas.iter().position(|replica| self.is_current(replica)))
    }
}
