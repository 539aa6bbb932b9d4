//! Multi-device buffer coherence for the Tessel tensor runtime.
//!
//! A logical buffer is a set of per-device replicas. The [`BufferRegistry`]
//! allocates replicas lazily on first access and keeps them coherent with
//! version stamps: every granted write bumps the buffer's master version, and a
//! device whose replica is older gets a copy queued from the master before its
//! view is handed out.
//!
//! # Module Organization
//!
//! - [`registry`] - Buffer handles, the descriptor table and the coherence protocol
//! - [`cache`] - Deduplicated read-only constant buffers
//! - [`external`] - Zero-copy wrappers for caller-owned memory
//! - [`streaming`] - Bounded read-ahead buffers over block streams
//! - [`view`] - Typed views returned by `read` / `read_write`
//! - [`handle`] - Reference-counted buffer handle for the tensor layer
//! - [`device`], [`queue`], [`sync`], [`allocator`], [`memory`] - Devices, their command queues and memory

pub mod allocator;
pub mod cache;
pub mod config;
pub mod device;
pub mod error;
pub mod external;
pub mod handle;
pub mod memory;
pub mod queue;
pub mod registry;
pub mod streaming;
pub mod sync;
pub mod view;

mod descriptor;


pub use allocator::{Allocator, BufferOptions, CpuAllocator, LruAllocator, RawBuffer};
pub use config::RegistryConfig;
pub use descriptor::REFERENCE_VERSION;
pub use device::{Device, DeviceSpecExt};
pub use error::{Error, Result};
pub use external::{ExternalMemory, ExternalMemoryMut, RawRegion};
pub use handle::SharedBuffer;
pub use memory::{Addressing, DeviceMemory};
pub use queue::{Command, Completion, DeviceQueue, HostQueue, WorkerQueue};
pub use registry::{BufferId, BufferRegistry, RegistryStats};
pub use streaming::{BufferStream, FileStream, ReaderStream, UNBOUNDED_BLOCKS};
pub use sync::{QueueSignal, TimelineSignal};
pub use view::{ReadGuard, ReadView, WriteGuard, WriteView};

pub use tessel_dtype::{DeviceSpec, Element, ScalarDType};
