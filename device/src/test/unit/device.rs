use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use test_case::test_case;

use crate::allocator::{Allocator, BufferOptions, CpuAllocator, LruAllocator};
use crate::error::DeviceTransferFailureSnafu;
use crate::test::{init_tracing, registry};
use crate::{
    Addressing, BufferRegistry, Command, Completion, Device, DeviceQueue, DeviceSpec, DeviceSpecExt, Error,
    BufferId, QueueSignal, RegistryConfig, ScalarDType, WorkerQueue,
};

#[test_case("host", DeviceSpec::Host; "host")]
#[test_case("CPU", DeviceSpec::Host; "cpu uppercase")]
#[test_case(" Host ", DeviceSpec::Host; "surrounding whitespace")]
#[test_case("accel", DeviceSpec::Accelerator { ordinal: 0 }; "accel defaults to ordinal zero")]
#[test_case("ACCEL:3", DeviceSpec::Accelerator { ordinal: 3 }; "accel with ordinal")]
#[test_case("gpu:1", DeviceSpec::Accelerator { ordinal: 1 }; "gpu alias")]
fn test_parse_device(input: &str, expected: DeviceSpec) {
    assert_eq!(<DeviceSpec as DeviceSpecExt>::parse(input).unwrap(), expected);
}

#[test_case("tpu"; "unknown kind")]
#[test_case("accel:x"; "bad ordinal")]
#[test_case("host:1"; "host has no ordinal")]
#[test_case(""; "empty")]
fn test_parse_invalid_device(input: &str) {
    assert!(matches!(<DeviceSpec as DeviceSpecExt>::parse(input), Err(Error::InvalidDevice { .. })));
}

#[test]
fn test_registry_devices() {
    let registry = BufferRegistry::new(RegistryConfig::builder().accelerators(2).build());
    let devices = registry.devices();
    assert_eq!(devices.len(), 3);
    assert_eq!(devices[0].spec(), DeviceSpec::Host);
    assert_eq!(devices[0].addressing(), Addressing::Unified);
    assert_eq!(devices[2].spec().canonicalize(), "ACCEL:1");
    assert_eq!(devices[2].addressing(), Addressing::Discrete);
    assert_eq!(devices[1].allocator().name(), "CPU:1");
}

#[test]
fn test_lru_reuses_freed_buffers() {
    let allocator = LruAllocator::new(Box::new(CpuAllocator::new(0)));
    let buffer = allocator.alloc(64, &BufferOptions::default()).unwrap();
    allocator.free(buffer);
    assert_eq!(allocator.cache_count(64), 1);

    let mut reused = allocator.alloc(64, &BufferOptions::default()).unwrap();
    assert_eq!(allocator.cache_count(64), 0);
    reused.as_bytes_mut().fill(0xff);
    allocator.free(reused);

    let zeroed = allocator.alloc(64, &BufferOptions::zeroed()).unwrap();
    assert!(zeroed.as_bytes().iter().all(|&b| b == 0), "recycled buffers are zeroed on request");
}

#[test]
fn test_cpu_capacity() {
    let allocator = CpuAllocator::with_capacity(1, 100);
    let first = allocator.alloc(60, &BufferOptions::default()).unwrap();
    assert!(matches!(
        allocator.alloc(60, &BufferOptions::default()),
        Err(Error::AllocationFailure { device: 1, bytes: 60, .. })
    ));
    allocator.free(first);
    assert_eq!(allocator.in_use(), 0);
    allocator.alloc(60, &BufferOptions::default()).unwrap();
}

#[test]
fn test_lru_flushes_cache_when_inner_allocator_is_full() {
    let allocator = LruAllocator::new(Box::new(CpuAllocator::with_capacity(0, 100)));
    let buffer = allocator.alloc(80, &BufferOptions::default()).unwrap();
    allocator.free(buffer);
    assert_eq!(allocator.cache_count(80), 1);

    // The cached 80 bytes still count against the budget until flushed
    allocator.alloc(40, &BufferOptions::default()).unwrap();
    assert_eq!(allocator.cache_count(80), 0);
}

#[test]
fn test_worker_queue_runs_in_order() {
    let registry = registry(1);
    let device = &registry.devices()[1];
    let queue = WorkerQueue::new(1);

    let src = device.allocate(8, &BufferOptions::zeroed()).unwrap();
    let mid = device.allocate(8, &BufferOptions::zeroed()).unwrap();
    let dst = device.allocate(8, &BufferOptions::zeroed()).unwrap();
    src.write().as_bytes_mut().unwrap().copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);

    let first = queue
        .submit(Command::Copy { src: Arc::clone(&src), dst: Arc::clone(&mid), after: Completion::ready() })
        .unwrap();
    let second = queue
        .submit(Command::Copy { src: Arc::clone(&mid), dst: Arc::clone(&dst), after: first.clone() })
        .unwrap();
    second.wait().unwrap();
    assert!(first.is_complete());
    assert_eq!(dst.read().as_bytes(), &[1, 2, 3, 4, 5, 6, 7, 8]);

    queue.synchronize().unwrap();
    assert_eq!(queue.signal().fault(), None);
}

#[test]
fn test_worker_queue_reports_failed_copy() {
    let registry = registry(1);
    let device = &registry.devices()[1];
    let queue = WorkerQueue::new(1);

    let small = device.allocate(4, &BufferOptions::zeroed()).unwrap();
    let large = device.allocate(8, &BufferOptions::zeroed()).unwrap();
    let failed = queue.submit(Command::Copy { src: small, dst: large, after: Completion::ready() }).unwrap();

    assert!(matches!(failed.wait(), Err(Error::DeviceTransferFailure { .. })));
    assert!(matches!(queue.synchronize(), Err(Error::DeviceTransferFailure { .. })));
}

/// Queue whose copies always fail at submission.
#[derive(Debug)]
struct RejectingQueue;

impl DeviceQueue for RejectingQueue {
    fn device(&self) -> usize {
        1
    }

    fn submit(&self, command: Command) -> crate::Result<Completion> {
        match command {
            Command::Copy { .. } => DeviceTransferFailureSnafu { reason: "link down" }.fail(),
            free => free.execute().map(|()| Completion::ready()),
        }
    }

    fn synchronize(&self) -> crate::Result<()> {
        Ok(())
    }
}

/// Queue whose copies fail asynchronously.
#[derive(Debug, Default)]
struct FaultyQueue {
    signal: Arc<QueueSignal>,
}

impl DeviceQueue for FaultyQueue {
    fn device(&self) -> usize {
        1
    }

    fn submit(&self, _command: Command) -> crate::Result<Completion> {
        self.signal.fail(1, "dma fault");
        Ok(Completion::pending(Arc::clone(&self.signal), 1))
    }

    fn synchronize(&self) -> crate::Result<()> {
        Ok(())
    }
}

fn registry_with_queue(queue: Arc<dyn DeviceQueue>) -> BufferRegistry {
    init_tracing();
    let accelerator = Device::new(1, Addressing::Discrete, Arc::new(CpuAllocator::new(1)), queue);
    BufferRegistry::with_devices(vec![Device::host(None, 4), accelerator]).unwrap()
}

#[test]
fn test_transfer_failure_at_submission_is_propagated() {
    let registry = registry_with_queue(Arc::new(RejectingQueue));
    let id = registry.create_buffer(ScalarDType::Int32, 2, "x").unwrap();
    registry.read_write::<i32>(id, 0, 2, 0, true).unwrap().copy_from_slice(&[1, 2]).unwrap();

    assert!(matches!(registry.read::<i32>(id, 0, 2, 1), Err(Error::DeviceTransferFailure { .. })));
    assert_eq!(registry.master_device(id).unwrap(), 0);
    assert_eq!(registry.master_version(id).unwrap(), 1);
    assert_ne!(registry.replica_version(id, 1).unwrap(), Some(1), "failed replica stays stale");

    // The host copy is untouched
    assert_eq!(registry.read::<i32>(id, 0, 2, 0).unwrap().to_vec().unwrap(), vec![1, 2]);
}

#[test]
fn test_asynchronous_transfer_failure_reaches_the_view() {
    let registry = registry_with_queue(Arc::new(FaultyQueue::default()));
    let id = registry.create_buffer(ScalarDType::Int32, 2, "x").unwrap();
    drop(registry.read_write::<i32>(id, 0, 2, 0, true).unwrap());

    let view = registry.read::<i32>(id, 0, 2, 1).unwrap();
    assert!(matches!(view.wait(), Err(Error::DeviceTransferFailure { ref reason }) if reason == "dma fault"));
    assert!(matches!(view.to_vec(), Err(Error::DeviceTransferFailure { .. })));
}

#[test]
fn test_failed_transfer_is_retried_and_keeps_failing() {
    let registry = registry_with_queue(Arc::new(FaultyQueue::default()));
    let id = registry.create_buffer(ScalarDType::Int32, 2, "x").unwrap();
    registry.read_write::<i32>(id, 0, 2, 0, true).unwrap().copy_from_slice(&[1, 2]).unwrap();

    let first = registry.read::<i32>(id, 0, 2, 1).unwrap();
    assert!(matches!(first.to_vec(), Err(Error::DeviceTransferFailure { .. })));
    drop(first);
    assert_eq!(registry.stats().copies, 1);

    // The faulted replica is copied again, and the queue's fault is sticky
    let second = registry.read::<i32>(id, 0, 2, 1).unwrap();
    assert_eq!(registry.stats().copies, 2);
    assert!(matches!(second.wait(), Err(Error::DeviceTransferFailure { .. })));
    drop(second);

    let update = registry.read_write::<i32>(id, 0, 1, 1, false).unwrap();
    assert_eq!(registry.stats().copies, 3);
    assert!(matches!(update.lock_mut(), Err(Error::DeviceTransferFailure { .. })));
    drop(update);
    assert_eq!(registry.master_device(id).unwrap(), 1);

    // The next access hands the master back to the intact host replica
    assert_eq!(registry.read::<i32>(id, 0, 2, 0).unwrap().to_vec().unwrap(), vec![1, 2]);
    assert_eq!(registry.master_device(id).unwrap(), 0);
    assert_eq!(registry.replica_version(id, 0).unwrap(), Some(registry.master_version(id).unwrap()));
    assert_eq!(registry.stats().copies, 3);
}

#[test]
fn test_failed_transfer_never_becomes_a_source() {
    init_tracing();
    let faulty = Device::new(1, Addressing::Discrete, Arc::new(CpuAllocator::new(1)), Arc::new(FaultyQueue::default()));
    let healthy = Device::accelerator(2, None, 4);
    let registry = BufferRegistry::with_devices(vec![Device::host(None, 4), faulty, healthy]).unwrap();
    let id = registry.create_buffer(ScalarDType::Int32, 2, "x").unwrap();
    registry.read_write::<i32>(id, 0, 2, 0, true).unwrap().copy_from_slice(&[5, 6]).unwrap();

    assert!(registry.read::<i32>(id, 0, 2, 1).unwrap().wait().is_err());
    assert!(
        matches!(registry.evict(id, 0), Err(Error::Unsupported { .. })),
        "the faulted replica cannot stand in for the host"
    );
    assert_eq!(registry.master_device(id).unwrap(), 0);
    assert_eq!(registry.read::<i32>(id, 0, 2, 2).unwrap().to_vec().unwrap(), vec![5, 6]);
}

/// Queue running copies on the caller's thread, checking the registry as each one starts.
#[derive(Debug, Default)]
struct InlineQueue {
    registry: OnceLock<Weak<BufferRegistry>>,
    fail: bool,
    /// Copies that started while the registry's table was locked.
    locked_copies: AtomicUsize,
    /// Buffer whose host writer is requested during each copy.
    watched: OnceLock<BufferId>,
    /// Whether each such writer was ready without waiting for the copy.
    writer_ready: Mutex<Vec<bool>>,
}

impl DeviceQueue for InlineQueue {
    fn device(&self) -> usize {
        1
    }

    fn submit(&self, command: Command) -> crate::Result<Completion> {
        if let Command::Copy { .. } = &command
            && let Some(registry) = self.registry.get().and_then(Weak::upgrade)
        {
            if registry.table.try_lock().is_none() {
                self.locked_copies.fetch_add(1, Ordering::SeqCst);
            }
            if let Some(&id) = self.watched.get() {
                let writer = registry.read_write::<u8>(id, 0, 1, 0, false)?;
                self.writer_ready.lock().push(writer.is_ready());
            }
        }
        match command {
            Command::Copy { .. } if self.fail => DeviceTransferFailureSnafu { reason: "inline fault" }.fail(),
            command => command.execute().map(|()| Completion::ready()),
        }
    }

    fn runs_inline(&self) -> bool {
        true
    }

    fn synchronize(&self) -> crate::Result<()> {
        Ok(())
    }
}

fn inline_registry(fail: bool) -> (Arc<BufferRegistry>, Arc<InlineQueue>) {
    init_tracing();
    let queue = Arc::new(InlineQueue { fail, ..InlineQueue::default() });
    let accelerator = Device::new(1, Addressing::Discrete, Arc::new(CpuAllocator::new(1)), queue.clone());
    let registry = Arc::new(BufferRegistry::with_devices(vec![Device::host(None, 4), accelerator]).unwrap());
    queue.registry.set(Arc::downgrade(&registry)).unwrap();
    (registry, queue)
}

#[test]
fn test_inline_copies_run_outside_the_table_lock() {
    let (registry, queue) = inline_registry(false);
    let id = registry.create_buffer(ScalarDType::Int32, 3, "x").unwrap();
    registry.read_write::<i32>(id, 0, 3, 0, true).unwrap().copy_from_slice(&[7, 8, 9]).unwrap();

    assert_eq!(registry.read::<i32>(id, 0, 3, 1).unwrap().to_vec().unwrap(), vec![7, 8, 9]);
    let copy = registry.duplicate(id, Some(1)).unwrap();
    assert_eq!(registry.read::<i32>(copy, 0, 3, 1).unwrap().to_vec().unwrap(), vec![7, 8, 9]);

    assert_eq!(registry.stats().copies, 2);
    assert_eq!(queue.locked_copies.load(Ordering::SeqCst), 0);
}

#[test]
fn test_writer_of_duplicated_buffer_waits_for_the_copy() {
    let (registry, queue) = inline_registry(false);
    let id = registry.create_buffer(ScalarDType::UInt8, 4, "source").unwrap();
    registry.read_write::<u8>(id, 0, 4, 0, true).unwrap().copy_from_slice(&[1, 2, 3, 4]).unwrap();
    queue.watched.set(id).unwrap();

    let copy = registry.duplicate(id, Some(1)).unwrap();
    assert_eq!(*queue.writer_ready.lock(), vec![false]);

    registry.read_write::<u8>(id, 0, 4, 0, true).unwrap().copy_from_slice(&[9; 4]).unwrap();
    assert_eq!(registry.read::<u8>(copy, 0, 4, 1).unwrap().to_vec().unwrap(), vec![1, 2, 3, 4]);
}

#[test]
fn test_failed_inline_copy_is_reported_and_retried() {
    let (registry, _queue) = inline_registry(true);
    let id = registry.create_buffer(ScalarDType::Int32, 2, "x").unwrap();
    registry.read_write::<i32>(id, 0, 2, 0, true).unwrap().copy_from_slice(&[3, 4]).unwrap();

    assert!(matches!(registry.read::<i32>(id, 0, 2, 1), Err(Error::DeviceTransferFailure { .. })));
    assert!(matches!(registry.read::<i32>(id, 0, 2, 1), Err(Error::DeviceTransferFailure { .. })));
    assert_eq!(registry.stats().copies, 2);

    let buffers = registry.len();
    assert!(matches!(registry.duplicate(id, Some(1)), Err(Error::DeviceTransferFailure { .. })));
    assert_eq!(registry.len(), buffers, "failed duplicate is not registered");

    assert_eq!(registry.read::<i32>(id, 0, 2, 0).unwrap().to_vec().unwrap(), vec![3, 4]);
    assert_eq!(registry.master_device(id).unwrap(), 0);
}

#[test]
fn test_allocation_failure_is_surfaced() {
    init_tracing();
    let registry = BufferRegistry::new(RegistryConfig::builder().device_capacity(8).build());
    let id = registry.create_buffer(ScalarDType::Float32, 4, "big").unwrap();

    assert!(matches!(registry.read::<f32>(id, 0, 4, 1), Err(Error::AllocationFailure { device: 1, bytes: 16, .. })));
    assert!(registry.replica_devices(id).unwrap().is_empty());

    // Falling back to the host is the caller's call
    assert_eq!(registry.read::<f32>(id, 0, 4, 0).unwrap().to_vec().unwrap(), vec![0.0; 4]);
}

#[test]
fn test_evicted_memory_is_recycled() {
    init_tracing();
    let registry = BufferRegistry::new(RegistryConfig::builder().device_capacity(16).build());
    let first = registry.create_buffer(ScalarDType::Float32, 4, "first").unwrap();
    drop(registry.read::<f32>(first, 0, 4, 0).unwrap());
    drop(registry.read::<f32>(first, 0, 4, 1).unwrap());
    assert!(registry.evict(first, 1).unwrap());
    registry.synchronize().unwrap();

    // Same size: served from the LRU cache
    let second = registry.create_buffer(ScalarDType::Int32, 4, "second").unwrap();
    drop(registry.read::<i32>(second, 0, 4, 1).unwrap());
    assert!(registry.evict(second, 1).is_err(), "only current replica");
    registry.release(second).unwrap();
    registry.synchronize().unwrap();

    // Different size: the cache is flushed back to the budget first
    let third = registry.create_buffer(ScalarDType::UInt8, 12, "third").unwrap();
    drop(registry.read::<u8>(third, 0, 12, 1).unwrap());
}

#[test]
fn test_with_devices_validation() {
    let host = || Device::host(None, 4);
    let accelerator = |index| Device::accelerator(index, None, 4);

    assert!(matches!(BufferRegistry::with_devices(Vec::new()), Err(Error::InvalidDevice { .. })));
    assert!(matches!(
        BufferRegistry::with_devices(vec![accelerator(0)]),
        Err(Error::InvalidDevice { .. })
    ));
    assert!(matches!(
        BufferRegistry::with_devices(vec![host(), accelerator(2)]),
        Err(Error::InvalidDevice { .. })
    ));

    let registry = BufferRegistry::with_devices(vec![host(), accelerator(1), accelerator(2)]).unwrap();
    assert_eq!(registry.devices().len(), 3);
}
