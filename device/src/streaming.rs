//! Streaming buffers: a bounded read-ahead ring fed by a background producer.
//!
//! A streaming buffer exposes an external sequential data source block by
//! block. The ring holds `buffered` blocks on the host; block `i` always lives
//! in slot `i % buffered`. A producer thread fills slots in block order as soon
//! as they become free, so it never runs more than `buffered` blocks ahead of
//! the consumers.
//!
//! A slot becomes free once its block is *retired*: a read view of it was
//! released, or a later block was requested while it was unpinned. Sequential
//! sources cannot rewind, so asking for a retired block after its slot was
//! refilled reports [`Error::BlockEvicted`](crate::Error::BlockEvicted).
//!
//! Mutable streams write modified blocks back to the source before their slot
//! is reused, on [`BufferRegistry::flush_stream`](crate::BufferRegistry::flush_stream),
//! and when the stream closes.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use snafu::{ResultExt, ensure};

use crate::error::{BlockEvictedSnafu, OutOfBoundsSnafu, Result, StreamClosedSnafu, StreamIoSnafu};
use crate::memory::DeviceMemory;
use crate::registry::BufferId;

/// Block count reported for streams without a known end.
pub const UNBOUNDED_BLOCKS: usize = usize::MAX;

/// Sequential block source behind a streaming buffer.
pub trait BufferStream: Send + 'static {
    /// Whether blocks may be modified and written back.
    fn is_mutable(&self) -> bool {
        false
    }

    /// Number of blocks, or `None` for an endless stream.
    fn block_count(&self) -> Option<usize>;

    /// Fill `buf` with block `index`. Returns `false` at end of data.
    ///
    /// Blocks are requested in increasing order, each exactly once.
    fn read_block(&mut self, index: usize, buf: &mut [u8]) -> io::Result<bool>;

    /// Write a modified block back.
    fn write_block(&mut self, index: usize, _buf: &[u8]) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, format!("stream is read-only, cannot write block {index}")))
    }
}

/// Immutable stream of fixed-size blocks read from any reader.
#[derive(Debug)]
pub struct ReaderStream<R> {
    reader: R,
    block_count: Option<usize>,
    next: usize,
}

impl<R: Read + Send + 'static> ReaderStream<R> {
    /// A stream that ends when the reader does.
    pub fn new(reader: R) -> Self {
        Self { reader, block_count: None, next: 0 }
    }

    /// A stream of exactly `count` blocks.
    pub fn with_block_count(reader: R, count: usize) -> Self {
        Self { reader, block_count: Some(count), next: 0 }
    }
}

impl<R: Read + Send + 'static> BufferStream for ReaderStream<R> {
    fn block_count(&self) -> Option<usize> {
        self.block_count
    }

    fn read_block(&mut self, index: usize, buf: &mut [u8]) -> io::Result<bool> {
        if index != self.next {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("sequential reader expected block {}, got {index}", self.next),
            ));
        }
        if self.block_count.is_some_and(|count| index >= count) {
            return Ok(false);
        }

        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        if filled == 0 && !buf.is_empty() {
            return match self.block_count {
                Some(count) => Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("reader ended at block {index} of {count}"),
                )),
                None => Ok(false),
            };
        }

        // Short final block
        buf[filled..].fill(0);
        self.next += 1;
        Ok(true)
    }
}

/// Mutable stream over a seekable file.
///
/// The block count is derived from the file length; a short final block is
/// zero-padded on read and truncated on write back.
#[derive(Debug)]
pub struct FileStream {
    file: File,
    block_bytes: usize,
    file_len: u64,
}

impl FileStream {
    pub fn new(file: File, block_bytes: usize) -> io::Result<Self> {
        if block_bytes == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "block size must be non-zero"));
        }
        let file_len = file.metadata()?.len();
        Ok(Self { file, block_bytes, file_len })
    }

    /// Open `path` for reading and writing.
    pub fn open(path: impl AsRef<Path>, block_bytes: usize) -> io::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        Self::new(file, block_bytes)
    }

    fn block_offset(&self, index: usize) -> u64 {
        index as u64 * self.block_bytes as u64
    }
}

impl BufferStream for FileStream {
    fn is_mutable(&self) -> bool {
        true
    }

    fn block_count(&self) -> Option<usize> {
        Some(self.file_len.div_ceil(self.block_bytes as u64) as usize)
    }

    fn read_block(&mut self, index: usize, buf: &mut [u8]) -> io::Result<bool> {
        let offset = self.block_offset(index);
        if offset >= self.file_len {
            return Ok(false);
        }
        let available = ((self.file_len - offset) as usize).min(buf.len());
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf[..available])?;
        buf[available..].fill(0);
        Ok(true)
    }

    fn write_block(&mut self, index: usize, buf: &[u8]) -> io::Result<()> {
        let offset = self.block_offset(index);
        if offset >= self.file_len {
            return Ok(());
        }
        let available = ((self.file_len - offset) as usize).min(buf.len());
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&buf[..available])?;
        self.file.flush()
    }
}

#[derive(Debug, Default)]
struct Slot {
    /// Block resident in the slot; `None` while empty or being refilled.
    block: Option<usize>,
    readers: usize,
    writer: bool,
    dirty: bool,
    /// Retired blocks may be replaced.
    retired: bool,
}

impl Slot {
    fn is_pinned(&self) -> bool {
        self.readers > 0 || self.writer
    }

    fn is_reusable(&self) -> bool {
        self.block.is_none() || (self.retired && !self.is_pinned())
    }
}

#[derive(Debug)]
struct Ring {
    slots: Vec<Slot>,
    /// Next block the producer fills.
    next_produce: usize,
    /// First block past the end of an endless stream, once discovered.
    end: Option<usize>,
    closed: Option<String>,
    /// The producer is writing a dirty block back outside the lock.
    writing_back: bool,
    /// The producer is inside the stream's I/O for a claimed slot.
    reading: bool,
}

impl Ring {
    /// Retire resident blocks before `block` that nobody holds.
    fn retire_before(&mut self, block: usize) -> bool {
        let mut changed = false;
        for slot in &mut self.slots {
            if slot.block.is_some_and(|b| b < block) && !slot.retired && !slot.is_pinned() {
                slot.retired = true;
                changed = true;
            }
        }
        changed
    }
}

/// Shared state of one streaming buffer.
pub(crate) struct StreamPipeline {
    id: BufferId,
    block_bytes: usize,
    total_blocks: usize,
    slots: Vec<Arc<DeviceMemory>>,
    ring: Mutex<Ring>,
    changed: Condvar,
    stream: Mutex<Box<dyn BufferStream>>,
    producer: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for StreamPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamPipeline")
            .field("id", &self.id)
            .field("block_bytes", &self.block_bytes)
            .field("total_blocks", &self.total_blocks)
            .field("ring", &*self.ring.lock())
            .finish()
    }
}

impl StreamPipeline {
    /// Build the ring over `slots` and start the producer thread.
    pub fn start(
        id: BufferId,
        slots: Vec<Arc<DeviceMemory>>,
        block_bytes: usize,
        stream: Box<dyn BufferStream>,
    ) -> Result<Arc<Self>> {
        let total_blocks = stream.block_count().unwrap_or(UNBOUNDED_BLOCKS);
        let ring = Ring {
            slots: slots.iter().map(|_| Slot::default()).collect(),
            next_produce: 0,
            end: None,
            closed: None,
            writing_back: false,
            reading: false,
        };
        let pipeline = Arc::new(Self {
            id,
            block_bytes,
            total_blocks,
            slots,
            ring: Mutex::new(ring),
            changed: Condvar::new(),
            stream: Mutex::new(stream),
            producer: Mutex::new(None),
        });

        let producer = Arc::clone(&pipeline);
        let handle = std::thread::Builder::new()
            .name(format!("tessel-stream-{}", id.get()))
            .spawn(move || producer.produce())
            .map_err(|e| StreamClosedSnafu { reason: format!("failed to spawn producer: {e}") }.build())?;
        *pipeline.producer.lock() = Some(handle);

        tracing::debug!(buffer = %id, block_bytes, total_blocks, buffered = pipeline.slots.len(), "stream opened");
        Ok(pipeline)
    }

    pub fn total_blocks(&self) -> usize {
        self.total_blocks
    }

    pub fn block_bytes(&self) -> usize {
        self.block_bytes
    }

    fn produce(&self) {
        loop {
            let Some((block, slot, write_back)) = self.claim_slot() else {
                return;
            };

            if let Some(old) = write_back {
                let result = self.write_back(old, slot);
                {
                    let mut ring = self.ring.lock();
                    ring.writing_back = false;
                    ring.reading = result.is_ok();
                }
                self.changed.notify_all();
                if let Err(e) = result {
                    tracing::warn!(buffer = %self.id, block = old, error = %e, "stream write back failed");
                    self.shutdown(format!("write back of block {old} failed: {e}"));
                    return;
                }
            }

            let result = {
                let mut storage = self.slots[slot].write();
                match storage.as_bytes_mut() {
                    Some(bytes) => self.stream.lock().read_block(block, bytes),
                    None => Err(io::Error::other("ring slot is not writable")),
                }
            };

            let mut ring = self.ring.lock();
            ring.reading = false;
            match result {
                Ok(true) => {
                    let state = &mut ring.slots[slot];
                    state.block = Some(block);
                    state.retired = false;
                    state.dirty = false;
                    ring.next_produce = block + 1;
                    tracing::trace!(buffer = %self.id, block, slot, "block produced");
                    self.changed.notify_all();
                }
                Ok(false) => {
                    ring.end = Some(block);
                    tracing::debug!(buffer = %self.id, blocks = block, "stream reached end of data");
                    self.changed.notify_all();
                    return;
                }
                Err(e) => {
                    drop(ring);
                    tracing::warn!(buffer = %self.id, block, error = %e, "stream read failed");
                    self.shutdown(format!("read of block {block} failed: {e}"));
                    return;
                }
            }
        }
    }

    /// Wait for the slot of the next block to be reusable and claim it.
    ///
    /// Returns the block, its slot, and a dirty block to write back first.
    fn claim_slot(&self) -> Option<(usize, usize, Option<usize>)> {
        let mut ring = self.ring.lock();
        loop {
            let block = ring.next_produce;
            if ring.closed.is_some() || ring.end.is_some() || block >= self.total_blocks {
                return None;
            }
            let index = block % self.slots.len();
            let slot = &mut ring.slots[index];
            if slot.is_reusable() {
                let old = slot.block.take();
                let dirty = std::mem::take(&mut slot.dirty);
                slot.retired = false;
                let write_back = old.filter(|_| dirty);
                ring.writing_back = write_back.is_some();
                ring.reading = true;
                return Some((block, index, write_back));
            }
            self.changed.wait(&mut ring);
        }
    }

    fn write_back(&self, block: usize, slot: usize) -> io::Result<()> {
        let storage = self.slots[slot].read();
        self.stream.lock().write_block(block, storage.as_bytes())?;
        tracing::trace!(buffer = %self.id, block, slot, "block written back");
        Ok(())
    }

    /// Pin `block` for reading or writing, waiting until it is produced.
    ///
    /// Returns the slot holding it.
    pub fn acquire(&self, block: usize, write: bool) -> Result<usize> {
        ensure!(block < self.total_blocks, OutOfBoundsSnafu { offset: block, count: 1usize, len: self.total_blocks });

        let mut ring = self.ring.lock();
        loop {
            if let Some(reason) = &ring.closed {
                return StreamClosedSnafu { reason: reason.clone() }.fail();
            }
            if let Some(end) = ring.end
                && block >= end
            {
                return StreamClosedSnafu { reason: format!("stream ended after {end} blocks") }.fail();
            }

            if ring.retire_before(block) {
                self.changed.notify_all();
            }

            let index = block % self.slots.len();
            let slot = &mut ring.slots[index];
            if slot.block == Some(block) {
                if write && !slot.is_pinned() {
                    slot.writer = true;
                    return Ok(index);
                }
                if !write && !slot.writer {
                    slot.readers += 1;
                    return Ok(index);
                }
            } else if block < ring.next_produce {
                return BlockEvictedSnafu { block }.fail();
            }

            self.changed.wait(&mut ring);
        }
    }

    /// Undo one [`acquire`](Self::acquire); the block is retired.
    pub fn unpin(&self, slot: usize, write: bool) {
        let mut ring = self.ring.lock();
        let state = &mut ring.slots[slot];
        if write {
            state.writer = false;
            state.dirty = true;
        } else {
            state.readers = state.readers.saturating_sub(1);
        }
        if !state.is_pinned() {
            state.retired = true;
        }
        self.changed.notify_all();
    }

    pub fn slot_memory(&self, slot: usize) -> &Arc<DeviceMemory> {
        &self.slots[slot]
    }

    /// Write every unpinned dirty block back to the stream.
    ///
    /// Also waits for a write back the producer has in flight.
    pub fn flush(&self) -> Result<()> {
        let dirty: Vec<(usize, usize)> = {
            let mut ring = self.ring.lock();
            while ring.writing_back {
                self.changed.wait(&mut ring);
            }
            ring.slots
                .iter_mut()
                .enumerate()
                .filter(|(_, slot)| slot.dirty && !slot.is_pinned())
                .filter_map(|(index, slot)| {
                    let block = slot.block?;
                    // Pinned so the producer leaves the slot alone meanwhile
                    slot.dirty = false;
                    slot.readers += 1;
                    Some((block, index))
                })
                .collect()
        };

        let mut result = Ok(());
        for &(block, slot) in &dirty {
            if result.is_ok() {
                result = self.write_back(block, slot).context(StreamIoSnafu { block });
            } else {
                self.ring.lock().slots[slot].dirty = true;
            }
        }

        let mut ring = self.ring.lock();
        for &(_, slot) in &dirty {
            ring.slots[slot].readers -= 1;
        }
        self.changed.notify_all();
        result
    }

    /// Mark the pipeline closed and wake every waiter.
    fn shutdown(&self, reason: String) -> bool {
        let mut ring = self.ring.lock();
        if ring.closed.is_some() {
            return false;
        }
        ring.closed = Some(reason);
        self.changed.notify_all();
        true
    }

    /// Stop the producer, write back dirty blocks, and fail all waiters with `StreamClosed`.
    ///
    /// A producer inside a stream read is detached instead of joined, since the
    /// read may never return; it exits once it does. Writing back dirty blocks
    /// still waits for the stream.
    pub fn close(&self, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        let first = self.shutdown(reason.clone());

        let busy = {
            let ring = self.ring.lock();
            ring.reading || ring.writing_back
        };
        if let Some(handle) = self.producer.lock().take() {
            if busy {
                tracing::debug!(buffer = %self.id, "producer busy in stream I/O, detaching");
                drop(handle);
            } else if handle.join().is_err() {
                tracing::error!(buffer = %self.id, "stream producer panicked");
            }
        }

        let result = self.flush();
        if first {
            tracing::debug!(buffer = %self.id, %reason, "stream closed");
        }
        result
    }
}
