use std::io::{self, Cursor, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use crate::test::registry;
use crate::{BufferStream, Error, FileStream, ReaderStream, ScalarDType, UNBOUNDED_BLOCKS};

/// `count` blocks of four `f32`, block `i` filled with `i`.
fn float_blocks(count: usize) -> Cursor<Vec<u8>> {
    let values: Vec<f32> = (0..count).flat_map(|block| [block as f32; 4]).collect();
    Cursor::new(bytemuck::cast_slice::<f32, u8>(&values).to_vec())
}

/// Stream of byte blocks, block `i` filled with `i`, counting what it produced.
struct Counting {
    produced: Arc<AtomicUsize>,
    limit: Option<usize>,
}

impl Counting {
    fn new(limit: Option<usize>) -> (Self, Arc<AtomicUsize>) {
        let produced = Arc::new(AtomicUsize::new(0));
        (Self { produced: Arc::clone(&produced), limit }, produced)
    }
}

impl BufferStream for Counting {
    fn block_count(&self) -> Option<usize> {
        self.limit
    }

    fn read_block(&mut self, index: usize, buf: &mut [u8]) -> io::Result<bool> {
        buf.fill(index as u8);
        self.produced.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

#[test]
fn test_requesting_a_later_block_first() {
    let registry = registry(0);
    let stream = ReaderStream::with_block_count(float_blocks(5), 5);
    let (id, total) = registry.create_streaming_buffer(ScalarDType::Float32, &[4], 2, stream).unwrap();
    assert_eq!(total, 5);

    let view = registry.read_block::<f32>(id, 4).unwrap();
    assert_eq!(view.to_vec().unwrap(), vec![4.0; 4]);
    drop(view);

    assert!(matches!(registry.read_block::<f32>(id, 1), Err(Error::BlockEvicted { block: 1 })));
    assert!(matches!(registry.read_block::<f32>(id, 5), Err(Error::OutOfBounds { offset: 5, len: 5, .. })));
}

#[test]
fn test_sequential_consumption() {
    let registry = registry(0);
    let stream = ReaderStream::with_block_count(float_blocks(6), 6);
    let (id, total) = registry.create_streaming_buffer(ScalarDType::Float32, &[2, 2], 3, stream).unwrap();

    for block in 0..total {
        let values = registry.read_block::<f32>(id, block).unwrap().to_vec().unwrap();
        assert_eq!(values, vec![block as f32; 4]);
    }
    assert_eq!(registry.byte_count(id).unwrap(), 6 * 16);
}

#[test]
fn test_element_access_maps_to_blocks() {
    let registry = registry(0);
    let stream = ReaderStream::with_block_count(float_blocks(3), 3);
    let (id, _) = registry.create_streaming_buffer(ScalarDType::Float32, &[4], 3, stream).unwrap();

    assert_eq!(registry.read::<f32>(id, 9, 2, 0).unwrap().to_vec().unwrap(), vec![2.0, 2.0]);
    assert!(matches!(registry.read::<f32>(id, 6, 4, 0), Err(Error::OutOfBounds { .. })), "ranges cannot span blocks");
    assert!(matches!(registry.read::<f32>(id, 0, 1, 1), Err(Error::InvalidDevice { .. })));
}

#[test]
fn test_producer_stays_within_the_ring() {
    let registry = registry(0);
    let (stream, produced) = Counting::new(Some(10));
    let (id, _) = registry.create_streaming_buffer(ScalarDType::UInt8, &[8], 2, stream).unwrap();

    let first = registry.read_block::<u8>(id, 0).unwrap();
    let second = registry.read_block::<u8>(id, 1).unwrap();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(produced.load(Ordering::SeqCst), 2, "both slots are pinned");
    assert_eq!(second.to_vec().unwrap(), vec![1; 8]);

    drop(first);
    assert_eq!(registry.read_block::<u8>(id, 2).unwrap().to_vec().unwrap(), vec![2; 8]);
    drop(second);
    let third = registry.read_block::<u8>(id, 3).unwrap();
    assert_eq!(third.to_vec().unwrap(), vec![3; 8]);
    std::thread::sleep(Duration::from_millis(20));
    assert!(produced.load(Ordering::SeqCst) <= 5, "block 5 waits for block 3's slot");
}

#[test]
fn test_endless_stream_end_of_data() {
    let registry = registry(0);
    let stream = ReaderStream::new(float_blocks(3));
    let (id, total) = registry.create_streaming_buffer(ScalarDType::Float32, &[4], 2, stream).unwrap();
    assert_eq!(total, UNBOUNDED_BLOCKS);

    assert_eq!(registry.read_block::<f32>(id, 2).unwrap().to_vec().unwrap(), vec![2.0; 4]);
    assert!(matches!(registry.read_block::<f32>(id, 3), Err(Error::StreamClosed { .. })));
    assert!(matches!(registry.read_block::<f32>(id, 100), Err(Error::StreamClosed { .. })));
}

#[test]
fn test_close_wakes_blocked_consumers() {
    let registry = registry(0);
    let (stream, _) = Counting::new(None);
    let (id, _) = registry.create_streaming_buffer(ScalarDType::UInt8, &[4], 1, stream).unwrap();

    let pinned = registry.read_block::<u8>(id, 0).unwrap();
    std::thread::scope(|scope| {
        let waiter = scope.spawn(|| registry.read_block::<u8>(id, 1).map(|view| view.len()));
        std::thread::sleep(Duration::from_millis(50));
        registry.close_stream(id).unwrap();
        assert!(matches!(waiter.join().unwrap(), Err(Error::StreamClosed { .. })));
    });

    assert_eq!(pinned.to_vec().unwrap(), vec![0; 4], "views taken before closing stay valid");
    drop(pinned);
    assert!(matches!(registry.read_block::<u8>(id, 0), Err(Error::StreamClosed { .. })));
    registry.release(id).unwrap();
}

/// Endless stream whose reads past block 0 stall until the gate opens or closes.
struct Gated {
    entered: Sender<usize>,
    gate: Receiver<()>,
}

impl BufferStream for Gated {
    fn block_count(&self) -> Option<usize> {
        None
    }

    fn read_block(&mut self, index: usize, buf: &mut [u8]) -> io::Result<bool> {
        if index > 0 {
            let _ = self.entered.send(index);
            self.gate.recv().map_err(|_| io::Error::other("gate closed"))?;
        }
        buf.fill(index as u8);
        Ok(true)
    }
}

#[test]
fn test_release_does_not_wait_for_a_stalled_read() {
    let registry = registry(0);
    let (entered_tx, entered) = crossbeam_channel::unbounded();
    let (gate, gate_rx) = crossbeam_channel::unbounded();
    let stream = Gated { entered: entered_tx, gate: gate_rx };
    let (id, _) = registry.create_streaming_buffer(ScalarDType::UInt8, &[4], 1, stream).unwrap();

    assert_eq!(registry.read_block::<u8>(id, 0).unwrap().to_vec().unwrap(), vec![0; 4]);
    assert_eq!(entered.recv_timeout(Duration::from_secs(5)).unwrap(), 1);

    registry.release(id).unwrap();
    assert!(!registry.contains(id));

    // Lets the detached producer finish its read and exit
    drop(gate);
}

#[test]
fn test_release_closes_the_stream() {
    let registry = registry(0);
    let (stream, _) = Counting::new(None);
    let (id, _) = registry.create_streaming_buffer(ScalarDType::UInt8, &[4], 2, stream).unwrap();
    registry.release(id).unwrap();
    assert!(matches!(registry.read_block::<u8>(id, 0), Err(Error::InvalidHandle { .. })));
}

#[test]
fn test_registry_drop_stops_producers() {
    let registry = registry(0);
    let (stream, _) = Counting::new(None);
    registry.create_streaming_buffer(ScalarDType::UInt8, &[4], 2, stream).unwrap();
    drop(registry);
}

#[test]
fn test_read_error_closes_the_stream() {
    struct Broken;
    impl BufferStream for Broken {
        fn block_count(&self) -> Option<usize> {
            Some(4)
        }

        fn read_block(&mut self, index: usize, buf: &mut [u8]) -> io::Result<bool> {
            if index == 1 {
                return Err(io::Error::other("disk unplugged"));
            }
            buf.fill(1);
            Ok(true)
        }
    }

    let registry = registry(0);
    let (id, _) = registry.create_streaming_buffer(ScalarDType::UInt8, &[4], 2, Broken).unwrap();
    let result = registry.read_block::<u8>(id, 1);
    assert!(matches!(result, Err(Error::StreamClosed { ref reason }) if reason.contains("disk unplugged")));
}

#[test]
fn test_read_only_stream_rejects_writes() {
    let registry = registry(1);
    let stream = ReaderStream::with_block_count(float_blocks(2), 2);
    let (id, _) = registry.create_streaming_buffer(ScalarDType::Float32, &[4], 1, stream).unwrap();

    assert!(registry.is_read_only(id).unwrap());
    assert!(matches!(registry.read_write_block::<f32>(id, 0), Err(Error::ReadOnlyViolation { .. })));
    assert!(matches!(registry.read_write::<f32>(id, 0, 4, 0, true), Err(Error::ReadOnlyViolation { .. })));
    assert!(matches!(registry.duplicate(id, None), Err(Error::Unsupported { .. })));
    assert!(matches!(registry.evict(id, 0), Err(Error::Unsupported { .. })));
}

#[test]
fn test_block_access_needs_a_stream() {
    let registry = registry(0);
    let id = registry.create_buffer(ScalarDType::UInt8, 4, "plain").unwrap();
    assert!(matches!(registry.read_block::<u8>(id, 0), Err(Error::Unsupported { .. })));
    assert!(matches!(registry.flush_stream(id), Err(Error::Unsupported { .. })));
}

#[test]
fn test_invalid_streaming_parameters() {
    let registry = registry(0);
    let (stream, _) = Counting::new(Some(1));
    assert!(matches!(
        registry.create_streaming_buffer(ScalarDType::UInt8, &[4], 0, stream),
        Err(Error::Unsupported { .. })
    ));
    let (stream, _) = Counting::new(Some(1));
    assert!(matches!(
        registry.create_streaming_buffer(ScalarDType::Int64, &[usize::MAX, 2], 1, stream),
        Err(Error::SizeOverflow { .. })
    ));
}

fn int_file(blocks: usize) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    let values: Vec<i32> = (0..(blocks * 4) as i32).collect();
    file.write_all(bytemuck::cast_slice(&values)).unwrap();
    file.flush().unwrap();
    file
}

fn file_values(file: &tempfile::NamedTempFile) -> Vec<i32> {
    let bytes = std::fs::read(file.path()).unwrap();
    bytes.chunks_exact(4).map(|chunk| i32::from_ne_bytes(chunk.try_into().unwrap())).collect()
}

#[test]
fn test_file_stream_flush_writes_back() {
    let file = int_file(4);
    let registry = registry(0);
    let stream = FileStream::open(file.path(), 16).unwrap();
    let (id, total) = registry.create_streaming_buffer(ScalarDType::Int32, &[4], 2, stream).unwrap();
    assert_eq!(total, 4);
    assert!(!registry.is_read_only(id).unwrap());

    let view = registry.read_write_block::<i32>(id, 1).unwrap();
    assert_eq!(view.to_vec().unwrap(), vec![4, 5, 6, 7]);
    view.lock_mut().unwrap().iter_mut().for_each(|value| *value += 100);
    drop(view);

    registry.flush_stream(id).unwrap();
    assert_eq!(&file_values(&file)[4..8], &[104, 105, 106, 107]);
    assert_eq!(&file_values(&file)[..4], &[0, 1, 2, 3]);
}

#[test]
fn test_dirty_block_written_back_before_slot_reuse() {
    let file = int_file(4);
    let registry = registry(0);
    let stream = FileStream::open(file.path(), 16).unwrap();
    let (id, _) = registry.create_streaming_buffer(ScalarDType::Int32, &[4], 2, stream).unwrap();

    registry.read_write::<i32>(id, 0, 4, 0, false).unwrap().copy_from_slice(&[-1, -2, -3, -4]).unwrap();

    // Block 2 reuses block 0's slot
    assert_eq!(registry.read_block::<i32>(id, 2).unwrap().to_vec().unwrap(), vec![8, 9, 10, 11]);
    assert_eq!(&file_values(&file)[..4], &[-1, -2, -3, -4]);
}

#[test]
fn test_release_flushes_dirty_blocks() {
    let file = int_file(2);
    let registry = registry(0);
    let stream = FileStream::open(file.path(), 16).unwrap();
    let (id, _) = registry.create_streaming_buffer(ScalarDType::Int32, &[4], 2, stream).unwrap();

    registry.read_write_block::<i32>(id, 1).unwrap().copy_from_slice(&[0; 4]).unwrap();
    registry.release(id).unwrap();

    assert_eq!(file_values(&file), vec![0, 1, 2, 3, 0, 0, 0, 0]);
}

#[test]
fn test_short_final_block_is_zero_padded() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(bytemuck::cast_slice(&[1i32, 2, 3, 4, 5, 6])).unwrap();
    file.flush().unwrap();

    let registry = registry(0);
    let stream = FileStream::open(file.path(), 16).unwrap();
    let (id, total) = registry.create_streaming_buffer(ScalarDType::Int32, &[4], 2, stream).unwrap();
    assert_eq!(total, 2);
    assert_eq!(registry.read_block::<i32>(id, 1).unwrap().to_vec().unwrap(), vec![5, 6, 0, 0]);
}
