use snafu::Snafu;

use crate::registry::BufferId;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Operation on a handle that was released or never issued.
    #[snafu(display("invalid buffer handle {id}"))]
    InvalidHandle { id: BufferId },

    /// Write access requested on an immutable buffer.
    #[snafu(display("buffer '{name}' is read-only"))]
    ReadOnlyViolation { name: String },

    #[snafu(display("access out of bounds: offset {offset} + count {count} exceeds {len} elements"))]
    OutOfBounds { offset: usize, count: usize, len: usize },

    #[snafu(display("byte count overflow: {count} elements of {element_size} bytes"))]
    SizeOverflow { count: usize, element_size: usize },

    #[snafu(display("invalid device: {device}"))]
    InvalidDevice { device: String },

    /// Device allocator could not satisfy the request.
    #[snafu(display("allocation of {bytes} bytes failed on device {device}: {reason}"))]
    AllocationFailure { device: usize, bytes: usize, reason: String },

    /// A copy between device memory records failed.
    #[snafu(display("device transfer failed: {reason}"))]
    DeviceTransferFailure { reason: String },

    /// A streaming buffer's source ended or was cancelled.
    #[snafu(display("stream closed: {reason}"))]
    StreamClosed { reason: String },

    /// Writing a dirty block back to its stream failed.
    #[snafu(display("stream I/O failed at block {block}"))]
    StreamIo { block: usize, source: std::io::Error },

    #[snafu(display("block {block} was already evicted from the stream ring"))]
    BlockEvicted { block: usize },

    #[snafu(display("view at byte offset {offset} is not aligned to {align} bytes"))]
    Misaligned { offset: usize, align: usize },

    #[snafu(display("unsupported operation: {operation}"))]
    Unsupported { operation: String },

    #[snafu(display("timed out after {waited_ms}ms waiting for timeline value {target} (current {current})"))]
    Timeout { waited_ms: u64, target: u64, current: u64 },
}
