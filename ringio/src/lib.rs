//! Completion-based vectored I/O over io_uring.
//!
//! A `RingInstance` owns a submission/completion queue pair with a fixed
//! queue depth and block size. `VectoredBuffer` provides the matching pool
//! of aligned fixed-size blocks together with an iovec table suitable for
//! `preadv`/`pwritev`-style requests. The ring, its buffer pool and the
//! bound file handle form one resource bundle with scoped setup/teardown.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::ptr::NonNull;

use io_uring::{cqueue, opcode, types, IoUring};
use log::debug;
use thiserror::Error;

/// Default number of entries for the submission and completion queues.
pub const DEFAULT_QUEUE_DEPTH: u32 = 8;

/// Default block size for vectored buffers.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Alignment for I/O blocks. Matches the usual direct-I/O requirement.
const BLOCK_ALIGN: usize = 4096;

#[derive(Debug, Error)]
pub enum RingError {
    #[error("ring not initialized, call setup() first")]
    NotInitialized,

    #[error("ring already initialized")]
    AlreadyInitialized,

    #[error("{message} (reason {reason})")]
    Io { message: String, reason: i32 },

    #[error("invalid buffer geometry: {0}")]
    Geometry(String),

    #[error("offset {offset} out of bounds (capacity {capacity})")]
    OffsetOutOfBounds { offset: u64, capacity: u64 },

    #[error("effective size {size} out of bounds (capacity {capacity})")]
    EffectiveSizeOutOfBounds { size: i64, capacity: u64 },

    #[error("submission queue full")]
    QueueFull,

    #[error("completion queue empty")]
    NoCompletion,
}

impl RingError {
    fn from_os(message: impl Into<String>, errno: i32) -> Self {
        RingError::Io {
            message: message.into(),
            reason: errno,
        }
    }

    /// Returns the underlying numeric reason, if this is an I/O failure.
    pub fn reason(&self) -> Option<i32> {
        match self {
            RingError::Io { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

impl From<std::io::Error> for RingError {
    fn from(err: std::io::Error) -> Self {
        RingError::Io {
            message: err.to_string(),
            reason: err.raw_os_error().unwrap_or(0),
        }
    }
}

/// One aligned, zero-initialized I/O block.
struct AlignedBlock {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl AlignedBlock {
    fn new(size: usize) -> Result<Self, RingError> {
        let align = BLOCK_ALIGN.min(size.next_power_of_two().max(1));
        let layout = Layout::from_size_align(size, align)
            .map_err(|e| RingError::Geometry(e.to_string()))?;
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw)
            .ok_or_else(|| RingError::Geometry(format!("allocation of {size} bytes failed")))?;
        Ok(Self { ptr, layout })
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for AlignedBlock {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

// The blocks are plain byte memory owned exclusively by the buffer.
unsafe impl Send for AlignedBlock {}

/// A pool of `num_buffers` aligned blocks of `block_size` bytes each, with
/// a matching iovec table for vectored requests.
///
/// The buffer tracks an absolute offset into the pool, the index of the
/// block that offset falls into, and an `effective_size` watermark that
/// distinguishes live bytes from raw capacity. After a short read the
/// watermark is lowered to the byte count actually transferred so the
/// buffer can be reused for further operations.
pub struct VectoredBuffer {
    block_size: usize,
    num_buffers: usize,
    blocks: Vec<AlignedBlock>,
    iovecs: Vec<libc::iovec>,
    offset: u64,
    index: usize,
    effective_size: i64,
}

impl VectoredBuffer {
    pub fn new(block_size: usize, num_buffers: usize) -> Result<Self, RingError> {
        if block_size == 0 || num_buffers == 0 {
            return Err(RingError::Geometry(format!(
                "block size {block_size} / buffer count {num_buffers} must be non-zero"
            )));
        }

        let mut blocks = Vec::with_capacity(num_buffers);
        for _ in 0..num_buffers {
            blocks.push(AlignedBlock::new(block_size)?);
        }

        let iovecs = blocks
            .iter()
            .map(|b| libc::iovec {
                iov_base: b.ptr.as_ptr() as *mut libc::c_void,
                iov_len: block_size,
            })
            .collect();

        Ok(Self {
            block_size,
            num_buffers,
            blocks,
            iovecs,
            offset: 0,
            index: 0,
            effective_size: 0,
        })
    }

    /// Overall capacity of the pool in bytes.
    pub fn capacity(&self) -> u64 {
        (self.block_size * self.num_buffers) as u64
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_buffers(&self) -> usize {
        self.num_buffers
    }

    pub fn effective_size(&self) -> i64 {
        self.effective_size
    }

    /// Sets the number of live bytes in the pool. Negative values and
    /// values above capacity are hard errors.
    pub fn set_effective_size(&mut self, size: i64) -> Result<(), RingError> {
        if size < 0 || size as u64 > self.capacity() {
            return Err(RingError::EffectiveSizeOutOfBounds {
                size,
                capacity: self.capacity(),
            });
        }
        self.effective_size = size;
        Ok(())
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Advances the absolute position into the pool. Out-of-bounds
    /// positions are rejected; the position at exact capacity is legal and
    /// denotes the end of the pool.
    pub fn set_offset(&mut self, offset: u64) -> Result<(), RingError> {
        if offset > self.capacity() {
            return Err(RingError::OffsetOutOfBounds {
                offset,
                capacity: self.capacity(),
            });
        }
        self.offset = offset;
        self.index = ((offset as usize) / self.block_size).min(self.num_buffers - 1);
        Ok(())
    }

    /// Index of the block the current offset falls into.
    pub fn current_index(&self) -> usize {
        self.index
    }

    /// Read access to the block at the current offset.
    pub fn buffer(&self) -> &[u8] {
        self.blocks[self.index].as_slice()
    }

    /// Write access to the block at the current offset.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        self.blocks[self.index].as_mut_slice()
    }

    /// Copies `data` into the pool starting at the current offset and
    /// raises the effective size to cover it. Returns the number of bytes
    /// copied, which is less than `data.len()` if capacity runs out.
    pub fn fill(&mut self, data: &[u8]) -> usize {
        let mut copied = 0usize;
        let mut pos = self.offset as usize;
        let cap = self.capacity() as usize;

        while copied < data.len() && pos < cap {
            let block = pos / self.block_size;
            let inside = pos % self.block_size;
            let room = (self.block_size - inside).min(data.len() - copied);
            self.blocks[block].as_mut_slice()[inside..inside + room]
                .copy_from_slice(&data[copied..copied + room]);
            copied += room;
            pos += room;
        }

        let high = (self.offset as usize + copied) as i64;
        if high > self.effective_size {
            self.effective_size = high;
        }
        copied
    }

    /// Copies the live bytes `[0, effective_size)` out of the pool.
    pub fn drain(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.effective_size.max(0) as usize);
        let mut remaining = self.effective_size.max(0) as usize;
        for block in &self.blocks {
            if remaining == 0 {
                break;
            }
            let take = remaining.min(self.block_size);
            out.extend_from_slice(&block.as_slice()[..take]);
            remaining -= take;
        }
        out
    }

    /// Zeroes the pool contents. Allocation is left in place.
    pub fn clear(&mut self) {
        for block in &mut self.blocks {
            block.as_mut_slice().fill(0);
        }
        self.offset = 0;
        self.index = 0;
        self.effective_size = 0;
    }

    fn iovec_ptr(&self) -> *const libc::iovec {
        self.iovecs.as_ptr()
    }
}

/// A handle for one io_uring instance bound to a file.
pub struct RingInstance {
    queue_depth: u32,
    block_size: usize,
    ring: Option<IoUring>,
    file: Option<File>,
}

impl Default for RingInstance {
    fn default() -> Self {
        Self::new()
    }
}

impl RingInstance {
    pub fn new() -> Self {
        Self::with_params(DEFAULT_QUEUE_DEPTH, DEFAULT_BLOCK_SIZE)
    }

    pub fn with_params(queue_depth: u32, block_size: usize) -> Self {
        Self {
            queue_depth,
            block_size,
            ring: None,
            file: None,
        }
    }

    pub fn queue_depth(&self) -> u32 {
        self.queue_depth
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Changes the queue depth. Must happen before `setup()`.
    pub fn set_queue_depth(&mut self, queue_depth: u32) -> Result<(), RingError> {
        if self.available() {
            return Err(RingError::AlreadyInitialized);
        }
        self.queue_depth = queue_depth;
        Ok(())
    }

    /// Changes the block size. Must happen before `setup()`.
    pub fn set_block_size(&mut self, block_size: usize) -> Result<(), RingError> {
        if self.available() {
            return Err(RingError::AlreadyInitialized);
        }
        self.block_size = block_size;
        Ok(())
    }

    /// Initializes the ring and binds `file` for subsequent requests.
    pub fn setup(&mut self, file: File) -> Result<(), RingError> {
        if self.available() {
            return Err(RingError::AlreadyInitialized);
        }
        let entries = self.queue_depth.max(1).next_power_of_two();
        self.ring = Some(IoUring::new(entries)?);
        self.file = Some(file);
        debug!(
            "ring initialized, queue depth {}, block size {}",
            self.queue_depth, self.block_size
        );
        Ok(())
    }

    /// True once `setup()` ran and `exit()` has not torn the ring down.
    pub fn available(&self) -> bool {
        self.ring.is_some()
    }

    /// Tears down the ring and releases the bound file handle.
    pub fn exit(&mut self) {
        self.ring = None;
        self.file = None;
    }

    /// The file handle bound by `setup()`.
    pub fn file(&self) -> Result<&File, RingError> {
        self.file.as_ref().ok_or(RingError::NotInitialized)
    }

    /// Allocates an aligned, zero-initialized vectored buffer matching the
    /// ring geometry: `queue_depth` blocks of `block_size` bytes.
    pub fn alloc_buffer(&self) -> Result<VectoredBuffer, RingError> {
        VectoredBuffer::new(self.block_size, self.queue_depth as usize)
    }

    fn check_geometry(&self, buf: &VectoredBuffer) -> Result<(), RingError> {
        if buf.num_buffers() > self.queue_depth as usize {
            return Err(RingError::Geometry(format!(
                "vector length {} exceeds queue depth {}",
                buf.num_buffers(),
                self.queue_depth
            )));
        }
        if buf.block_size() != self.block_size {
            return Err(RingError::Geometry(format!(
                "buffer block size {} does not match ring block size {}",
                buf.block_size(),
                self.block_size
            )));
        }
        Ok(())
    }

    /// Enqueues a vectored read of the whole pool at file position `pos`.
    pub fn read(&mut self, file: &File, buf: &mut VectoredBuffer, pos: u64) -> Result<(), RingError> {
        self.check_geometry(buf)?;
        let ring = self.ring.as_mut().ok_or(RingError::NotInitialized)?;

        let entry = opcode::Readv::new(
            types::Fd(file.as_raw_fd()),
            buf.iovec_ptr(),
            buf.num_buffers() as u32,
        )
        .offset(pos)
        .build()
        .user_data(pos);

        unsafe {
            ring.submission()
                .push(&entry)
                .map_err(|_| RingError::QueueFull)?;
        }
        ring.submit()?;
        Ok(())
    }

    /// Enqueues a vectored write of the whole pool at file position `pos`.
    pub fn write(&mut self, file: &File, buf: &VectoredBuffer, pos: u64) -> Result<(), RingError> {
        self.check_geometry(buf)?;
        let ring = self.ring.as_mut().ok_or(RingError::NotInitialized)?;

        let entry = opcode::Writev::new(
            types::Fd(file.as_raw_fd()),
            buf.iovec_ptr(),
            buf.num_buffers() as u32,
        )
        .offset(pos)
        .build()
        .user_data(pos);

        unsafe {
            ring.submission()
                .push(&entry)
                .map_err(|_| RingError::QueueFull)?;
        }
        ring.submit()?;
        Ok(())
    }

    /// Blocks until one completion arrives and pops it off the queue.
    pub fn wait(&mut self) -> Result<cqueue::Entry, RingError> {
        let ring = self.ring.as_mut().ok_or(RingError::NotInitialized)?;
        ring.submit_and_wait(1)?;
        let mut cq = ring.completion();
        let entry = cq.next().ok_or(RingError::NoCompletion)?;
        Ok(entry)
    }

    /// Publishes consumed completion entries back to the kernel. The
    /// counterpart of liburing's `io_uring_cqe_seen`.
    pub fn seen(&mut self) -> Result<(), RingError> {
        let ring = self.ring.as_mut().ok_or(RingError::NotInitialized)?;
        ring.completion().sync();
        Ok(())
    }

    /// Awaits one completion, reconciles the byte count with the buffer's
    /// effective size, and returns the count. A negative kernel result is
    /// surfaced as a ring failure carrying the errno.
    pub fn handle_current_io(&mut self, buf: &mut VectoredBuffer) -> Result<i64, RingError> {
        let cqe = self.wait()?;
        let res = cqe.result();
        if res < 0 {
            return Err(RingError::from_os("vectored request failed", -res));
        }
        self.seen()?;
        buf.set_effective_size(res as i64)?;
        Ok(res as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_geometry_is_validated() {
        assert!(VectoredBuffer::new(0, 4).is_err());
        assert!(VectoredBuffer::new(4096, 0).is_err());

        let buf = VectoredBuffer::new(4096, 8).unwrap();
        assert_eq!(buf.capacity(), 8 * 4096);
        assert_eq!(buf.effective_size(), 0);
    }

    #[test]
    fn offset_bounds() {
        let mut buf = VectoredBuffer::new(16, 2).unwrap();
        buf.set_offset(32).unwrap();
        assert!(buf.set_offset(33).is_err());
        buf.set_offset(17).unwrap();
        assert_eq!(buf.current_index(), 1);
    }

    #[test]
    fn effective_size_bounds() {
        let mut buf = VectoredBuffer::new(16, 2).unwrap();
        assert!(buf.set_effective_size(-1).is_err());
        buf.set_effective_size(32).unwrap();
        assert!(buf.set_effective_size(33).is_err());
    }

    #[test]
    fn fill_and_drain_round_trip() {
        let mut buf = VectoredBuffer::new(4, 2).unwrap();
        let copied = buf.fill(b"hello!");
        assert_eq!(copied, 6);
        assert_eq!(buf.effective_size(), 6);
        assert_eq!(buf.drain(), b"hello!");

        // Capacity is a hard stop for fill().
        buf.set_offset(6).unwrap();
        assert_eq!(buf.fill(b"abcdef"), 2);
    }
}
