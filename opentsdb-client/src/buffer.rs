//! Trace buffers and the allocator that hands them out.
use std::{
    io,
    sync::atomic::{AtomicU64, Ordering},
};

use bytes::{Bytes, BytesMut};
use crossbeam_queue::ArrayQueue;

const DEFAULT_POOL_SLOTS: usize = 64;

// Buffers that grew past this are not worth keeping around.
const MAX_POOLED_CAPACITY: usize = 1024 * 1024;

static NEXT_SINK_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of an output sink.
///
/// Every [`TraceBuffer`] gets a distinct identity for its whole lifetime, which codecs use to key any per-sink encoder
/// state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SinkId(u64);

impl SinkId {
    fn next() -> Self {
        SinkId(NEXT_SINK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// A growable byte buffer that data points are encoded into.
#[derive(Debug)]
pub struct TraceBuffer {
    id: SinkId,
    buf: BytesMut,
    header_len: usize,
}

impl TraceBuffer {
    fn from_bytes(buf: BytesMut) -> Self {
        Self { id: SinkId::next(), buf, header_len: 0 }
    }

    /// Returns the identity of this buffer.
    pub const fn id(&self) -> SinkId {
        self.id
    }

    /// Returns the number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns `true` if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Returns `true` if anything beyond the batch header has been written.
    pub fn has_records(&self) -> bool {
        self.buf.len() > self.header_len
    }

    /// Marks everything written so far as the batch header.
    pub(crate) fn mark_header(&mut self) {
        self.header_len = self.buf.len();
    }

    /// Returns the bytes written so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Appends raw bytes.
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Consumes the buffer, returning its contents.
    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

impl io::Write for TraceBuffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.buf.extend_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Allocates and recycles the buffers that batches are encoded into.
///
/// When pooling is enabled, buffers released by the transport are cleared and kept for reuse, up to a fixed number of
/// slots. Otherwise, every allocation is fresh and released buffers are simply dropped.
///
/// A single manager can be shared between clients.
#[derive(Debug)]
pub struct BufferManager {
    pool: Option<ArrayQueue<BytesMut>>,
    allocated: AtomicU64,
    reused: AtomicU64,
}

impl BufferManager {
    /// Creates a pooling `BufferManager`.
    pub fn pooled() -> Self {
        Self::with_pool_slots(DEFAULT_POOL_SLOTS)
    }

    /// Creates a pooling `BufferManager` that retains at most `slots` released buffers.
    ///
    /// # Panics
    ///
    /// Panics if `slots` is zero.
    pub fn with_pool_slots(slots: usize) -> Self {
        Self { pool: Some(ArrayQueue::new(slots)), allocated: AtomicU64::new(0), reused: AtomicU64::new(0) }
    }

    /// Creates a `BufferManager` that never reuses buffers.
    pub fn unpooled() -> Self {
        Self { pool: None, allocated: AtomicU64::new(0), reused: AtomicU64::new(0) }
    }

    /// Returns `true` if released buffers are recycled.
    pub fn is_pooled(&self) -> bool {
        self.pool.is_some()
    }

    /// Allocates an empty buffer with room for at least `initial_size` bytes.
    pub fn allocate(&self, initial_size: usize) -> TraceBuffer {
        match self.pool.as_ref().and_then(ArrayQueue::pop) {
            Some(mut buf) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                buf.reserve(initial_size);
                TraceBuffer::from_bytes(buf)
            }
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                TraceBuffer::from_bytes(BytesMut::with_capacity(initial_size))
            }
        }
    }

    /// Wraps existing data in a read-only buffer.
    pub fn wrap<B>(&self, data: B) -> Bytes
    where
        B: Into<Bytes>,
    {
        data.into()
    }

    /// Returns a buffer to the manager.
    ///
    /// Buffers that are still shared elsewhere, or that grew unreasonably large, are dropped instead of pooled.
    pub fn release(&self, buf: Bytes) {
        let Some(pool) = self.pool.as_ref() else { return };

        if let Ok(mut buf) = buf.try_into_mut() {
            if buf.capacity() <= MAX_POOLED_CAPACITY {
                buf.clear();
                let _ = pool.push(buf);
            }
        }
    }

    /// Returns the number of buffers allocated fresh.
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Returns the number of allocations served from the pool.
    pub fn reused(&self) -> u64 {
        self.reused.load(Ordering::Relaxed)
    }
}

impl Default for BufferManager {
    fn default() -> Self {
        Self::pooled()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use bytes::Bytes;

    use super::BufferManager;

    #[test]
    fn sink_ids_are_unique() {
        let manager = BufferManager::unpooled();
        let a = manager.allocate(16);
        let b = manager.allocate(16);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn pooled_buffers_are_recycled_empty() {
        let manager = BufferManager::pooled();

        let mut buf = manager.allocate(32);
        buf.write_all(b"PUTBATCH\n").unwrap();
        let first_id = buf.id();
        manager.release(buf.into_bytes());

        let buf = manager.allocate(32);
        assert!(buf.is_empty());
        assert_ne!(buf.id(), first_id);
        assert_eq!(manager.allocated(), 1);
        assert_eq!(manager.reused(), 1);
    }

    #[test]
    fn shared_buffers_are_not_pooled() {
        let manager = BufferManager::pooled();

        let mut buf = manager.allocate(32);
        buf.write_all(b"data").unwrap();
        let bytes = buf.into_bytes();
        let still_shared = bytes.clone();
        manager.release(bytes);

        let _ = manager.allocate(32);
        assert_eq!(manager.reused(), 0);
        assert_eq!(&still_shared[..], b"data");
    }

    #[test]
    fn unpooled_never_reuses() {
        let manager = BufferManager::unpooled();
        manager.release(manager.allocate(8).into_bytes());
        let _ = manager.allocate(8);

        assert!(!manager.is_pooled());
        assert_eq!(manager.allocated(), 2);
        assert_eq!(manager.reused(), 0);
    }

    #[test]
    fn header_tracking() {
        let manager = BufferManager::unpooled();
        let mut buf = manager.allocate(8);
        buf.extend_from_slice(b"[");
        buf.mark_header();
        assert!(!buf.has_records());

        buf.extend_from_slice(b"{}");
        assert!(buf.has_records());
        assert_eq!(manager.wrap("STATS\n"), Bytes::from_static(b"STATS\n"));
    }
}
