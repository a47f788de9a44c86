//! Power-of-two circular buffer for outgoing frames.
//!
//! - Scale-to-zero: no allocation until the first write, storage returned
//!   to a lock-free pool once drained
//! - Length derived from head/tail, so it cannot drift from the contents
//! - Soft limit returns WouldBlock for backpressure on slow clients
//! - Hard limit returns OutOfMemory and the caller drops the connection

use std::io::{self, IoSlice};
use std::sync::LazyLock;

use crossbeam_queue::ArrayQueue;

/// Smallest pooled buffer (4KB).
const MIN_SIZE: usize = 4096;

/// Soft limit (1MB): writes above this are rejected with WouldBlock.
const SOFT_LIMIT: usize = 1024 * 1024;

/// Hard cap (8MB): growing past this returns OutOfMemory.
const MAX_SIZE: usize = 8 * 1024 * 1024;

// Global buffer pools by size class. Fanout to many subscribers churns
// through buffers quickly, so small classes are kept deep.
static POOL_4K: LazyLock<ArrayQueue<Box<[u8]>>> = LazyLock::new(|| ArrayQueue::new(256));
static POOL_16K: LazyLock<ArrayQueue<Box<[u8]>>> = LazyLock::new(|| ArrayQueue::new(64));
static POOL_64K: LazyLock<ArrayQueue<Box<[u8]>>> = LazyLock::new(|| ArrayQueue::new(16));

fn pool_for(size: usize) -> Option<&'static ArrayQueue<Box<[u8]>>> {
    match size {
        4096 => Some(&POOL_4K),
        16384 => Some(&POOL_16K),
        65536 => Some(&POOL_64K),
        _ => None,
    }
}

fn acquire(size: usize) -> Box<[u8]> {
    let size = size.next_power_of_two().max(MIN_SIZE);
    pool_for(size)
        .and_then(|pool| pool.pop())
        .unwrap_or_else(|| vec![0u8; size].into_boxed_slice())
}

fn release(buf: Box<[u8]>) {
    if let Some(pool) = pool_for(buf.len()) {
        let _ = pool.push(buf);
    }
}

/// Circular write buffer with power-of-two sizing.
///
/// `head` and `tail` are unbounded counters; the index into storage is
/// `position & (capacity - 1)`.
pub struct WriteBuffer {
    /// Storage, None while empty (scale-to-zero).
    buf: Option<Box<[u8]>>,
    head: usize,
    tail: usize,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self {
            buf: None,
            head: 0,
            tail: 0,
        }
    }

    /// Bytes currently queued.
    #[inline]
    pub fn len(&self) -> usize {
        self.head - self.tail
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Queue `data` for writing.
    ///
    /// Returns WouldBlock when the buffer is already past the soft limit
    /// and OutOfMemory when the write would exceed the hard cap.
    pub fn write_bytes(&mut self, data: &[u8]) -> io::Result<()> {
        if self.len() >= SOFT_LIMIT {
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        let required = self.len() + data.len();
        if required > MAX_SIZE {
            return Err(io::Error::from(io::ErrorKind::OutOfMemory));
        }

        if self.buf.as_ref().is_none_or(|b| b.len() < required) {
            self.grow(required);
        }

        let buf = self.buf.as_mut().unwrap();
        let cap = buf.len();
        let start = self.head & (cap - 1);
        let first = data.len().min(cap - start);
        buf[start..start + first].copy_from_slice(&data[..first]);
        if first < data.len() {
            buf[..data.len() - first].copy_from_slice(&data[first..]);
        }
        self.head += data.len();
        Ok(())
    }

    /// The queued bytes as up to two slices for vectored I/O.
    pub fn as_io_slices(&self) -> [IoSlice<'_>; 2] {
        static EMPTY: [u8; 0] = [];
        let Some(buf) = self.buf.as_ref() else {
            return [IoSlice::new(&EMPTY), IoSlice::new(&EMPTY)];
        };
        let cap = buf.len();
        let start = self.tail & (cap - 1);
        let len = self.len();
        let first = len.min(cap - start);
        [
            IoSlice::new(&buf[start..start + first]),
            IoSlice::new(&buf[..len - first]),
        ]
    }

    /// Mark `n` bytes as written to the socket. Releases the storage back
    /// to the pool once the buffer drains.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len());
        self.tail += n;
        if self.is_empty() {
            self.head = 0;
            self.tail = 0;
            if let Some(buf) = self.buf.take() {
                release(buf);
            }
        }
    }

    /// Replace storage with a larger power-of-two buffer, unwrapping the
    /// queued bytes to the front.
    fn grow(&mut self, required: usize) {
        let new_buf = acquire(required);
        let len = self.len();
        let mut replacement = new_buf;
        if let Some(old) = self.buf.take() {
            let cap = old.len();
            let start = self.tail & (cap - 1);
            let first = len.min(cap - start);
            replacement[..first].copy_from_slice(&old[start..start + first]);
            replacement[first..len].copy_from_slice(&old[..len - first]);
            release(old);
        }
        self.buf = Some(replacement);
        self.tail = 0;
        self.head = len;
    }
}

impl Default for WriteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(buf: &mut WriteBuffer) -> Vec<u8> {
        let mut out = Vec::new();
        let slices = buf.as_io_slices();
        out.extend_from_slice(&slices[0]);
        out.extend_from_slice(&slices[1]);
        let n = out.len();
        buf.consume(n);
        out
    }

    #[test]
    fn test_starts_unallocated() {
        let buf = WriteBuffer::new();
        assert!(buf.is_empty());
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_write_and_drain() {
        let mut buf = WriteBuffer::new();
        buf.write_bytes(b"hello").unwrap();
        buf.write_bytes(b" world").unwrap();
        assert_eq!(buf.len(), 11);
        assert_eq!(drain(&mut buf), b"hello world");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_wraparound_preserves_order() {
        let mut buf = WriteBuffer::new();
        // Leave 1000 queued bytes near the end of the 4K buffer, then write
        // past the boundary so the second write wraps to the front.
        buf.write_bytes(&vec![7u8; 3000]).unwrap();
        buf.consume(2000);
        buf.write_bytes(&vec![1u8; 2000]).unwrap();
        let out = drain(&mut buf);
        assert_eq!(out.len(), 3000);
        assert_eq!(&out[..1000], &vec![7u8; 1000][..]);
        assert_eq!(&out[1000..], &vec![1u8; 2000][..]);
    }

    #[test]
    fn test_grow_keeps_contents() {
        let mut buf = WriteBuffer::new();
        let big = vec![9u8; MIN_SIZE * 3];
        buf.write_bytes(b"abc").unwrap();
        buf.write_bytes(&big).unwrap();
        let out = drain(&mut buf);
        assert_eq!(&out[..3], b"abc");
        assert_eq!(out.len(), 3 + big.len());
    }

    #[test]
    fn test_soft_limit_backpressure() {
        let mut buf = WriteBuffer::new();
        buf.write_bytes(&vec![0u8; SOFT_LIMIT]).unwrap();
        let err = buf.write_bytes(b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_hard_limit() {
        let mut buf = WriteBuffer::new();
        let err = buf.write_bytes(&vec![0u8; MAX_SIZE + 1]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::OutOfMemory);
    }

    #[test]
    fn test_partial_consume() {
        let mut buf = WriteBuffer::new();
        buf.write_bytes(b"abcdef").unwrap();
        buf.consume(3);
        assert_eq!(drain(&mut buf), b"def");
    }
}
