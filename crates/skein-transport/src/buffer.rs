//! Growable byte buffer with independent read and write cursors.
//!
//! Each connection owns one buffer per direction. Bytes are appended at
//! `write_index` and consumed from `read_index`; the region between them is the
//! readable data. The backing storage doubles when a write needs more room and
//! is reallocated ("compacted") when a large buffer has mostly been drained, so
//! a single burst does not pin memory for the lifetime of the connection.
//!
//! Invariant after every operation: `0 <= read_index <= write_index <= capacity`.

use std::fmt;
use std::io::{self, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd};

use nix::errno::Errno;
use nix::sys::socket::{send, MsgFlags};
use nix::sys::uio::readv;

use crate::error::BufferError;

/// Capacity above which a mostly-drained buffer is reallocated.
pub const LARGE_BUFFER_THRESHOLD: usize = 64 * 1024;

/// Smallest capacity allocated on first growth.
pub const MIN_CAPACITY: usize = 64;

/// Stack-side spill area for `read_from_fd`.
const OVERFLOW_CHUNK: usize = 64 * 1024;

/// Read/write byte buffer.
#[derive(Clone, Default)]
pub struct ByteBuffer {
    data: Vec<u8>,
    read_index: usize,
    write_index: usize,
}

impl fmt::Debug for ByteBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteBuffer")
            .field("capacity", &self.capacity())
            .field("read_index", &self.read_index)
            .field("write_index", &self.write_index)
            .finish()
    }
}

impl ByteBuffer {
    /// Creates an empty buffer with zero capacity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a buffer with `capacity` writable bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity],
            read_index: 0,
            write_index: 0,
        }
    }

    /// Total size of the backing storage.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Current read cursor.
    pub fn read_index(&self) -> usize {
        self.read_index
    }

    /// Current write cursor.
    pub fn write_index(&self) -> usize {
        self.write_index
    }

    /// Bytes available to read.
    pub fn readable_len(&self) -> usize {
        self.write_index - self.read_index
    }

    /// Bytes that can be written without growing.
    pub fn writable_len(&self) -> usize {
        self.capacity() - self.write_index
    }

    /// True when nothing is readable.
    pub fn is_empty(&self) -> bool {
        self.readable_len() == 0
    }

    /// The readable region, without consuming it.
    pub fn peek_raw(&self) -> &[u8] {
        &self.data[self.read_index..self.write_index]
    }

    /// The first `len` readable bytes, if that many are buffered.
    pub fn peek(&self, len: usize) -> Option<&[u8]> {
        if len > self.readable_len() {
            return None;
        }
        Some(&self.data[self.read_index..self.read_index + len])
    }

    /// The writable tail; pair with [`advance_write`](Self::advance_write).
    pub fn writable_mut(&mut self) -> &mut [u8] {
        let start = self.write_index;
        &mut self.data[start..]
    }

    /// Commits `len` bytes written directly into [`writable_mut`](Self::writable_mut).
    pub fn advance_write(&mut self, len: usize) -> Result<(), BufferError> {
        self.set_write_index(self.write_index + len)
    }

    /// Guarantees at least `len` writable bytes.
    ///
    /// A large buffer whose readable data is under half its capacity is first
    /// reallocated to hold only the unread tail; then the capacity doubles until
    /// the request fits.
    pub fn ensure_writable(&mut self, len: usize) -> Result<(), BufferError> {
        if self.writable_len() >= len {
            return Ok(());
        }

        if self.capacity() > LARGE_BUFFER_THRESHOLD && self.readable_len() < self.capacity() / 2
        {
            let wanted = self
                .readable_len()
                .checked_add(len)
                .ok_or(BufferError::CapacityOverflow)?;
            self.reallocate(wanted)?;
            if self.writable_len() >= len {
                return Ok(());
            }
        }

        let required = self
            .write_index
            .checked_add(len)
            .ok_or(BufferError::CapacityOverflow)?;
        let mut new_capacity = self.capacity().max(MIN_CAPACITY);
        while new_capacity < required {
            new_capacity = new_capacity
                .checked_mul(2)
                .ok_or(BufferError::CapacityOverflow)?;
        }

        let additional = new_capacity - self.capacity();
        self.data
            .try_reserve_exact(additional)
            .map_err(|_| BufferError::OutOfMemory {
                requested: new_capacity,
            })?;
        self.data.resize(new_capacity, 0);
        Ok(())
    }

    /// Appends `bytes`, growing as needed.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        self.ensure_writable(bytes.len())?;
        let end = self.write_index + bytes.len();
        self.data[self.write_index..end].copy_from_slice(bytes);
        self.write_index = end;
        Ok(())
    }

    /// Copies exactly `out.len()` bytes out of the readable region.
    pub fn read(&mut self, out: &mut [u8]) -> Result<(), BufferError> {
        let bytes = self.peek(out.len()).ok_or(BufferError::InsufficientData {
            wanted: out.len(),
            readable: self.readable_len(),
        })?;
        out.copy_from_slice(bytes);
        self.skip(out.len())
    }

    /// Consumes `len` readable bytes without copying them.
    pub fn skip(&mut self, len: usize) -> Result<(), BufferError> {
        if len > self.readable_len() {
            return Err(BufferError::InsufficientData {
                wanted: len,
                readable: self.readable_len(),
            });
        }
        self.read_index += len;
        if self.read_index == self.write_index {
            self.read_index = 0;
            self.write_index = 0;
        }
        Ok(())
    }

    /// Moves the read cursor; must stay within `0..=write_index`.
    pub fn set_read_index(&mut self, index: usize) -> Result<(), BufferError> {
        if index > self.write_index {
            return Err(BufferError::IndexOutOfRange {
                index,
                limit: self.write_index,
            });
        }
        self.read_index = index;
        Ok(())
    }

    /// Moves the write cursor; must stay within `read_index..=capacity`.
    pub fn set_write_index(&mut self, index: usize) -> Result<(), BufferError> {
        if index < self.read_index || index > self.capacity() {
            return Err(BufferError::IndexOutOfRange {
                index,
                limit: self.capacity(),
            });
        }
        self.write_index = index;
        Ok(())
    }

    /// Drops all readable data, keeping the allocation.
    pub fn clear(&mut self) {
        self.read_index = 0;
        self.write_index = 0;
    }

    /// Reallocates to hold only the unread tail, releasing the consumed prefix
    /// and any excess capacity.
    pub fn compact(&mut self) -> Result<(), BufferError> {
        self.reallocate(self.readable_len())
    }

    /// Compacts when the buffer is large and less than half full.
    ///
    /// Returns true if a reallocation happened.
    pub fn maybe_compact(&mut self) -> Result<bool, BufferError> {
        if self.capacity() > LARGE_BUFFER_THRESHOLD && self.readable_len() < self.capacity() / 2 {
            self.compact()?;
            return Ok(true);
        }
        Ok(false)
    }

    fn reallocate(&mut self, min_capacity: usize) -> Result<(), BufferError> {
        let new_capacity = min_capacity
            .max(MIN_CAPACITY)
            .checked_next_power_of_two()
            .ok_or(BufferError::CapacityOverflow)?;

        let mut fresh = Vec::new();
        fresh
            .try_reserve_exact(new_capacity)
            .map_err(|_| BufferError::OutOfMemory {
                requested: new_capacity,
            })?;
        fresh.extend_from_slice(self.peek_raw());
        let readable = fresh.len();
        fresh.resize(new_capacity, 0);

        self.data = fresh;
        self.read_index = 0;
        self.write_index = readable;
        Ok(())
    }

    /// Formats `args` into the writable region, growing as needed.
    ///
    /// Returns the number of bytes written. On failure nothing is left behind.
    pub fn write_formatted(&mut self, args: fmt::Arguments<'_>) -> Result<usize, BufferError> {
        struct Sink<'a> {
            buf: &'a mut ByteBuffer,
            error: Option<BufferError>,
        }

        impl fmt::Write for Sink<'_> {
            fn write_str(&mut self, s: &str) -> fmt::Result {
                self.buf.write(s.as_bytes()).map_err(|e| {
                    self.error = Some(e);
                    fmt::Error
                })
            }
        }

        // measured relative to the read cursor: growth may compact and move it
        let before = self.readable_len();
        let mut sink = Sink {
            buf: self,
            error: None,
        };
        if fmt::write(&mut sink, args).is_err() {
            let error = sink.error.take().unwrap_or(BufferError::CapacityOverflow);
            self.write_index = self.read_index + before;
            return Err(error);
        }
        Ok(self.readable_len() - before)
    }

    /// Reads whatever the descriptor has into the buffer.
    ///
    /// Uses a scatter read into the writable tail plus a stack spill area so a
    /// single syscall can absorb more than the current free space. Returns the
    /// number of bytes read; `Ok(0)` means the peer closed, and
    /// `ErrorKind::WouldBlock` means no data right now.
    pub fn read_from_fd(&mut self, fd: BorrowedFd<'_>) -> io::Result<usize> {
        let mut overflow = [0u8; OVERFLOW_CHUNK];
        let writable = self.writable_len();

        let n = loop {
            let start = self.write_index;
            let tail = &mut self.data[start..];
            let mut iov = [IoSliceMut::new(tail), IoSliceMut::new(&mut overflow)];
            match readv(fd, &mut iov) {
                Ok(n) => break n,
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(errno.into()),
            }
        };

        if n <= writable {
            self.write_index += n;
        } else {
            self.write_index = self.capacity();
            self.write(&overflow[..n - writable])
                .map_err(|e| io::Error::new(io::ErrorKind::OutOfMemory, e))?;
        }
        Ok(n)
    }

    /// Sends the readable region to a socket and consumes what was sent.
    ///
    /// `SIGPIPE` is suppressed; a closed peer surfaces as `BrokenPipe`.
    pub fn write_to_fd(&mut self, fd: BorrowedFd<'_>) -> io::Result<usize> {
        if self.is_empty() {
            return Ok(0);
        }
        let n = loop {
            match send(fd.as_raw_fd(), self.peek_raw(), MsgFlags::MSG_NOSIGNAL) {
                Ok(n) => break n,
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(errno.into()),
            }
        };
        self.skip(n)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(n)
    }
}

impl fmt::Write for ByteBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write(s.as_bytes()).map_err(|_| fmt::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;

    fn check_invariant(buf: &ByteBuffer) {
        assert!(buf.read_index() <= buf.write_index());
        assert!(buf.write_index() <= buf.capacity());
    }

    #[test]
    fn test_new_is_empty() {
        let buf = ByteBuffer::new();
        assert_eq!(buf.capacity(), 0);
        assert_eq!(buf.readable_len(), 0);
        assert_eq!(buf.writable_len(), 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_write_then_read() {
        let mut buf = ByteBuffer::new();
        buf.write(b"hello world").unwrap();
        assert_eq!(buf.readable_len(), 11);

        let mut out = [0u8; 5];
        buf.read(&mut out).unwrap();
        assert_eq!(&out, b"hello");
        assert_eq!(buf.peek_raw(), b" world");
        check_invariant(&buf);
    }

    #[test]
    fn test_read_too_much_fails() {
        let mut buf = ByteBuffer::new();
        buf.write(b"abc").unwrap();
        let mut out = [0u8; 4];
        let err = buf.read(&mut out).unwrap_err();
        assert_eq!(
            err,
            BufferError::InsufficientData {
                wanted: 4,
                readable: 3
            }
        );
        assert_eq!(buf.readable_len(), 3);
    }

    #[test]
    fn test_growth_doubles() {
        let mut buf = ByteBuffer::new();
        buf.ensure_writable(1).unwrap();
        assert_eq!(buf.capacity(), MIN_CAPACITY);

        buf.write(&[7u8; MIN_CAPACITY]).unwrap();
        buf.ensure_writable(1).unwrap();
        assert_eq!(buf.capacity(), MIN_CAPACITY * 2);

        buf.ensure_writable(MIN_CAPACITY * 5).unwrap();
        assert_eq!(buf.capacity(), MIN_CAPACITY * 8);
        check_invariant(&buf);
    }

    #[test]
    fn test_skip_to_end_resets_cursors() {
        let mut buf = ByteBuffer::new();
        buf.write(b"abcdef").unwrap();
        buf.skip(6).unwrap();
        assert_eq!(buf.read_index(), 0);
        assert_eq!(buf.write_index(), 0);
        assert!(buf.skip(1).is_err());
    }

    #[test]
    fn test_set_indexes_bounds() {
        let mut buf = ByteBuffer::with_capacity(16);
        buf.write(b"12345678").unwrap();
        assert!(buf.set_read_index(9).is_err());
        buf.set_read_index(4).unwrap();
        assert!(buf.set_write_index(3).is_err());
        assert!(buf.set_write_index(17).is_err());
        buf.set_write_index(6).unwrap();
        assert_eq!(buf.peek_raw(), b"56");
        check_invariant(&buf);
    }

    #[test]
    fn test_large_drained_buffer_compacts_on_growth() {
        let mut buf = ByteBuffer::new();
        let big = vec![1u8; LARGE_BUFFER_THRESHOLD * 2];
        buf.write(&big).unwrap();
        let large_capacity = buf.capacity();
        assert!(large_capacity > LARGE_BUFFER_THRESHOLD);

        buf.skip(big.len() - 10).unwrap();
        buf.ensure_writable(large_capacity).unwrap();
        assert_eq!(buf.readable_len(), 10);
        assert_eq!(buf.read_index(), 0);
        assert!(buf.writable_len() >= large_capacity);
        check_invariant(&buf);
    }

    #[test]
    fn test_maybe_compact() {
        let mut buf = ByteBuffer::new();
        buf.write(&vec![9u8; LARGE_BUFFER_THRESHOLD * 4]).unwrap();
        assert!(!buf.maybe_compact().unwrap());

        buf.skip(LARGE_BUFFER_THRESHOLD * 4 - 100).unwrap();
        assert!(buf.maybe_compact().unwrap());
        assert_eq!(buf.readable_len(), 100);
        assert_eq!(buf.capacity(), 128);
        assert!(buf.peek_raw().iter().all(|&b| b == 9));
    }

    #[test]
    fn test_write_formatted() {
        let mut buf = ByteBuffer::new();
        let n = buf
            .write_formatted(format_args!("{} {}\r\n", "HTTP/1.1", 200))
            .unwrap();
        assert_eq!(n, 14);
        assert_eq!(buf.peek_raw(), b"HTTP/1.1 200\r\n");

        let long = "x".repeat(5000);
        buf.write_formatted(format_args!("{long}")).unwrap();
        assert_eq!(buf.readable_len(), 14 + 5000);
    }

    #[test]
    fn test_read_from_fd_and_overflow() {
        let (mut a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();

        let payload = vec![0xABu8; 1000];
        a.write_all(&payload).unwrap();

        let mut buf = ByteBuffer::with_capacity(16);
        let n = buf.read_from_fd(b.as_fd()).unwrap();
        assert_eq!(n, 1000);
        assert_eq!(buf.readable_len(), 1000);
        assert_eq!(buf.peek_raw(), &payload[..]);
        check_invariant(&buf);

        let err = buf.read_from_fd(b.as_fd()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        drop(a);
        assert_eq!(buf.read_from_fd(b.as_fd()).unwrap(), 0);
    }

    #[test]
    fn test_write_to_fd() {
        let (a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();

        let mut buf = ByteBuffer::new();
        buf.write(b"ping").unwrap();
        assert_eq!(buf.write_to_fd(a.as_fd()).unwrap(), 4);
        assert!(buf.is_empty());

        let mut out = [0u8; 4];
        std::io::Read::read_exact(&mut b, &mut out).unwrap();
        assert_eq!(&out, b"ping");
    }
}
