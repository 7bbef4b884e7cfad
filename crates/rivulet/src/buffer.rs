//! Growable byte buffer with read/write cursors
//!
//! Layout mirrors the classic reactor buffer:
//!
//! ```text
//! +-------------------+------------------+------------------+
//! | prependable bytes |  readable bytes  |  writable bytes  |
//! +-------------------+------------------+------------------+
//! 0      <=      reader      <=      writer      <=     capacity
//! ```
//!
//! The prepend region reserves cheap header space (length prefixes and the
//! like) so a protocol layer can frame a message without an extra copy.
//! One input and one output buffer are embedded in every connection and are
//! only ever touched by that connection's loop thread.

use rivulet_core::error::{NetError, NetResult};
use std::os::unix::io::RawFd;

/// Reserved header space kept in front of the readable region.
pub const CHEAP_PREPEND: usize = 8;
/// Initial writable capacity.
pub const INITIAL_SIZE: usize = 1024;

/// Stack scratch used by the scatter read, bounding one `readv` to 64 KiB
/// beyond the buffer's own tail.
const EXTRA_BUF_SIZE: usize = 65536;

pub struct Buffer {
    data: Vec<u8>,
    reader: usize,
    writer: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(initial: usize) -> Self {
        Buffer {
            data: vec![0; CHEAP_PREPEND + initial],
            reader: CHEAP_PREPEND,
            writer: CHEAP_PREPEND,
        }
    }

    #[inline]
    pub fn readable(&self) -> usize {
        self.writer - self.reader
    }

    #[inline]
    pub fn writable(&self) -> usize {
        self.data.len() - self.writer
    }

    #[inline]
    pub fn prependable(&self) -> usize {
        self.reader
    }

    /// Backing capacity; `prependable + readable + writable == capacity`.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The unconsumed readable region.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.data[self.reader..self.writer]
    }

    /// Consume `len` readable bytes. Consuming everything resets both
    /// cursors to the prepend boundary so the space is reclaimed.
    pub fn retrieve(&mut self, len: usize) {
        if len < self.readable() {
            self.reader += len;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.reader = CHEAP_PREPEND;
        self.writer = CHEAP_PREPEND;
    }

    /// Extract and consume `len` bytes.
    pub fn retrieve_as_bytes(&mut self, len: usize) -> Vec<u8> {
        let len = len.min(self.readable());
        let out = self.data[self.reader..self.reader + len].to_vec();
        self.retrieve(len);
        out
    }

    pub fn retrieve_all_as_bytes(&mut self) -> Vec<u8> {
        self.retrieve_as_bytes(self.readable())
    }

    /// Extract and consume `len` bytes as a string (lossy on invalid UTF-8).
    pub fn retrieve_as_string(&mut self, len: usize) -> String {
        let bytes = self.retrieve_as_bytes(len);
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn retrieve_all_as_string(&mut self) -> String {
        self.retrieve_as_string(self.readable())
    }

    /// Copy `data` behind the writer cursor, growing or compacting first.
    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.data[self.writer..self.writer + data.len()].copy_from_slice(data);
        self.writer += data.len();
    }

    /// Prepend `data` into the reserved header space in front of the
    /// readable region. Panics if the prepend space is exhausted; callers
    /// prepend at most `CHEAP_PREPEND` bytes of framing.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(data.len() <= self.prependable());
        self.reader -= data.len();
        self.data[self.reader..self.reader + data.len()].copy_from_slice(data);
    }

    /// Make room for `len` more bytes behind the writer cursor.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable() < len {
            self.make_space(len);
        }
    }

    /// The writable tail, for callers that fill the buffer directly.
    /// Pair with [`has_written`](Self::has_written).
    pub fn begin_write(&mut self) -> &mut [u8] {
        let writer = self.writer;
        &mut self.data[writer..]
    }

    /// Advance the writer cursor over `len` bytes filled via `begin_write`.
    pub fn has_written(&mut self, len: usize) {
        debug_assert!(len <= self.writable());
        self.writer += len;
    }

    fn make_space(&mut self, len: usize) {
        if self.writable() + self.prependable() < len + CHEAP_PREPEND {
            // Grow to exactly accommodate the request.
            self.data.resize(self.writer + len, 0);
        } else {
            // Enough dead prepend space: slide unread bytes down instead of
            // growing, which bounds memory under steady-state traffic.
            let readable = self.readable();
            self.data.copy_within(self.reader..self.writer, CHEAP_PREPEND);
            self.reader = CHEAP_PREPEND;
            self.writer = self.reader + readable;
        }
    }

    /// Single scatter read from `fd` into the writable tail plus a 64 KiB
    /// stack scratch region. Bytes landing in the scratch are appended
    /// (growing the buffer) only after the read, so the buffer is never
    /// grown speculatively. `Ok(0)` is the peer's half-close.
    pub fn read_fd(&mut self, fd: RawFd) -> NetResult<usize> {
        let mut extra = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable();

        let mut iov = [
            libc::iovec {
                iov_base: self.begin_write().as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut libc::c_void,
                iov_len: EXTRA_BUF_SIZE,
            },
        ];
        // When the tail alone can hold 64 KiB there is no point in the
        // second segment.
        let iovcnt: libc::c_int = if writable < EXTRA_BUF_SIZE { 2 } else { 1 };

        let n = unsafe { libc::readv(fd, iov.as_mut_ptr(), iovcnt) };
        if n < 0 {
            return Err(NetError::last_os());
        }
        let n = n as usize;
        if n <= writable {
            self.has_written(n);
        } else {
            self.writer = self.data.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }

    /// Single write of the readable region. Never loops; partial writes are
    /// the caller's responsibility (it retrieves what was written and waits
    /// for the next writable notification).
    pub fn write_fd(&mut self, fd: RawFd) -> NetResult<usize> {
        let readable = self.readable();
        let n = unsafe {
            libc::write(
                fd,
                self.data[self.reader..].as_ptr() as *const libc::c_void,
                readable,
            )
        };
        if n < 0 {
            return Err(NetError::last_os());
        }
        Ok(n as usize)
    }
}
