use crate::error::BufferError;
use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;

/// Size of the on-stack spill area used by scatter reads, so one fill can
/// pull more than the current free space without growing up front.
pub const SPILL_SIZE: usize = 64 * 1024;

/// Chunk size used when filling from a generic reader.
const READ_CHUNK: usize = 4096;

/// A staging area with independent read and write cursors.
///
/// Implementations are not synchronized. A connection's buffers are only
/// ever touched by the single task currently holding that connection's
/// lease (see `connection::ConnectionTable::take_lease`).
pub trait ByteBuffer {
    /// Bytes available to read.
    fn readable_bytes(&self) -> usize;

    /// Bytes that can be written without growing.
    fn writable_bytes(&self) -> usize;

    /// Current usable capacity.
    fn capacity(&self) -> usize;

    /// Largest capacity the buffer may grow to.
    fn max_capacity(&self) -> usize;

    /// Append bytes, growing if needed. Fails with `OutOfMemory` when the
    /// unread data plus `data` would exceed the maximum capacity.
    fn append(&mut self, data: &[u8]) -> Result<(), BufferError>;

    /// Scatter-read from a descriptor into free space plus a bounded spill
    /// area. `Ok(0)` means end of stream.
    fn fill_from_fd(&mut self, fd: RawFd) -> Result<usize, BufferError>;

    /// Gather-write the readable bytes to a descriptor.
    fn drain_to_fd(&mut self, fd: RawFd) -> Result<usize, BufferError>;

    /// Fill from any reader (used by secure channels).
    fn read_from<R: Read>(&mut self, reader: &mut R) -> Result<usize, BufferError>;

    /// Drain to any writer (used by secure channels).
    fn write_to<W: Write>(&mut self, writer: &mut W) -> Result<usize, BufferError>;

    /// Take every readable byte, leaving the buffer empty.
    fn read_all(&mut self) -> Vec<u8>;

    /// Take the bytes before the first `delimiter` and consume the delimiter.
    ///
    /// `None` means the delimiter is not buffered yet and nothing was
    /// consumed; `Some(vec![])` means the delimiter sat at the read cursor.
    fn read_until(&mut self, delimiter: &[u8]) -> Option<Vec<u8>>;

    /// Take exactly `len` bytes, or nothing if fewer are buffered.
    fn read_exact(&mut self, len: usize) -> Option<Vec<u8>>;

    /// Copy of the readable bytes without consuming them.
    fn peek_all(&self) -> Vec<u8>;

    /// Drop all content and rewind both cursors.
    fn reset(&mut self);
}

/// Find `needle` in the logical concatenation of `head` and `tail`.
pub(crate) fn find_in_segments(head: &[u8], tail: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    if tail.is_empty() {
        return head.windows(needle.len()).position(|w| w == needle);
    }

    let total = head.len() + tail.len();
    if total < needle.len() {
        return None;
    }
    let at = |i: usize| if i < head.len() { head[i] } else { tail[i - head.len()] };
    (0..=total - needle.len()).find(|&start| {
        needle
            .iter()
            .enumerate()
            .all(|(offset, &b)| at(start + offset) == b)
    })
}

/// `readv` over the given segments, returning the byte count.
pub(crate) fn readv_fd(fd: RawFd, segments: &mut [&mut [u8]]) -> io::Result<usize> {
    let iov: Vec<libc::iovec> = segments
        .iter_mut()
        .filter(|s| !s.is_empty())
        .map(|s| libc::iovec {
            iov_base: s.as_mut_ptr() as *mut libc::c_void,
            iov_len: s.len(),
        })
        .collect();
    if iov.is_empty() {
        return Ok(0);
    }

    let n = unsafe { libc::readv(fd, iov.as_ptr(), iov.len() as libc::c_int) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// `writev` over the given segments, returning the byte count.
pub(crate) fn writev_fd(fd: RawFd, segments: &[&[u8]]) -> io::Result<usize> {
    let iov: Vec<libc::iovec> = segments
        .iter()
        .filter(|s| !s.is_empty())
        .map(|s| libc::iovec {
            iov_base: s.as_ptr() as *mut libc::c_void,
            iov_len: s.len(),
        })
        .collect();
    if iov.is_empty() {
        return Ok(0);
    }

    let n = unsafe { libc::writev(fd, iov.as_ptr(), iov.len() as libc::c_int) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// A growable buffer that compacts unread bytes to the front before growing.
pub struct LinearBuffer {
    data: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
    max_capacity: usize,
}

impl LinearBuffer {
    /// Create a new buffer with the specified capacity and no growth limit
    pub fn new(capacity: usize) -> Self {
        Self::with_limit(capacity, usize::MAX)
    }

    /// Create a buffer that refuses to grow past `max_capacity` bytes
    pub fn with_limit(capacity: usize, max_capacity: usize) -> Self {
        let capacity = capacity.min(max_capacity);
        Self {
            data: vec![0; capacity],
            read_pos: 0,
            write_pos: 0,
            max_capacity,
        }
    }

    /// Ensure at least `additional` bytes of tail space, compacting first
    /// and growing only when compaction is not enough.
    pub fn ensure_capacity(&mut self, additional: usize) -> Result<(), BufferError> {
        if self.data.len() - self.write_pos >= additional {
            return Ok(());
        }

        self.compact();

        let readable = self.readable_bytes();
        if self.data.len() - self.write_pos < additional {
            let required = readable + additional;
            if required > self.max_capacity {
                return Err(BufferError::OutOfMemory {
                    requested: required,
                    limit: self.max_capacity,
                });
            }
            let new_capacity = required.max(self.data.len() * 2).min(self.max_capacity);
            self.data.resize(new_capacity, 0);
        }

        Ok(())
    }

    /// Get a slice of the buffer's unread data
    pub fn slice(&self) -> &[u8] {
        &self.data[self.read_pos..self.write_pos]
    }

    /// Advance the read position by the specified amount
    pub fn advance_read(&mut self, amount: usize) {
        self.read_pos += amount.min(self.readable_bytes());
        if self.read_pos == self.write_pos {
            self.read_pos = 0;
            self.write_pos = 0;
        }
    }

    fn compact(&mut self) {
        if self.read_pos == 0 {
            return;
        }
        let len = self.write_pos - self.read_pos;
        self.data.copy_within(self.read_pos..self.write_pos, 0);
        self.read_pos = 0;
        self.write_pos = len;
    }

    fn spill_len(&self) -> usize {
        self.max_capacity
            .saturating_sub(self.readable_bytes() + self.writable_bytes())
            .min(SPILL_SIZE)
    }
}

impl ByteBuffer for LinearBuffer {
    fn readable_bytes(&self) -> usize {
        self.write_pos - self.read_pos
    }

    fn writable_bytes(&self) -> usize {
        self.data.len() - self.write_pos
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }

    fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    fn append(&mut self, data: &[u8]) -> Result<(), BufferError> {
        self.ensure_capacity(data.len())?;
        self.data[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
        self.write_pos += data.len();
        Ok(())
    }

    fn fill_from_fd(&mut self, fd: RawFd) -> Result<usize, BufferError> {
        let writable = self.writable_bytes();
        let spill_len = self.spill_len();
        if writable == 0 && spill_len == 0 {
            return Err(BufferError::Retry);
        }

        let mut spill = [0u8; SPILL_SIZE];
        let n = {
            let (_, tail) = self.data.split_at_mut(self.write_pos);
            readv_fd(fd, &mut [tail, &mut spill[..spill_len]])?
        };

        if n <= writable {
            self.write_pos += n;
        } else {
            self.write_pos = self.data.len();
            self.append(&spill[..n - writable])?;
        }
        Ok(n)
    }

    fn drain_to_fd(&mut self, fd: RawFd) -> Result<usize, BufferError> {
        if self.readable_bytes() == 0 {
            return Ok(0);
        }
        let n = writev_fd(fd, &[self.slice()])?;
        self.advance_read(n);
        Ok(n)
    }

    fn read_from<R: Read>(&mut self, reader: &mut R) -> Result<usize, BufferError> {
        let room = self
            .max_capacity
            .saturating_sub(self.readable_bytes())
            .min(READ_CHUNK);
        if room == 0 {
            return Err(BufferError::Retry);
        }
        self.ensure_capacity(room)?;

        // Read directly into the buffer at the write position
        let bytes_read = reader.read(&mut self.data[self.write_pos..self.write_pos + room])?;
        self.write_pos += bytes_read;
        Ok(bytes_read)
    }

    fn write_to<W: Write>(&mut self, writer: &mut W) -> Result<usize, BufferError> {
        if self.readable_bytes() == 0 {
            return Ok(0);
        }
        let bytes_written = writer.write(self.slice())?;
        self.advance_read(bytes_written);
        Ok(bytes_written)
    }

    fn read_all(&mut self) -> Vec<u8> {
        let out = self.slice().to_vec();
        self.read_pos = 0;
        self.write_pos = 0;
        out
    }

    fn read_until(&mut self, delimiter: &[u8]) -> Option<Vec<u8>> {
        let pos = find_in_segments(self.slice(), &[], delimiter)?;
        let chunk = self.data[self.read_pos..self.read_pos + pos].to_vec();
        self.advance_read(pos + delimiter.len());
        Some(chunk)
    }

    fn read_exact(&mut self, len: usize) -> Option<Vec<u8>> {
        if self.readable_bytes() < len {
            return None;
        }
        let chunk = self.data[self.read_pos..self.read_pos + len].to_vec();
        self.advance_read(len);
        Some(chunk)
    }

    fn peek_all(&self) -> Vec<u8> {
        self.slice().to_vec()
    }

    fn reset(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }
}
