use crate::buffer::{find_in_segments, readv_fd, writev_fd, ByteBuffer, SPILL_SIZE};
use crate::error::BufferError;
use std::io::{Read, Write};
use std::os::unix::io::RawFd;

/// A wrap-around byte buffer.
///
/// One slot of the backing storage is always left empty so that
/// `read_pos == write_pos` unambiguously means "empty". The readable range
/// is `[read_pos, write_pos)` modulo the storage length.
pub struct RingBuffer {
    data: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
    /// Usable bytes the buffer may grow to (the reserved slot is extra).
    max_capacity: usize,
}

impl RingBuffer {
    /// Create a ring holding up to `capacity` bytes before it has to grow.
    pub fn new(capacity: usize) -> Self {
        Self::with_limit(capacity, usize::MAX - 1)
    }

    pub fn with_limit(capacity: usize, max_capacity: usize) -> Self {
        let usable = capacity.min(max_capacity).max(1);
        Self {
            data: vec![0; usable + 1],
            read_pos: 0,
            write_pos: 0,
            max_capacity,
        }
    }

    /// The readable bytes as at most two slices, in order.
    pub fn as_slices(&self) -> (&[u8], &[u8]) {
        if self.read_pos <= self.write_pos {
            (&self.data[self.read_pos..self.write_pos], &[])
        } else {
            (&self.data[self.read_pos..], &self.data[..self.write_pos])
        }
    }

    /// The free space as at most two mutable slices, in write order.
    fn free_slices(&mut self) -> (&mut [u8], &mut [u8]) {
        let len = self.data.len();
        let (r, w) = (self.read_pos, self.write_pos);
        if w >= r {
            // The slot just behind `read_pos` stays reserved.
            if r == 0 {
                (&mut self.data[w..len - 1], &mut [])
            } else {
                let (head, tail) = self.data.split_at_mut(w);
                (tail, &mut head[..r - 1])
            }
        } else {
            (&mut self.data[w..r - 1], &mut [])
        }
    }

    /// Advance the read cursor past `amount` readable bytes.
    pub fn consume(&mut self, amount: usize) {
        let amount = amount.min(self.readable_bytes());
        self.read_pos = (self.read_pos + amount) % self.data.len();
        if self.read_pos == self.write_pos {
            self.read_pos = 0;
            self.write_pos = 0;
        }
    }

    fn advance_write(&mut self, amount: usize) {
        self.write_pos = (self.write_pos + amount) % self.data.len();
    }

    fn copy_out(&self, len: usize) -> Vec<u8> {
        let (head, tail) = self.as_slices();
        let mut out = Vec::with_capacity(len);
        let from_head = len.min(head.len());
        out.extend_from_slice(&head[..from_head]);
        out.extend_from_slice(&tail[..len - from_head]);
        out
    }

    /// Make room for `additional` more bytes. Growth relocates the wrapped
    /// head segment behind the tail so the readable bytes stay in order.
    fn ensure_writable(&mut self, additional: usize) -> Result<(), BufferError> {
        if self.writable_bytes() >= additional {
            return Ok(());
        }

        let readable = self.readable_bytes();
        let required = readable + additional;
        if required > self.max_capacity {
            return Err(BufferError::OutOfMemory {
                requested: required,
                limit: self.max_capacity,
            });
        }

        let usable = required
            .max(self.capacity().saturating_mul(2))
            .min(self.max_capacity);
        let old_len = self.data.len();
        self.data.resize(usable + 1, 0);

        if self.write_pos < self.read_pos {
            // The wrapped part lives at [0, write_pos); move it right after
            // the old end so [read_pos, ..) is contiguous again.
            let wrapped = self.write_pos;
            let room = self.data.len() - old_len;
            if wrapped < room {
                self.data.copy_within(0..wrapped, old_len);
                self.write_pos = old_len + wrapped;
            } else {
                // Not enough room to append the whole head: linearize.
                let mut linear = Vec::with_capacity(self.data.len());
                linear.extend_from_slice(&self.data[self.read_pos..old_len]);
                linear.extend_from_slice(&self.data[..wrapped]);
                linear.resize(self.data.len(), 0);
                self.data = linear;
                self.read_pos = 0;
                self.write_pos = readable;
            }
        }
        Ok(())
    }

    fn spill_len(&self) -> usize {
        self.max_capacity
            .saturating_sub(self.capacity())
            .min(SPILL_SIZE)
    }
}

impl ByteBuffer for RingBuffer {
    fn readable_bytes(&self) -> usize {
        let len = self.data.len();
        (self.write_pos + len - self.read_pos) % len
    }

    fn writable_bytes(&self) -> usize {
        self.capacity() - self.readable_bytes()
    }

    fn capacity(&self) -> usize {
        self.data.len() - 1
    }

    fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    fn append(&mut self, data: &[u8]) -> Result<(), BufferError> {
        self.ensure_writable(data.len())?;

        let (first, second) = self.free_slices();
        let split = data.len().min(first.len());
        first[..split].copy_from_slice(&data[..split]);
        second[..data.len() - split].copy_from_slice(&data[split..]);
        self.advance_write(data.len());
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
            let (first, second) = self.free_slices();
            readv_fd(fd, &mut [first, second, &mut spill[..spill_len]])?
        };

        if n <= writable {
            self.advance_write(n);
        } else {
            self.advance_write(writable);
            self.append(&spill[..n - writable])?;
        }
        Ok(n)
    }

    fn drain_to_fd(&mut self, fd: RawFd) -> Result<usize, BufferError> {
        if self.readable_bytes() == 0 {
            return Ok(0);
        }
        let (head, tail) = self.as_slices();
        let n = writev_fd(fd, &[head, tail])?;
        self.consume(n);
        Ok(n)
    }

    fn read_from<R: Read>(&mut self, reader: &mut R) -> Result<usize, BufferError> {
        let mut chunk = [0u8; 4096];
        let room = self
            .max_capacity
            .saturating_sub(self.readable_bytes())
            .min(chunk.len());
        if room == 0 {
            return Err(BufferError::Retry);
        }
        let n = reader.read(&mut chunk[..room])?;
        self.append(&chunk[..n])?;
        Ok(n)
    }

    fn write_to<W: Write>(&mut self, writer: &mut W) -> Result<usize, BufferError> {
        let n = {
            let (head, _) = self.as_slices();
            if head.is_empty() {
                return Ok(0);
            }
            writer.write(head)?
        };
        self.consume(n);
        Ok(n)
    }

    fn read_all(&mut self) -> Vec<u8> {
        let out = self.copy_out(self.readable_bytes());
        self.reset();
        out
    }

    fn read_until(&mut self, delimiter: &[u8]) -> Option<Vec<u8>> {
        let (head, tail) = self.as_slices();
        let pos = find_in_segments(head, tail, delimiter)?;
        let chunk = self.copy_out(pos);
        self.consume(pos + delimiter.len());
        Some(chunk)
    }

    fn read_exact(&mut self, len: usize) -> Option<Vec<u8>> {
        if self.readable_bytes() < len {
            return None;
        }
        let chunk = self.copy_out(len);
        self.consume(len);
        Some(chunk)
    }

    fn peek_all(&self) -> Vec<u8> {
        self.copy_out(self.readable_bytes())
    }

    fn reset(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }
}
