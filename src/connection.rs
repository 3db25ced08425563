use crate::buffer::{writev_fd, ByteBuffer, LinearBuffer};
use crate::config::BufferConfig;
use crate::error::BufferError;
use crate::http::{HttpParser, ParseStatus, Status};
use crate::metrics::ServerMetrics;
use crate::response::{Response, ResponseBuilder};
use crate::ring_buffer::RingBuffer;
use crate::transport::Transport;
use log::debug;
use memmap2::Mmap;
use std::collections::HashMap;
use std::fmt;
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

const GENERATION_MASK: u32 = 0x7fff_ffff;

/// Poller token of the listening socket.
pub const LISTENER_TOKEN: u64 = u64::MAX;

/// Poller token of the loop's waker.
pub const WAKER_TOKEN: u64 = u64::MAX - 1;

/// Address of a connection slot. The generation changes every time the
/// slot is recycled, so an id held by a timer or a task goes stale once
/// its connection is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId {
    pub index: u32,
    pub generation: u32,
}

impl ConnId {
    /// Poller token for this id. Generations stay below 2^31, so tokens
    /// never collide with `LISTENER_TOKEN` or `WAKER_TOKEN`.
    pub fn token(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    pub fn from_token(token: u64) -> Option<Self> {
        if token >> 63 != 0 {
            return None;
        }
        Some(Self {
            index: token as u32,
            generation: (token >> 32) as u32,
        })
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}

/// What the loop should do with a connection once its task is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Read,
    Write,
    Close,
}

/// Result of draining the socket into the read buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The socket has nothing more for now; `usize` bytes arrived.
    Data(usize),
    /// Orderly shutdown by the peer with nothing new to read.
    Closed,
}

/// Result of writing the pending response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Done(usize),
    /// The socket stopped taking bytes; wait for write readiness.
    Pending(usize),
}

/// The part of a connection a task works on: socket, buffers, parser and
/// the pending response. Lives in its slot while idle and inside a `Lease`
/// while a task runs.
pub struct ConnectionIo {
    pub transport: Transport,
    pub read_buf: LinearBuffer,
    pub write_buf: RingBuffer,
    pub parser: HttpParser,
    file: Option<Mmap>,
    file_offset: usize,
    pub keep_alive: bool,
    /// The peer shut down its writing half after sending a request.
    peer_closed: bool,
}

impl ConnectionIo {
    pub fn new(
        transport: Transport,
        read: BufferConfig,
        write: BufferConfig,
        parser: HttpParser,
    ) -> Self {
        Self {
            transport,
            read_buf: LinearBuffer::with_limit(read.initial, read.max),
            write_buf: RingBuffer::with_limit(write.initial, write.max),
            parser,
            file: None,
            file_offset: 0,
            keep_alive: false,
            peer_closed: false,
        }
    }

    /// Read until the socket would block (the registration is
    /// edge-triggered, so stopping early could lose the wakeup).
    pub fn read(&mut self) -> Result<ReadOutcome, BufferError> {
        let mut total = 0;
        loop {
            match self.transport.fill(&mut self.read_buf) {
                Ok(0) => {
                    if total == 0 {
                        return Ok(ReadOutcome::Closed);
                    }
                    self.peer_closed = true;
                    return Ok(ReadOutcome::Data(total));
                }
                Ok(n) => total += n,
                // at the ceiling: parse what we have first
                Err(BufferError::Retry) => return Ok(ReadOutcome::Data(total)),
                Err(BufferError::Io(e)) if e.kind() == ErrorKind::Interrupted => continue,
                Err(BufferError::Io(e)) if e.kind() == ErrorKind::WouldBlock => {
                    return Ok(ReadOutcome::Data(total));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run the parser over the read buffer and stage a response when a
    /// request completes.
    pub fn process(&mut self, builder: &ResponseBuilder, metrics: &ServerMetrics) -> Next {
        let mut response = match self.parser.parse(&mut self.read_buf) {
            Ok(ParseStatus::Complete) => match self.parser.get_request() {
                Ok(request) => {
                    metrics.requests.increment(1);
                    let keep_alive = request.keep_alive && !self.peer_closed;
                    builder.build(&request.path, keep_alive, None)
                }
                Err(e) => {
                    debug!("Incomplete request after parse: {}", e);
                    self.bad_request(builder, metrics)
                }
            },
            Ok(ParseStatus::Incomplete) => {
                if self.read_buf.readable_bytes() >= self.read_buf.max_capacity() {
                    debug!("Request exceeds the read buffer ceiling");
                    self.bad_request(builder, metrics)
                } else if self.peer_closed {
                    return Next::Close;
                } else {
                    return Next::Read;
                }
            }
            Err(e) => {
                debug!("Malformed request: {}", e);
                self.bad_request(builder, metrics)
            }
        };

        self.parser.reset();
        self.keep_alive = response.keep_alive;
        // the head reports the body length, so render it while the file is attached
        if let Err(e) = response.write_into(&mut self.write_buf) {
            debug!("Cannot stage response: {}", e);
            return Next::Close;
        }
        self.file = response.take_file();
        self.file_offset = 0;
        Next::Write
    }

    fn bad_request(&mut self, builder: &ResponseBuilder, metrics: &ServerMetrics) -> Response {
        metrics.bad_requests.increment(1);
        // nothing after a malformed request can be trusted
        self.read_buf.reset();
        builder.error_page(Status::BadRequest, false)
    }

    /// Bytes still to send: staged head plus the rest of the mapped file
    pub fn pending_bytes(&self) -> usize {
        let file = self.file.as_ref().map(|m| m.len() - self.file_offset).unwrap_or(0);
        self.write_buf.readable_bytes() + file
    }

    /// Write the pending response until it is gone or the socket would block.
    pub fn flush(&mut self) -> Result<FlushOutcome, BufferError> {
        let mut total = 0;
        while self.pending_bytes() > 0 {
            match self.write_once() {
                Ok(0) => {
                    return Err(BufferError::Io(io::Error::new(
                        ErrorKind::WriteZero,
                        "socket accepted no bytes",
                    )));
                }
                Ok(n) => total += n,
                Err(e) if e.is_retryable() => {
                    if let BufferError::Io(io_err) = &e {
                        if io_err.kind() == ErrorKind::Interrupted {
                            continue;
                        }
                    }
                    return Ok(FlushOutcome::Pending(total));
                }
                Err(e) => return Err(e),
            }
        }
        self.file = None;
        self.file_offset = 0;
        Ok(FlushOutcome::Done(total))
    }

    fn write_once(&mut self) -> Result<usize, BufferError> {
        let file: &[u8] = match &self.file {
            Some(map) => &map[self.file_offset..],
            None => &[],
        };

        if self.transport.is_secure() {
            if self.write_buf.readable_bytes() > 0 {
                return self.transport.drain(&mut self.write_buf);
            }
            let n = self.transport.write_raw(file)?;
            self.file_offset += n;
            return Ok(n);
        }

        // head and file leave in one gather write
        let (head, tail) = self.write_buf.as_slices();
        let n = writev_fd(self.transport.raw_fd(), &[head, tail, file])?;
        let from_ring = n.min(self.write_buf.readable_bytes());
        self.write_buf.consume(from_ring);
        self.file_offset += n - from_ring;
        Ok(n)
    }

    /// Whether the peer still has unparsed bytes queued (pipelining).
    pub fn has_buffered_input(&self) -> bool {
        self.read_buf.readable_bytes() > 0
    }

    /// Drop buffered data and close the socket.
    pub fn close(&mut self) {
        self.read_buf.reset();
        self.write_buf.reset();
        self.file = None;
        self.file_offset = 0;
        self.parser.reset();
        self.transport.close();
    }
}

/// Exclusive access to one connection's `ConnectionIo` for the length of a
/// task. Only `ConnectionTable::take_lease` creates one and the table holds
/// no I/O state for the slot until it comes back.
pub struct Lease {
    id: ConnId,
    pub io: ConnectionIo,
}

impl Lease {
    pub fn id(&self) -> ConnId {
        self.id
    }
}

/// A live connection.
pub struct Connection {
    pub id: ConnId,
    pub fd: RawFd,
    pub peer: SocketAddr,
    /// `None` while leased to a task
    io: Option<ConnectionIo>,
}

impl Connection {
    pub fn is_leased(&self) -> bool {
        self.io.is_none()
    }
}

struct Slot {
    generation: u32,
    conn: Option<Connection>,
}

/// Arena of connection slots, recycled through a free list.
///
/// Only the event loop thread touches the table.
pub struct ConnectionTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_fd: HashMap<RawFd, ConnId>,
    live: usize,
    leased: usize,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            by_fd: HashMap::with_capacity(capacity),
            live: 0,
            leased: 0,
        }
    }

    /// Live connections
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Connections whose I/O state is out with a task
    pub fn leased(&self) -> usize {
        self.leased
    }

    pub fn insert(&mut self, peer: SocketAddr, io: ConnectionIo) -> ConnId {
        let fd = io.transport.raw_fd();
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    conn: None,
                });
                (self.slots.len() - 1) as u32
            }
        };

        let slot = &mut self.slots[index as usize];
        let id = ConnId {
            index,
            generation: slot.generation,
        };
        slot.conn = Some(Connection {
            id,
            fd,
            peer,
            io: Some(io),
        });
        self.by_fd.insert(fd, id);
        self.live += 1;
        id
    }

    pub fn get(&self, id: ConnId) -> Option<&Connection> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.conn.as_ref())
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.get(id).is_some()
    }

    pub fn lookup_fd(&self, fd: RawFd) -> Option<ConnId> {
        self.by_fd.get(&fd).copied()
    }

    fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.conn.as_mut())
    }

    /// Move the connection's I/O state out for a task. `None` for a stale
    /// id or a connection that is already leased.
    pub fn take_lease(&mut self, id: ConnId) -> Option<Lease> {
        let io = self.get_mut(id)?.io.take()?;
        self.leased += 1;
        Some(Lease { id, io })
    }

    /// Put a lease back. If the connection was closed meanwhile the I/O
    /// state is closed and dropped instead, and `false` is returned.
    pub fn return_lease(&mut self, lease: Lease) -> bool {
        let Lease { id, mut io } = lease;
        self.leased = self.leased.saturating_sub(1);
        match self.get_mut(id) {
            Some(conn) if conn.io.is_none() => {
                conn.io = Some(io);
                true
            }
            _ => {
                io.close();
                false
            }
        }
    }

    /// A lease was dropped without coming back (its task never ran).
    pub fn lease_lost(&mut self) {
        self.leased = self.leased.saturating_sub(1);
    }

    /// Erase the connection and recycle its slot. A leased connection loses
    /// its slot here; its I/O state is closed when the lease comes back.
    pub fn remove(&mut self, id: ConnId) -> Option<Connection> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let mut conn = slot.conn.take()?;
        slot.generation = (slot.generation + 1) & GENERATION_MASK;
        self.free.push(id.index);
        self.live -= 1;
        if self.by_fd.get(&conn.fd) == Some(&id) {
            self.by_fd.remove(&conn.fd);
        }
        if let Some(io) = conn.io.as_mut() {
            io.close();
        }
        Some(conn)
    }

    /// Every live id, for shutdown
    pub fn ids(&self) -> Vec<ConnId> {
        self.slots
            .iter()
            .filter_map(|slot| slot.conn.as_ref().map(|c| c.id))
            .collect()
    }
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}
