use crate::acceptor::{self, Listener};
use crate::auth::Authenticator;
use crate::buffer::{ByteBuffer, LinearBuffer};
use crate::config::{BufferConfig, ServerConfig};
use crate::connection::{
    ConnId, ConnectionIo, ConnectionTable, FlushOutcome, Lease, Next, ReadOutcome,
    LISTENER_TOKEN, WAKER_TOKEN,
};
use crate::error::ServerResult;
use crate::http::HttpParser;
use crate::metrics::ServerMetrics;
use crate::poller::{self, Poller, Waker, CONNECTION_READ, CONNECTION_WRITE, LISTEN};
use crate::response::{Response, ResponseBuilder};
use crate::timer::TimerHeap;
use crate::transport::{Handshake, SecureChannel, Transport};
use crate::worker_pool::WorkerPool;
use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, error, info, warn};
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const HANDSHAKE_PRIORITY: u32 = 0;
const READ_PRIORITY: u32 = 1;
/// Flushes go first so buffered responses leave before new input arrives.
const WRITE_PRIORITY: u32 = 2;

/// How long shutdown waits for running tasks to hand their leases back.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Messages posted to the loop by tasks and timer callbacks.
pub(crate) enum LoopMessage {
    /// A task finished and returns its lease.
    Done { lease: Lease, next: Next },
    /// The idle timer of a connection fired.
    Expired(ConnId),
    /// A secure handshake finished on a worker.
    Handshaken {
        peer: SocketAddr,
        channel: io::Result<Box<dyn SecureChannel>>,
    },
}

/// What every I/O task needs, shared by reference count.
pub(crate) struct TaskContext {
    builder: ResponseBuilder,
    metrics: Arc<ServerMetrics>,
    tx: Sender<LoopMessage>,
    waker: Arc<Waker>,
}

impl TaskContext {
    fn send(&self, message: LoopMessage) {
        if self.tx.send(message).is_ok() {
            self.waker.wake();
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum TaskKind {
    Read,
    Write,
}

/// Drain the socket and run the parser. Runs on a worker.
fn read_task(io: &mut ConnectionIo, ctx: &TaskContext) -> Next {
    match io.read() {
        Ok(ReadOutcome::Closed) => Next::Close,
        Ok(ReadOutcome::Data(n)) => {
            ctx.metrics.bytes_read.increment(n);
            io.process(&ctx.builder, &ctx.metrics)
        }
        Err(e) => {
            debug!("Read failed: {}", e);
            Next::Close
        }
    }
}

/// Flush the staged response. Runs on a worker.
fn write_task(io: &mut ConnectionIo, ctx: &TaskContext) -> Next {
    loop {
        match io.flush() {
            Ok(FlushOutcome::Pending(n)) => {
                ctx.metrics.bytes_written.increment(n);
                return Next::Write;
            }
            Ok(FlushOutcome::Done(n)) => {
                ctx.metrics.bytes_written.increment(n);
                if !io.keep_alive {
                    return Next::Close;
                }
                if !io.has_buffered_input() {
                    return Next::Read;
                }
                // a pipelined request is already buffered
                match io.process(&ctx.builder, &ctx.metrics) {
                    Next::Write => continue,
                    other => return other,
                }
            }
            Err(e) => {
                debug!("Write failed: {}", e);
                return Next::Close;
            }
        }
    }
}

/// Send the busy reply on a non-blocking socket and half-close it. Unread
/// input is discarded first, since closing over it resets the connection
/// and the peer can lose the reply.
fn turn_away(fd: RawFd) {
    let mut scratch = [0u8; 4096];
    for _ in 0..16 {
        let n = unsafe {
            libc::recv(
                fd,
                scratch.as_mut_ptr() as *mut libc::c_void,
                scratch.len(),
                libc::MSG_DONTWAIT,
            )
        };
        if n <= 0 {
            break;
        }
    }

    let mut reply = LinearBuffer::new(256);
    if Response::busy().write_into(&mut reply).is_ok() {
        let _ = reply.drain_to_fd(fd);
    }
    unsafe {
        libc::shutdown(fd, libc::SHUT_WR);
    }
}

/// The readiness loop. Owns the poller, the timers and the connection
/// table; none of them is touched from any other thread.
pub struct EventLoop {
    listener: Listener,
    poller: Poller,
    waker: Arc<Waker>,
    timers: TimerHeap<ConnId>,
    table: ConnectionTable,
    pool: Arc<WorkerPool>,
    ctx: Arc<TaskContext>,
    rx: Receiver<LoopMessage>,
    stop: Arc<AtomicBool>,
    metrics: Arc<ServerMetrics>,
    idle_timeout: Duration,
    max_connections: usize,
    read_buffer: BufferConfig,
    write_buffer: BufferConfig,
    authenticator: Option<Arc<dyn Authenticator>>,
    handshake: Option<Arc<dyn Handshake>>,
    pending_handshakes: usize,
}

impl EventLoop {
    pub(crate) fn new(
        config: &ServerConfig,
        listener: Listener,
        pool: Arc<WorkerPool>,
        metrics: Arc<ServerMetrics>,
        stop: Arc<AtomicBool>,
        waker: Arc<Waker>,
    ) -> ServerResult<Self> {
        let poller = Poller::new(config.poll_batch_size)?;
        poller.add(listener.as_raw_fd(), LISTENER_TOKEN, LISTEN)?;
        poller.add(waker.fd(), WAKER_TOKEN, LISTEN)?;

        let (tx, rx) = channel::unbounded();
        let ctx = Arc::new(TaskContext {
            builder: ResponseBuilder::new(config.resources_dir.clone()),
            metrics: Arc::clone(&metrics),
            tx,
            waker: Arc::clone(&waker),
        });

        Ok(Self {
            listener,
            poller,
            waker,
            timers: TimerHeap::new(),
            table: ConnectionTable::with_capacity(config.max_connections.min(4096)),
            pool,
            ctx,
            rx,
            stop,
            metrics,
            idle_timeout: config.idle_timeout,
            max_connections: config.max_connections,
            read_buffer: config.read_buffer,
            write_buffer: config.write_buffer,
            authenticator: None,
            handshake: None,
            pending_handshakes: 0,
        })
    }

    pub(crate) fn set_authenticator(&mut self, authenticator: Option<Arc<dyn Authenticator>>) {
        self.authenticator = authenticator;
    }

    pub(crate) fn set_handshake(&mut self, handshake: Option<Arc<dyn Handshake>>) {
        self.handshake = handshake;
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Serve until the stop flag is raised, then close everything down.
    pub fn run(&mut self) -> ServerResult<()> {
        info!("Event loop serving on {}", self.listener.local_addr());
        while !self.stop.load(Ordering::Acquire) {
            self.turn()?;
        }
        self.shutdown();
        Ok(())
    }

    /// One poll cycle.
    fn turn(&mut self) -> ServerResult<()> {
        let timeout = self.timers.next_wake_ms(Instant::now());
        let events = self.poller.wait(timeout)?;

        for (token, events) in events {
            match token {
                LISTENER_TOKEN => self.accept_all(),
                WAKER_TOKEN => self.waker.drain(),
                _ => {
                    if let Some(id) = ConnId::from_token(token) {
                        self.dispatch(id, events);
                    }
                }
            }
        }

        self.timers.tick(Instant::now());
        self.process_messages();
        Ok(())
    }

    fn dispatch(&mut self, id: ConnId, events: u32) {
        match self.table.get(id) {
            None => return,
            Some(conn) if conn.is_leased() && !poller::is_closed(events) => {
                // one-shot registration means no task is out for this connection
                warn!("Readiness for connection {} while its task is running", id);
                return;
            }
            Some(_) => {}
        }
        if poller::is_closed(events) {
            self.close(id);
        } else if poller::is_readable(events) {
            self.submit(id, TaskKind::Read);
        } else if poller::is_writable(events) {
            self.submit(id, TaskKind::Write);
        }
    }

    fn submit(&mut self, id: ConnId, kind: TaskKind) {
        let mut lease = match self.table.take_lease(id) {
            Some(lease) => lease,
            None => return,
        };
        let fd = lease.io.transport.raw_fd();
        let plain = !lease.io.transport.is_secure();
        self.extend_timer(id);

        let ctx = Arc::clone(&self.ctx);
        let priority = match kind {
            TaskKind::Read => READ_PRIORITY,
            TaskKind::Write => WRITE_PRIORITY,
        };
        // the poll thread must not wait for queue space
        let submitted = self.pool.try_submit(priority, move || {
            let next = match kind {
                TaskKind::Read => read_task(&mut lease.io, &ctx),
                TaskKind::Write => write_task(&mut lease.io, &ctx),
            };
            ctx.send(LoopMessage::Done { lease, next });
        });

        if let Err(e) = submitted {
            warn!("Cannot run task for connection {}: {}", id, e);
            // a half-sent response cannot be followed by another one
            if e.is_full() && plain && matches!(kind, TaskKind::Read) {
                self.metrics.rejected_busy.increment(1);
                turn_away(fd);
            }
            self.table.lease_lost();
            self.close(id);
            // the task owns the socket; deregister before it closes
            drop(e.into_inner());
        }
    }

    fn accept_all(&mut self) {
        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("Accept failed: {}", e);
                    break;
                }
            };

            if self.table.len() + self.pending_handshakes >= self.max_connections {
                self.reject_busy(stream, peer);
                continue;
            }

            match self.handshake.clone() {
                Some(handshake) => self.start_handshake(handshake, stream, peer),
                None => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        warn!("Cannot configure socket from {}: {}", peer, e);
                        continue;
                    }
                    let _ = stream.set_nodelay(true);
                    self.register(Transport::Plain(stream), peer);
                }
            }
        }
    }

    fn reject_busy(&self, stream: TcpStream, peer: SocketAddr) {
        self.metrics.rejected_busy.increment(1);
        warn!("Connection ceiling reached, turning away {}", peer);
        if stream.set_nonblocking(true).is_ok() {
            turn_away(stream.as_raw_fd());
        }
    }

    fn start_handshake(&mut self, handshake: Arc<dyn Handshake>, stream: TcpStream, peer: SocketAddr) {
        let ctx = Arc::clone(&self.ctx);
        let submitted = self.pool.try_submit(HANDSHAKE_PRIORITY, move || {
            let channel = handshake.handshake(stream);
            ctx.send(LoopMessage::Handshaken { peer, channel });
        });
        match submitted {
            Ok(_) => self.pending_handshakes += 1,
            Err(e) => {
                if e.is_full() {
                    self.metrics.rejected_busy.increment(1);
                }
                warn!("Cannot run handshake for {}: {}", peer, e);
            }
        }
    }

    fn register(&mut self, transport: Transport, peer: SocketAddr) {
        let parser = match &self.authenticator {
            Some(auth) => HttpParser::with_authenticator(Arc::clone(auth)),
            None => HttpParser::new(),
        };
        let io = ConnectionIo::new(transport, self.read_buffer, self.write_buffer, parser);
        let fd = io.transport.raw_fd();
        let id = self.table.insert(peer, io);

        if let Err(e) = self.poller.add(fd, id.token(), CONNECTION_READ) {
            warn!("Cannot register connection from {}: {}", peer, e);
            self.table.remove(id);
            return;
        }

        if !self.idle_timeout.is_zero() {
            let tx = self.ctx.tx.clone();
            self.timers.add(
                id,
                self.idle_timeout,
                Box::new(move || {
                    let _ = tx.send(LoopMessage::Expired(id));
                }),
            );
        }

        self.metrics.accepted.increment(1);
        debug!("Accepted {} as connection {}", peer, id);
    }

    fn extend_timer(&mut self, id: ConnId) {
        if !self.idle_timeout.is_zero() {
            self.timers.adjust(id, self.idle_timeout);
        }
    }

    fn process_messages(&mut self) {
        while let Ok(message) = self.rx.try_recv() {
            self.handle_message(message);
        }
    }

    fn handle_message(&mut self, message: LoopMessage) {
        match message {
            LoopMessage::Done { lease, next } => {
                let id = lease.id();
                if !self.table.return_lease(lease) {
                    // closed while the task ran
                    return;
                }
                match next {
                    Next::Close => self.close(id),
                    Next::Read => self.rearm(id, CONNECTION_READ),
                    Next::Write => self.rearm(id, CONNECTION_WRITE),
                }
            }
            LoopMessage::Expired(id) => {
                if self.table.contains(id) {
                    self.metrics.timed_out.increment(1);
                    debug!("Connection {} idle, closing", id);
                    self.close(id);
                }
            }
            LoopMessage::Handshaken { peer, channel } => {
                self.pending_handshakes = self.pending_handshakes.saturating_sub(1);
                match channel {
                    Ok(mut channel) => {
                        if let Err(e) = acceptor::set_nonblocking(channel.raw_fd()) {
                            warn!("Cannot configure secure socket from {}: {}", peer, e);
                            let _ = channel.close();
                            return;
                        }
                        self.register(Transport::Secure(channel), peer);
                    }
                    Err(e) => warn!("Handshake with {} failed: {}", peer, e),
                }
            }
        }
    }

    /// Allow exactly one more readiness delivery for `id`.
    fn rearm(&mut self, id: ConnId, interest: u32) {
        let fd = match self.table.get(id) {
            Some(conn) => conn.fd,
            None => return,
        };
        if let Err(e) = self.poller.modify(fd, id.token(), interest) {
            debug!("Cannot re-arm connection {}: {}", id, e);
            self.close(id);
        }
    }

    /// Deregister, drop the timer and erase the connection. Stale ids are
    /// ignored, so closing twice is harmless.
    fn close(&mut self, id: ConnId) {
        let fd = match self.table.get(id) {
            Some(conn) => conn.fd,
            None => return,
        };
        if let Err(e) = self.poller.remove(fd) {
            debug!("Deregistering connection {} failed: {}", id, e);
        }
        self.timers.remove(id);
        if let Some(conn) = self.table.remove(id) {
            self.metrics.closed.increment(1);
            debug!("Closed connection {} from {}", id, conn.peer);
        }
    }

    /// Wait (bounded) for running tasks, then close every connection.
    fn shutdown(&mut self) {
        info!(
            "Event loop stopping with {} connections, {} tasks running",
            self.table.len(),
            self.table.leased()
        );

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while self.table.leased() > 0 || self.pending_handshakes > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("{} tasks still running at shutdown", self.table.leased());
                break;
            }
            match self.rx.recv_timeout(remaining) {
                Ok(LoopMessage::Done { lease, .. }) => {
                    self.table.return_lease(lease);
                }
                Ok(LoopMessage::Handshaken { channel, .. }) => {
                    self.pending_handshakes = self.pending_handshakes.saturating_sub(1);
                    if let Ok(mut channel) = channel {
                        let _ = channel.close();
                    }
                }
                Ok(LoopMessage::Expired(_)) => {}
                Err(_) => break,
            }
        }

        for id in self.table.ids() {
            self.close(id);
        }
        self.timers.clear();
    }
}
