use crate::error::{ServerError, ServerResult};
use libc::{EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLRDHUP};
use std::io::{self, ErrorKind};
use std::os::unix::io::RawFd;

/// Interest for a connection waiting to read: edge-triggered and one-shot,
/// so nothing more is delivered until the loop re-arms it.
pub const CONNECTION_READ: u32 = (EPOLLIN | EPOLLET | EPOLLONESHOT | EPOLLRDHUP) as u32;

/// Interest for a connection with a pending response.
pub const CONNECTION_WRITE: u32 = (EPOLLOUT | EPOLLET | EPOLLONESHOT | EPOLLRDHUP) as u32;

/// Level-triggered interest for the listener and the waker.
pub const LISTEN: u32 = EPOLLIN as u32;

pub fn is_readable(events: u32) -> bool {
    events & EPOLLIN as u32 != 0
}

pub fn is_writable(events: u32) -> bool {
    events & EPOLLOUT as u32 != 0
}

/// Peer hung up or the socket is in error.
pub fn is_closed(events: u32) -> bool {
    events & (EPOLLHUP | EPOLLERR | EPOLLRDHUP) as u32 != 0
}

/// Thin wrapper over an epoll instance. Each registration carries a 64-bit
/// token that comes back with its events.
pub struct Poller {
    epoll_fd: RawFd,
    events: Vec<libc::epoll_event>,
    max_events: usize,
}

impl Poller {
    /// Create a new poller returning at most `max_events` per wait
    pub fn new(max_events: usize) -> ServerResult<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(ServerError::Io(io::Error::last_os_error()));
        }

        Ok(Self {
            epoll_fd,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; max_events.max(1)],
            max_events: max_events.max(1),
        })
    }

    pub fn add(&self, fd: RawFd, token: u64, interest: u32) -> ServerResult<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interest)
    }

    /// Change the interest of a registered descriptor; also re-arms a
    /// one-shot registration.
    pub fn modify(&self, fd: RawFd, token: u64, interest: u32) -> ServerResult<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interest)
    }

    pub fn remove(&self, fd: RawFd) -> ServerResult<()> {
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if ret < 0 {
            return Err(ServerError::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, token: u64, interest: u32) -> ServerResult<()> {
        let mut event = libc::epoll_event {
            events: interest,
            u64: token,
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut event as *mut _) };
        if ret < 0 {
            return Err(ServerError::Io(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Wait up to `timeout_ms` (-1 blocks) and return `(token, events)`
    /// pairs. A signal interruption returns an empty batch.
    pub fn wait(&mut self, timeout_ms: i32) -> ServerResult<Vec<(u64, u32)>> {
        let num_events = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                self.events.as_mut_ptr(),
                self.max_events as i32,
                timeout_ms,
            )
        };

        if num_events < 0 {
            let err = io::Error::last_os_error();
            // Ignore EINTR as it's just a signal interruption
            if err.kind() != ErrorKind::Interrupted {
                return Err(ServerError::Io(err));
            }
            return Ok(Vec::new());
        }

        let result = self.events[..num_events as usize]
            .iter()
            .map(|event| (event.u64, event.events))
            .collect();
        Ok(result)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

/// An eventfd other threads write to so the loop's `wait` returns early.
pub struct Waker {
    fd: RawFd,
}

impl Waker {
    pub fn new() -> ServerResult<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(ServerError::Io(io::Error::last_os_error()));
        }
        Ok(Self { fd })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Bump the counter. A saturated counter already means "awake".
    pub fn wake(&self) {
        let val: u64 = 1;
        unsafe {
            libc::write(self.fd, &val as *const u64 as *const libc::c_void, 8);
        }
    }

    /// Reset the counter after a wakeup.
    pub fn drain(&self) {
        let mut val: u64 = 0;
        unsafe {
            libc::read(self.fd, &mut val as *mut u64 as *mut libc::c_void, 8);
        }
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}
