use crate::buffer::ByteBuffer;
use crate::error::BufferError;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

/// An established encrypted channel over an accepted socket.
pub trait SecureChannel: Read + Write + Send {
    /// Send the close notification and tear the session down.
    fn close(&mut self) -> io::Result<()>;

    /// The underlying socket descriptor
    fn raw_fd(&self) -> RawFd;
}

/// Turns a freshly accepted socket into a `SecureChannel`.
pub trait Handshake: Send + Sync {
    fn handshake(&self, stream: TcpStream) -> io::Result<Box<dyn SecureChannel>>;
}

/// How bytes move between a connection's buffers and its socket.
pub enum Transport {
    /// Plain TCP; buffers use scatter/gather syscalls on the descriptor.
    Plain(TcpStream),
    Secure(Box<dyn SecureChannel>),
}

impl Transport {
    pub fn raw_fd(&self) -> RawFd {
        match self {
            Transport::Plain(stream) => stream.as_raw_fd(),
            Transport::Secure(channel) => channel.raw_fd(),
        }
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, Transport::Secure(_))
    }

    /// Read whatever the socket has into `buffer`. `Ok(0)` is end of stream.
    pub fn fill<B: ByteBuffer>(&mut self, buffer: &mut B) -> Result<usize, BufferError> {
        match self {
            Transport::Plain(stream) => buffer.fill_from_fd(stream.as_raw_fd()),
            Transport::Secure(channel) => buffer.read_from(channel),
        }
    }

    /// Write as much of `buffer` as the socket takes.
    pub fn drain<B: ByteBuffer>(&mut self, buffer: &mut B) -> Result<usize, BufferError> {
        match self {
            Transport::Plain(stream) => buffer.drain_to_fd(stream.as_raw_fd()),
            Transport::Secure(channel) => buffer.write_to(channel),
        }
    }

    /// Write raw bytes (the mapped file segment) straight to the socket.
    pub fn write_raw(&mut self, data: &[u8]) -> io::Result<usize> {
        match self {
            Transport::Plain(stream) => stream.write(data),
            Transport::Secure(channel) => channel.write(data),
        }
    }

    /// Close the session. Errors are ignored: the peer may already be gone.
    pub fn close(&mut self) {
        match self {
            Transport::Plain(stream) => {
                let _ = stream.shutdown(Shutdown::Both);
            }
            Transport::Secure(channel) => {
                let _ = channel.close();
            }
        }
    }
}

impl AsRawFd for Transport {
    fn as_raw_fd(&self) -> RawFd {
        self.raw_fd()
    }
}
