#[cfg(not(target_os = "linux"))]
compile_error!("reactor-server needs epoll and eventfd and only builds on Linux");

pub mod acceptor;
pub mod auth;
pub mod buffer;
pub mod config;
pub mod connection;
pub mod error;
pub mod event_loop;
pub mod http;
pub mod logger;
pub mod metrics;
pub mod poller;
pub mod resource_pool;
pub mod response;
pub mod ring_buffer;
pub mod server;
pub mod timer;
pub mod transport;
pub mod worker_pool;

/// Re-exports of common components for easier access
pub use auth::{Authenticator, MemoryCacheFactory, MemoryStoreFactory, PooledAuthenticator};
pub use buffer::{ByteBuffer, LinearBuffer};
pub use config::{AuthConfig, BufferConfig, LogConfig, PoolConfig, ServerConfig};
pub use connection::{ConnId, ConnectionTable};
pub use error::{BufferError, ServerError, ServerResult};
pub use http::{HttpParser, Method, ParseStatus, Request, Status};
pub use logger::{AsyncLogger, LogHandle};
pub use metrics::{Counter, ServerMetrics};
pub use resource_pool::{Pooled, ResourceFactory, ResourcePool};
pub use response::{Response, ResponseBuilder};
pub use ring_buffer::RingBuffer;
pub use server::{Server, ServerHandle};
pub use timer::TimerHeap;
pub use transport::{Handshake, SecureChannel, Transport};
pub use worker_pool::{TaskHandle, TrySubmitError, WorkerPool};
