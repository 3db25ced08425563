use crate::acceptor::Listener;
use crate::auth::{self, Authenticator};
use crate::config::ServerConfig;
use crate::error::ServerResult;
use crate::event_loop::EventLoop;
use crate::metrics::ServerMetrics;
use crate::poller::Waker;
use crate::transport::Handshake;
use crate::worker_pool::WorkerPool;
use log::info;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Stops a running server from any thread.
#[derive(Clone)]
pub struct ServerHandle {
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ServerHandle {
    /// Raise the stop flag and wake the loop so it notices.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.waker.wake();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// Everything one server instance owns: listener, poller, worker pool,
/// connection table and counters. Built by `new`, driven by `run`, torn
/// down when `run` returns.
pub struct Server {
    event_loop: EventLoop,
    pool: Arc<WorkerPool>,
    metrics: Arc<ServerMetrics>,
    handle: ServerHandle,
}

impl Server {
    /// Bind the listener and start the worker pool. Login and register
    /// forms are checked against in-memory user tables until
    /// `with_authenticator` says otherwise.
    pub fn new(config: ServerConfig) -> ServerResult<Self> {
        config.validate()?;

        let listener = Listener::bind(config.socket_address(), config.backlog_size)?;
        let pool = Arc::new(WorkerPool::new(config.pool.clone())?);
        let metrics = Arc::new(ServerMetrics::new());
        let stop = Arc::new(AtomicBool::new(false));
        let waker = Arc::new(Waker::new()?);

        let authenticator: Arc<dyn Authenticator> = Arc::new(auth::memory_authenticator(
            config.auth.cache_connections,
            config.auth.store_connections,
            config.auth.acquire_timeout,
        )?);

        let mut event_loop = EventLoop::new(
            &config,
            listener,
            Arc::clone(&pool),
            Arc::clone(&metrics),
            Arc::clone(&stop),
            Arc::clone(&waker),
        )?;
        event_loop.set_authenticator(Some(authenticator));

        info!(
            "Server bound to {} with {} worker threads (min {}, max {})",
            event_loop.local_addr(),
            config.pool.initial,
            config.pool.min,
            config.pool.max
        );

        Ok(Self {
            event_loop,
            pool,
            metrics,
            handle: ServerHandle { stop, waker },
        })
    }

    /// Verify login and register forms with `authenticator`; `None`
    /// serves those pages without verification.
    pub fn with_authenticator(mut self, authenticator: Option<Arc<dyn Authenticator>>) -> Self {
        self.event_loop.set_authenticator(authenticator);
        self
    }

    /// Wrap every accepted socket in a secure channel.
    pub fn with_handshake(mut self, handshake: Arc<dyn Handshake>) -> Self {
        self.event_loop.set_handshake(Some(handshake));
        self
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.event_loop.local_addr()
    }

    pub fn metrics(&self) -> Arc<ServerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Serve on the calling thread until `ServerHandle::stop`. On return
    /// every connection is closed, the pool is joined and the listener is
    /// released.
    pub fn run(mut self) -> ServerResult<()> {
        let result = self.event_loop.run();
        self.pool.shutdown();
        info!("Server stopped\n{}", self.metrics.format());
        result
    }
}
