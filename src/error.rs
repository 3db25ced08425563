use std::io;
use thiserror::Error;

/// Failures raised by the byte buffers.
#[derive(Error, Debug)]
pub enum BufferError {
    #[error("buffer growth to {requested} bytes exceeds the {limit} byte limit")]
    OutOfMemory { requested: usize, limit: usize },

    /// The buffer sits at its ceiling with no free space; drain it and try again.
    #[error("buffer is full, retry after draining")]
    Retry,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl BufferError {
    /// Whether the operation may succeed later without closing the descriptor.
    pub fn is_retryable(&self) -> bool {
        match self {
            BufferError::Retry => true,
            BufferError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ),
            BufferError::OutOfMemory { .. } => false,
        }
    }
}

/// Main error type for the server
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("HTTP parsing error: {0}")]
    HttpParse(String),

    #[error("Worker pool is shut down")]
    PoolShutdown,

    #[error("Worker queue stayed full")]
    PoolSaturated,

    #[error("Task panicked: {0}")]
    TaskPanicked(String),

    #[error("Timed out waiting for a pooled {0} resource")]
    PoolTimeout(&'static str),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type ServerResult<T> = Result<T, ServerError>;
