use crate::error::{ServerError, ServerResult};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Worker pool sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Threads started with the pool
    pub initial: usize,
    pub min: usize,
    pub max: usize,
    /// How often the sampler re-evaluates the pool size
    pub resize_interval: Duration,
    /// Tasks queued before `submit` blocks
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let cpus = num_cpus::get();
        Self {
            initial: cpus,
            min: cpus.min(2),
            max: cpus * 4,
            resize_interval: Duration::from_millis(500),
            queue_capacity: 10_000,
        }
    }
}

impl PoolConfig {
    pub fn new(initial: usize, min: usize, max: usize) -> Self {
        Self {
            initial,
            min,
            max,
            ..Self::default()
        }
    }

    pub fn with_resize_interval(mut self, interval: Duration) -> Self {
        self.resize_interval = interval;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn validate(&self) -> ServerResult<()> {
        if self.max == 0 {
            return Err(ServerError::Config("pool max must be at least 1".to_string()));
        }
        if self.min > self.max {
            return Err(ServerError::Config(format!(
                "pool min {} exceeds max {}",
                self.min, self.max
            )));
        }
        if self.initial < self.min || self.initial > self.max {
            return Err(ServerError::Config(format!(
                "pool initial {} outside [{}, {}]",
                self.initial, self.min, self.max
            )));
        }
        if self.queue_capacity == 0 {
            return Err(ServerError::Config("pool queue capacity must be at least 1".to_string()));
        }
        if self.resize_interval.is_zero() {
            return Err(ServerError::Config("pool resize interval must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Initial and maximum size of a connection buffer
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BufferConfig {
    pub initial: usize,
    pub max: usize,
}

impl BufferConfig {
    pub fn new(initial: usize, max: usize) -> Self {
        Self { initial, max }
    }

    fn validate(&self, which: &str) -> ServerResult<()> {
        if self.initial == 0 || self.max == 0 {
            return Err(ServerError::Config(format!("{} buffer sizes must be non-zero", which)));
        }
        if self.initial > self.max {
            return Err(ServerError::Config(format!(
                "{} buffer initial {} exceeds max {}",
                which, self.initial, self.max
            )));
        }
        Ok(())
    }
}

/// Asynchronous log sink settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// One of off, error, warn, info, debug, trace
    pub level: String,
    /// Log directory; `None` writes to stderr
    pub directory: Option<PathBuf>,
    /// Appended to the `YYYY_MM_DD` file name
    pub suffix: String,
    /// Lines per file before rolling
    pub max_lines: usize,
    /// Lines queued for the writer before new ones are dropped
    pub queue_capacity: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
            suffix: "_server.log".to_string(),
            max_lines: 800_000,
            queue_capacity: 1024,
        }
    }
}

impl LogConfig {
    pub fn level_filter(&self) -> ServerResult<LevelFilter> {
        self.level
            .parse()
            .map_err(|_| ServerError::Config(format!("unknown log level {:?}", self.level)))
    }
}

/// Cache and store pools behind the login/register pages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub cache_connections: usize,
    pub store_connections: usize,
    pub acquire_timeout: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            cache_connections: 8,
            store_connections: 8,
            acquire_timeout: Duration::from_secs(3),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    // Network configuration
    pub listen_address: String,
    pub port: u16,
    pub backlog_size: i32,

    // Connection settings
    /// Sliding idle timeout; zero disables eviction
    pub idle_timeout: Duration,
    /// Open connections before new ones get a busy reply
    pub max_connections: usize,
    /// Readiness events taken per poll
    pub poll_batch_size: usize,
    pub read_buffer: BufferConfig,
    pub write_buffer: BufferConfig,

    // Thread configuration
    pub pool: PoolConfig,

    // Content
    pub resources_dir: PathBuf,

    pub log: LogConfig,
    pub auth: AuthConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: "127.0.0.1".to_string(),
            port: 8080,
            backlog_size: 1024,

            idle_timeout: Duration::from_secs(60),
            max_connections: 65_536,
            poll_batch_size: 1024,
            read_buffer: BufferConfig::new(4 * 1024, 1024 * 1024), // 4 KB .. 1 MB
            write_buffer: BufferConfig::new(4 * 1024, 1024 * 1024),

            pool: PoolConfig::default(),

            resources_dir: PathBuf::from("resources"),

            log: LogConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the address and port to listen on
    pub fn with_address(mut self, address: &str, port: u16) -> Self {
        self.listen_address = address.to_string();
        self.port = port;
        self
    }

    /// Set the idle timeout; zero disables eviction
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the connection ceiling
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the worker pool sizing
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Set the read buffer sizes
    pub fn with_read_buffer(mut self, initial: usize, max: usize) -> Self {
        self.read_buffer = BufferConfig::new(initial, max);
        self
    }

    /// Set the write buffer sizes
    pub fn with_write_buffer(mut self, initial: usize, max: usize) -> Self {
        self.write_buffer = BufferConfig::new(initial, max);
        self
    }

    /// Set the directory static files are served from
    pub fn with_resources_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.resources_dir = dir.into();
        self
    }

    pub fn with_log(mut self, log: LogConfig) -> Self {
        self.log = log;
        self
    }

    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.auth = auth;
        self
    }

    /// Get the full address string (address:port)
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.listen_address, self.port)
    }

    /// Reject settings the server cannot run with
    pub fn validate(&self) -> ServerResult<()> {
        self.pool.validate()?;
        self.read_buffer.validate("read")?;
        self.write_buffer.validate("write")?;
        if self.max_connections == 0 {
            return Err(ServerError::Config("max_connections must be at least 1".to_string()));
        }
        if self.poll_batch_size == 0 {
            return Err(ServerError::Config("poll_batch_size must be at least 1".to_string()));
        }
        if self.backlog_size <= 0 {
            return Err(ServerError::Config("backlog_size must be positive".to_string()));
        }
        if self.auth.cache_connections == 0 || self.auth.store_connections == 0 {
            return Err(ServerError::Config("auth pools need at least one connection".to_string()));
        }
        if self.log.max_lines == 0 || self.log.queue_capacity == 0 {
            return Err(ServerError::Config("log max_lines and queue_capacity must be non-zero".to_string()));
        }
        self.log.level_filter()?;
        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> ServerResult<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn save_to_json_file<P: AsRef<Path>>(&self, path: P) -> ServerResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}
