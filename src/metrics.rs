use std::sync::atomic::{AtomicUsize, Ordering};

/// A simple counter that can be incremented atomically
#[derive(Debug)]
pub struct Counter {
    value: AtomicUsize,
}

impl Counter {
    /// Create a new counter with an initial value
    pub fn new(initial_value: usize) -> Self {
        Self {
            value: AtomicUsize::new(initial_value),
        }
    }

    /// Increment the counter by a specific amount
    pub fn increment(&self, amount: usize) {
        self.value.fetch_add(amount, Ordering::Relaxed);
    }

    /// Get the current value of the counter
    pub fn value(&self) -> usize {
        self.value.load(Ordering::Relaxed)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Counters shared by the event loop and the I/O tasks
#[derive(Debug, Default)]
pub struct ServerMetrics {
    pub accepted: Counter,
    /// Connections turned away at the ceiling
    pub rejected_busy: Counter,
    pub closed: Counter,
    /// Connections evicted by the idle timer
    pub timed_out: Counter,
    pub requests: Counter,
    pub bad_requests: Counter,
    pub bytes_read: Counter,
    pub bytes_written: Counter,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connections accepted and not yet closed
    pub fn open_connections(&self) -> usize {
        self.accepted.value().saturating_sub(self.closed.value())
    }

    /// Get metrics as a formatted string
    pub fn format(&self) -> String {
        let rows = [
            ("connections.accepted", self.accepted.value()),
            ("connections.rejected_busy", self.rejected_busy.value()),
            ("connections.closed", self.closed.value()),
            ("connections.timed_out", self.timed_out.value()),
            ("connections.open", self.open_connections()),
            ("requests", self.requests.value()),
            ("requests.bad", self.bad_requests.value()),
            ("bytes_read", self.bytes_read.value()),
            ("bytes_written", self.bytes_written.value()),
        ];

        let mut result = String::new();
        for (name, value) in rows {
            result.push_str(&format!("{}: {}\n", name, value));
        }
        result
    }
}
