//! Reference server configuration.

use std::time::Duration;

/// Configuration for [`ShapeLogServer`](crate::ShapeLogServer).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// How long a live request is held open without changes.
    pub long_poll_timeout: Duration,
    /// Maximum number of log entries per response.
    pub max_batch: usize,
}

impl ServerConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self {
            long_poll_timeout: Duration::from_secs(20),
            max_batch: 100,
        }
    }

    /// Sets the long-poll timeout.
    pub fn with_long_poll_timeout(mut self, timeout: Duration) -> Self {
        self.long_poll_timeout = timeout;
        self
    }

    /// Sets the maximum batch size.
    pub fn with_max_batch(mut self, max: usize) -> Self {
        self.max_batch = max.max(1);
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}
