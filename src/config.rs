//! Server configuration
//!
//! Values come from the command line; everything except the address has a
//! default.

use std::time::Duration;

use crate::codec::DEFAULT_MAX_FRAME_LENGTH;

/// Channel buffer size for server commands
pub const DEFAULT_COMMAND_BUFFER: usize = 256;

/// Per-connection outbound queue capacity
pub const DEFAULT_OUTBOUND_QUEUE: usize = 1024;

/// Longest accepted username, in characters
pub const MAX_USERNAME_CHARS: usize = 20;

/// Longest accepted message, in characters
pub const MAX_MESSAGE_CHARS: usize = 560;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind, e.g. `127.0.0.1:8080`
    pub address: String,
    pub command_buffer: usize,
    pub outbound_queue: usize,
    /// Upper bound on one stuffed record
    pub max_frame_length: usize,
    /// Close sessions that stay silent this long
    pub read_timeout: Option<Duration>,
}

impl ServerConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            command_buffer: DEFAULT_COMMAND_BUFFER,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            read_timeout: None,
        }
    }

    pub fn with_outbound_queue(mut self, capacity: usize) -> Self {
        self.outbound_queue = capacity.max(1);
        self
    }

    pub fn with_max_frame_length(mut self, max: usize) -> Self {
        self.max_frame_length = max;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::new("127.0.0.1:0");
        assert_eq!(config.command_buffer, DEFAULT_COMMAND_BUFFER);
        assert_eq!(config.outbound_queue, DEFAULT_OUTBOUND_QUEUE);
        assert_eq!(config.max_frame_length, DEFAULT_MAX_FRAME_LENGTH);
        assert!(config.read_timeout.is_none());
    }

    #[test]
    fn test_outbound_queue_never_zero() {
        // mpsc::channel panics on a zero capacity
        let config = ServerConfig::new("127.0.0.1:0").with_outbound_queue(0);
        assert_eq!(config.outbound_queue, 1);
    }
}
