//! Connection configuration.
//!
//! A [`ConnectionConfig`] is read-only once a connection has been started; every
//! [`Connection`](crate::protocol::Connection) holds it behind an `Arc` and the sender,
//! receiver and call surface all consult the same record.
//!
//! The defaults mirror a small internal service: an 8 KiB send buffer that may grow up
//! to 1 MiB for oversized batches, no compression, immediate flushing and a heartbeat
//! every 59 seconds of idle time.
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 13304;
pub const DEFAULT_SEND_BUFFER_SIZE: usize = 8 * 1024;
pub const DEFAULT_SEND_BUFFER_MAX_SIZE: usize = 1024 * 1024;
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(59);
pub const DEFAULT_MAX_INPUT_SIZE: usize = 0x3FF4;
pub const DEFAULT_MAX_OUTSTANDING_COMMANDS: usize = 1 << 16;
pub const DEFAULT_COMMAND_POOL_CAPACITY: usize = 1024;
pub const DEFAULT_BUFFER_POOL_CAPACITY: usize = 64;
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 1;

/// Largest value a frame length field can carry.
pub(crate) const MAX_FRAME_SIZE: usize = i32::MAX as usize;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("send buffer size must be non-zero")]
    ZeroSendBuffer,

    #[error("send buffer max size ({max}) is smaller than the send buffer size ({size})")]
    MaxBelowSendBuffer { size: usize, max: usize },

    #[error("maximum outstanding commands must be non-zero")]
    ZeroOutstanding,

    #[error("invalid compression level {0}, expected 0-9")]
    CompressionLevel(u32),

    #[error("'{field}' exceeds the largest frame size ({value} bytes)")]
    TooLarge { field: &'static str, value: usize },

    #[error("thread pool needs at least one worker")]
    ZeroWorkers,
}

/// Transport settings shared by both ends of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Remote host the client connects to.
    pub host: String,
    /// Remote port the client connects to.
    pub port: u16,
    /// Capacity of a pooled send buffer; batches are cut at this size.
    pub send_buffer_size: usize,
    /// An oversized batch buffer up to this capacity is kept for the next batch,
    /// anything larger goes back to the allocator after one use.
    pub send_buffer_max_size: usize,
    /// Batches of at least this many bytes are compressed. `0` disables compression.
    pub min_compress_size: usize,
    /// Deflate level used for compressed batches.
    pub compression_level: u32,
    /// Coalescing delay before a batch is flushed. `None` flushes as soon as the
    /// queue runs dry.
    pub output_sleep: Option<Duration>,
    /// Idle time after which a heartbeat is queued. [`Duration::ZERO`] disables it.
    pub check_interval: Duration,
    /// Largest inbound frame or payload accepted by the receive loops.
    pub max_input_size: usize,
    /// Upper bound on commands that may be live at once on one connection.
    pub max_outstanding_commands: usize,
    /// Number of released commands kept for reuse.
    pub command_pool_capacity: usize,
    /// Number of released send buffers kept for reuse.
    pub buffer_pool_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            send_buffer_size: DEFAULT_SEND_BUFFER_SIZE,
            send_buffer_max_size: DEFAULT_SEND_BUFFER_MAX_SIZE,
            min_compress_size: 0,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            output_sleep: None,
            check_interval: DEFAULT_CHECK_INTERVAL,
            max_input_size: DEFAULT_MAX_INPUT_SIZE,
            max_outstanding_commands: DEFAULT_MAX_OUTSTANDING_COMMANDS,
            command_pool_capacity: DEFAULT_COMMAND_POOL_CAPACITY,
            buffer_pool_capacity: DEFAULT_BUFFER_POOL_CAPACITY,
        }
    }
}

impl ConnectionConfig {
    /// `host:port` pair suitable for `TcpStream::connect`.
    pub fn address(&self) -> (&str, u16) {
        (self.host.as_str(), self.port)
    }

    /// Converts a signed millisecond delay into an output sleep; negative values
    /// mean "flush immediately".
    pub fn output_sleep_from_millis(millis: i64) -> Option<Duration> {
        u64::try_from(millis).ok().map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.send_buffer_size == 0 {
            return Err(ConfigError::ZeroSendBuffer);
        }
        if self.send_buffer_max_size < self.send_buffer_size {
            return Err(ConfigError::MaxBelowSendBuffer {
                size: self.send_buffer_size,
                max: self.send_buffer_max_size,
            });
        }
        if self.max_outstanding_commands == 0 {
            return Err(ConfigError::ZeroOutstanding);
        }
        if self.compression_level > 9 {
            return Err(ConfigError::CompressionLevel(self.compression_level));
        }
        for (field, value) in [
            ("send_buffer_max_size", self.send_buffer_max_size),
            ("max_input_size", self.max_input_size),
        ] {
            if value > MAX_FRAME_SIZE {
                return Err(ConfigError::TooLarge { field, value });
            }
        }
        Ok(())
    }
}
