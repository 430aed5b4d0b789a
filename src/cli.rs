//! Command line options shared by the skein binaries.
//!
//! [`TransportArgs`] is flattened into each binary's own `clap` parser and turned into a
//! [`ConnectionConfig`] once the target address is known.
use std::time::Duration;

use clap::Args;

use crate::config::{
    ConnectionConfig, DEFAULT_BUFFER_POOL_CAPACITY, DEFAULT_COMMAND_POOL_CAPACITY,
    DEFAULT_COMPRESSION_LEVEL, DEFAULT_MAX_INPUT_SIZE, DEFAULT_MAX_OUTSTANDING_COMMANDS,
    DEFAULT_SEND_BUFFER_MAX_SIZE, DEFAULT_SEND_BUFFER_SIZE,
};

#[derive(Debug, Clone, Args)]
pub struct TransportArgs {
    /// Send buffer size in bytes; batches are cut at this size
    #[arg(long, default_value_t = DEFAULT_SEND_BUFFER_SIZE)]
    pub send_buffer_size: usize,

    /// Largest grown send buffer kept between batches
    #[arg(long, default_value_t = DEFAULT_SEND_BUFFER_MAX_SIZE)]
    pub send_buffer_max_size: usize,

    /// Compress batches of at least this many bytes (0 disables compression)
    #[arg(long, default_value_t = 0)]
    pub min_compress_size: usize,

    /// Deflate level for compressed batches
    #[arg(long, default_value_t = DEFAULT_COMPRESSION_LEVEL)]
    pub compression_level: u32,

    /// Coalescing delay in milliseconds before a batch is flushed; negative flushes at once
    #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
    pub output_sleep_ms: i64,

    /// Idle seconds before a heartbeat is sent (0 disables heartbeats)
    #[arg(long, default_value_t = 59)]
    pub check_seconds: u64,

    /// Largest inbound frame accepted, in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_INPUT_SIZE)]
    pub max_input_size: usize,

    /// Maximum number of live commands per connection
    #[arg(long, default_value_t = DEFAULT_MAX_OUTSTANDING_COMMANDS)]
    pub max_outstanding: usize,
}

impl TransportArgs {
    pub fn into_config(self, host: impl Into<String>, port: u16) -> ConnectionConfig {
        ConnectionConfig {
            host: host.into(),
            port,
            send_buffer_size: self.send_buffer_size,
            send_buffer_max_size: self.send_buffer_max_size,
            min_compress_size: self.min_compress_size,
            compression_level: self.compression_level,
            output_sleep: ConnectionConfig::output_sleep_from_millis(self.output_sleep_ms),
            check_interval: Duration::from_secs(self.check_seconds),
            max_input_size: self.max_input_size,
            max_outstanding_commands: self.max_outstanding,
            command_pool_capacity: DEFAULT_COMMAND_POOL_CAPACITY,
            buffer_pool_capacity: DEFAULT_BUFFER_POOL_CAPACITY,
        }
    }
}
