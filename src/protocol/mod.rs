//! Wire protocol and connection machinery.
//!
//! This module holds everything between a call made on a [`Client`](crate::Client) and the
//! bytes that leave the socket: the per-connection command queue, the drain loop that
//! batches queued commands into frames, the callback table that matches responses to
//! callers, and the server side that accepts sockets and dispatches requests.
//!
//! # Overview
//!
//! Every [`Connection`] owns one outbound pipeline:
//!
//! - Callers on any thread encode their parameters into a pooled command and append it
//!   to the [`CommandQueue`].
//! - A single [`Sender`] thread takes the whole queued chain, builds as many commands as
//!   fit into a batch buffer and writes the batch, compressing it when configured.
//! - Calls that expect a result park their completion in [`PendingCalls`] under a
//!   callback index; the receive thread resolves it when the response record arrives.
//!
//! Disposing a connection, whether on request or after a socket failure, resolves every
//! call that is still queued or waiting with [`ReturnType::ClientDisposed`].
//!
//! # Binary Format
//!
//! All integers are little-endian.
//!
//! - Request record: `i32 code | u32 flags | u32 callback index | u32 length | payload`.
//! - Response record: `i32 callback index | u8 return type | u32 length | payload`.
//! - A batch is a run of records. A compressed batch is replaced by
//!   `i32 -compressed length | i32 original length | raw deflate stream`.
//!
//! Codes below [`MIN_USER_COMMAND`](crate::command::MIN_USER_COMMAND) are reserved for the
//! transport itself; the only one in use is the heartbeat.
//!
//! Parameters and results inside a payload are encoded with `bincode` using
//! [`payload_config`].
//!
//! # See Also
//!
//! - [`command`](crate::command): the queued unit of work and its call descriptors.
//! - [`pool`](crate::pool): reuse of commands and send buffers.
mod connection;
pub mod frame;
mod link;
mod pending;
mod queue;
mod response;
mod sender;
mod server;
mod thread;
mod transport;

use bincode::config::{self, Config};

pub(crate) use connection::Shared;
pub use connection::{Connection, Role};
pub use link::{SocketLink, SocketLinks};
pub use pending::PendingCalls;
pub use queue::{CommandQueue, WaitHandle};
pub use response::{RawReturn, ReturnType, ReturnValue};
pub use sender::Sender;
pub use server::{Handler, RpcServer};
pub use thread::ThreadPool;
pub use transport::TransportError;

/// `bincode` configuration for call parameters and results.
pub fn payload_config() -> impl Config {
    config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}
