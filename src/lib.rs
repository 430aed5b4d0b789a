pub mod cli;
pub mod client;
pub mod command;
pub mod config;
pub mod demo;
pub mod pool;
pub mod protocol;

pub use client::Client;
pub use command::{CommandFlags, CommandInfo, CommandKind};
pub use config::{ConfigError, ConnectionConfig};
pub use protocol::{
    Connection, Handler, RawReturn, ReturnType, ReturnValue, RpcServer, TransportError,
};
