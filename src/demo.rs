//! A small call table and its server-side handler.
//!
//! Stands in for the descriptor tables normally generated next to a service interface.
//! The `skein_server` and `skein_client` binaries speak it, and the loopback tests use
//! it to drive every calling convention.
use std::sync::atomic::{AtomicU64, Ordering};

use bincode::{Decode, Encode};
use log::debug;

use crate::{
    command::{CommandFlags, CommandInfo},
    protocol::{Handler, RawReturn, ReturnType, frame::RequestRecord, payload_config},
};

/// `String -> String`.
pub static ECHO: CommandInfo = CommandInfo::new(0, CommandFlags::NONE);
/// `(u64, u64) -> u64`.
pub static ADD: CommandInfo = CommandInfo::new(1, CommandFlags::NONE);
/// `u64 -> ()`, adds to the server's counter.
pub static NOTIFY: CommandInfo = CommandInfo::new(2, CommandFlags::NONE);
/// `() -> u64`, reads the server's counter.
pub static COUNT: CommandInfo = CommandInfo::new(3, CommandFlags::SEND_NOW);
/// `() -> ()`.
pub static PING: CommandInfo = CommandInfo::new(4, CommandFlags::SEND_NOW);

#[derive(Debug, Default)]
pub struct DemoHandler {
    counter: AtomicU64,
}

impl DemoHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}

impl Handler for DemoHandler {
    fn call(&self, request: &RequestRecord) -> RawReturn {
        match request.code {
            code if code == ECHO.code() => reply(decode::<String>(request)),
            code if code == ADD.code() => {
                reply(decode::<(u64, u64)>(request).map(|(a, b)| a.wrapping_add(b)))
            }
            code if code == NOTIFY.code() => match decode::<u64>(request) {
                Ok(amount) => {
                    self.counter.fetch_add(amount, Ordering::SeqCst);
                    ReturnType::Success.into()
                }
                Err(kind) => kind.into(),
            },
            code if code == COUNT.code() => reply(Ok(self.counter())),
            code if code == PING.code() => ReturnType::Success.into(),
            code => {
                debug!("no handler for call code {code}");
                ReturnType::ServerNoCommand.into()
            }
        }
    }
}

fn decode<T: Decode<()>>(request: &RequestRecord) -> Result<T, ReturnType> {
    bincode::decode_from_slice(&request.payload, payload_config())
        .map(|(value, _)| value)
        .map_err(|e| {
            debug!("failed to decode parameters of call {}: {e}", request.code);
            ReturnType::ServerDeserializeError
        })
}

fn reply<T: Encode>(output: Result<T, ReturnType>) -> RawReturn {
    let output = match output {
        Ok(output) => output,
        Err(kind) => return kind.into(),
    };
    match bincode::encode_to_vec(output, payload_config()) {
        Ok(payload) => RawReturn::new(ReturnType::Success, payload),
        Err(e) => {
            debug!("failed to encode call output: {e}");
            ReturnType::ServerException.into()
        }
    }
}
