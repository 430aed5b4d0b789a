//! Outbound unit of work.
//!
//! This module defines the [`Command`] struct, one queued unit of outbound RPC work or
//! control traffic, together with the static descriptor ([`CommandInfo`]) that identifies
//! a call on the wire and the [`Completion`] strategies that deliver its result.
//!
//! # Overview
//! A command is obtained from the connection's [`CommandPool`](crate::pool::CommandPool),
//! filled on the caller's thread (parameters are encoded eagerly into the command's own
//! payload buffer), queued, and finally built into a batch by the connection's sender.
//! Once built it goes straight back to the pool; the completion that waits for the
//! response lives in the connection's callback table under the command's callback index.
//!
//! The [`CommandKind`] variants are:
//!
//! - `InputOnly`: fire-and-forget with parameters.
//! - `CallOnly`: fire-and-forget without parameters.
//! - `OutputOnly`: no parameters, returns a value.
//! - `InputOutput`: parameters in, value out.
//! - `Call`: acknowledged notification, with or without parameters.
//! - `Check`: heartbeat injected by the sender's watchdog.
//! - `Reply`: a server's response to a request.
//!
//! # Example
//! ```rust
//! use skein::{CommandFlags, CommandInfo};
//!
//! static ECHO: CommandInfo = CommandInfo::new(0, CommandFlags::NONE);
//! assert_eq!(ECHO.code(), 128);
//! ```
use std::{
    fmt,
    ops::BitOr,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use log::error;
use parking_lot::{Condvar, Mutex};

use crate::{
    pool::Reset,
    protocol::{
        RawReturn, ReturnType, TransportError,
        frame::{self, NO_CALLBACK},
    },
};

/// Call codes below this value are reserved for system commands.
pub const MIN_USER_COMMAND: i32 = 128;

/// Heartbeat call code.
pub const CHECK_COMMAND: i32 = 1;

/// Serialization and scheduling flags carried by a call descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CommandFlags(u32);

impl CommandFlags {
    pub const NONE: Self = Self(0);
    /// Parameters are text (JSON) encoded instead of binary.
    pub const JSON: Self = Self(1);
    /// Flush the batch as soon as this command has been built.
    pub const SEND_NOW: Self = Self(1 << 1);
    /// Verification call; the batch carrying it is never compressed.
    pub const VERIFY: Self = Self(1 << 2);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl BitOr for CommandFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

/// Static call descriptor: numeric identity plus flags.
///
/// Tables of descriptors are normally generated next to a service interface and handed
/// to the [`Client`](crate::Client) call methods; the transport treats them as opaque keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandInfo {
    code: i32,
    flags: CommandFlags,
}

impl CommandInfo {
    /// Descriptor for the `index`-th user call.
    ///
    /// # Panics
    /// If `index` does not fit the non-negative wire code range.
    pub const fn new(index: u32, flags: CommandFlags) -> Self {
        assert!(
            index <= (i32::MAX - MIN_USER_COMMAND) as u32,
            "call index out of range"
        );
        Self {
            code: index as i32 + MIN_USER_COMMAND,
            flags,
        }
    }

    pub(crate) const fn system(code: i32) -> Self {
        Self {
            code,
            flags: CommandFlags::NONE,
        }
    }

    pub const fn code(&self) -> i32 {
        self.code
    }

    pub const fn flags(&self) -> CommandFlags {
        self.flags
    }
}

impl Default for CommandInfo {
    fn default() -> Self {
        Self::system(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    InputOnly,
    CallOnly,
    OutputOnly,
    InputOutput,
    Call,
    Check,
    Reply,
}

impl CommandKind {
    /// Whether the peer answers this kind with a response record.
    pub fn expects_response(self) -> bool {
        matches!(
            self,
            CommandKind::OutputOnly | CommandKind::InputOutput | CommandKind::Call
        )
    }
}

/// Private per-call completion primitive for blocking callers.
#[derive(Debug, Default)]
pub struct WaitSlot {
    result: Mutex<Option<RawReturn>>,
    ready: Condvar,
}

impl WaitSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn release(&self, raw: RawReturn) {
        *self.result.lock() = Some(raw);
        self.ready.notify_one();
    }

    /// Blocks until [`release`](Self::release) has been called.
    pub fn wait(&self) -> RawReturn {
        let mut result = self.result.lock();
        loop {
            if let Some(raw) = result.take() {
                return raw;
            }
            self.ready.wait(&mut result);
        }
    }
}

impl Reset for Arc<WaitSlot> {
    fn reset(&mut self) {
        *self.result.lock() = None;
    }
}

pub type Callback = Box<dyn FnOnce(RawReturn) + Send + 'static>;

/// How the result of a call reaches its caller.
pub enum Completion {
    /// Releases a blocked caller.
    Wait(Arc<WaitSlot>),
    /// Runs a continuation on the thread that processes the response.
    Callback(Callback),
}

impl Completion {
    /// Delivers `raw`. A panicking callback is logged and swallowed so the thread that
    /// resolves calls (a receive loop or `dispose`) keeps going.
    pub fn complete(self, raw: RawReturn) {
        match self {
            Completion::Wait(slot) => slot.release(raw),
            Completion::Callback(callback) => {
                if panic::catch_unwind(AssertUnwindSafe(move || callback(raw))).is_err() {
                    error!("call completion panicked");
                }
            }
        }
    }

    pub fn is_wait(&self) -> bool {
        matches!(self, Completion::Wait(_))
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Completion::Wait(_) => f.write_str("Completion::Wait"),
            Completion::Callback(_) => f.write_str("Completion::Callback"),
        }
    }
}

/// What the commands built into the current batch asked of the sender.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildInfo {
    pub count: usize,
    pub send_now: bool,
    pub has_waiter: bool,
    pub is_verify: bool,
}

impl BuildInfo {
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// One queued unit of outbound work.
#[derive(Debug)]
pub struct Command {
    kind: CommandKind,
    info: CommandInfo,
    index: u32,
    status: ReturnType,
    waiting: bool,
    payload: Vec<u8>,
}

impl Default for Command {
    fn default() -> Self {
        Self {
            kind: CommandKind::CallOnly,
            info: CommandInfo::default(),
            index: NO_CALLBACK,
            status: ReturnType::Unknown,
            waiting: false,
            payload: Vec::new(),
        }
    }
}

impl Command {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fills a request command. `index` is the callback slot holding the completion,
    /// [`NO_CALLBACK`] when no response is expected.
    pub(crate) fn set_request(
        &mut self,
        kind: CommandKind,
        info: CommandInfo,
        index: u32,
        waiting: bool,
    ) {
        self.kind = kind;
        self.info = info;
        self.index = index;
        self.waiting = waiting;
    }

    pub(crate) fn set_check(&mut self) {
        self.set_request(
            CommandKind::Check,
            CommandInfo::system(CHECK_COMMAND),
            NO_CALLBACK,
            false,
        );
    }

    pub(crate) fn set_reply(&mut self, index: u32, status: ReturnType) {
        self.kind = CommandKind::Reply;
        self.index = index;
        self.status = status;
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn info(&self) -> &CommandInfo {
        &self.info
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub(crate) fn payload_mut(&mut self) -> &mut Vec<u8> {
        &mut self.payload
    }

    pub(crate) fn has_callback(&self) -> bool {
        self.index != NO_CALLBACK
    }

    /// Size of the record this command frames.
    pub fn record_len(&self) -> usize {
        match self.kind {
            CommandKind::Reply => frame::RESPONSE_HEADER_SIZE + self.payload.len(),
            _ => frame::REQUEST_HEADER_SIZE + self.payload.len(),
        }
    }

    /// Appends this command's record to `out`.
    ///
    /// Returns `false` without touching `out` when the record does not fit the
    /// remaining `capacity` of a non-empty batch; the command then stays at the front
    /// of the queue for the next batch. A record larger than `capacity` is always
    /// accepted into an empty batch.
    pub fn build(
        &self,
        out: &mut Vec<u8>,
        capacity: usize,
        info: &mut BuildInfo,
    ) -> Result<bool, TransportError> {
        if !out.is_empty() && out.len() + self.record_len() > capacity {
            return Ok(false);
        }
        match self.kind {
            CommandKind::Reply => {
                frame::write_response(out, self.index, self.status, &self.payload)?
            }
            _ => frame::write_request(
                out,
                self.info.code(),
                self.info.flags(),
                self.index,
                &self.payload,
            )?,
        }

        let flags = self.info.flags();
        info.count += 1;
        info.send_now |= flags.contains(CommandFlags::SEND_NOW);
        info.is_verify |= flags.contains(CommandFlags::VERIFY);
        info.has_waiter |= self.waiting;
        Ok(true)
    }
}

impl Reset for Command {
    fn reset(&mut self) {
        self.kind = CommandKind::CallOnly;
        self.info = CommandInfo::default();
        self.index = NO_CALLBACK;
        self.status = ReturnType::Unknown;
        self.waiting = false;
        self.payload.clear();
    }
}
