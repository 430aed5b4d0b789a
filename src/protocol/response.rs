use bincode::Decode;
use log::debug;

use super::payload_config;

/// Outcome classification of a call.
///
/// The discriminant is the byte carried in a response record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReturnType {
    Unknown = 0,
    Success = 1,
    /// The call could not be issued locally (pool exhaustion, bad parameters).
    ClientException = 2,
    /// The connection was torn down before the call completed.
    ClientDisposed = 3,
    ClientDeserializeError = 4,
    ServerException = 5,
    ServerDeserializeError = 6,
    /// The server has no handler for the call code.
    ServerNoCommand = 7,
}

impl ReturnType {
    pub fn is_success(self) -> bool {
        self == ReturnType::Success
    }
}

impl From<u8> for ReturnType {
    fn from(value: u8) -> Self {
        match value {
            1 => ReturnType::Success,
            2 => ReturnType::ClientException,
            3 => ReturnType::ClientDisposed,
            4 => ReturnType::ClientDeserializeError,
            5 => ReturnType::ServerException,
            6 => ReturnType::ServerDeserializeError,
            7 => ReturnType::ServerNoCommand,
            _ => ReturnType::Unknown,
        }
    }
}

impl From<ReturnType> for u8 {
    fn from(value: ReturnType) -> Self {
        value as u8
    }
}

/// Typed result of a call; produced exactly once per call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnValue<T> {
    pub kind: ReturnType,
    pub value: Option<T>,
}

impl<T> ReturnValue<T> {
    pub fn success(value: T) -> Self {
        Self {
            kind: ReturnType::Success,
            value: Some(value),
        }
    }

    pub fn is_success(&self) -> bool {
        self.kind.is_success()
    }

    pub fn into_result(self) -> Result<T, ReturnType> {
        match (self.kind, self.value) {
            (ReturnType::Success, Some(value)) => Ok(value),
            (ReturnType::Success, None) => Err(ReturnType::ClientDeserializeError),
            (kind, _) => Err(kind),
        }
    }
}

impl<T> From<ReturnType> for ReturnValue<T> {
    fn from(kind: ReturnType) -> Self {
        Self { kind, value: None }
    }
}

/// Untyped outcome as it leaves the wire: the return type plus the encoded output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawReturn {
    pub kind: ReturnType,
    pub payload: Vec<u8>,
}

impl RawReturn {
    pub fn new(kind: ReturnType, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    pub fn disposed() -> Self {
        Self::from(ReturnType::ClientDisposed)
    }

    /// Decodes the payload of a successful return.
    pub fn decode<T: Decode<()>>(&self) -> ReturnValue<T> {
        if !self.kind.is_success() {
            return self.kind.into();
        }
        match bincode::decode_from_slice(&self.payload, payload_config()) {
            Ok((value, _)) => ReturnValue::success(value),
            Err(e) => {
                debug!("failed to decode call output: {e}");
                ReturnType::ClientDeserializeError.into()
            }
        }
    }
}

impl From<ReturnType> for RawReturn {
    fn from(kind: ReturnType) -> Self {
        Self {
            kind,
            payload: Vec::new(),
        }
    }
}
