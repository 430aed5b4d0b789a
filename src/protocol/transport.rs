use std::{
    io::{self, Write},
    net::TcpStream,
    sync::atomic::{AtomicBool, Ordering},
    thread,
};

use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to encode message: {0}")]
    Serialize(#[from] bincode::error::EncodeError),
    #[error("failed to decode message: {0}")]
    Deserialize(#[from] bincode::error::DecodeError),
    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),
    #[error("connection disposed")]
    Disposed,
    #[error("command pool exhausted, {limit} commands outstanding")]
    PoolExhausted { limit: usize },
    #[error("frame of {size} bytes exceeds the maximum input size of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Writes `data` completely, advancing by the bytes the socket accepted.
///
/// Partial writes, interrupts and would-block are retried for as long as the connection
/// has not been disposed; any other failure is returned and ends the batch.
pub(crate) fn send_all<W: Write>(
    writer: &mut W,
    mut data: &[u8],
    disposed: &AtomicBool,
) -> Result<(), TransportError> {
    while !data.is_empty() {
        if disposed.load(Ordering::Acquire) {
            return Err(TransportError::Disposed);
        }
        match writer.write(data) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
            Ok(count) => data = &data[count..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::yield_now(),
            Err(e) => return Err(e.into()),
        }
    }
    writer.flush()?;
    Ok(())
}

/// Socket options applied to every connection before its threads start.
pub(crate) fn configure_stream(stream: &TcpStream) -> Result<(), TransportError> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Accepts at most `chunk` bytes per call and fails every other call with `Interrupted`.
    struct Trickle {
        out: Vec<u8>,
        chunk: usize,
        interrupt: bool,
    }

    impl Write for Trickle {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.interrupt = !self.interrupt;
            if self.interrupt {
                return Err(io::ErrorKind::Interrupted.into());
            }
            let count = buf.len().min(self.chunk);
            self.out.extend_from_slice(&buf[..count]);
            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Broken;

    impl Write for Broken {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn retries_partial_writes() {
        let mut writer = Trickle {
            out: Vec::new(),
            chunk: 3,
            interrupt: false,
        };
        let data: Vec<u8> = (0..20).collect();

        send_all(&mut writer, &data, &AtomicBool::new(false)).unwrap();
        assert_eq!(writer.out, data);
    }

    #[test]
    fn socket_error_fails_batch() {
        let err = send_all(&mut Broken, b"abc", &AtomicBool::new(false)).unwrap_err();
        assert!(matches!(err, TransportError::Io(e) if e.kind() == io::ErrorKind::BrokenPipe));
    }

    #[test]
    fn disposed_connection_stops_writing() {
        let mut out = Vec::new();
        let err = send_all(&mut out, b"abc", &AtomicBool::new(true)).unwrap_err();
        assert!(matches!(err, TransportError::Disposed));
        assert!(out.is_empty());
    }
}
