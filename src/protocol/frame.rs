//! Wire framing.
//!
//! A batch written by a sender is a run of records, either raw or wrapped in a single
//! compressed block:
//!
//! ```text
//! raw:         [record][record]...
//! compressed:  [i32 -compressed_len][i32 original_len][deflate([record][record]...)]
//! ```
//!
//! Every record starts with a non-negative `i32` (the call code for requests, the
//! callback index for responses), so a reader tells a compressed block from a raw record
//! by the sign of the first field. All integers are little-endian.
//!
//! Request record: `i32 code | u32 flags | u32 callback_index | u32 len | payload`.
//! Response record: `i32 callback_index | u8 return_type | u32 len | payload`.
use std::io::{self, Read, Write};

use flate2::{Compression, read::DeflateDecoder, write::DeflateEncoder};

use crate::{command::CommandFlags, config::MAX_FRAME_SIZE};

use super::{ReturnType, TransportError};

/// Callback index of a request that expects no response.
pub const NO_CALLBACK: u32 = u32::MAX;
pub const COMPRESSION_HEADER_SIZE: usize = 2 * size_of::<i32>();
pub const REQUEST_HEADER_SIZE: usize = size_of::<i32>() + 3 * size_of::<u32>();
pub const RESPONSE_HEADER_SIZE: usize = size_of::<i32>() + size_of::<u8>() + size_of::<u32>();

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
    pub code: i32,
    pub flags: CommandFlags,
    pub index: u32,
    pub payload: Vec<u8>,
}

impl RequestRecord {
    pub fn expects_response(&self) -> bool {
        self.index != NO_CALLBACK
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseRecord {
    pub index: u32,
    pub kind: ReturnType,
    pub payload: Vec<u8>,
}

fn payload_len(payload: &[u8]) -> Result<u32, TransportError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge {
            size: payload.len(),
            limit: MAX_FRAME_SIZE,
        });
    }
    u32::try_from(payload.len()).map_err(|_| TransportError::Malformed("payload length overflow"))
}

pub fn write_request(
    out: &mut Vec<u8>,
    code: i32,
    flags: CommandFlags,
    index: u32,
    payload: &[u8],
) -> Result<(), TransportError> {
    if code < 0 {
        return Err(TransportError::Malformed("negative call code"));
    }
    let length = payload_len(payload)?;
    out.reserve(REQUEST_HEADER_SIZE + payload.len());
    out.extend_from_slice(&code.to_le_bytes());
    out.extend_from_slice(&flags.bits().to_le_bytes());
    out.extend_from_slice(&index.to_le_bytes());
    out.extend_from_slice(&length.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(())
}

pub fn write_response(
    out: &mut Vec<u8>,
    index: u32,
    kind: ReturnType,
    payload: &[u8],
) -> Result<(), TransportError> {
    let index =
        i32::try_from(index).map_err(|_| TransportError::Malformed("callback index overflow"))?;
    let length = payload_len(payload)?;
    out.reserve(RESPONSE_HEADER_SIZE + payload.len());
    out.extend_from_slice(&index.to_le_bytes());
    out.push(kind.into());
    out.extend_from_slice(&length.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(())
}

/// Compresses `data` into `out` behind the 8-byte compression header.
///
/// Returns `Ok(false)` and leaves `out` empty when deflate does not make the batch
/// smaller; the caller then sends `data` as is.
pub fn compress(data: &[u8], out: &mut Vec<u8>, level: u32) -> io::Result<bool> {
    out.clear();
    let Ok(original) = i32::try_from(data.len()) else {
        return Ok(false);
    };
    out.extend_from_slice(&[0; COMPRESSION_HEADER_SIZE]);

    let mut encoder = DeflateEncoder::new(&mut *out, Compression::new(level));
    encoder.write_all(data)?;
    encoder.finish()?;

    let compressed = out.len() - COMPRESSION_HEADER_SIZE;
    let length = match i32::try_from(compressed) {
        Ok(length) if compressed < data.len() => length,
        _ => {
            out.clear();
            return Ok(false);
        }
    };
    out[..4].copy_from_slice(&(-length).to_le_bytes());
    out[4..COMPRESSION_HEADER_SIZE].copy_from_slice(&original.to_le_bytes());
    Ok(true)
}

/// Inflates a compressed block body into `out`, which must come out at `original_len`.
pub fn decompress(
    block: &[u8],
    original_len: usize,
    out: &mut Vec<u8>,
) -> Result<(), TransportError> {
    out.clear();
    out.reserve(original_len);
    let limit = u64::try_from(original_len).unwrap_or(u64::MAX).saturating_add(1);
    DeflateDecoder::new(block).take(limit).read_to_end(out)?;
    if out.len() != original_len {
        return Err(TransportError::Malformed("decompressed length mismatch"));
    }
    Ok(())
}

/// Reads records off a byte stream, inflating compressed blocks transparently.
pub struct FrameReader<R> {
    inner: R,
    block: Vec<u8>,
    position: usize,
    from_block: bool,
    compressed: Vec<u8>,
    max_input_size: usize,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R, max_input_size: usize) -> Self {
        Self {
            inner,
            block: Vec::new(),
            position: 0,
            from_block: false,
            compressed: Vec::new(),
            max_input_size,
        }
    }

    /// Next request record, `None` once the peer closed the stream between records.
    pub fn read_request(&mut self) -> Result<Option<RequestRecord>, TransportError> {
        let Some(code) = self.next_record()? else {
            return Ok(None);
        };
        let flags = CommandFlags::from_bits(self.read_u32()?);
        let index = self.read_u32()?;
        let payload = self.read_payload()?;
        Ok(Some(RequestRecord {
            code,
            flags,
            index,
            payload,
        }))
    }

    /// Next response record, `None` once the peer closed the stream between records.
    pub fn read_response(&mut self) -> Result<Option<ResponseRecord>, TransportError> {
        let Some(index) = self.next_record()? else {
            return Ok(None);
        };
        let index = u32::try_from(index).map_err(|_| TransportError::Malformed("negative index"))?;
        let mut kind = [0; 1];
        self.read_exact(&mut kind)?;
        let payload = self.read_payload()?;
        Ok(Some(ResponseRecord {
            index,
            kind: ReturnType::from(kind[0]),
            payload,
        }))
    }

    fn next_record(&mut self) -> Result<Option<i32>, TransportError> {
        loop {
            if self.position < self.block.len() {
                self.from_block = true;
                let lead = self.read_u32()?;
                return Ok(Some(i32::from_le_bytes(lead.to_le_bytes())));
            }

            self.from_block = false;
            self.block.clear();
            self.position = 0;

            let mut lead = [0; 4];
            if !self.read_lead(&mut lead)? {
                return Ok(None);
            }
            let lead = i32::from_le_bytes(lead);
            if lead >= 0 {
                return Ok(Some(lead));
            }
            self.inflate(lead.unsigned_abs())?;
        }
    }

    fn inflate(&mut self, compressed_len: u32) -> Result<(), TransportError> {
        let compressed_len = self.check_size(compressed_len)?;
        let original = self.read_u32()?;
        if i32::try_from(original).is_err() {
            return Err(TransportError::Malformed("negative original length"));
        }
        let original = self.check_size(original)?;
        if original == 0 {
            return Err(TransportError::Malformed("empty compressed block"));
        }

        self.compressed.resize(compressed_len, 0);
        self.inner.read_exact(&mut self.compressed)?;
        decompress(&self.compressed, original, &mut self.block)?;
        self.position = 0;
        Ok(())
    }

    /// Reads the first field of a record from the stream. `false` on EOF before any byte.
    fn read_lead(&mut self, buf: &mut [u8; 4]) -> Result<bool, TransportError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(false),
                Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
                Ok(count) => filled += count,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        if !self.from_block {
            self.inner.read_exact(buf)?;
            return Ok(());
        }
        let end = self.position + buf.len();
        let Some(bytes) = self.block.get(self.position..end) else {
            return Err(TransportError::Malformed("record crosses compressed block"));
        };
        buf.copy_from_slice(bytes);
        self.position = end;
        Ok(())
    }

    fn read_u32(&mut self) -> Result<u32, TransportError> {
        let mut buf = [0; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_payload(&mut self) -> Result<Vec<u8>, TransportError> {
        let length = self.read_u32()?;
        let length = self.check_size(length)?;
        let mut payload = vec![0; length];
        self.read_exact(&mut payload)?;
        Ok(payload)
    }

    fn check_size(&self, size: u32) -> Result<usize, TransportError> {
        let size = usize::try_from(size).map_err(|_| TransportError::Malformed("size overflow"))?;
        if size > self.max_input_size {
            return Err(TransportError::FrameTooLarge {
                size,
                limit: self.max_input_size,
            });
        }
        Ok(size)
    }
}
