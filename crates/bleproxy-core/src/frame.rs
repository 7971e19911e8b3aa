//! Length-delimited plaintext framing
//!
//! Every frame on the wire is `0x00 | varint(payload_len) | varint(msg_type)
//! | payload`. The leading zero byte marks the plaintext transport; any other
//! value is reserved for the encrypted variant and fails the session.

use crate::error::FrameError;

/// Maximum encoded length of a varint (unsigned base-128, u64)
pub const MAX_VARINT_BYTES: usize = 10;

/// Upper bound on a single frame payload
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024;

/// Transport indicator for plaintext frames
pub const PLAINTEXT_MARKER: u8 = 0x00;

// ----------------------------------------------------------------------------
// Varint Codec
// ----------------------------------------------------------------------------

/// Append the base-128 little-endian encoding of `value` to `buf`
pub fn encode_varint(mut value: u64, buf: &mut Vec<u8>) {
    while value >= 0x80 {
        buf.push((value & 0x7f) as u8 | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Decode a varint from the front of `data`.
///
/// Returns `Ok(None)` when more bytes are needed, `Ok(Some((value, len)))`
/// on success.
pub fn decode_varint(data: &[u8]) -> Result<Option<(u64, usize)>, FrameError> {
    let mut value: u64 = 0;
    for (i, &byte) in data.iter().enumerate() {
        if i >= MAX_VARINT_BYTES {
            return Err(FrameError::VarintOverflow);
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if data.len() >= MAX_VARINT_BYTES {
        return Err(FrameError::VarintOverflow);
    }
    Ok(None)
}

// ----------------------------------------------------------------------------
// Frame Codec
// ----------------------------------------------------------------------------

/// A single decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: u64,
    pub payload: Vec<u8>,
}

/// Encode one frame ready for the socket
pub fn encode_frame(msg_type: u64, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 6);
    out.push(PLAINTEXT_MARKER);
    encode_varint(payload.len() as u64, &mut out);
    encode_varint(msg_type, &mut out);
    out.extend_from_slice(payload);
    out
}

/// Incremental frame decoder over a growable byte accumulator.
///
/// Feed raw socket reads with [`FrameDecoder::extend`] and drain complete
/// frames with [`FrameDecoder::next_frame`]. A `None` return means the
/// accumulator holds at most a partial frame.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes from the socket
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// True if the accumulator holds the beginning of an unfinished frame.
    ///
    /// Used by the session to distinguish a clean peer close (empty buffer)
    /// from a mid-frame close ([`FrameError::ShortRead`]).
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Try to decode the next complete frame from the accumulator
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        if self.buf[0] != PLAINTEXT_MARKER {
            return Err(FrameError::UnsupportedTransport { first: self.buf[0] });
        }

        let mut offset = 1;
        let (payload_len, consumed) = match decode_varint(&self.buf[offset..])? {
            Some(v) => v,
            None => return Ok(None),
        };
        offset += consumed;

        let payload_len = payload_len as usize;
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLarge { len: payload_len });
        }

        let (msg_type, consumed) = match decode_varint(&self.buf[offset..])? {
            Some(v) => v,
            None => return Ok(None),
        };
        offset += consumed;

        if self.buf.len() < offset + payload_len {
            return Ok(None);
        }

        let payload = self.buf[offset..offset + payload_len].to_vec();
        self.buf.drain(..offset + payload_len);
        Ok(Some(Frame { msg_type, payload }))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
