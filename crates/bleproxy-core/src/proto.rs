//! Protobuf-subset field codec
//!
//! The native API only ever uses two wire types: varint (0) and
//! length-delimited (2). Fields holding their default value are omitted on
//! encode; unknown fields are skipped on decode so newer clients keep
//! working against this daemon.

use crate::error::DecodeError;
use crate::frame::{decode_varint, encode_varint};

const WIRE_VARINT: u8 = 0;
const WIRE_LEN: u8 = 2;

// ----------------------------------------------------------------------------
// Writer
// ----------------------------------------------------------------------------

/// Accumulates an encoded message payload
#[derive(Debug, Default)]
pub struct ProtoWriter {
    buf: Vec<u8>,
}

impl ProtoWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(&mut self, field: u32, wire_type: u8) {
        encode_varint(u64::from(field) << 3 | u64::from(wire_type), &mut self.buf);
    }

    /// Unsigned varint field; omitted when zero
    pub fn varint(&mut self, field: u32, value: u64) {
        if value != 0 {
            self.key(field, WIRE_VARINT);
            encode_varint(value, &mut self.buf);
        }
    }

    /// Signed field with zigzag encoding; omitted when zero
    pub fn sint32(&mut self, field: u32, value: i32) {
        if value != 0 {
            self.key(field, WIRE_VARINT);
            let zigzag = ((value << 1) ^ (value >> 31)) as u32;
            encode_varint(u64::from(zigzag), &mut self.buf);
        }
    }

    /// Boolean field; omitted when false
    pub fn bool(&mut self, field: u32, value: bool) {
        if value {
            self.key(field, WIRE_VARINT);
            self.buf.push(1);
        }
    }

    /// UTF-8 string field; omitted when empty
    pub fn string(&mut self, field: u32, value: &str) {
        self.bytes(field, value.as_bytes());
    }

    /// Raw bytes field; omitted when empty
    pub fn bytes(&mut self, field: u32, value: &[u8]) {
        if !value.is_empty() {
            self.key(field, WIRE_LEN);
            encode_varint(value.len() as u64, &mut self.buf);
            self.buf.extend_from_slice(value);
        }
    }

    /// Nested message field; emitted even when empty so repeated elements
    /// keep their cardinality
    pub fn message(&mut self, field: u32, value: &[u8]) {
        self.key(field, WIRE_LEN);
        encode_varint(value.len() as u64, &mut self.buf);
        self.buf.extend_from_slice(value);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

// ----------------------------------------------------------------------------
// Reader
// ----------------------------------------------------------------------------

/// One decoded field value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue<'a> {
    Varint(u64),
    Bytes(&'a [u8]),
}

impl<'a> FieldValue<'a> {
    pub fn as_u64(&self) -> Result<u64, DecodeError> {
        match self {
            FieldValue::Varint(v) => Ok(*v),
            FieldValue::Bytes(_) => Err(DecodeError::Truncated),
        }
    }

    pub fn as_u32(&self) -> Result<u32, DecodeError> {
        Ok(self.as_u64()? as u32)
    }

    pub fn as_u16(&self) -> Result<u16, DecodeError> {
        Ok(self.as_u64()? as u16)
    }

    pub fn as_bool(&self) -> Result<bool, DecodeError> {
        Ok(self.as_u64()? != 0)
    }

    pub fn as_sint32(&self) -> Result<i32, DecodeError> {
        let zigzag = self.as_u64()? as u32;
        Ok((zigzag >> 1) as i32 ^ -((zigzag & 1) as i32))
    }

    pub fn as_bytes(&self) -> Result<&'a [u8], DecodeError> {
        match self {
            FieldValue::Bytes(b) => Ok(b),
            FieldValue::Varint(_) => Err(DecodeError::Truncated),
        }
    }

    pub fn as_str(&self) -> Result<&'a str, DecodeError> {
        core::str::from_utf8(self.as_bytes()?).map_err(|_| DecodeError::InvalidString)
    }
}

/// Walks the fields of one encoded message payload
#[derive(Debug)]
pub struct ProtoReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ProtoReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_varint(&mut self) -> Result<u64, DecodeError> {
        match decode_varint(&self.data[self.pos..]) {
            Ok(Some((value, consumed))) => {
                self.pos += consumed;
                Ok(value)
            }
            _ => Err(DecodeError::Truncated),
        }
    }

    /// Advance to the next field. `Ok(None)` at end of payload.
    pub fn next_field(&mut self) -> Result<Option<(u32, FieldValue<'a>)>, DecodeError> {
        if self.pos >= self.data.len() {
            return Ok(None);
        }
        let key = self.read_varint()?;
        let field = (key >> 3) as u32;
        let wire_type = (key & 0x7) as u8;
        match wire_type {
            WIRE_VARINT => {
                let value = self.read_varint()?;
                Ok(Some((field, FieldValue::Varint(value))))
            }
            WIRE_LEN => {
                let len = self.read_varint()? as usize;
                if self.pos + len > self.data.len() {
                    return Err(DecodeError::Truncated);
                }
                let bytes = &self.data[self.pos..self.pos + len];
                self.pos += len;
                Ok(Some((field, FieldValue::Bytes(bytes))))
            }
            other => Err(DecodeError::UnknownWireType(other)),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
