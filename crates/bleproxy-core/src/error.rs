//! Error taxonomy for the daemon
//!
//! Framing and protocol violations are fatal for the offending session only;
//! BLE-side failures are carried as error codes inside response messages and
//! never terminate the daemon.

use thiserror::Error;

// ----------------------------------------------------------------------------
// Framing Errors
// ----------------------------------------------------------------------------

/// Errors produced by the frame codec
#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    /// Stream closed mid-frame. Closing between frames is a normal
    /// termination and never surfaces as an error.
    #[error("stream closed inside a partial frame")]
    ShortRead,

    #[error("varint exceeded {max} bytes without terminating", max = crate::frame::MAX_VARINT_BYTES)]
    VarintOverflow,

    #[error("payload of {len} bytes exceeds the {max} byte limit", max = crate::frame::MAX_PAYLOAD_LEN)]
    PayloadTooLarge { len: usize },

    /// Any leading byte other than 0x00 selects a transport this daemon
    /// does not implement.
    #[error("unsupported transport indicator 0x{first:02x}")]
    UnsupportedTransport { first: u8 },
}

// ----------------------------------------------------------------------------
// Message Codec Errors
// ----------------------------------------------------------------------------

/// Errors produced while decoding a message payload
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated field in message payload")]
    Truncated,

    #[error("unknown wire type {0}")]
    UnknownWireType(u8),

    #[error("invalid UTF-8 in string field")]
    InvalidString,

    #[error("unknown message type {0}")]
    UnknownMessageType(u64),

    #[error("invalid enum value {value} for {field}")]
    InvalidEnumValue { field: &'static str, value: u64 },
}

// ----------------------------------------------------------------------------
// Session / Daemon Errors
// ----------------------------------------------------------------------------

/// Top-level error type for session and daemon failures
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// A message arrived in a session state that does not accept it.
    #[error("message {message_type:?} not permitted in state {state}")]
    ProtocolViolation {
        message_type: crate::message::MessageType,
        state: &'static str,
    },

    #[error("client presented an invalid password")]
    AuthFailure,

    /// The outbox filled up while holding a non-droppable reply.
    #[error("session outbox full for a non-droppable message")]
    Backpressure,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("shutting down")]
    Shutdown,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn internal(msg: impl Into<String>) -> Self {
        ProxyError::Internal(msg.into())
    }
}
