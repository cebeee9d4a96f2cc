//! Wire boundary for the Cellar client.
//!
//! Cellar speaks a length-prefixed binary protocol over TCP: each frame is a
//! 4-byte big-endian length (counting the message code byte plus the body),
//! one message code byte, and the body. This crate carries the pieces the
//! client core needs while staying wire-agnostic above the frame: the framed
//! [`Message`] value, the frame codec, the [`Connection`] abstraction with its
//! close-watch machinery, the [`ResponseListener`] trait the I/O layer drives,
//! and the [`Connector`] seam for establishing transports.
//!
//! Payload serialization and opcode routing live above this crate; nothing in
//! here inspects a body except the server error reply (code 0).

pub mod codec;
pub mod connection;
pub mod connector;

use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;

pub use connection::{CloseWatch, Connection, ResponseListener};
pub use connector::{Connector, TcpConnector};

/// Maximum frame size (10MB), enforced on both encode and decode.
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Message codes the client core and its tests need by name.
///
/// Responses use the request code plus one; the server error reply is code 0
/// regardless of the request.
pub mod codes {
    /// Server error reply.
    pub const ERROR_REPLY: u8 = 0;
    pub const PING: u8 = 1;
    pub const PING_RESP: u8 = 2;
    pub const GET: u8 = 9;
    pub const GET_RESP: u8 = 10;
    pub const PUT: u8 = 11;
    pub const PUT_RESP: u8 = 12;
    pub const DELETE: u8 = 13;
    pub const DELETE_RESP: u8 = 14;
}

/// Transport and framing errors.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One framed protocol message: a code byte and an opaque body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub code: u8,
    pub body: Bytes,
}

impl Message {
    pub fn new(code: u8, body: impl Into<Bytes>) -> Self {
        Self {
            code,
            body: body.into(),
        }
    }

    /// Frame length on the wire, excluding the length prefix itself.
    pub fn frame_len(&self) -> usize {
        1 + self.body.len()
    }
}

/// A decoded server error reply: a `u32` big-endian error code followed by a
/// UTF-8 message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReply {
    pub code: u32,
    pub message: String,
}

impl ErrorReply {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn decode(body: &Bytes) -> Result<Self, ProtocolError> {
        if body.len() < 4 {
            return Err(ProtocolError::InvalidMessage(
                "error reply shorter than its error code".to_string(),
            ));
        }
        let mut code = [0u8; 4];
        code.copy_from_slice(&body[..4]);
        let message = String::from_utf8(body[4..].to_vec()).map_err(|_| {
            ProtocolError::InvalidMessage("error reply message is not UTF-8".to_string())
        })?;
        Ok(Self {
            code: u32::from_be_bytes(code),
            message,
        })
    }

    /// Encode back into a code-0 message, for servers and tests.
    pub fn to_message(&self) -> Message {
        let mut body = Vec::with_capacity(4 + self.message.len());
        body.extend_from_slice(&self.code.to_be_bytes());
        body.extend_from_slice(self.message.as_bytes());
        Message::new(codes::ERROR_REPLY, body)
    }
}
