//! Wire message framing.
//!
//! Every message starts with a fixed 16-byte header:
//!
//! ```text
//! [messageLength:4][requestId:4][responseTo:4][opCode:4]
//! ```
//!
//! A message with `opCode == OP_COMPRESSED` carries a second header ahead of
//! the compressed payload:
//!
//! ```text
//! [originalOpCode:4][uncompressedSize:4][compressorId:1][compressed bytes]
//! ```
//!
//! All integers are little-endian.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::ConnectionError;

/// Size of the fixed message header.
pub const MESSAGE_HEADER_LENGTH: usize = 16;

/// Size of the sub-header that follows the header of an `OP_COMPRESSED` message.
pub const COMPRESSED_HEADER_LENGTH: usize = 9;

/// Default cap on a single message when the server has not said otherwise.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 48_000_000;

/// Wire opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Reply,
    Query,
    Compressed,
    Msg,
}

impl OpCode {
    pub const OP_REPLY: i32 = 1;
    pub const OP_QUERY: i32 = 2004;
    pub const OP_COMPRESSED: i32 = 2012;
    pub const OP_MSG: i32 = 2013;

    /// Get the wire value.
    pub fn value(&self) -> i32 {
        match self {
            OpCode::Reply => Self::OP_REPLY,
            OpCode::Query => Self::OP_QUERY,
            OpCode::Compressed => Self::OP_COMPRESSED,
            OpCode::Msg => Self::OP_MSG,
        }
    }

    /// Parse a wire value. Returns None for opcodes this crate does not speak.
    pub fn from_value(value: i32) -> Option<Self> {
        match value {
            Self::OP_REPLY => Some(OpCode::Reply),
            Self::OP_QUERY => Some(OpCode::Query),
            Self::OP_COMPRESSED => Some(OpCode::Compressed),
            Self::OP_MSG => Some(OpCode::Msg),
            _ => None,
        }
    }
}

/// The fixed header in front of every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Total message length in bytes, header included.
    pub message_length: u32,
    pub request_id: u32,
    pub response_to: u32,
    pub op_code: i32,
}

impl MessageHeader {
    pub fn new(message_length: u32, request_id: u32, response_to: u32, op_code: i32) -> Self {
        Self {
            message_length,
            request_id,
            response_to,
            op_code,
        }
    }

    /// Append the header to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.message_length);
        buf.put_u32_le(self.request_id);
        buf.put_u32_le(self.response_to);
        buf.put_i32_le(self.op_code);
    }

    /// Overwrite the first [`MESSAGE_HEADER_LENGTH`] bytes of `buf`.
    ///
    /// Used to backfill the length once the body has been written.
    pub fn write_at_start(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= MESSAGE_HEADER_LENGTH);
        buf[0..4].copy_from_slice(&self.message_length.to_le_bytes());
        buf[4..8].copy_from_slice(&self.request_id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.response_to.to_le_bytes());
        buf[12..16].copy_from_slice(&self.op_code.to_le_bytes());
    }

    /// Decode and validate a header.
    ///
    /// # Errors
    /// Returns `ProtocolFraming` if fewer than [`MESSAGE_HEADER_LENGTH`] bytes
    /// are given, or if the declared length is shorter than the header itself
    /// or larger than `max_message_size`.
    pub fn decode(data: &[u8], max_message_size: usize) -> Result<Self, ConnectionError> {
        if data.len() < MESSAGE_HEADER_LENGTH {
            return Err(ConnectionError::ProtocolFraming(format!(
                "incomplete message header: expected {} bytes, got {}",
                MESSAGE_HEADER_LENGTH,
                data.len()
            )));
        }

        let mut buf = &data[..MESSAGE_HEADER_LENGTH];
        let header = Self {
            message_length: buf.get_u32_le(),
            request_id: buf.get_u32_le(),
            response_to: buf.get_u32_le(),
            op_code: buf.get_i32_le(),
        };

        let length = header.message_length as usize;
        if length < MESSAGE_HEADER_LENGTH {
            return Err(ConnectionError::ProtocolFraming(format!(
                "message length {} is smaller than the {} byte header",
                length, MESSAGE_HEADER_LENGTH
            )));
        }
        if length > max_message_size {
            return Err(ConnectionError::ProtocolFraming(format!(
                "message length {} is larger than the maximum message length {}",
                length, max_message_size
            )));
        }

        Ok(header)
    }

    /// Number of bytes that follow the header.
    pub fn body_length(&self) -> usize {
        self.message_length as usize - MESSAGE_HEADER_LENGTH
    }

    pub fn is_compressed(&self) -> bool {
        self.op_code == OpCode::OP_COMPRESSED
    }
}

/// The sub-header of an `OP_COMPRESSED` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressedHeader {
    /// Opcode of the message before compression.
    pub original_op_code: i32,
    /// Length of the body before compression, header excluded.
    pub uncompressed_size: u32,
    pub compressor_id: u8,
    /// The header this sub-header was read behind.
    pub message_header: MessageHeader,
}

impl CompressedHeader {
    /// Append the sub-header to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.original_op_code);
        buf.put_u32_le(self.uncompressed_size);
        buf.put_u8(self.compressor_id);
    }

    /// Decode the sub-header from the start of an `OP_COMPRESSED` body.
    pub fn decode(body: &[u8], message_header: MessageHeader) -> Result<Self, ConnectionError> {
        if body.len() < COMPRESSED_HEADER_LENGTH {
            return Err(ConnectionError::ProtocolFraming(format!(
                "incomplete compressed header: expected {} bytes, got {}",
                COMPRESSED_HEADER_LENGTH,
                body.len()
            )));
        }

        let mut buf = &body[..COMPRESSED_HEADER_LENGTH];
        Ok(Self {
            original_op_code: buf.get_i32_le(),
            uncompressed_size: buf.get_u32_le(),
            compressor_id: buf.get_u8(),
            message_header,
        })
    }

    /// Header describing the message as it was before compression.
    pub fn uncompressed_header(&self) -> MessageHeader {
        MessageHeader {
            message_length: self
                .uncompressed_size
                .saturating_add(MESSAGE_HEADER_LENGTH as u32),
            request_id: self.message_header.request_id,
            response_to: self.message_header.response_to,
            op_code: self.original_op_code,
        }
    }
}

/// Header of a received message after any decompression.
///
/// `op_code` is the logical opcode: for a compressed message it is the
/// original opcode from the compressed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyHeader {
    pub message_length: u32,
    pub request_id: u32,
    pub response_to: u32,
    pub op_code: i32,
    /// Whether the message arrived as `OP_COMPRESSED`.
    pub compressed: bool,
}

impl From<MessageHeader> for ReplyHeader {
    fn from(header: MessageHeader) -> Self {
        Self {
            message_length: header.message_length,
            request_id: header.request_id,
            response_to: header.response_to,
            op_code: header.op_code,
            compressed: false,
        }
    }
}

impl From<CompressedHeader> for ReplyHeader {
    fn from(header: CompressedHeader) -> Self {
        let logical = header.uncompressed_header();
        Self {
            compressed: true,
            ..ReplyHeader::from(logical)
        }
    }
}
