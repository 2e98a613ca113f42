//! Command and reply messages.
//!
//! - [`CommandMessage`]: An outbound command, encoded as `OP_MSG` or legacy `OP_QUERY`
//! - [`EncodedMessage`]: The framed bytes of a command, optionally wrapped as `OP_COMPRESSED`
//! - [`ReplyMessage`]: The first reply document located inside a received body

use std::sync::atomic::{AtomicU32, Ordering};

use bson::{Document, RawDocument};
use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::BoxedCompressor;
use crate::document::{Encoder, command_name};
use crate::error::ConnectionError;
use crate::framing::{
    COMPRESSED_HEADER_LENGTH, CompressedHeader, DEFAULT_MAX_MESSAGE_SIZE, MESSAGE_HEADER_LENGTH,
    MessageHeader, OpCode, ReplyHeader,
};

static NEXT_REQUEST_ID: AtomicU32 = AtomicU32::new(1);

/// Allocate a process-wide unique request id.
pub fn next_request_id() -> u32 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

/// Size limits a message must respect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageSettings {
    pub max_document_size: usize,
    pub max_message_size: usize,
    pub max_batch_count: usize,
}

impl Default for MessageSettings {
    fn default() -> Self {
        Self {
            max_document_size: 16 * 1024 * 1024,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_batch_count: 1000,
        }
    }
}

/// A database and collection pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    database: String,
    collection: String,
}

impl Namespace {
    pub const COMMAND_COLLECTION: &'static str = "$cmd";

    pub fn new<D: Into<String>, C: Into<String>>(database: D, collection: C) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// The command namespace `<database>.$cmd`.
    pub fn command<D: Into<String>>(database: D) -> Self {
        Self::new(database, Self::COMMAND_COLLECTION)
    }

    /// Parse `database.collection`. The collection may itself contain dots.
    pub fn parse(full_name: &str) -> Option<Self> {
        let (database, collection) = full_name.split_once('.')?;
        if database.is_empty() || collection.is_empty() {
            return None;
        }
        Some(Self::new(database, collection))
    }

    pub fn database_name(&self) -> &str {
        &self.database
    }

    pub fn collection_name(&self) -> &str {
        &self.collection
    }

    pub fn full_name(&self) -> String {
        format!("{}.{}", self.database, self.collection)
    }
}

/// Outbound wire shape of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandFormat {
    /// `OP_MSG` with a single kind-0 section.
    #[default]
    Msg,
    /// `OP_QUERY` against `<database>.$cmd`, answered with `OP_REPLY`.
    LegacyQuery,
}

/// A command to send, with the request id its reply will answer.
#[derive(Debug, Clone)]
pub struct CommandMessage {
    request_id: u32,
    namespace: Namespace,
    command: Document,
    format: CommandFormat,
}

impl CommandMessage {
    /// Create an `OP_MSG` command against `database`.
    pub fn new<D: Into<String>>(database: D, command: Document) -> Self {
        Self {
            request_id: next_request_id(),
            namespace: Namespace::command(database),
            command,
            format: CommandFormat::Msg,
        }
    }

    /// Create a command by encoding `value` with `encoder`.
    pub fn from_value<D, T, E>(database: D, value: &T, encoder: &E) -> Result<Self, ConnectionError>
    where
        D: Into<String>,
        T: ?Sized,
        E: Encoder<T>,
    {
        Ok(Self::new(database, encoder.encode(value)?))
    }

    /// Send as a legacy `OP_QUERY` instead of `OP_MSG`.
    pub fn legacy(mut self) -> Self {
        self.format = CommandFormat::LegacyQuery;
        self
    }

    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn command(&self) -> &Document {
        &self.command
    }

    pub fn format(&self) -> CommandFormat {
        self.format
    }

    /// The command name, with any `$query` wrapper unwrapped.
    pub fn command_name(&self) -> &str {
        command_name(&self.command).unwrap_or_default()
    }

    pub fn op_code(&self) -> OpCode {
        match self.format {
            CommandFormat::Msg => OpCode::Msg,
            CommandFormat::LegacyQuery => OpCode::Query,
        }
    }

    /// Frame the command.
    ///
    /// # Errors
    /// Returns `Encode` if the document cannot be serialized or the result
    /// exceeds the document or message size limits.
    pub fn encode(&self, settings: &MessageSettings) -> Result<EncodedMessage, ConnectionError> {
        let mut buf = BytesMut::with_capacity(256);
        MessageHeader::new(0, self.request_id, 0, self.op_code().value()).encode_into(&mut buf);

        let document = match self.format {
            CommandFormat::Msg => {
                buf.put_u32_le(0); // flag bits
                buf.put_u8(0); // section kind: body
                let mut body = self.command.clone();
                if !body.contains_key("$db") {
                    body.insert("$db", self.namespace.database_name());
                }
                body
            }
            CommandFormat::LegacyQuery => {
                buf.put_i32_le(0); // flags
                buf.put_slice(self.namespace.full_name().as_bytes());
                buf.put_u8(0);
                buf.put_i32_le(0); // numberToSkip
                buf.put_i32_le(-1); // numberToReturn
                self.command.clone()
            }
        };

        let first_document_position = buf.len();
        let bytes = bson::to_vec(&document)
            .map_err(|e| ConnectionError::Encode(format!("command encoding failed: {e}")))?;
        if bytes.len() > settings.max_document_size {
            return Err(ConnectionError::Encode(format!(
                "command document of {} bytes exceeds the maximum document size {}",
                bytes.len(),
                settings.max_document_size
            )));
        }
        buf.put_slice(&bytes);

        let message_length = buf.len();
        if message_length > settings.max_message_size {
            return Err(ConnectionError::Encode(format!(
                "message of {} bytes exceeds the maximum message size {}",
                message_length, settings.max_message_size
            )));
        }
        MessageHeader::new(message_length as u32, self.request_id, 0, self.op_code().value())
            .write_at_start(&mut buf);

        Ok(EncodedMessage {
            request_id: self.request_id,
            op_code: self.op_code().value(),
            bytes: buf.freeze(),
            first_document_position,
        })
    }
}

/// A framed message ready for the transport.
#[derive(Debug, Clone)]
pub struct EncodedMessage {
    request_id: u32,
    op_code: i32,
    bytes: Bytes,
    first_document_position: usize,
}

impl EncodedMessage {
    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    pub fn op_code(&self) -> i32 {
        self.op_code
    }

    /// The whole message, header included.
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Offset of the command document within [`bytes`](Self::bytes).
    pub fn first_document_position(&self) -> usize {
        self.first_document_position
    }

    /// Wrap the message body in an `OP_COMPRESSED` envelope.
    ///
    /// The envelope keeps the request id; the original opcode and body size
    /// travel in the compressed header.
    pub fn compress(
        &self,
        compressor: &BoxedCompressor,
        settings: &MessageSettings,
    ) -> Result<Bytes, ConnectionError> {
        let body = &self.bytes[MESSAGE_HEADER_LENGTH..];
        let compressed = compressor
            .compress(body)
            .map_err(|e| ConnectionError::Encode(format!("compression failed: {e}")))?;

        let message_length = MESSAGE_HEADER_LENGTH + COMPRESSED_HEADER_LENGTH + compressed.len();
        if message_length > settings.max_message_size {
            return Err(ConnectionError::Encode(format!(
                "compressed message of {} bytes exceeds the maximum message size {}",
                message_length, settings.max_message_size
            )));
        }

        let header = MessageHeader::new(
            message_length as u32,
            self.request_id,
            0,
            OpCode::OP_COMPRESSED,
        );
        let mut buf = BytesMut::with_capacity(message_length);
        header.encode_into(&mut buf);
        CompressedHeader {
            original_op_code: self.op_code,
            uncompressed_size: body.len() as u32,
            compressor_id: compressor.id(),
            message_header: header,
        }
        .encode_into(&mut buf);
        buf.put_slice(&compressed);
        Ok(buf.freeze())
    }
}

/// The first document of a reply body.
#[derive(Debug, Clone, Copy)]
pub struct ReplyMessage<'a> {
    header: ReplyHeader,
    document: &'a RawDocument,
}

/// `OP_MSG` flag bit announcing a trailing CRC-32C checksum.
const CHECKSUM_PRESENT: u32 = 1;

/// Fixed prefix of an `OP_REPLY` body before its documents.
const OP_REPLY_PREFIX_LENGTH: usize = 20;

impl<'a> ReplyMessage<'a> {
    /// Locate the reply document in `body`.
    ///
    /// # Errors
    /// Returns `ProtocolFraming` if the reply does not answer `request_id`,
    /// has an unexpected opcode or section layout, or its document overruns
    /// the body. Returns `Decode` if the document bytes are malformed.
    pub fn parse(
        header: &ReplyHeader,
        body: &'a [u8],
        request_id: u32,
    ) -> Result<Self, ConnectionError> {
        if header.response_to != request_id {
            return Err(ConnectionError::ProtocolFraming(format!(
                "the responseTo ({}) in the response does not match the requestId ({}) in the request",
                header.response_to, request_id
            )));
        }

        let document = match header.op_code {
            OpCode::OP_MSG => {
                if body.len() < 5 {
                    return Err(ConnectionError::ProtocolFraming(format!(
                        "OP_MSG body of {} bytes is too short",
                        body.len()
                    )));
                }
                let flags = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
                let end = if flags & CHECKSUM_PRESENT != 0 {
                    body.len().saturating_sub(4)
                } else {
                    body.len()
                };
                if body[4] != 0 {
                    return Err(ConnectionError::ProtocolFraming(format!(
                        "expected a body section, got section kind {}",
                        body[4]
                    )));
                }
                read_document(&body[..end], 5)?
            }
            OpCode::OP_REPLY => {
                if body.len() < OP_REPLY_PREFIX_LENGTH {
                    return Err(ConnectionError::ProtocolFraming(format!(
                        "OP_REPLY body of {} bytes is too short",
                        body.len()
                    )));
                }
                let number_returned = i32::from_le_bytes([body[16], body[17], body[18], body[19]]);
                if number_returned < 1 {
                    return Err(ConnectionError::ProtocolFraming(
                        "reply contains no documents".into(),
                    ));
                }
                read_document(body, OP_REPLY_PREFIX_LENGTH)?
            }
            other => {
                return Err(ConnectionError::ProtocolFraming(format!(
                    "unexpected reply opcode {other}"
                )));
            }
        };

        Ok(Self {
            header: *header,
            document,
        })
    }

    pub fn header(&self) -> &ReplyHeader {
        &self.header
    }

    pub fn document(&self) -> &'a RawDocument {
        self.document
    }
}

fn read_document(body: &[u8], offset: usize) -> Result<&RawDocument, ConnectionError> {
    let remaining = body.len().saturating_sub(offset);
    if remaining < 5 {
        return Err(ConnectionError::ProtocolFraming(format!(
            "expected a document at offset {offset}, only {remaining} bytes remain"
        )));
    }
    let declared = i32::from_le_bytes([
        body[offset],
        body[offset + 1],
        body[offset + 2],
        body[offset + 3],
    ]);
    if declared < 5 || declared as usize > remaining {
        return Err(ConnectionError::ProtocolFraming(format!(
            "document length {declared} does not fit in the {remaining} remaining bytes"
        )));
    }
    RawDocument::from_bytes(&body[offset..offset + declared as usize])
        .map_err(|e| ConnectionError::Decode(format!("malformed reply document: {e}")))
}
