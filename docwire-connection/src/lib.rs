//! Stream connection for docwire.
//!
//! This crate owns one transport stream to one server and dispatches
//! commands over it, blocking or async, with identical semantics.
//!
//! ## Features
//!
//! - Opening handshake with compressor negotiation
//! - `OP_MSG` and legacy `OP_QUERY` commands, `OP_MSG` and `OP_REPLY` replies
//! - Outbound `OP_COMPRESSED` (snappy, zlib, zstd), skipped for credential commands
//! - Ok-check on the raw reply before decoding
//! - Command events with redaction of credential commands
//! - Fail-fast close on any dispatch failure
//!
//! ## Example
//!
//! ```ignore
//! use docwire_connection::{CommandMessage, ConnectionBuilder, DocumentDecoder, ServerAddress};
//! use bson::doc;
//!
//! let connection = ConnectionBuilder::new(ServerAddress::new("localhost", 27017))
//!     .stream_factory(tcp_stream_factory)
//!     .compressor_names(["zstd", "snappy"])?
//!     .build()?;
//! connection.open_async().await?;
//!
//! let ping = CommandMessage::new("admin", doc! { "ping": 1 });
//! let reply = connection.send_and_receive_async(&ping, &DocumentDecoder).await?;
//! ```

mod buffer;
mod builder;
mod connection;
mod description;
mod events;
mod initializer;
mod state;
mod stream;
mod translate;

pub use buffer::{ByteBuf, ResponseBuffers};
pub use builder::ConnectionBuilder;
pub use connection::InternalStreamConnection;
pub use description::{ConnectionDescription, ConnectionId, ServerId, ServerType};
pub use events::{
    CommandFailedEvent, CommandListener, CommandStartedEvent, CommandSucceededEvent,
    LoggingCommandListener,
};
pub use initializer::{ConnectionInitializer, HandshakeInitializer, description_from_reply};
pub use state::ConnectionState;
pub use stream::{Stream, StreamFactory};

// Re-export core types
pub use docwire_core::{
    BoxedCompressor, CommandFormat, CommandMessage, CompressionLevel, Compressor, CompressorKind,
    CompressorRegistry, CompressorSpec, ConnectionError, Decoder, DocumentDecoder, Encoder,
    EncodedMessage, ErrorKind, MessageHeader, MessageSettings, Namespace, OpCode,
    RawDocumentDecoder, ReplyHeader, SECURITY_SENSITIVE_COMMANDS, SerdeDecoder, SerdeEncoder,
    ServerAddress, compressor_ids, is_security_sensitive,
};
