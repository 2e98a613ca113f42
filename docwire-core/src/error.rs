//! Connection error taxonomy.
//!
//! This module provides the error types shared by every connection
//! implementation:
//! - [`ConnectionError`]: The single error type returned by connection operations
//! - [`ErrorKind`]: A fieldless view of the variant, for matching and comparison

use std::io;
use std::sync::Arc;

use bson::Document;

use crate::address::ServerAddress;

/// The kind of a [`ConnectionError`], without its payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ClosedConnection,
    ReadTimeout,
    ReadFailure,
    WriteFailure,
    Interrupted,
    CommandFailure,
    UnexpectedInternal,
    UnsupportedCompressor,
    ProtocolFraming,
    OpenFailure,
    InvalidState,
    Encode,
    Decode,
}

impl ErrorKind {
    /// Get the string representation of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ClosedConnection => "closed_connection",
            ErrorKind::ReadTimeout => "read_timeout",
            ErrorKind::ReadFailure => "read_failure",
            ErrorKind::WriteFailure => "write_failure",
            ErrorKind::Interrupted => "interrupted",
            ErrorKind::CommandFailure => "command_failure",
            ErrorKind::UnexpectedInternal => "unexpected_internal",
            ErrorKind::UnsupportedCompressor => "unsupported_compressor",
            ErrorKind::ProtocolFraming => "protocol_framing",
            ErrorKind::OpenFailure => "open_failure",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::Encode => "encode",
            ErrorKind::Decode => "decode",
        }
    }
}

/// Errors produced by a connection.
///
/// Transport failures are translated into this type exactly once, at the
/// connection boundary. The type is `Clone` so the same value can be handed
/// to a command listener and returned to the caller.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The connection (or its transport) is closed.
    #[error("connection to {address} is closed: {message}")]
    ClosedConnection {
        address: ServerAddress,
        message: String,
    },

    /// The transport timed out waiting for bytes.
    #[error("timeout while receiving message from {address}")]
    ReadTimeout {
        address: ServerAddress,
        #[source]
        source: Arc<io::Error>,
    },

    /// Reading from the transport failed.
    #[error("exception receiving message from {address}")]
    ReadFailure {
        address: ServerAddress,
        #[source]
        source: Arc<io::Error>,
    },

    /// Writing to the transport failed.
    #[error("exception sending message to {address}")]
    WriteFailure {
        address: ServerAddress,
        #[source]
        source: Arc<io::Error>,
    },

    /// The blocked operation was interrupted.
    #[error("interrupted: {message}")]
    Interrupted {
        message: String,
        #[source]
        source: Option<Arc<io::Error>>,
    },

    /// The server answered the command with `ok: 0`.
    #[error("command failed with error {code}: '{message}' on server {address}")]
    CommandFailure {
        code: i32,
        code_name: Option<String>,
        message: String,
        address: ServerAddress,
        response: Document,
    },

    /// An unexpected condition the taxonomy has no better name for.
    #[error("unexpected internal error: {message}")]
    UnexpectedInternal {
        message: String,
        #[source]
        source: Option<Arc<io::Error>>,
    },

    /// A compressor name or wire id with no local implementation.
    #[error("unsupported compressor: {0}")]
    UnsupportedCompressor(String),

    /// Header, length or section data inconsistent with the bytes received.
    #[error("protocol error: {0}")]
    ProtocolFraming(String),

    /// The transport could not be opened.
    #[error("exception opening socket to {address}")]
    OpenFailure {
        address: ServerAddress,
        #[source]
        source: Arc<io::Error>,
    },

    /// The operation is not valid in the connection's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Message encoding error.
    #[error("encode error: {0}")]
    Encode(String),

    /// Message decoding error.
    #[error("decode error: {0}")]
    Decode(String),
}

impl ConnectionError {
    /// Create a closed-connection error.
    pub fn closed<S: Into<String>>(address: &ServerAddress, message: S) -> Self {
        ConnectionError::ClosedConnection {
            address: address.clone(),
            message: message.into(),
        }
    }

    /// Build a command failure from the server's error document.
    ///
    /// Reads `code` (default -1), `codeName` and `errmsg` (default empty).
    pub fn command_failure(response: Document, address: &ServerAddress) -> Self {
        let code = match response.get("code") {
            Some(bson::Bson::Int32(code)) => *code,
            Some(bson::Bson::Int64(code)) => i32::try_from(*code).unwrap_or(-1),
            Some(bson::Bson::Double(code))
                if code.fract() == 0.0
                    && *code >= f64::from(i32::MIN)
                    && *code <= f64::from(i32::MAX) =>
            {
                *code as i32
            }
            _ => -1,
        };
        let code_name = response.get_str("codeName").ok().map(str::to_owned);
        let message = response.get_str("errmsg").unwrap_or_default().to_owned();
        ConnectionError::CommandFailure {
            code,
            code_name,
            message,
            address: address.clone(),
            response,
        }
    }

    /// Get the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConnectionError::ClosedConnection { .. } => ErrorKind::ClosedConnection,
            ConnectionError::ReadTimeout { .. } => ErrorKind::ReadTimeout,
            ConnectionError::ReadFailure { .. } => ErrorKind::ReadFailure,
            ConnectionError::WriteFailure { .. } => ErrorKind::WriteFailure,
            ConnectionError::Interrupted { .. } => ErrorKind::Interrupted,
            ConnectionError::CommandFailure { .. } => ErrorKind::CommandFailure,
            ConnectionError::UnexpectedInternal { .. } => ErrorKind::UnexpectedInternal,
            ConnectionError::UnsupportedCompressor(_) => ErrorKind::UnsupportedCompressor,
            ConnectionError::ProtocolFraming(_) => ErrorKind::ProtocolFraming,
            ConnectionError::OpenFailure { .. } => ErrorKind::OpenFailure,
            ConnectionError::InvalidState(_) => ErrorKind::InvalidState,
            ConnectionError::Encode(_) => ErrorKind::Encode,
            ConnectionError::Decode(_) => ErrorKind::Decode,
        }
    }

    /// Get the server error code (only for `CommandFailure`).
    pub fn code(&self) -> Option<i32> {
        match self {
            ConnectionError::CommandFailure { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Copy of this error with server-provided payload removed.
    ///
    /// Command failures keep their code but lose the message and the
    /// response document. Other variants are returned unchanged.
    pub fn redacted(&self) -> Self {
        match self {
            ConnectionError::CommandFailure { code, address, .. } => {
                ConnectionError::CommandFailure {
                    code: *code,
                    code_name: None,
                    message: String::new(),
                    address: address.clone(),
                    response: Document::new(),
                }
            }
            other => other.clone(),
        }
    }

    /// Wrap this error in an `io::Error` so a transport can return it.
    ///
    /// The connection's translator unwraps it again unchanged.
    pub fn into_io(self) -> io::Error {
        io::Error::other(self)
    }

    /// Recover a `ConnectionError` previously wrapped with [`into_io`](Self::into_io).
    pub fn from_io(err: io::Error) -> Result<Self, io::Error> {
        let is_domain = err
            .get_ref()
            .is_some_and(|inner| inner.is::<ConnectionError>());
        if !is_domain {
            return Err(err);
        }
        match err.into_inner().map(|inner| inner.downcast::<ConnectionError>()) {
            Some(Ok(domain)) => Ok(*domain),
            _ => Err(io::Error::other("connection error payload vanished")),
        }
    }
}
