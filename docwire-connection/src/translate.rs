//! Transport error translation.
//!
//! Every `io::Error` a [`Stream`](crate::Stream) returns is mapped onto the
//! connection error taxonomy exactly once, here. A transport that already
//! produced a [`ConnectionError`] (wrapped with
//! [`ConnectionError::into_io`]) gets it back unchanged.

use std::io;
use std::sync::Arc;

use docwire_core::{ConnectionError, ServerAddress};

/// The transport operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operation {
    Open,
    Read,
    Write,
}

pub(crate) fn translate(
    err: io::Error,
    operation: Operation,
    address: &ServerAddress,
) -> ConnectionError {
    let err = match ConnectionError::from_io(err) {
        Ok(domain) => return domain,
        Err(err) => err,
    };

    match (err.kind(), operation) {
        (io::ErrorKind::Interrupted, _) => ConnectionError::Interrupted {
            message: format!("interrupted while talking to {address}"),
            source: Some(Arc::new(err)),
        },
        (io::ErrorKind::Other | io::ErrorKind::Unsupported | io::ErrorKind::OutOfMemory, _) => {
            ConnectionError::UnexpectedInternal {
                message: format!("unexpected error talking to {address}: {err}"),
                source: Some(Arc::new(err)),
            }
        }
        (_, Operation::Open) => ConnectionError::OpenFailure {
            address: address.clone(),
            source: Arc::new(err),
        },
        (io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock, Operation::Read) => {
            ConnectionError::ReadTimeout {
                address: address.clone(),
                source: Arc::new(err),
            }
        }
        (_, Operation::Read) => ConnectionError::ReadFailure {
            address: address.clone(),
            source: Arc::new(err),
        },
        (_, Operation::Write) => ConnectionError::WriteFailure {
            address: address.clone(),
            source: Arc::new(err),
        },
    }
}

/// Translate a failed body read.
///
/// End of stream inside a message body is `ProtocolFraming`.
pub(crate) fn translate_body_read(err: io::Error, address: &ServerAddress) -> ConnectionError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        return ConnectionError::ProtocolFraming(format!(
            "unexpected end of stream from {address} while reading the message body: {err}"
        ));
    }
    translate(err, Operation::Read, address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use docwire_core::ErrorKind;

    fn address() -> ServerAddress {
        ServerAddress::new("localhost", 27017)
    }

    fn kind_of(kind: io::ErrorKind, operation: Operation) -> ErrorKind {
        translate(io::Error::new(kind, "boom"), operation, &address()).kind()
    }

    #[test]
    fn test_read_errors() {
        assert_eq!(kind_of(io::ErrorKind::TimedOut, Operation::Read), ErrorKind::ReadTimeout);
        assert_eq!(kind_of(io::ErrorKind::WouldBlock, Operation::Read), ErrorKind::ReadTimeout);
        assert_eq!(kind_of(io::ErrorKind::ConnectionReset, Operation::Read), ErrorKind::ReadFailure);
        assert_eq!(kind_of(io::ErrorKind::UnexpectedEof, Operation::Read), ErrorKind::ReadFailure);
    }

    #[test]
    fn test_write_errors() {
        assert_eq!(kind_of(io::ErrorKind::BrokenPipe, Operation::Write), ErrorKind::WriteFailure);
        assert_eq!(kind_of(io::ErrorKind::TimedOut, Operation::Write), ErrorKind::WriteFailure);
    }

    #[test]
    fn test_open_errors() {
        assert_eq!(kind_of(io::ErrorKind::ConnectionRefused, Operation::Open), ErrorKind::OpenFailure);
        assert_eq!(kind_of(io::ErrorKind::TimedOut, Operation::Open), ErrorKind::OpenFailure);
    }

    #[test]
    fn test_interrupted_and_internal() {
        for operation in [Operation::Open, Operation::Read, Operation::Write] {
            assert_eq!(kind_of(io::ErrorKind::Interrupted, operation), ErrorKind::Interrupted);
            assert_eq!(kind_of(io::ErrorKind::Other, operation), ErrorKind::UnexpectedInternal);
            assert_eq!(kind_of(io::ErrorKind::Unsupported, operation), ErrorKind::UnexpectedInternal);
        }
    }

    #[test]
    fn test_domain_errors_pass_through() {
        let wrapped = ConnectionError::ProtocolFraming("bad section".into()).into_io();
        let err = translate(wrapped, Operation::Read, &address());
        assert_eq!(err.kind(), ErrorKind::ProtocolFraming);
        assert_eq!(err.to_string(), "protocol error: bad section");

        let wrapped = ConnectionError::closed(&address(), "stream closed").into_io();
        assert_eq!(
            translate(wrapped, Operation::Write, &address()).kind(),
            ErrorKind::ClosedConnection
        );
    }

    #[test]
    fn test_body_read_eof_is_framing() {
        let err = translate_body_read(
            io::Error::new(io::ErrorKind::UnexpectedEof, "eof"),
            &address(),
        );
        assert_eq!(err.kind(), ErrorKind::ProtocolFraming);

        let err = translate_body_read(
            io::Error::new(io::ErrorKind::TimedOut, "slow"),
            &address(),
        );
        assert_eq!(err.kind(), ErrorKind::ReadTimeout);
    }
}
