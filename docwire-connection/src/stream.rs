//! Transport capability.
//!
//! A connection depends only on the [`Stream`] trait, never on a concrete
//! socket. Every operation exists in a blocking and an async form; a
//! transport reports failures as `std::io::Error` and the connection
//! translates them.

use std::io;
use std::sync::Arc;

use docwire_core::ServerAddress;
use futures::future::BoxFuture;

use crate::buffer::ByteBuf;

/// A byte stream to one server.
///
/// A stream is shared between the connection and whoever calls
/// [`close`](Stream::close), so every method takes `&self`.
pub trait Stream: Send + Sync {
    /// The server this stream talks to.
    fn address(&self) -> &ServerAddress;

    /// Connect the stream.
    fn open(&self) -> io::Result<()>;

    /// Connect the stream without blocking.
    fn open_async(&self) -> BoxFuture<'_, io::Result<()>>;

    /// Write all of `data`.
    fn write(&self, data: &[u8]) -> io::Result<()>;

    /// Write all of `data` without blocking.
    fn write_async<'a>(&'a self, data: &'a [u8]) -> BoxFuture<'a, io::Result<()>>;

    /// Read `len` bytes.
    ///
    /// A stream that reaches end-of-input early returns either an
    /// `UnexpectedEof` error or a buffer shorter than `len`.
    fn read(&self, len: usize) -> io::Result<ByteBuf>;

    /// Read `len` bytes without blocking.
    fn read_async(&self, len: usize) -> BoxFuture<'_, io::Result<ByteBuf>>;

    /// An empty buffer with room for `size` bytes.
    fn get_buffer(&self, size: usize) -> ByteBuf {
        ByteBuf::with_capacity(size)
    }

    /// Close the stream. Closing twice must be harmless.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Creates the stream for a connection.
pub trait StreamFactory: Send + Sync {
    fn create(&self, address: &ServerAddress) -> io::Result<Arc<dyn Stream>>;
}

impl<F> StreamFactory for F
where
    F: Fn(&ServerAddress) -> io::Result<Arc<dyn Stream>> + Send + Sync,
{
    fn create(&self, address: &ServerAddress) -> io::Result<Arc<dyn Stream>> {
        self(address)
    }
}
