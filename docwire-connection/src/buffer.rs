//! Receive buffers.
//!
//! A transport hands out [`ByteBuf`]s from `read` and `get_buffer`. A buffer
//! may carry a release hook (for example, returning the memory to a pool)
//! which runs exactly once, when the buffer is dropped.

use std::fmt;
use std::ops::{Deref, DerefMut};

use bytes::BytesMut;
use docwire_core::ReplyHeader;

type ReleaseHook = Box<dyn FnOnce(BytesMut) + Send>;

/// An owned byte buffer with an optional release hook.
pub struct ByteBuf {
    data: BytesMut,
    release: Option<ReleaseHook>,
}

impl ByteBuf {
    pub fn new(data: BytesMut) -> Self {
        Self {
            data,
            release: None,
        }
    }

    /// An empty buffer that can grow to `capacity` without reallocating.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(BytesMut::with_capacity(capacity))
    }

    /// A buffer whose storage is handed to `release` when it is dropped.
    pub fn with_release<F>(data: BytesMut, release: F) -> Self
    where
        F: FnOnce(BytesMut) + Send + 'static,
    {
        Self {
            data,
            release: Some(Box::new(release)),
        }
    }

    /// Mutable access to the underlying storage, for writers that append.
    pub fn bytes_mut(&mut self) -> &mut BytesMut {
        &mut self.data
    }
}

impl From<&[u8]> for ByteBuf {
    fn from(data: &[u8]) -> Self {
        Self::new(BytesMut::from(data))
    }
}

impl Deref for ByteBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for ByteBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for ByteBuf {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release(std::mem::take(&mut self.data));
        }
    }
}

impl fmt::Debug for ByteBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteBuf")
            .field("len", &self.data.len())
            .field("pooled", &self.release.is_some())
            .finish()
    }
}

/// A received reply: its logical header and its body.
///
/// For a compressed reply the header describes the message before
/// compression and the body holds the decompressed bytes. The body buffer is
/// released when this value is dropped.
#[derive(Debug)]
pub struct ResponseBuffers {
    header: ReplyHeader,
    body: ByteBuf,
}

impl ResponseBuffers {
    pub fn new(header: ReplyHeader, body: ByteBuf) -> Self {
        Self { header, body }
    }

    pub fn header(&self) -> &ReplyHeader {
        &self.header
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Take the body buffer, consuming the response.
    pub fn into_body(self) -> ByteBuf {
        self.body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_release_runs_once_on_drop() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let buf = ByteBuf::with_release(BytesMut::from(&b"abc"[..]), move |data| {
            assert_eq!(&data[..], b"abc");
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(&buf[..], b"abc");
        assert_eq!(released.load(Ordering::SeqCst), 0);
        drop(buf);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_response_buffers_release_body() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let body = ByteBuf::with_release(BytesMut::from(&b"body"[..]), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let header = docwire_core::MessageHeader::new(20, 1, 0, docwire_core::OpCode::OP_MSG);
        let response = ResponseBuffers::new(header.into(), body);
        assert_eq!(response.body(), b"body");
        assert_eq!(response.header().response_to, 0);

        let body = response.into_body();
        assert_eq!(released.load(Ordering::SeqCst), 0);
        drop(body);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_bytes_mut_appends() {
        let mut buf = ByteBuf::with_capacity(8);
        assert!(buf.is_empty());
        buf.bytes_mut().extend_from_slice(b"1234");
        assert_eq!(buf.len(), 4);
        assert!(format!("{buf:?}").contains("len: 4"));
    }
}
