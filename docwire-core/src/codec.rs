//! Compressor trait and implementations.
//!
//! This module provides the [`Compressor`] trait for wire-message compression
//! and implementations for the algorithms a server can negotiate:
//! - [`NoopCompressor`]: Passes bytes through (always available)
//! - [`SnappyCompressor`]: Snappy raw format (requires `compression-snappy` feature)
//! - [`ZlibCompressor`]: Zlib format via flate2 (requires `compression-zlib` feature)
//! - [`ZstdCompressor`]: Zstandard (requires `compression-zstd` feature)

use bytes::{Bytes, BytesMut};
use std::io;
use std::sync::Arc;

#[cfg(any(feature = "compression-zlib", feature = "compression-zstd"))]
use bytes::BufMut;
#[cfg(any(feature = "compression-zlib", feature = "compression-zstd"))]
use std::io::{Read, Write};

/// Wire identifiers carried in the compressed header.
pub mod compressor_ids {
    pub const NOOP: u8 = 0;
    pub const SNAPPY: u8 = 1;
    pub const ZLIB: u8 = 2;
    pub const ZSTD: u8 = 3;
}

/// Compressor trait for whole-message compression.
///
/// A compressor is selected once per connection during the handshake and
/// then applied to every outbound command that is allowed to be compressed.
/// Inbound messages name their compressor by wire id.
///
/// # Example
///
/// ```ignore
/// use docwire_core::Compressor;
/// use bytes::{Bytes, BytesMut};
/// use std::io;
///
/// struct Lz4Compressor;
///
/// impl Compressor for Lz4Compressor {
///     fn id(&self) -> u8 { 42 }
///     fn name(&self) -> &'static str { "lz4" }
///
///     fn compress(&self, data: &[u8]) -> io::Result<Bytes> {
///         // ... lz4 compression
///     }
///
///     fn uncompress(&self, data: &[u8], expected_len: usize, dst: &mut BytesMut) -> io::Result<()> {
///         // ... lz4 decompression
///     }
/// }
/// ```
pub trait Compressor: Send + Sync + 'static {
    /// The wire identifier written into the compressed header.
    fn id(&self) -> u8;

    /// The name exchanged during the handshake (e.g., "snappy", "zlib").
    fn name(&self) -> &'static str;

    /// Compress data.
    fn compress(&self, data: &[u8]) -> io::Result<Bytes>;

    /// Decompress `data`, appending exactly `expected_len` bytes to `dst`.
    ///
    /// Output that would be longer or shorter than `expected_len` is an
    /// `InvalidData` error, and no more than `expected_len + 1` bytes are
    /// ever produced.
    fn uncompress(&self, data: &[u8], expected_len: usize, dst: &mut BytesMut) -> io::Result<()>;
}

/// A boxed compressor for type-erased storage.
///
/// Use `Option<BoxedCompressor>` where `None` means messages go out verbatim.
#[derive(Clone)]
pub struct BoxedCompressor(Arc<dyn Compressor>);

impl BoxedCompressor {
    /// Create a new boxed compressor.
    pub fn new<C: Compressor>(compressor: C) -> Self {
        BoxedCompressor(Arc::new(compressor))
    }

    /// Get the wire identifier.
    pub fn id(&self) -> u8 {
        self.0.id()
    }

    /// Get the handshake name.
    pub fn name(&self) -> &'static str {
        self.0.name()
    }

    /// Compress data.
    pub fn compress(&self, data: &[u8]) -> io::Result<Bytes> {
        self.0.compress(data)
    }

    /// Decompress data into `dst`, expecting exactly `expected_len` bytes.
    pub fn uncompress(
        &self,
        data: &[u8],
        expected_len: usize,
        dst: &mut BytesMut,
    ) -> io::Result<()> {
        self.0.uncompress(data, expected_len, dst)
    }
}

impl std::fmt::Debug for BoxedCompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("BoxedCompressor")
            .field(&self.name())
            .field(&self.id())
            .finish()
    }
}

/// Noop compressor.
///
/// This compressor passes data through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCompressor;

impl Compressor for NoopCompressor {
    fn id(&self) -> u8 {
        compressor_ids::NOOP
    }

    fn name(&self) -> &'static str {
        "noop"
    }

    fn compress(&self, data: &[u8]) -> io::Result<Bytes> {
        Ok(Bytes::copy_from_slice(data))
    }

    fn uncompress(&self, data: &[u8], expected_len: usize, dst: &mut BytesMut) -> io::Result<()> {
        check_length(data.len(), expected_len)?;
        dst.extend_from_slice(data);
        Ok(())
    }
}

/// Snappy compressor (raw block format).
///
/// Requires the `compression-snappy` feature.
#[cfg(feature = "compression-snappy")]
#[derive(Debug, Clone, Copy, Default)]
pub struct SnappyCompressor;

#[cfg(feature = "compression-snappy")]
impl Compressor for SnappyCompressor {
    fn id(&self) -> u8 {
        compressor_ids::SNAPPY
    }

    fn name(&self) -> &'static str {
        "snappy"
    }

    fn compress(&self, data: &[u8]) -> io::Result<Bytes> {
        let compressed = snap::raw::Encoder::new()
            .compress_vec(data)
            .map_err(io::Error::other)?;
        Ok(Bytes::from(compressed))
    }

    fn uncompress(&self, data: &[u8], expected_len: usize, dst: &mut BytesMut) -> io::Result<()> {
        let len = snap::raw::decompress_len(data).map_err(io::Error::other)?;
        check_length(len, expected_len)?;
        let start = dst.len();
        dst.resize(start + len, 0);
        let written = snap::raw::Decoder::new()
            .decompress(data, &mut dst[start..])
            .map_err(|e| {
                dst.truncate(start);
                io::Error::other(e)
            })?;
        dst.truncate(start + written);
        check_length(written, expected_len)
    }
}

/// Zlib compressor using flate2.
///
/// Requires the `compression-zlib` feature.
#[cfg(feature = "compression-zlib")]
#[derive(Debug, Clone, Copy)]
pub struct ZlibCompressor {
    /// Compression level (0-9). Default is 6.
    pub level: u32,
}

#[cfg(feature = "compression-zlib")]
impl Default for ZlibCompressor {
    fn default() -> Self {
        Self { level: 6 }
    }
}

#[cfg(feature = "compression-zlib")]
impl ZlibCompressor {
    /// Create a new ZlibCompressor with the specified compression level.
    ///
    /// Level ranges from 0 (no compression) to 9 (best compression).
    pub fn with_level(level: u32) -> Self {
        Self {
            level: level.min(9),
        }
    }
}

#[cfg(feature = "compression-zlib")]
impl Compressor for ZlibCompressor {
    fn id(&self) -> u8 {
        compressor_ids::ZLIB
    }

    fn name(&self) -> &'static str {
        "zlib"
    }

    fn compress(&self, data: &[u8]) -> io::Result<Bytes> {
        use flate2::write::ZlibEncoder;
        let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::new(self.level));
        encoder.write_all(data)?;
        Ok(Bytes::from(encoder.finish()?))
    }

    fn uncompress(&self, data: &[u8], expected_len: usize, dst: &mut BytesMut) -> io::Result<()> {
        read_bounded(flate2::read::ZlibDecoder::new(data), expected_len, dst)
    }
}

/// Zstd compressor.
///
/// Requires the `compression-zstd` feature.
#[cfg(feature = "compression-zstd")]
#[derive(Debug, Clone, Copy)]
pub struct ZstdCompressor {
    /// Compression level (1-22). Default is 3.
    pub level: i32,
}

#[cfg(feature = "compression-zstd")]
impl Default for ZstdCompressor {
    fn default() -> Self {
        Self { level: 3 }
    }
}

#[cfg(feature = "compression-zstd")]
impl ZstdCompressor {
    /// Create a new ZstdCompressor with the specified compression level.
    ///
    /// Level ranges from 1 (fastest) to 22 (best compression).
    pub fn with_level(level: i32) -> Self {
        Self {
            level: level.clamp(1, 22),
        }
    }
}

#[cfg(feature = "compression-zstd")]
impl Compressor for ZstdCompressor {
    fn id(&self) -> u8 {
        compressor_ids::ZSTD
    }

    fn name(&self) -> &'static str {
        "zstd"
    }

    fn compress(&self, data: &[u8]) -> io::Result<Bytes> {
        let compressed = zstd::bulk::compress(data, self.level).map_err(io::Error::other)?;
        Ok(Bytes::from(compressed))
    }

    fn uncompress(&self, data: &[u8], expected_len: usize, dst: &mut BytesMut) -> io::Result<()> {
        read_bounded(zstd::Decoder::new(data)?, expected_len, dst)
    }
}

fn check_length(actual: usize, expected: usize) -> io::Result<()> {
    if actual != expected {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("decompressed length {actual} does not match the declared {expected}"),
        ));
    }
    Ok(())
}

/// Stream `reader` into `dst`, stopping one byte past `expected_len`.
#[cfg(any(feature = "compression-zlib", feature = "compression-zstd"))]
fn read_bounded<R: Read>(reader: R, expected_len: usize, dst: &mut BytesMut) -> io::Result<()> {
    let start = dst.len();
    dst.reserve(expected_len);
    let mut limited = reader.take(expected_len as u64 + 1);
    let result = io::copy(&mut limited, &mut (&mut *dst).writer());
    let written = dst.len() - start;
    if let Err(e) = result.and_then(|_| check_length(written, expected_len)) {
        dst.truncate(start);
        return Err(e);
    }
    Ok(())
}
