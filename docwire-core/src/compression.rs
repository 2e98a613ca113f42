//! Compression configuration and negotiation.
//!
//! This module provides configuration types for wire compression:
//! - [`CompressorKind`]: Supported compression algorithms
//! - [`CompressionLevel`]: Compression quality settings
//! - [`CompressorSpec`]: One locally configured compressor
//! - [`CompressorRegistry`]: Id lookup and send-compressor negotiation

use std::collections::HashMap;

use crate::codec::{BoxedCompressor, NoopCompressor, compressor_ids};
use crate::error::ConnectionError;

#[cfg(feature = "compression-snappy")]
use crate::codec::SnappyCompressor;

#[cfg(feature = "compression-zlib")]
use crate::codec::ZlibCompressor;

#[cfg(feature = "compression-zstd")]
use crate::codec::ZstdCompressor;

/// Supported compression algorithms.
///
/// This enum is used for configuration and handshake negotiation.
/// Use [`CompressorSpec::create()`] to get the actual compressor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressorKind {
    Noop,
    #[cfg(feature = "compression-snappy")]
    Snappy,
    #[cfg(feature = "compression-zlib")]
    Zlib,
    #[cfg(feature = "compression-zstd")]
    Zstd,
}

impl CompressorKind {
    /// Parse a handshake compressor name.
    /// Returns None for names without a local implementation.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "noop" => Some(Self::Noop),
            #[cfg(feature = "compression-snappy")]
            "snappy" => Some(Self::Snappy),
            #[cfg(feature = "compression-zlib")]
            "zlib" => Some(Self::Zlib),
            #[cfg(feature = "compression-zstd")]
            "zstd" => Some(Self::Zstd),
            _ => None,
        }
    }

    /// Get the handshake name for this algorithm.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Noop => "noop",
            #[cfg(feature = "compression-snappy")]
            Self::Snappy => "snappy",
            #[cfg(feature = "compression-zlib")]
            Self::Zlib => "zlib",
            #[cfg(feature = "compression-zstd")]
            Self::Zstd => "zstd",
        }
    }

    /// Get the wire identifier for this algorithm.
    pub fn id(&self) -> u8 {
        match self {
            Self::Noop => compressor_ids::NOOP,
            #[cfg(feature = "compression-snappy")]
            Self::Snappy => compressor_ids::SNAPPY,
            #[cfg(feature = "compression-zlib")]
            Self::Zlib => compressor_ids::ZLIB,
            #[cfg(feature = "compression-zstd")]
            Self::Zstd => compressor_ids::ZSTD,
        }
    }
}

/// Compression level configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionLevel {
    /// Fastest compression (lowest ratio).
    Fastest,
    /// Best compression (highest ratio, slowest).
    Best,
    /// Default compression level for each algorithm.
    #[default]
    Default,
    /// Precise compression level (algorithm-specific value).
    Precise(u32),
}

impl CompressionLevel {
    /// Create a compression level with a precise value.
    ///
    /// The value interpretation is algorithm-specific:
    /// - zlib: 0-9 (0=no compression, 9=best)
    /// - zstd: 1-22 (1=fastest, 22=best)
    ///
    /// Snappy has no levels and ignores the value.
    pub fn precise(level: u32) -> Self {
        CompressionLevel::Precise(level)
    }
}

/// Convert CompressionLevel to a flate2 zlib level (0-9).
#[cfg(feature = "compression-zlib")]
fn level_to_zlib(level: CompressionLevel) -> u32 {
    match level {
        CompressionLevel::Fastest => 1,
        CompressionLevel::Best => 9,
        CompressionLevel::Default => 6,
        CompressionLevel::Precise(n) => n.clamp(0, 9),
    }
}

/// Convert CompressionLevel to zstd level (1-22).
#[cfg(feature = "compression-zstd")]
fn level_to_zstd(level: CompressionLevel) -> i32 {
    match level {
        CompressionLevel::Fastest => 1,
        CompressionLevel::Best => 22,
        CompressionLevel::Default => 3,
        CompressionLevel::Precise(n) => (n.min(22) as i32).clamp(1, 22),
    }
}

/// A locally configured compressor: algorithm plus level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressorSpec {
    pub kind: CompressorKind,
    pub level: CompressionLevel,
}

impl CompressorSpec {
    /// Create a spec with the default level.
    pub fn new(kind: CompressorKind) -> Self {
        Self {
            kind,
            level: CompressionLevel::Default,
        }
    }

    /// Create a spec from a handshake name.
    ///
    /// # Errors
    /// Returns `UnsupportedCompressor` for names without a local implementation.
    pub fn from_name(name: &str) -> Result<Self, ConnectionError> {
        CompressorKind::from_name(name)
            .map(Self::new)
            .ok_or_else(|| ConnectionError::UnsupportedCompressor(name.to_owned()))
    }

    /// Set the compression level.
    pub fn level(mut self, level: CompressionLevel) -> Self {
        self.level = level;
        self
    }

    /// Get the handshake name.
    pub fn name(&self) -> &'static str {
        self.kind.as_str()
    }

    /// Build the compressor.
    #[allow(unused_variables)]
    pub fn create(&self) -> BoxedCompressor {
        let level = self.level;
        match self.kind {
            CompressorKind::Noop => BoxedCompressor::new(NoopCompressor),
            #[cfg(feature = "compression-snappy")]
            CompressorKind::Snappy => BoxedCompressor::new(SnappyCompressor),
            #[cfg(feature = "compression-zlib")]
            CompressorKind::Zlib => {
                BoxedCompressor::new(ZlibCompressor::with_level(level_to_zlib(level)))
            }
            #[cfg(feature = "compression-zstd")]
            CompressorKind::Zstd => {
                BoxedCompressor::new(ZstdCompressor::with_level(level_to_zstd(level)))
            }
        }
    }
}

/// The compressors a connection was built with.
///
/// Fixed at construction: an ordered list for negotiation and an id map for
/// decoding inbound compressed messages.
#[derive(Debug, Clone, Default)]
pub struct CompressorRegistry {
    ordered: Vec<BoxedCompressor>,
    by_id: HashMap<u8, BoxedCompressor>,
}

impl CompressorRegistry {
    /// Build the registry from configured specs, preserving their order.
    ///
    /// A later spec with the same wire id replaces the earlier one in the id map.
    pub fn new(specs: &[CompressorSpec]) -> Self {
        let ordered: Vec<BoxedCompressor> = specs.iter().map(CompressorSpec::create).collect();
        let by_id = ordered
            .iter()
            .map(|compressor| (compressor.id(), compressor.clone()))
            .collect();
        Self { ordered, by_id }
    }

    /// Look up a compressor by wire id.
    pub fn get(&self, id: u8) -> Option<&BoxedCompressor> {
        self.by_id.get(&id)
    }

    /// Look up a compressor by wire id, failing with `UnsupportedCompressor`.
    pub fn require(&self, id: u8) -> Result<&BoxedCompressor, ConnectionError> {
        self.get(id).ok_or_else(|| {
            ConnectionError::UnsupportedCompressor(format!(
                "unsupported compressor with identifier {id}"
            ))
        })
    }

    /// Handshake names, in configuration order.
    pub fn names(&self) -> Vec<&'static str> {
        self.ordered.iter().map(BoxedCompressor::name).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    /// Pick the send compressor from the server's advertised names.
    ///
    /// Advertised names are walked in server order and the first one with a
    /// local compressor wins. No advertised names means no compression.
    ///
    /// # Errors
    /// Returns `UnsupportedCompressor` when the server advertises names and
    /// none of them has a local compressor.
    pub fn negotiate(
        &self,
        advertised: &[String],
    ) -> Result<Option<BoxedCompressor>, ConnectionError> {
        if advertised.is_empty() {
            return Ok(None);
        }

        for name in advertised {
            if let Some(compressor) = self.ordered.iter().find(|c| c.name() == name.as_str()) {
                return Ok(Some(compressor.clone()));
            }
        }

        Err(ConnectionError::UnsupportedCompressor(format!(
            "unexpected compressor negotiated: {}",
            advertised.join(", ")
        )))
    }
}
