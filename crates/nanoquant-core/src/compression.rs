//! Payload codecs applied to serialized tensor encodings.

use serde::{Deserialize, Serialize};

use crate::error::{NanoquantError, Result};

/// Trait for byte-level compression codecs.
pub trait Compressor: Send + Sync {
    /// Compress data.
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress data.
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress and check the output length against the recorded size.
    fn decompress_exact(&self, data: &[u8], output_size: usize) -> Result<Vec<u8>> {
        let decompressed = self.decompress(data)?;
        if decompressed.len() != output_size {
            return Err(NanoquantError::Decompression(format!(
                "Expected {} bytes, got {}",
                output_size,
                decompressed.len()
            )));
        }
        Ok(decompressed)
    }
}

/// Codec recorded in an artifact header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    /// Zstd, the default
    #[default]
    Zstd,
    /// LZ4 for fast unpacking
    Lz4,
}

impl CodecKind {
    /// Build the codec. `level` only applies to zstd.
    #[must_use]
    pub fn compressor(self, level: i32) -> Box<dyn Compressor> {
        match self {
            Self::Zstd => Box::new(ZstdCompressor::with_level(level)),
            Self::Lz4 => Box::new(Lz4Compressor::new()),
        }
    }

    /// Lowercase codec name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Zstd => "zstd",
            Self::Lz4 => "lz4",
        }
    }
}

/// Zstd compressor with configurable level.
pub struct ZstdCompressor {
    level: i32,
}

impl ZstdCompressor {
    /// Create a new Zstd compressor with default level (3).
    #[must_use]
    pub fn new() -> Self {
        Self::with_level(3)
    }

    /// Create a new Zstd compressor with specified level (-7 to 22).
    #[must_use]
    pub fn with_level(level: i32) -> Self {
        Self { level }
    }
}

impl Default for ZstdCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Compressor for ZstdCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        zstd::encode_all(data, self.level)
            .map_err(|e| NanoquantError::Compression(e.to_string()))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        zstd::decode_all(data).map_err(|e| NanoquantError::Decompression(e.to_string()))
    }
}

/// LZ4 compressor for maximum speed.
pub struct Lz4Compressor;

impl Lz4Compressor {
    /// Create a new LZ4 compressor.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Default for Lz4Compressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Compressor for Lz4Compressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(lz4_flex::compress_prepend_size(data))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4_flex::decompress_size_prepended(data)
            .map_err(|e| NanoquantError::Decompression(e.to_string()))
    }
}
