//! Stored-value compression
//!
//! Values whose serialized form exceeds the threshold are compressed before
//! they hit the wire. Deflate (zlib framing) is the default; LZ4 is available
//! for deployments that prefer speed over ratio. A failed compression falls
//! back to storing the raw bytes.
//!
//! # Example
//!
//! ```
//! use slotcache::cache::compression::{CompressionAlgorithm, CompressionManager};
//!
//! let manager = CompressionManager::new();
//!
//! let data = vec![b'x'; 4096];
//! let (compressed, algorithm) = manager.compress(&data);
//! assert_eq!(algorithm, CompressionAlgorithm::Deflate);
//!
//! let decompressed = manager.decompress(&compressed, algorithm).unwrap();
//! assert_eq!(decompressed.as_ref(), &data[..]);
//! ```

use std::io::{Read, Write};

use bytes::Bytes;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const LZ4_MAX_RATIO: usize = 255;

// =============================================================================
// Compression Algorithm
// =============================================================================

/// Supported compression algorithms.
///
/// The discriminant doubles as the leading flag byte of an encoded value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// No compression
    None,
    /// Deflate with zlib framing
    #[default]
    Deflate,
    /// LZ4 block format with size prefix
    Lz4,
}

impl CompressionAlgorithm {
    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Deflate => "deflate",
            CompressionAlgorithm::Lz4 => "lz4",
        }
    }

    /// Leading byte written in front of the payload
    pub fn flag(&self) -> u8 {
        match self {
            CompressionAlgorithm::None => 0x00,
            CompressionAlgorithm::Deflate => 0x01,
            CompressionAlgorithm::Lz4 => 0x02,
        }
    }

    pub fn from_flag(flag: u8) -> Option<Self> {
        match flag {
            0x00 => Some(CompressionAlgorithm::None),
            0x01 => Some(CompressionAlgorithm::Deflate),
            0x02 => Some(CompressionAlgorithm::Lz4),
            _ => None,
        }
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for CompressionAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(CompressionAlgorithm::None),
            "deflate" | "zlib" => Ok(CompressionAlgorithm::Deflate),
            "lz4" => Ok(CompressionAlgorithm::Lz4),
            other => Err(Error::Config(format!("unknown compression algorithm '{}'", other))),
        }
    }
}

// =============================================================================
// Compression Configuration
// =============================================================================

/// Configuration for compression
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    /// Algorithm applied to values above the threshold
    pub algorithm: CompressionAlgorithm,
    /// Values at or below this many bytes are stored raw
    pub threshold_bytes: usize,
    /// Compression level (algorithm-specific)
    pub level: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: CompressionAlgorithm::Deflate,
            threshold_bytes: 1024,
            level: 6,
        }
    }
}

// =============================================================================
// Compressor Trait
// =============================================================================

/// Trait for compression implementations
pub trait Compressor: Send + Sync {
    fn algorithm(&self) -> CompressionAlgorithm;

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Pass-through compressor
pub struct NoopCompressor;

impl Compressor for NoopCompressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::None
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

// =============================================================================
// Deflate Compressor
// =============================================================================

/// Deflate compressor (zlib stream, interoperable with java.util.zip)
pub struct DeflateCompressor {
    level: Compression,
}

impl DeflateCompressor {
    pub fn new() -> Self {
        Self {
            level: Compression::default(),
        }
    }

    pub fn with_level(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
        }
    }
}

impl Default for DeflateCompressor {
    fn default() -> Self {
        Self::new()
    }
}

fn deflate_error(e: std::io::Error) -> Error {
    Error::CompressionFailed {
        algorithm: "deflate".into(),
        reason: e.to_string(),
    }
}

impl Compressor for DeflateCompressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Deflate
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), self.level);
        encoder.write_all(data).map_err(deflate_error)?;
        encoder.finish().map_err(deflate_error)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = ZlibDecoder::new(data);
        let mut out = Vec::with_capacity(data.len() * 2);
        decoder
            .read_to_end(&mut out)
            .map_err(|e| Error::DecompressionFailed {
                algorithm: "deflate".into(),
                reason: e.to_string(),
            })?;
        Ok(out)
    }
}

// =============================================================================
// LZ4 Compressor
// =============================================================================

/// LZ4 compressor (fast compression)
pub struct Lz4Compressor {
    level: i32,
}

impl Lz4Compressor {
    pub fn new() -> Self {
        Self { level: 4 }
    }

    pub fn with_level(level: i32) -> Self {
        Self { level }
    }
}

impl Default for Lz4Compressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Compressor for Lz4Compressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Lz4
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::compress(
            data,
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(self.level)),
            true,
        )
        .map_err(|e| Error::CompressionFailed {
            algorithm: "lz4".into(),
            reason: e.to_string(),
        })
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        // The size prefix comes from the store; LZ4 never expands past 255:1
        let declared = data
            .get(..4)
            .map(|p| i32::from_le_bytes([p[0], p[1], p[2], p[3]]))
            .unwrap_or(-1);
        if declared < 0 || declared as usize > data.len().saturating_mul(LZ4_MAX_RATIO) {
            return Err(Error::DecompressionFailed {
                algorithm: "lz4".into(),
                reason: format!("implausible size prefix {}", declared),
            });
        }

        lz4::block::decompress(data, None).map_err(|e| Error::DecompressionFailed {
            algorithm: "lz4".into(),
            reason: e.to_string(),
        })
    }
}

// =============================================================================
// Compression Manager
// =============================================================================

/// Picks the compressor for a value and falls back to raw bytes on failure
pub struct CompressionManager {
    config: CompressionConfig,
    noop: NoopCompressor,
    deflate: DeflateCompressor,
    lz4: Lz4Compressor,
}

impl CompressionManager {
    pub fn new() -> Self {
        Self::with_config(CompressionConfig::default())
    }

    pub fn with_config(config: CompressionConfig) -> Self {
        Self {
            noop: NoopCompressor,
            deflate: DeflateCompressor::with_level(config.level),
            lz4: Lz4Compressor::with_level(config.level as i32),
            config,
        }
    }

    fn compressor(&self, algorithm: CompressionAlgorithm) -> &dyn Compressor {
        match algorithm {
            CompressionAlgorithm::None => &self.noop,
            CompressionAlgorithm::Deflate => &self.deflate,
            CompressionAlgorithm::Lz4 => &self.lz4,
        }
    }

    /// Compress data with the configured algorithm.
    ///
    /// Returns (data, algorithm_used). Data at or below the threshold is
    /// returned unchanged, as is data whose compression failed.
    pub fn compress(&self, data: &[u8]) -> (Bytes, CompressionAlgorithm) {
        if data.len() <= self.config.threshold_bytes
            || self.config.algorithm == CompressionAlgorithm::None
        {
            return (Bytes::copy_from_slice(data), CompressionAlgorithm::None);
        }

        match self.compressor(self.config.algorithm).compress(data) {
            Ok(compressed) => (Bytes::from(compressed), self.config.algorithm),
            Err(e) => {
                tracing::warn!("Compression failed, storing uncompressed: {}", e);
                (Bytes::copy_from_slice(data), CompressionAlgorithm::None)
            }
        }
    }

    pub fn decompress(&self, data: &[u8], algorithm: CompressionAlgorithm) -> Result<Bytes> {
        let decompressed = self.compressor(algorithm).decompress(data)?;
        Ok(Bytes::from(decompressed))
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }
}

impl Default for CompressionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn large_text() -> Vec<u8> {
        b"Hello, this is test data that should compress well. "
            .iter()
            .copied()
            .cycle()
            .take(4000)
            .collect()
    }

    #[test]
    fn test_deflate_roundtrip() {
        let compressor = DeflateCompressor::new();
        let data = large_text();
        let compressed = compressor.compress(&data).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(compressor.decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn test_lz4_roundtrip() {
        let compressor = Lz4Compressor::new();
        let data = large_text();
        let compressed = compressor.compress(&data).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(compressor.decompress(&compressed).unwrap(), data);
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let manager = CompressionManager::new();

        let at_threshold = vec![b'a'; 1024];
        let (result, algorithm) = manager.compress(&at_threshold);
        assert_eq!(algorithm, CompressionAlgorithm::None);
        assert_eq!(result.as_ref(), &at_threshold[..]);

        let above = vec![b'a'; 1025];
        let (_, algorithm) = manager.compress(&above);
        assert_eq!(algorithm, CompressionAlgorithm::Deflate);
    }

    #[test]
    fn test_lz4_manager() {
        let manager = CompressionManager::with_config(CompressionConfig {
            algorithm: CompressionAlgorithm::Lz4,
            ..Default::default()
        });
        let data = large_text();
        let (compressed, algorithm) = manager.compress(&data);
        assert_eq!(algorithm, CompressionAlgorithm::Lz4);
        assert_eq!(manager.decompress(&compressed, algorithm).unwrap().as_ref(), &data[..]);
    }

    #[test]
    fn test_corrupt_deflate_is_error() {
        let manager = CompressionManager::new();
        assert!(manager
            .decompress(b"definitely not zlib", CompressionAlgorithm::Deflate)
            .is_err());
    }

    #[test]
    fn test_flags() {
        for alg in [
            CompressionAlgorithm::None,
            CompressionAlgorithm::Deflate,
            CompressionAlgorithm::Lz4,
        ] {
            assert_eq!(CompressionAlgorithm::from_flag(alg.flag()), Some(alg));
        }
        assert_eq!(CompressionAlgorithm::from_flag(0x7f), None);
        assert_eq!("LZ4".parse::<CompressionAlgorithm>().unwrap(), CompressionAlgorithm::Lz4);
    }
}
