//! On-wire value format
//!
//! ```text
//! ┌──────┬──────────────────────────────────────┐
//! │ flag │ envelope JSON (compressed if flag≠0) │
//! └──────┴──────────────────────────────────────┘
//!   0x00 raw, 0x01 deflate, 0x02 lz4
//! ```
//!
//! Serialized envelopes above the compression threshold are compressed.
//! Decoding never fails loudly: the store may hold values written by an
//! older payload schema, so anything unreadable is a miss.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::compression::{CompressionAlgorithm, CompressionConfig, CompressionManager};
use super::envelope::CacheEnvelope;
use crate::error::{Error, Result};

/// Encodes and decodes [`CacheEnvelope`]s
#[derive(Default)]
pub struct EnvelopeCodec {
    compression: CompressionManager,
}

impl EnvelopeCodec {
    pub fn new(config: CompressionConfig) -> Self {
        Self {
            compression: CompressionManager::with_config(config),
        }
    }

    pub fn encode<T: Serialize>(&self, envelope: &CacheEnvelope<T>) -> Result<Bytes> {
        let json = serde_json::to_vec(envelope)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        if json.is_empty() {
            return Err(Error::Serialization("envelope serialized to nothing".into()));
        }

        let (body, algorithm) = self.compression.compress(&json);
        let mut out = BytesMut::with_capacity(body.len() + 1);
        out.put_u8(algorithm.flag());
        out.put_slice(&body);
        Ok(out.freeze())
    }

    /// Decode, reporting why a value is unreadable
    pub fn try_decode<T: DeserializeOwned>(&self, raw: &[u8]) -> Result<CacheEnvelope<T>> {
        let (&flag, body) = raw
            .split_first()
            .ok_or_else(|| Error::Serialization("empty value".into()))?;
        let algorithm = CompressionAlgorithm::from_flag(flag)
            .ok_or_else(|| Error::Serialization(format!("unknown flag byte {:#04x}", flag)))?;
        let json = match algorithm {
            CompressionAlgorithm::None => Bytes::copy_from_slice(body),
            other => self.compression.decompress(body, other)?,
        };
        serde_json::from_slice(&json).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Decode, treating any failure as a miss
    pub fn decode<T: DeserializeOwned>(&self, raw: &[u8]) -> Option<CacheEnvelope<T>> {
        match self.try_decode(raw) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                debug!("Discarding unreadable cached value ({} bytes): {}", raw.len(), e);
                None
            }
        }
    }
}
