//! Property-Based Tests for Slot Hashing and the Value Codec
//!
//! # Test Properties
//!
//! 1. **Slot Range**: every key hashes into `0..16384`
//! 2. **Hash Tags**: keys sharing a non-empty `{tag}` share a slot
//! 3. **Codec Robustness**: decoding arbitrary bytes never panics
//! 4. **Roundtrip**: decode(encode(x)) == x on both sides of the compression threshold

#![cfg(test)]

use proptest::prelude::*;

use super::codec::EnvelopeCodec;
use super::compression::{CompressionAlgorithm, CompressionConfig};
use super::envelope::CacheEnvelope;
use crate::cluster::slot::crc16;
use crate::cluster::{hash_slot, SLOT_COUNT};
use crate::config::COMPRESSION_THRESHOLD;

// =============================================================================
// Strategies
// =============================================================================

/// Tags without braces, so the first `{...}` is the tag itself
fn tag_strategy() -> impl Strategy<Value = String> {
    "[a-z0-9:_-]{1,12}"
}

/// Payload lengths clustered around the compression threshold
fn threshold_payload_strategy() -> impl Strategy<Value = String> {
    let lo = COMPRESSION_THRESHOLD - 64;
    let hi = COMPRESSION_THRESHOLD + 64;
    (lo..hi).prop_flat_map(|len| prop::collection::vec(any::<char>(), len))
        .prop_map(|chars| chars.into_iter().collect())
}

fn algorithm_strategy() -> impl Strategy<Value = CompressionAlgorithm> {
    prop_oneof![
        Just(CompressionAlgorithm::Deflate),
        Just(CompressionAlgorithm::Lz4),
    ]
}

// =============================================================================
// Slot Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: Every key maps to a valid slot.
    #[test]
    fn prop_slot_in_range(key in prop::collection::vec(any::<u8>(), 0..256)) {
        prop_assert!(hash_slot(&key) < SLOT_COUNT);
    }

    /// Property: Only the tag decides the slot.
    #[test]
    fn prop_hash_tag_colocates(
        tag in tag_strategy(),
        a in "[a-z]{0,10}",
        b in "[a-z]{0,10}",
    ) {
        let left = format!("{}{{{}}}", a, tag);
        let right = format!("{{{}}}{}", tag, b);
        prop_assert_eq!(hash_slot(left.as_bytes()), hash_slot(tag.as_bytes()));
        prop_assert_eq!(hash_slot(right.as_bytes()), hash_slot(tag.as_bytes()));
    }

    /// Property: An empty tag hashes the whole key.
    #[test]
    fn prop_empty_tag_ignored(prefix in "[a-z]{0,10}", suffix in "[a-z]{0,10}") {
        let key = format!("{}{{}}{}", prefix, suffix);
        let expected = crc16(key.as_bytes()) % SLOT_COUNT;
        prop_assert_eq!(hash_slot(key.as_bytes()), expected);
    }
}

// =============================================================================
// Codec Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: Arbitrary stored bytes decode to a miss or a value, never a panic.
    #[test]
    fn prop_decode_never_panics(raw in prop::collection::vec(any::<u8>(), 0..2048)) {
        let codec = EnvelopeCodec::default();
        let _ = codec.decode::<serde_json::Value>(&raw);
        let _ = codec.decode::<String>(&raw);
    }

    /// Property: Encoding then decoding returns the same envelope.
    #[test]
    fn prop_roundtrip_near_threshold(
        payload in threshold_payload_strategy(),
        algorithm in algorithm_strategy(),
        load_time in 0i64..4_000_000_000_000,
        ttl in -1i64..100_000,
    ) {
        let codec = EnvelopeCodec::new(CompressionConfig {
            algorithm,
            ..Default::default()
        });
        let envelope = CacheEnvelope::loaded_at(payload, load_time, ttl);
        let bytes = codec.encode(&envelope)?;

        let json_len = serde_json::to_vec(&envelope)?.len();
        let expected_flag = if json_len > COMPRESSION_THRESHOLD { algorithm.flag() } else { 0 };
        prop_assert_eq!(bytes[0], expected_flag);
        prop_assert_eq!(codec.decode::<String>(&bytes), Some(envelope));
    }
}
