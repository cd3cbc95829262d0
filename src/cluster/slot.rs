//! Key to slot hashing.
//!
//! The keyspace is split into [`SLOT_COUNT`] slots. A key's slot is the
//! CRC16/XMODEM checksum of the key modulo the slot count. When the key
//! contains a non-empty `{...}` section only that section is hashed, so
//! related keys can be pinned to one slot.

use bytes::Bytes;

use crate::error::{Error, Result};

/// Number of hash slots in the cluster keyspace
pub const SLOT_COUNT: u16 = 16384;

const CRC16_TABLE: [u16; 256] = build_table();

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// CRC16 (XMODEM: poly 0x1021, init 0, no reflection)
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, &b| {
        (crc << 8) ^ CRC16_TABLE[(((crc >> 8) as u8) ^ b) as usize]
    })
}

/// Part of the key that participates in hashing
fn hash_tag(key: &[u8]) -> &[u8] {
    if let Some(open) = key.iter().position(|&b| b == b'{') {
        let rest = &key[open + 1..];
        if let Some(len) = rest.iter().position(|&b| b == b'}') {
            if len > 0 {
                return &rest[..len];
            }
        }
    }
    key
}

/// Slot owning `key`
pub fn hash_slot(key: &[u8]) -> u16 {
    crc16(hash_tag(key)) % SLOT_COUNT
}

/// Common slot of a multi-key command.
///
/// Returns [`Error::NoDispatchKey`] for an empty key list and
/// [`Error::CrossSlot`] if any two keys hash differently.
pub fn common_slot(keys: &[Bytes]) -> Result<u16> {
    let mut iter = keys.iter();
    let first = iter.next().ok_or(Error::NoDispatchKey)?;
    let slot = hash_slot(first);
    if iter.any(|k| hash_slot(k) != slot) {
        return Err(Error::CrossSlot);
    }
    Ok(slot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_crc16_check_value() {
        assert_eq!(crc16(b"123456789"), 0x31C3);
        assert_eq!(crc16(b""), 0);
    }

    #[test]
    fn test_known_slots() {
        assert_eq!(hash_slot(b"foo"), 12182);
        assert!(hash_slot(b"anything at all") < SLOT_COUNT);
    }

    #[test]
    fn test_hash_tags() {
        assert_eq!(
            hash_slot(b"{user1000}.following"),
            hash_slot(b"{user1000}.followers")
        );
        assert_eq!(hash_slot(b"{user1000}.following"), hash_slot(b"user1000"));
        // empty tag hashes the whole key
        assert_eq!(hash_slot(b"foo{}{bar}"), crc16(b"foo{}{bar}") % SLOT_COUNT);
        // only the first tag counts
        assert_eq!(hash_slot(b"foo{{bar}}zap"), hash_slot(b"{bar"));
        // unterminated tag hashes the whole key
        assert_eq!(hash_slot(b"foo{bar"), crc16(b"foo{bar") % SLOT_COUNT);
    }

    #[test]
    fn test_common_slot() {
        let same = vec![Bytes::from_static(b"{a}1"), Bytes::from_static(b"{a}2")];
        assert_eq!(common_slot(&same).unwrap(), hash_slot(b"a"));

        let mixed = vec![Bytes::from_static(b"foo"), Bytes::from_static(b"bar")];
        assert_matches!(common_slot(&mixed), Err(Error::CrossSlot));
        assert_matches!(common_slot(&[]), Err(Error::NoDispatchKey));
    }
}
