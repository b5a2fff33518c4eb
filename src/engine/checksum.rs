//! CRC32 checksums for redo-log frames
//!
//! Every frame appended to the log carries a checksum over its length
//! prefix and body. A mismatch on replay aborts the open: a store that
//! cannot prove its log intact must not come up.

use crc32fast::Hasher;

/// Computes a CRC32 (IEEE) checksum over the provided bytes.
pub fn compute_checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Verifies that `data` hashes to `expected`.
pub fn verify_checksum(data: &[u8], expected: u32) -> bool {
    compute_checksum(data) == expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_deterministic() {
        let data = b"indexing storage frame";
        assert_eq!(compute_checksum(data), compute_checksum(data));
    }

    #[test]
    fn checksum_detects_single_bit_flip() {
        let mut data = vec![0x10, 0x20, 0x30, 0x40];
        let original = compute_checksum(&data);
        data[1] ^= 0x01;
        assert_ne!(original, compute_checksum(&data));
    }

    #[test]
    fn verify_rejects_wrong_checksum() {
        let data = b"frame body";
        let checksum = compute_checksum(data);
        assert!(verify_checksum(data, checksum));
        assert!(!verify_checksum(data, checksum.wrapping_add(1)));
    }
}
