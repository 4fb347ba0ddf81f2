//! State Hashing
//!
//! SHA-256 digests over encoded world state. Peers exchange these to detect
//! desyncs, and replays compare them at checkpoints.

use sha2::{Sha256, Digest};

/// Hash output type (256 bits / 32 bytes)
pub type StateHash = [u8; 32];

/// Domain separator for whole-world encodings.
pub const WORLD_DOMAIN: &[u8] = b"RTS_LOCKSTEP_WORLD_V1";

/// Compute a simple hash of arbitrary data.
pub fn hash_bytes(data: &[u8]) -> StateHash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute hash with domain separator.
pub fn hash_with_domain(domain: &[u8], data: &[u8]) -> StateHash {
    let mut hasher = Sha256::new();
    hasher.update(domain);
    hasher.update(data);
    hasher.finalize().into()
}

/// First bytes of a hash as hex, for log lines.
pub fn short_hex(hash: &StateHash) -> String {
    hex::encode(&hash[..6])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_separation() {
        let data = [1u8, 2, 3, 4];
        assert_ne!(hash_with_domain(b"DOMAIN_A", &data), hash_with_domain(b"DOMAIN_B", &data));
        assert_eq!(hash_with_domain(WORLD_DOMAIN, &data), hash_with_domain(WORLD_DOMAIN, &data));
    }

    #[test]
    fn test_hash_bytes_sensitivity() {
        assert_ne!(hash_bytes(&[1, 2, 3]), hash_bytes(&[1, 2, 4]));
        assert_eq!(short_hex(&hash_bytes(b"")).len(), 12);
    }
}
