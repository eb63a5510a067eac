//! Hashing for table construction and packet fingerprinting.
//!
//! The permutation walk needs two independent hashes per backend so that a
//! backend's offset and skip are uncorrelated. Following the NetBricks
//! Maglev setup, offset comes from xxHash and skip from FNV. Both take the
//! configured seed, so changing the seed rebalances the whole table.

use std::hash::Hasher;

use fnv::FnvHasher;
use twox_hash::XxHash64;

/// FNV-1a 64-bit offset basis. The seed is folded into the initial state so
/// that seed 0 reproduces standard FNV.
const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;

/// Byte length of the flow tuple hashed per packet: source address,
/// destination address (with the protocol folded in), and the L4 port word.
pub const TUPLE_LEN: usize = 12;

/// Independent `(offset_hash, skip_hash)` pair for one backend identity.
pub(crate) fn permutation_hashes(identity: &[u8], seed: u64) -> (u64, u64) {
    let mut offset = XxHash64::with_seed(seed);
    offset.write(identity);

    let mut skip = FnvHasher::with_key(FNV_OFFSET_BASIS ^ seed);
    skip.write(identity);

    (offset.finish(), skip.finish())
}

/// Fingerprint of a packed flow tuple.
///
/// 64 bits wide: both the cache key and the table slot derive from this one
/// value, and two flows that collide on it silently share a cache entry, so
/// the width is kept well above the table index range.
#[inline]
pub fn fingerprint(tuple: &[u8; TUPLE_LEN], seed: u64) -> u64 {
    let mut h = FnvHasher::with_key(FNV_OFFSET_BASIS ^ seed);
    h.write(tuple);
    h.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic() {
        let tuple = [1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];
        assert_eq!(fingerprint(&tuple, 0), fingerprint(&tuple, 0));
        assert_eq!(fingerprint(&tuple, 7), fingerprint(&tuple, 7));
    }

    #[test]
    fn seed_changes_fingerprint() {
        let tuple = [0u8; TUPLE_LEN];
        assert_ne!(fingerprint(&tuple, 0), fingerprint(&tuple, 1));
    }

    #[test]
    fn permutation_hashes_are_independent() {
        let (h1, h2) = permutation_hashes(&[10, 0, 0, 1], 0);
        assert_ne!(h1, h2);

        // Different identities move both hashes.
        let (g1, g2) = permutation_hashes(&[10, 0, 0, 2], 0);
        assert_ne!(h1, g1);
        assert_ne!(h2, g2);
    }
}
