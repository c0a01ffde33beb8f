//! Topic-to-broker assignment hash.
//!
//! The owner of a topic is a pure function of the topic name and the ordered
//! cluster membership list, so every node and client computes the same
//! answer without coordination. The hash is the MD5 of the UTF-8 name folded
//! to four bytes by XOR-striping and read as a signed big-endian integer.

use md5::{Digest, Md5};

/// Hashes a topic name to the 32-bit value used for ownership routing.
///
/// The 16 MD5 bytes are split into four groups of four; output byte `i` is
/// the XOR of group `i`. The result is stable across processes and
/// architectures and must match every other implementation byte for byte.
pub fn topic_hash(topic_name: &str) -> i32 {
    let digest = Md5::digest(topic_name.as_bytes());

    let mut folded = [0u8; 4];
    let stripe = digest.len() / folded.len();
    for (i, out) in folded.iter_mut().enumerate() {
        for j in 0..stripe {
            *out ^= digest[stripe * i + j];
        }
    }

    i32::from_be_bytes(folded)
}

/// Maps a topic name onto a slot in `0..=peer_count`.
///
/// Slots `0..peer_count` index the leader's peer list; slot `peer_count`
/// means the broker evaluating the function owns the topic itself.
pub fn owner_index(topic_name: &str, peer_count: usize) -> usize {
    let slots = peer_count as i32 + 1;
    (topic_hash(topic_name) % slots).unsigned_abs() as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    // Golden values; any change here breaks routing against existing
    // deployments.
    #[test]
    fn hash_golden_values() {
        assert_eq!(topic_hash(""), -1673922520);
        assert_eq!(topic_hash("a"), 19892569);
        assert_eq!(topic_hash("topic"), -1034268799);
    }

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(topic_hash("news"), topic_hash("news"));
        assert_ne!(topic_hash("news"), topic_hash("sports"));
    }

    #[test]
    fn owner_index_is_within_cluster_bounds() {
        for name in ["", "a", "topic", "x", "y", "z"] {
            for peers in 0..5 {
                assert!(owner_index(name, peers) <= peers);
            }
        }
    }

    #[test]
    fn single_broker_owns_everything() {
        assert_eq!(owner_index("anything", 0), 0);
        assert_eq!(owner_index("", 0), 0);
    }

    #[test]
    fn two_broker_split_golden_values() {
        // hash("x") = -870439544 (even), hash("z") = 1555093895 (odd)
        assert_eq!(owner_index("x", 1), 0);
        assert_eq!(owner_index("z", 1), 1);
    }
}
