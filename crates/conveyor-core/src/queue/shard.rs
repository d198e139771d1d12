//! Stable stream -> shard routing.

use sha2::{Digest, Sha256};

use crate::domain::StreamName;

/// Shard index for a stream among `shards` shards.
///
/// First 8 bytes of SHA-256(stream name), big-endian, modulo `shards`.
/// Stable across processes and releases, unlike `DefaultHasher`.
pub fn shard_index(stream: &StreamName, shards: usize) -> usize {
    if shards <= 1 {
        return 0;
    }
    let digest = Sha256::digest(stream.as_str().as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % shards as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(s: &str) -> StreamName {
        StreamName::new(s).unwrap()
    }

    #[test]
    fn same_stream_always_lands_on_same_shard() {
        let s = stream("payments");
        let first = shard_index(&s, 7);
        for _ in 0..10 {
            assert_eq!(shard_index(&s, 7), first);
        }
        assert!(first < 7);
    }

    #[test]
    fn single_shard_is_index_zero() {
        assert_eq!(shard_index(&stream("anything"), 1), 0);
        assert_eq!(shard_index(&stream("anything"), 0), 0);
    }

    #[test]
    fn streams_spread_over_shards() {
        let used: std::collections::HashSet<usize> = (0..64)
            .map(|i| shard_index(&stream(&format!("stream-{i}")), 4))
            .collect();
        assert!(used.len() > 1);
    }
}
