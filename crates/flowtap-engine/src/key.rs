//! Flow keys: the byte tuple flows are grouped by, and their hash.

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// FNV-1a over an arbitrary byte slice, used both for flow-key hashing and
/// shard selection (`hash(key) % num_shards`).
pub fn fnv1a(bytes: &[u8]) -> u64 {
    let mut h = FNV_OFFSET;
    for &b in bytes {
        h ^= b as u64;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

/// The byte-concatenation of a packet's configured key fields.
///
/// For bidirectional flows the key is canonicalized to whichever of the
/// forward/reverse byte orderings sorts first, so that a packet and its
/// reply hash to the same key; `forward` on the extracted packet records
/// which side of that canonicalization the observed packet was on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowKey(Vec<u8>);

impl FlowKey {
    /// Build a key from already-concatenated, already-canonicalized bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Build a bidirectional key from a packet's forward and reverse byte
    /// orderings, returning the canonical key and whether `forward_bytes`
    /// was the one kept (i.e. this packet travels in the flow's forward
    /// direction).
    pub fn canonicalize(forward_bytes: Vec<u8>, reverse_bytes: Vec<u8>) -> (Self, bool) {
        if forward_bytes <= reverse_bytes {
            (Self(forward_bytes), true)
        } else {
            (Self(reverse_bytes), false)
        }
    }

    /// FNV-1a hash of the key bytes, used to pick a shard.
    pub fn hash(&self) -> u64 {
        fnv1a(&self.0)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_picks_smaller_byte_ordering() {
        let (key, forward) = FlowKey::canonicalize(vec![2, 0, 0], vec![1, 0, 0]);
        assert_eq!(key.as_bytes(), &[1, 0, 0]);
        assert!(!forward);
    }

    #[test]
    fn reply_packet_hashes_to_same_key_as_request() {
        let (request_key, request_fwd) = FlowKey::canonicalize(vec![1, 2], vec![2, 1]);
        let (reply_key, reply_fwd) = FlowKey::canonicalize(vec![2, 1], vec![1, 2]);
        assert_eq!(request_key, reply_key);
        assert_ne!(request_fwd, reply_fwd);
    }

    #[test]
    fn hash_is_deterministic() {
        let key = FlowKey::from_bytes(vec![1, 2, 3]);
        assert_eq!(key.hash(), key.hash());
    }
}
