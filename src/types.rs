//! Common types shared across the ring, clock, storage, and coordinator
//! modules.
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

/// A key within a bucket. The ring hashes `bucket || key` to a ring
/// position; within a vnode, `bucket` and `key` together address a single
/// object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bkey {
    pub bucket: Vec<u8>,
    pub key: Vec<u8>,
}

impl Bkey {
    pub fn new(bucket: impl Into<Vec<u8>>, key: impl Into<Vec<u8>>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Bytes hashed to find this key's ring position: `bucket || 0x00 ||
    /// key`. The separator keeps `(bucket="a", key="bc")` and
    /// `(bucket="ab", key="c")` from colliding.
    pub fn hash_input(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.bucket.len() + self.key.len() + 1);
        buf.extend_from_slice(&self.bucket);
        buf.push(0u8);
        buf.extend_from_slice(&self.key);
        buf
    }

    /// Storage-layer encoding: a length-prefixed `bucket` followed by
    /// `key`, so lexicographic byte order on the encoded form matches
    /// `(bucket, key)` order (needed for Merkle leaf ordering and
    /// `fold_keys` range scans).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.bucket.len() + self.key.len() + 4);
        buf.extend_from_slice(&(self.bucket.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.bucket);
        buf.extend_from_slice(&self.key);
        buf
    }
}

impl fmt::Display for Bkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}",
            String::from_utf8_lossy(&self.bucket),
            String::from_utf8_lossy(&self.key)
        )
    }
}

/// Identity of a vnode: its fixed position on the ring plus an epoch that
/// increments every time the vnode's owning process restarts. Epoch is
/// folded into every dot the vnode mints, so a dot from a crashed-and-
/// restarted vnode can never collide with one it issued before the crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VnodeId {
    pub partition_index: u32,
    pub epoch: u64,
}

impl VnodeId {
    pub fn new(partition_index: u32, epoch: u64) -> Self {
        Self {
            partition_index,
            epoch,
        }
    }
}

impl fmt::Display for VnodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vn{}@{}", self.partition_index, self.epoch)
    }
}

/// A single dot: one causally-distinct write, identified by the vnode that
/// minted it and a per-vnode monotonic counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Dot {
    pub vnode: VnodeId,
    pub counter: u64,
}

/// Sentinel stored in place of a deleted value. `Clock::values()` filters
/// tombstones out of its result, but the clock keeps tracking the dot until
/// anti-entropy has propagated the delete everywhere — pruning it too early
/// would let a stale replica's concurrent write resurrect the value.
pub const TOMBSTONE: &str = "\u{0}quorumdb.tombstone\u{0}";

pub fn is_tombstone(value: &JsonValue) -> bool {
    matches!(value, JsonValue::String(s) if s == TOMBSTONE)
}

pub fn tombstone_value() -> JsonValue {
    JsonValue::String(TOMBSTONE.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bkey_hash_input_avoids_boundary_collision() {
        let a = Bkey::new(b"a".to_vec(), b"bc".to_vec());
        let b = Bkey::new(b"ab".to_vec(), b"c".to_vec());
        assert_ne!(a.hash_input(), b.hash_input());
    }

    #[test]
    fn tombstone_roundtrip() {
        let v = tombstone_value();
        assert!(is_tombstone(&v));
        assert!(!is_tombstone(&serde_json::json!({"x": 1})));
    }
}
