//! Per-vnode Merkle tree for anti-entropy (C7).
//!
//! Fixed shape: branching factor `B`, depth 2, `B^2` leaf buckets. Every key
//! hashes to one leaf bucket; a leaf's hash is the XOR of a per-key entry
//! hash over everything currently in that bucket. XOR makes single-key
//! updates O(1) — insert/update/remove a key by XORing its old and new
//! contribution in and out — instead of re-hashing the whole bucket on
//! every write, which is what a naive bottom-up rebuild would cost.
//! Branch hashes (one level up) and the root are recomputed from the leaf
//! hashes; comparing two trees descends root -> branch -> leaf, touching
//! only branches that actually differ.
use sha2::{Digest, Sha256};
use std::collections::HashMap;

pub type Hash = [u8; 32];

const ZERO_HASH: Hash = [0u8; 32];

fn xor_into(acc: &mut Hash, other: &Hash) {
    for i in 0..32 {
        acc[i] ^= other[i];
    }
}

fn entry_hash(key: &[u8], value_digest: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update((key.len() as u32).to_be_bytes());
    hasher.update(key);
    hasher.update(value_digest);
    hasher.finalize().into()
}

fn combine(hashes: &[Hash]) -> Hash {
    let mut hasher = Sha256::new();
    for h in hashes {
        hasher.update(h);
    }
    hasher.finalize().into()
}

/// A B-ary, depth-2 Merkle tree over the keys of one vnode.
pub struct MerkleTree {
    branching: usize,
    leaves: Vec<Hash>,
    entries: HashMap<Vec<u8>, (usize, Hash)>,
}

impl MerkleTree {
    pub fn new(branching: usize) -> Self {
        assert!(branching > 0);
        Self {
            branching,
            leaves: vec![ZERO_HASH; branching * branching],
            entries: HashMap::new(),
        }
    }

    pub fn branching(&self) -> usize {
        self.branching
    }

    pub fn num_leaves(&self) -> usize {
        self.leaves.len()
    }

    pub fn leaf_index(&self, key: &[u8]) -> usize {
        let digest = Sha256::digest(key);
        let v = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        (v as usize) % self.leaves.len()
    }

    /// Insert or update a key's contribution. `value_digest` should be a
    /// hash of the serialized clock stored for this key, so two replicas
    /// with the same value disagree on nothing and ones with different
    /// values (including differing causal history) disagree on this leaf.
    pub fn upsert(&mut self, key: &[u8], value_digest: &[u8]) {
        let idx = self.leaf_index(key);
        let h = entry_hash(key, value_digest);
        if let Some((old_idx, old_h)) = self.entries.remove(key) {
            xor_into(&mut self.leaves[old_idx], &old_h);
        }
        xor_into(&mut self.leaves[idx], &h);
        self.entries.insert(key.to_vec(), (idx, h));
    }

    pub fn remove(&mut self, key: &[u8]) {
        if let Some((idx, h)) = self.entries.remove(key) {
            xor_into(&mut self.leaves[idx], &h);
        }
    }

    pub fn rebuild<I: IntoIterator<Item = (Vec<u8>, Vec<u8>)>>(branching: usize, entries: I) -> Self {
        let mut tree = Self::new(branching);
        for (k, v) in entries {
            tree.upsert(&k, &v);
        }
        tree
    }

    pub fn leaf_hash(&self, leaf: usize) -> Hash {
        self.leaves[leaf]
    }

    /// Hash of the `branching` leaves belonging to branch `branch`.
    pub fn branch_hash(&self, branch: usize) -> Hash {
        let start = branch * self.branching;
        combine(&self.leaves[start..start + self.branching])
    }

    pub fn root_hash(&self) -> Hash {
        let branch_hashes: Vec<Hash> = (0..self.branching).map(|b| self.branch_hash(b)).collect();
        combine(&branch_hashes)
    }

    /// Leaf indices that differ between `self` and `other`, found by
    /// descending only into branches whose hash disagrees.
    pub fn diff(&self, other: &MerkleTree) -> Vec<usize> {
        assert_eq!(self.branching, other.branching, "cannot diff trees of different shape");
        let mut out = Vec::new();
        for branch in 0..self.branching {
            if self.branch_hash(branch) == other.branch_hash(branch) {
                continue;
            }
            let start = branch * self.branching;
            for leaf in start..start + self.branching {
                if self.leaves[leaf] != other.leaves[leaf] {
                    out.push(leaf);
                }
            }
        }
        out
    }
}
