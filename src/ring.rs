//! Consistent-hash ring and preference lists (C1).
//!
//! The ring is fixed at `2^ring_bits` partitions; each partition is owned by
//! exactly one physical node at a time. A key's preference list ("preflist")
//! is the `N` partitions walking clockwise from its hash position, skipping
//! partitions whose owner already appears in the list so replicas land on
//! distinct physical nodes — the same diversity rule Dynamo-style rings use
//! to keep a single node failure from taking out more than one replica.
//!
//! Lookup itself is grounded on the classic `BTreeMap<token, owner>` +
//! clockwise-range-scan approach (see the consistent-hashing reference in
//! the example pack); here the "tokens" are just partition indices since
//! the ring has a fixed partition count rather than per-node virtual nodes.
use crate::network::NodeId;
use crate::types::{Bkey, VnodeId};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// An immutable view of the ring's partition ownership. Membership changes
/// produce a new snapshot; nothing mutates one in place, so a coordinator
/// can hold a `Arc<RingSnapshot>` across an entire request without racing
/// a concurrent rebalance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingSnapshot {
    ring_bits: u32,
    owners: Vec<NodeId>,
    epochs: Vec<u64>,
}

impl RingSnapshot {
    /// Build a ring with `2^ring_bits` partitions, assigning ownership
    /// round-robin across `nodes`. `nodes` must be non-empty.
    pub fn new(ring_bits: u32, nodes: &[NodeId]) -> Self {
        assert!(!nodes.is_empty(), "ring requires at least one node");
        let num_partitions = 1usize << ring_bits;
        let owners = (0..num_partitions)
            .map(|i| nodes[i % nodes.len()].clone())
            .collect();
        let epochs = vec![0u64; num_partitions];
        Self { ring_bits, owners, epochs }
    }

    /// Build a ring the same way as [`RingSnapshot::new`], but seeding each
    /// partition's epoch from `epochs` instead of zero — used when
    /// rebuilding the ring after a membership change, so a vnode that has
    /// already bumped its epoch (e.g. on restart) doesn't regress.
    pub fn new_with_epochs(ring_bits: u32, nodes: &[NodeId], epochs: &EpochTable) -> Self {
        let mut ring = Self::new(ring_bits, nodes);
        for (idx, epoch) in ring.epochs.iter_mut().enumerate() {
            *epoch = epochs.current(idx as u32);
        }
        ring
    }

    pub fn num_partitions(&self) -> usize {
        self.owners.len()
    }

    /// The partition index a key's hash falls into: the top `ring_bits`
    /// bits of a SHA-256 digest of its hash input.
    pub fn partition_of(&self, key: &Bkey) -> u32 {
        let digest = Sha256::digest(key.hash_input());
        let top = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        top >> (32 - self.ring_bits)
    }

    pub fn owner(&self, partition_index: u32) -> &NodeId {
        &self.owners[partition_index as usize]
    }

    pub fn vnode(&self, partition_index: u32) -> VnodeId {
        VnodeId::new(partition_index, self.epochs[partition_index as usize])
    }

    /// Record that a vnode's owning process restarted, so dots it mints
    /// afterward carry a fresh epoch.
    pub fn bump_epoch(&mut self, partition_index: u32) {
        self.epochs[partition_index as usize] += 1;
    }

    /// The preflist for a key: `n` vnodes, walking clockwise from the
    /// key's partition, diversified by owning node where possible.
    pub fn preflist(&self, key: &Bkey, n: usize) -> Vec<VnodeId> {
        self.preflist_for_partition(self.partition_of(key), n)
    }

    pub fn preflist_for_partition(&self, start: u32, n: usize) -> Vec<VnodeId> {
        let num_partitions = self.num_partitions() as u32;
        let n = n.min(num_partitions as usize);
        let mut result = Vec::with_capacity(n);
        let mut seen_owners: Vec<&NodeId> = Vec::with_capacity(n);

        // First pass: prefer partitions whose owner isn't already in the
        // list, for physical-node diversity.
        for i in 0..num_partitions {
            if result.len() == n {
                break;
            }
            let idx = (start + i) % num_partitions;
            let owner = self.owner(idx);
            if !seen_owners.contains(&owner) {
                seen_owners.push(owner);
                result.push(self.vnode(idx));
            }
        }
        // Second pass (fewer distinct nodes than N): fill remaining slots
        // with whatever partitions come next, repeats allowed.
        if result.len() < n {
            for i in 0..num_partitions {
                if result.len() == n {
                    break;
                }
                let idx = (start + i) % num_partitions;
                let vnode = self.vnode(idx);
                if !result.contains(&vnode) {
                    result.push(vnode);
                }
            }
        }
        result
    }

    /// The primary vnode for a key: the first entry of its preflist.
    pub fn primary(&self, key: &Bkey) -> VnodeId {
        self.vnode(self.partition_of(key))
    }

    /// Replica vnodes for a key (preflist of length `n`).
    pub fn replicas(&self, key: &Bkey, n: usize) -> Vec<VnodeId> {
        self.preflist(key, n)
    }

    /// The partitions peered with `partition_index` for anti-entropy and
    /// gossip: the up-to-`n-1` successors sharing its preflist, unioned
    /// with the up-to-`n-1` predecessor partitions whose own preflist of
    /// length `n` would include `partition_index`. Excludes partitions
    /// owned by `exclude` if given.
    pub fn peers(&self, partition_index: u32, n: usize, exclude: Option<&NodeId>) -> Vec<u32> {
        let num_partitions = self.num_partitions() as u32;
        let mut result = Vec::new();

        for idx in self
            .preflist_for_partition(partition_index, n)
            .into_iter()
            .map(|vn| vn.partition_index)
        {
            if idx != partition_index && !result.contains(&idx) {
                result.push(idx);
            }
        }

        let wanted_predecessors = n.saturating_sub(1);
        let mut found_predecessors = 0;
        let mut back = partition_index;
        for _ in 0..num_partitions.saturating_sub(1) {
            if found_predecessors >= wanted_predecessors {
                break;
            }
            back = (back + num_partitions - 1) % num_partitions;
            if back == partition_index {
                break;
            }
            if !result.contains(&back)
                && self
                    .preflist_for_partition(back, n)
                    .iter()
                    .any(|vn| vn.partition_index == partition_index)
            {
                result.push(back);
                found_predecessors += 1;
            }
        }

        result
            .into_iter()
            .filter(|idx| exclude.map(|ex| self.owner(*idx) != ex).unwrap_or(true))
            .collect()
    }

    /// Every partition whose preflist of length `n` includes `node`,
    /// i.e. the partitions `node` is responsible for serving or
    /// replicating.
    pub fn responsible_preflists(&self, node: &NodeId, n: usize) -> Vec<u32> {
        let num_partitions = self.num_partitions() as u32;
        (0..num_partitions)
            .filter(|&idx| {
                self.preflist_for_partition(idx, n)
                    .iter()
                    .any(|vn| self.owner(vn.partition_index) == node)
            })
            .collect()
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        let mut seen = Vec::new();
        for owner in &self.owners {
            if !seen.contains(owner) {
                seen.push(owner.clone());
            }
        }
        seen
    }
}

/// Per-node epoch bookkeeping kept outside the snapshot: a node tracks the
/// epoch of each vnode it currently owns so it can bump it on restart
/// before publishing a new snapshot.
#[derive(Debug, Default)]
pub struct EpochTable {
    epochs: HashMap<u32, u64>,
}

impl EpochTable {
    pub fn bump(&mut self, partition_index: u32) -> u64 {
        let entry = self.epochs.entry(partition_index).or_insert(0);
        *entry += 1;
        *entry
    }

    pub fn current(&self, partition_index: u32) -> u64 {
        self.epochs.get(&partition_index).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(i: u8) -> NodeId {
        NodeId::from_uuid(uuid::Uuid::from_u128(i as u128))
    }

    #[test]
    fn preflist_has_requested_length() {
        let nodes: Vec<NodeId> = (0..5).map(node).collect();
        let ring = RingSnapshot::new(4, &nodes);
        let key = Bkey::new(b"bucket".to_vec(), b"k1".to_vec());
        assert_eq!(ring.preflist(&key, 3).len(), 3);
    }

    #[test]
    fn preflist_is_clockwise_and_wraps() {
        let nodes: Vec<NodeId> = (0..4).map(node).collect();
        let ring = RingSnapshot::new(2, &nodes); // 4 partitions
        let list = ring.preflist_for_partition(3, 3);
        let indices: Vec<u32> = list.iter().map(|v| v.partition_index).collect();
        assert_eq!(indices, vec![3, 0, 1]);
    }

    #[test]
    fn preflist_prefers_distinct_owners() {
        let nodes: Vec<NodeId> = (0..2).map(node).collect();
        let ring = RingSnapshot::new(3, &nodes); // 8 partitions, 2 nodes alternating
        let list = ring.preflist_for_partition(0, 2);
        let owners: Vec<&NodeId> = list.iter().map(|v| ring.owner(v.partition_index)).collect();
        assert_ne!(owners[0], owners[1]);
    }

    #[test]
    fn same_key_maps_to_same_primary_deterministically() {
        let nodes: Vec<NodeId> = (0..3).map(node).collect();
        let ring = RingSnapshot::new(4, &nodes);
        let key = Bkey::new(b"b".to_vec(), b"k".to_vec());
        assert_eq!(ring.primary(&key), ring.primary(&key));
    }

    #[test]
    fn peers_includes_successors_and_predecessors() {
        let nodes: Vec<NodeId> = (0..4).map(node).collect();
        let ring = RingSnapshot::new(2, &nodes); // 4 partitions, 1:1 with owners
        let mut peers = ring.peers(1, 3, None);
        peers.sort();
        assert_eq!(peers, vec![0, 2, 3]);
    }

    #[test]
    fn peers_excludes_partitions_owned_by_the_given_node() {
        let nodes: Vec<NodeId> = (0..4).map(node).collect();
        let ring = RingSnapshot::new(2, &nodes);
        let self_node = ring.owner(0).clone();
        let peers = ring.peers(1, 3, Some(&self_node));
        assert!(!peers.contains(&0));
    }

    #[test]
    fn new_with_epochs_preserves_epoch_across_rebuild() {
        let nodes: Vec<NodeId> = (0..2).map(node).collect();
        let mut epochs = EpochTable::default();
        epochs.bump(0);
        epochs.bump(0);
        let ring = RingSnapshot::new_with_epochs(2, &nodes, &epochs);
        assert_eq!(ring.vnode(0).epoch, 2);
        assert_eq!(ring.vnode(1).epoch, 0);
    }

    #[test]
    fn responsible_preflists_contains_partition_of_owned_key() {
        let nodes: Vec<NodeId> = (0..3).map(node).collect();
        let ring = RingSnapshot::new(4, &nodes);
        let key = Bkey::new(b"b".to_vec(), b"k".to_vec());
        let primary_partition = ring.partition_of(&key);
        let owner = ring.owner(primary_partition).clone();
        let responsible = ring.responsible_preflists(&owner, 3);
        assert!(responsible.contains(&primary_partition));
    }
}
