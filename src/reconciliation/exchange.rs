//! Anti-entropy exchange (C7): the periodic background process that walks
//! a vnode's Merkle tree against a peer's and repairs whatever diverges.
//!
//! One tick per vnode at `sync_interval` (default 2s). Each tick picks one
//! peer from the vnode's preflist, compares root hashes, and if they
//! differ descends branch by branch to the leaves that actually disagree
//! — the same root -> branch -> leaf walk `MerkleTree::diff` performs
//! locally, just driven over the wire one level at a time so a tree that's
//! still mid-rebuild on the peer (`DbError::NotReady`) aborts the exchange
//! cleanly instead of mid-repairing. A token bucket caps how many
//! outstanding hashtree comparisons a vnode can have in flight at once,
//! and at most one exchange per peer pair runs concurrently.
use crate::clock::Clock;
use crate::coordinator::ReplicaClient;
use crate::error::{DbError, DbResult};
use crate::types::{Bkey, VnodeId};
use dashmap::DashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Caps the number of outstanding hashtree operations (branch/leaf
/// fetches) a vnode may have in flight across all its exchanges at once.
pub struct TokenBucket {
    capacity: usize,
    in_use: AtomicUsize,
}

impl TokenBucket {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, in_use: AtomicUsize::new(0) }
    }

    /// Try to acquire one token; returns `None` if the bucket is empty.
    pub fn try_acquire(&self) -> Option<TokenGuard<'_>> {
        let mut current = self.in_use.load(Ordering::Acquire);
        loop {
            if current >= self.capacity {
                return None;
            }
            match self.in_use.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(TokenGuard { bucket: self }),
                Err(observed) => current = observed,
            }
        }
    }
}

pub struct TokenGuard<'a> {
    bucket: &'a TokenBucket,
}

impl Drop for TokenGuard<'_> {
    fn drop(&mut self) {
        self.bucket.in_use.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Default outstanding-hashtree-op budget per vnode.
pub const DEFAULT_HASHTREE_TOKENS: usize = 90;

/// The peer side of an exchange: whatever lets us ask a remote vnode for
/// its Merkle root, a branch hash, or the keys in a leaf. `cluster.rs`
/// implements this for both local (same-process) and remote vnodes.
#[async_trait::async_trait]
pub trait ExchangePeer: Send + Sync {
    async fn merkle_root(&self, vnode: VnodeId) -> DbResult<[u8; 32]>;
    async fn merkle_branch_hash(&self, vnode: VnodeId, branch: usize) -> DbResult<[u8; 32]>;
    async fn keys_in_leaf(&self, vnode: VnodeId, leaf: usize) -> DbResult<Vec<Bkey>>;
    async fn read(&self, vnode: VnodeId, key: Bkey) -> DbResult<Clock>;
}

/// Runs one exchange between `local` and `peer` for a single vnode pair.
/// Returns the number of keys repaired.
pub struct Exchange {
    pub branching: usize,
    pub tokens: Arc<TokenBucket>,
    /// Tracks `(local_vnode, peer_vnode)` pairs currently mid-exchange, so
    /// a new tick for the same pair is skipped rather than queued.
    in_flight: Arc<DashSet<(VnodeId, VnodeId)>>,
}

impl Exchange {
    pub fn new(branching: usize, tokens: Arc<TokenBucket>) -> Self {
        Self { branching, tokens, in_flight: Arc::new(DashSet::new()) }
    }

    /// Compare `local_vnode` against `peer_vnode` on `peer`, repairing any
    /// leaf that disagrees by reading every key in it from both sides and
    /// pushing the merged clock to the replica client (`repair_into`).
    pub async fn run(
        &self,
        local_vnode: VnodeId,
        peer_vnode: VnodeId,
        peer: &dyn ExchangePeer,
        local: &dyn ExchangePeer,
        repair_into: &dyn ReplicaClient,
    ) -> DbResult<usize> {
        let pair = (local_vnode, peer_vnode);
        if !self.in_flight.insert(pair) {
            trace!(%local_vnode, %peer_vnode, "exchange already in flight, skipping tick");
            return Ok(0);
        }
        let result = self.run_inner(local_vnode, peer_vnode, peer, local, repair_into).await;
        self.in_flight.remove(&pair);
        result
    }

    async fn run_inner(
        &self,
        local_vnode: VnodeId,
        peer_vnode: VnodeId,
        peer: &dyn ExchangePeer,
        local: &dyn ExchangePeer,
        repair_into: &dyn ReplicaClient,
    ) -> DbResult<usize> {
        let _token = match self.tokens.try_acquire() {
            Some(t) => t,
            None => {
                debug!(%local_vnode, "hashtree token bucket exhausted, deferring exchange");
                return Ok(0);
            }
        };

        let (local_root, peer_root) = tokio::try_join!(
            local.merkle_root(local_vnode),
            peer.merkle_root(peer_vnode)
        )?;
        if local_root == peer_root {
            trace!(%local_vnode, %peer_vnode, "merkle roots match, nothing to repair");
            return Ok(0);
        }

        let mut repaired = 0;
        for branch in 0..self.branching {
            let (lb, pb) = tokio::try_join!(
                local.merkle_branch_hash(local_vnode, branch),
                peer.merkle_branch_hash(peer_vnode, branch)
            )?;
            if lb == pb {
                continue;
            }
            let start = branch * self.branching;
            for leaf in start..start + self.branching {
                repaired += self
                    .repair_leaf(local_vnode, peer_vnode, leaf, peer, local, repair_into)
                    .await?;
            }
        }
        Ok(repaired)
    }

    async fn repair_leaf(
        &self,
        local_vnode: VnodeId,
        peer_vnode: VnodeId,
        leaf: usize,
        peer: &dyn ExchangePeer,
        local: &dyn ExchangePeer,
        repair_into: &dyn ReplicaClient,
    ) -> DbResult<usize> {
        let mut keys: Vec<Bkey> = local.keys_in_leaf(local_vnode, leaf).await?;
        for k in peer.keys_in_leaf(peer_vnode, leaf).await? {
            if !keys.contains(&k) {
                keys.push(k);
            }
        }

        let mut repaired = 0;
        for key in keys {
            let (local_clock, peer_clock) = match tokio::try_join!(
                local.read(local_vnode, key.clone()),
                peer.read(peer_vnode, key.clone())
            ) {
                Ok(v) => v,
                Err(DbError::NotReady) => continue,
                Err(e) => return Err(e),
            };
            let merged = Clock::sync(&local_clock, &peer_clock);
            if merged != local_clock {
                repair_into.repair(local_vnode, key.clone(), merged.clone()).await?;
                repaired += 1;
            }
            if merged != peer_clock {
                repair_into.repair(peer_vnode, key, merged).await?;
            }
        }
        Ok(repaired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_bucket_refuses_past_capacity() {
        let bucket = TokenBucket::new(1);
        let first = bucket.try_acquire();
        assert!(first.is_some());
        assert!(bucket.try_acquire().is_none());
        drop(first);
        assert!(bucket.try_acquire().is_some());
    }
}
