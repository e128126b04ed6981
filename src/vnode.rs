//! The vnode actor (C4): owns one partition's storage, clock state, and
//! Merkle tree behind a single mailbox, so every operation against a given
//! key within this vnode is processed strictly one at a time.
use crate::clock::{Clock, Context};
use crate::error::{DbError, DbResult, StorageError};
use crate::reconciliation::merkle::MerkleTree;
use crate::storage::{BatchOp, Storage};
use crate::types::{Bkey, VnodeId};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// Merkle tree shape: `MTREE_CHILDREN` branches, each covering
/// `MTREE_CHILDREN` leaves (`B^2` total buckets).
pub const MTREE_CHILDREN: usize = 16;

/// Reserved storage key recording the highest epoch a vnode has ever run
/// under, so a crashed-and-restarted actor backed by the same engine mints
/// dots under a fresh epoch rather than risking counter reuse against
/// whatever it already committed before the crash.
const EPOCH_KEY: &[u8] = b"\x00quorumdb.vnode_epoch\x00";

fn load_persisted_epoch(storage: &dyn Storage) -> Option<u64> {
    storage
        .get(EPOCH_KEY)
        .ok()
        .flatten()
        .and_then(|bytes| bytes.try_into().ok())
        .map(u64::from_be_bytes)
}

fn persist_epoch(storage: &dyn Storage, epoch: u64) {
    if let Err(e) = storage.put(EPOCH_KEY, &epoch.to_be_bytes()) {
        warn!(error = %e, "failed to persist vnode epoch");
    }
}

/// Resolve the epoch a vnode should actually run under: if `storage` already
/// recorded an epoch at or past the one the caller supplied, this is a
/// restart against surviving state, so bump past it; otherwise trust the
/// caller (typically the ring snapshot's own epoch tracking).
fn resolve_epoch(requested: VnodeId, storage: &dyn Storage) -> VnodeId {
    let epoch = match load_persisted_epoch(storage) {
        Some(persisted) if persisted >= requested.epoch => persisted + 1,
        _ => requested.epoch,
    };
    persist_epoch(storage, epoch);
    VnodeId::new(requested.partition_index, epoch)
}

#[derive(Debug, Default)]
pub struct VnodeStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub repairs: AtomicU64,
}

enum VnodeMsg {
    Read {
        key: Bkey,
        reply: oneshot::Sender<DbResult<Clock>>,
    },
    Write {
        key: Bkey,
        context: Context,
        value: JsonValue,
        reply: oneshot::Sender<DbResult<Clock>>,
    },
    Repair {
        key: Bkey,
        incoming: Clock,
        reply: oneshot::Sender<DbResult<()>>,
    },
    MerkleRoot {
        reply: oneshot::Sender<DbResult<[u8; 32]>>,
    },
    MerkleBranchHash {
        branch: usize,
        reply: oneshot::Sender<DbResult<[u8; 32]>>,
    },
    KeysInLeaf {
        leaf: usize,
        reply: oneshot::Sender<DbResult<Vec<Bkey>>>,
    },
}

/// A cheap, cloneable handle to a running vnode actor.
#[derive(Clone)]
pub struct VnodeHandle {
    pub id: VnodeId,
    tx: mpsc::Sender<VnodeMsg>,
    pub stats: Arc<VnodeStats>,
}

impl VnodeHandle {
    pub async fn read(&self, key: Bkey) -> DbResult<Clock> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(VnodeMsg::Read { key, reply })
            .await
            .map_err(|_| DbError::NotReady)?;
        rx.await.map_err(|_| DbError::NotReady)?
    }

    pub async fn write(&self, key: Bkey, context: Context, value: JsonValue) -> DbResult<Clock> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(VnodeMsg::Write { key, context, value, reply })
            .await
            .map_err(|_| DbError::NotReady)?;
        rx.await.map_err(|_| DbError::NotReady)?
    }

    /// Merge-only write used by read-repair and anti-entropy key-repair:
    /// mints no new dot, just folds `incoming` into whatever this vnode
    /// already has.
    pub async fn repair(&self, key: Bkey, incoming: Clock) -> DbResult<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(VnodeMsg::Repair { key, incoming, reply })
            .await
            .map_err(|_| DbError::NotReady)?;
        rx.await.map_err(|_| DbError::NotReady)?
    }

    pub async fn merkle_root(&self) -> DbResult<[u8; 32]> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(VnodeMsg::MerkleRoot { reply })
            .await
            .map_err(|_| DbError::NotReady)?;
        rx.await.map_err(|_| DbError::NotReady)?
    }

    pub async fn merkle_branch_hash(&self, branch: usize) -> DbResult<[u8; 32]> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(VnodeMsg::MerkleBranchHash { branch, reply })
            .await
            .map_err(|_| DbError::NotReady)?;
        rx.await.map_err(|_| DbError::NotReady)?
    }

    pub async fn keys_in_leaf(&self, leaf: usize) -> DbResult<Vec<Bkey>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(VnodeMsg::KeysInLeaf { leaf, reply })
            .await
            .map_err(|_| DbError::NotReady)?;
        rx.await.map_err(|_| DbError::NotReady)?
    }
}

struct VnodeActor {
    id: VnodeId,
    storage: Arc<dyn Storage>,
    tree: MerkleTree,
    /// Gate guarding merkle queries until the initial full-storage fold
    /// finishes. Reads and writes are served during that window; only
    /// anti-entropy exchange waits, since querying a half-built tree would
    /// report bogus divergence with every peer.
    tree_ready: bool,
    stats: Arc<VnodeStats>,
    rx: mpsc::Receiver<VnodeMsg>,
}

fn clock_digest(clock: &Clock) -> Vec<u8> {
    let bytes = bincode::serialize(clock).expect("clock always serializable");
    Sha256::digest(&bytes).to_vec()
}

impl VnodeActor {
    fn load_clock(&self, key: &Bkey) -> DbResult<Option<Clock>> {
        let raw = self.storage.get(&key.encode()).map_err(DbError::Storage)?;
        match raw {
            None => Ok(None),
            Some(bytes) => bincode::deserialize(&bytes)
                .map(Some)
                .map_err(|e| DbError::Storage(StorageError::Backend(e.to_string()))),
        }
    }

    fn store_clock(&self, key: &Bkey, clock: &Clock) -> DbResult<()> {
        let bytes = bincode::serialize(clock)
            .map_err(|e| DbError::Storage(StorageError::Backend(e.to_string())))?;
        self.storage
            .put(&key.encode(), &bytes)
            .map_err(DbError::Storage)
    }

    fn handle_read(&mut self, key: &Bkey) -> DbResult<Clock> {
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.load_clock(key)?.unwrap_or_default())
    }

    fn handle_write(&mut self, key: &Bkey, context: &Context, value: JsonValue) -> DbResult<Clock> {
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        let existing = self.load_clock(key)?.unwrap_or_default();
        let updated = existing.update(context, value, self.id);
        self.store_clock(key, &updated)?;
        self.tree.upsert(&key.encode(), &clock_digest(&updated));
        trace!(vnode = %self.id, %key, "write applied");
        Ok(updated)
    }

    fn handle_repair(&mut self, key: &Bkey, incoming: Clock) -> DbResult<()> {
        self.stats.repairs.fetch_add(1, Ordering::Relaxed);
        let existing = self.load_clock(key)?.unwrap_or_default();
        let merged = Clock::sync(&existing, &incoming);
        if merged != existing {
            self.store_clock(key, &merged)?;
            self.tree.upsert(&key.encode(), &clock_digest(&merged));
            debug!(vnode = %self.id, %key, "repaired from divergent replica");
        }
        Ok(())
    }

    fn rebuild_tree(&mut self) {
        let mut entries = Vec::new();
        let result = self.storage.fold(&mut |k, v| {
            if k != EPOCH_KEY {
                entries.push((k.to_vec(), v.to_vec()));
            }
            Ok(())
        });
        if let Err(e) = result {
            warn!(vnode = %self.id, error = %e, "merkle tree rebuild scan failed");
            return;
        }
        let mut tree = MerkleTree::new(self.tree.branching());
        for (k, v) in entries {
            let digest = Sha256::digest(&v).to_vec();
            tree.upsert(&k, &digest);
        }
        self.tree = tree;
        self.tree_ready = true;
    }

    async fn run(mut self) {
        self.rebuild_tree();
        while let Some(msg) = self.rx.recv().await {
            match msg {
                VnodeMsg::Read { key, reply } => {
                    let _ = reply.send(self.handle_read(&key));
                }
                VnodeMsg::Write { key, context, value, reply } => {
                    let result = self.handle_write(&key, &context, value);
                    let _ = reply.send(result);
                }
                VnodeMsg::Repair { key, incoming, reply } => {
                    let result = self.handle_repair(&key, incoming);
                    let _ = reply.send(result);
                }
                VnodeMsg::MerkleRoot { reply } => {
                    let result = if self.tree_ready {
                        Ok(self.tree.root_hash())
                    } else {
                        Err(DbError::NotReady)
                    };
                    let _ = reply.send(result);
                }
                VnodeMsg::MerkleBranchHash { branch, reply } => {
                    let result = if self.tree_ready {
                        Ok(self.tree.branch_hash(branch))
                    } else {
                        Err(DbError::NotReady)
                    };
                    let _ = reply.send(result);
                }
                VnodeMsg::KeysInLeaf { leaf, reply } => {
                    let result = if !self.tree_ready {
                        Err(DbError::NotReady)
                    } else {
                        let mut keys = Vec::new();
                        let leaf_match = self.storage.fold_keys(&mut |k| {
                            if self.tree.leaf_index(k) == leaf {
                                keys.push(k.to_vec());
                            }
                            Ok(())
                        });
                        leaf_match
                            .map(|()| {
                                keys.into_iter()
                                    .filter_map(|encoded| decode_bkey(&encoded))
                                    .collect()
                            })
                            .map_err(DbError::Storage)
                    };
                    let _ = reply.send(result);
                }
            }
        }
    }
}

fn decode_bkey(encoded: &[u8]) -> Option<Bkey> {
    if encoded.len() < 4 {
        return None;
    }
    let bucket_len = u32::from_be_bytes(encoded[0..4].try_into().ok()?) as usize;
    let bucket = encoded.get(4..4 + bucket_len)?.to_vec();
    let key = encoded.get(4 + bucket_len..)?.to_vec();
    Some(Bkey { bucket, key })
}

/// Spawn a vnode actor, returning a handle to it. The actor's first action
/// is a full fold of `storage` to build its Merkle tree; until that
/// finishes, `merkle_root`/`merkle_branch_hash`/`keys_in_leaf` return
/// `DbError::NotReady` (reads and writes are unaffected).
pub fn spawn(id: VnodeId, storage: Arc<dyn Storage>) -> VnodeHandle {
    spawn_with_branching(id, storage, MTREE_CHILDREN)
}

pub fn spawn_with_branching(id: VnodeId, storage: Arc<dyn Storage>, branching: usize) -> VnodeHandle {
    let id = resolve_epoch(id, storage.as_ref());
    let (tx, rx) = mpsc::channel(256);
    let stats = Arc::new(VnodeStats::default());
    let actor = VnodeActor {
        id,
        storage,
        tree: MerkleTree::new(branching),
        tree_ready: false,
        stats: stats.clone(),
        rx,
    };
    tokio::spawn(actor.run());
    VnodeHandle { id, tx, stats }
}
