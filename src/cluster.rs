//! Cluster management for quorumdb.
//!
//! This module provides the high-level cluster management functionality:
//!
//! - Node lifecycle (start, join, leave)
//! - Peer tracking and discovery via heartbeat and gossip
//! - Ring ownership and local vnode hosting
//! - Dispatch of coordinator/exchange calls to local or remote vnodes
//!
//! # Design
//!
//! A quorumdb cluster is a peer-to-peer network of nodes, each owning a
//! share of the ring's partitions. Any node can coordinate a request for
//! any key; it fans reads/writes out to whichever nodes currently own
//! that key's preflist, locally or over the wire, and runs periodic
//! anti-entropy against its own partitions' peers.
use crate::clock::{Clock, Context};
use crate::error::{DbError, DbResult};
use crate::network::{
    AddressBook, Connection, Listener, Message, NetworkReplicaClient, NodeId, PeerInfo,
    PeerStatus, DEFAULT_PORT,
};
use crate::reconciliation::{Exchange, ExchangePeer, TokenBucket, DEFAULT_HASHTREE_TOKENS};
use crate::ring::{EpochTable, RingSnapshot};
use crate::storage::{MemStorage, Storage};
use crate::types::{Bkey, VnodeId};
use crate::vnode::{self, VnodeHandle};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value as JsonValue;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::time::interval;

/// Configuration for a cluster node.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Address to bind for cluster communication.
    pub bind_addr: SocketAddr,
    /// Optional address of an existing peer to join.
    pub join_addr: Option<SocketAddr>,
    /// Interval for heartbeat pings (default: 5 seconds).
    pub heartbeat_interval: Duration,
    /// Interval for gossip announcements (default: 10 seconds).
    pub gossip_interval: Duration,
    /// Interval for anti-entropy ticks against preflist peers (default: 2s).
    pub sync_interval: Duration,
    /// Number of bits in the ring (2^ring_bits partitions).
    pub ring_bits: u32,
    /// Number of replicas per key.
    pub replication_factor: usize,
    /// Outstanding hashtree op budget shared by all local vnodes.
    pub hashtree_tokens: usize,
    /// Merkle tree branching factor per vnode.
    pub mtree_children: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            join_addr: None,
            heartbeat_interval: Duration::from_secs(5),
            gossip_interval: Duration::from_secs(10),
            sync_interval: Duration::from_secs(2),
            ring_bits: 6,
            replication_factor: 3,
            hashtree_tokens: DEFAULT_HASHTREE_TOKENS,
            mtree_children: 16,
        }
    }
}

impl ClusterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn join(mut self, addr: SocketAddr) -> Self {
        self.join_addr = Some(addr);
        self
    }

    pub fn ring_bits(mut self, bits: u32) -> Self {
        self.ring_bits = bits;
        self
    }

    pub fn replication_factor(mut self, n: usize) -> Self {
        self.replication_factor = n;
        self
    }

    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }
}

/// State of the cluster from a partition-availability perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    Healthy,
    Partitioned,
    Recovering,
}

/// Internal cluster state shared across background tasks.
struct ClusterState {
    peers: DashMap<NodeId, PeerInfo>,
    ring: RwLock<Arc<RingSnapshot>>,
    partition_state: RwLock<PartitionState>,
    epochs: RwLock<EpochTable>,
}

impl ClusterState {
    fn new(ring: RingSnapshot) -> Self {
        Self {
            peers: DashMap::new(),
            ring: RwLock::new(Arc::new(ring)),
            partition_state: RwLock::new(PartitionState::Healthy),
            epochs: RwLock::new(EpochTable::default()),
        }
    }

    /// Rebuild the ring from the current known peer set (`self_node` plus
    /// every peer in the table) and atomically swap it in, preserving each
    /// partition's epoch across the rebuild via the shared `EpochTable`.
    async fn rebuild_ring(&self, ring_bits: u32, self_node: &NodeId) {
        let mut nodes: Vec<NodeId> = self.peers.iter().map(|e| e.key().clone()).collect();
        nodes.push(self_node.clone());
        nodes.sort();
        nodes.dedup();

        let epochs = self.epochs.read().await;
        let new_ring = RingSnapshot::new_with_epochs(ring_bits, &nodes, &epochs);
        drop(epochs);
        *self.ring.write().await = Arc::new(new_ring);
    }

    fn get_peers(&self) -> Vec<PeerInfo> {
        self.peers.iter().map(|e| e.value().clone()).collect()
    }

    fn upsert_peer(&self, peer: PeerInfo) {
        self.peers
            .entry(peer.node_id.clone())
            .and_modify(|existing| {
                existing.last_seen = peer.last_seen;
                existing.status = peer.status;
            })
            .or_insert(peer);
    }

    fn update_peer_status(&self, node_id: &NodeId, status: PeerStatus) {
        if let Some(mut peer) = self.peers.get_mut(node_id) {
            peer.status = status;
            peer.last_seen = Utc::now();
        }
    }

    fn prune_stale_peers(&self, max_age: Duration) {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap_or_default();
        self.peers.retain(|_, peer| peer.last_seen > cutoff);
    }

    async fn ring(&self) -> Arc<RingSnapshot> {
        self.ring.read().await.clone()
    }
}

/// Resolves a [`VnodeId`]'s owning node to a socket address, consulting
/// the live ring snapshot and peer table. Self-addresses never appear
/// here; `ClusterNode` checks ownership against its own id before
/// falling back to this for remote dispatch.
struct ClusterAddressBook {
    peers: Arc<DashMap<NodeId, PeerInfo>>,
    ring: Arc<RingSnapshot>,
}

impl AddressBook for ClusterAddressBook {
    fn address_of(&self, vnode: VnodeId) -> Option<SocketAddr> {
        if vnode.partition_index as usize >= self.ring.num_partitions() {
            return None;
        }
        let owner = self.ring.owner(vnode.partition_index);
        self.peers.get(owner).map(|p| p.address)
    }
}

/// A node in the quorumdb cluster.
pub struct ClusterNode {
    node_id: NodeId,
    config: ClusterConfig,
    state: Arc<ClusterState>,
    /// Vnodes this node currently hosts, keyed by partition index.
    vnodes: Arc<DashMap<u32, VnodeHandle>>,
    exchange: Arc<Exchange>,
    shutdown_tx: broadcast::Sender<()>,
    running: Arc<RwLock<bool>>,
    actual_addr: Arc<RwLock<Option<SocketAddr>>>,
}

impl ClusterNode {
    /// Create a new, single-node cluster owning every partition. Joining
    /// peers later redistributes ownership via gossip-driven rebalancing
    /// (left for an operator-triggered ring update; this module hosts
    /// whatever the ring snapshot currently assigns it).
    pub fn new(config: ClusterConfig) -> Self {
        let node_id = NodeId::new();
        let ring = RingSnapshot::new(config.ring_bits, &[node_id.clone()]);
        let (shutdown_tx, _) = broadcast::channel(1);
        let tokens = Arc::new(TokenBucket::new(config.hashtree_tokens));

        Self {
            node_id,
            state: Arc::new(ClusterState::new(ring)),
            vnodes: Arc::new(DashMap::new()),
            exchange: Arc::new(Exchange::new(config.mtree_children, tokens)),
            config,
            shutdown_tx,
            running: Arc::new(RwLock::new(false)),
            actual_addr: Arc::new(RwLock::new(None)),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn bind_addr(&self) -> SocketAddr {
        if let Ok(guard) = self.actual_addr.try_read() {
            if let Some(addr) = *guard {
                return addr;
            }
        }
        self.config.bind_addr
    }

    pub async fn actual_addr(&self) -> Option<SocketAddr> {
        *self.actual_addr.read().await
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.state.get_peers()
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    pub async fn partition_state(&self) -> PartitionState {
        *self.state.partition_state.read().await
    }

    pub async fn ring(&self) -> Arc<RingSnapshot> {
        self.state.ring().await
    }

    /// The preflist for `key`, per the current ring snapshot.
    pub async fn preflist(&self, key: &Bkey) -> Vec<VnodeId> {
        self.ring().await.preflist(key, self.config.replication_factor)
    }

    /// Ensure a vnode actor is running for every partition this node owns
    /// per the current ring snapshot. Called on startup and whenever the
    /// ring changes.
    async fn ensure_local_vnodes(&self) {
        let ring = self.ring().await;
        for partition in 0..ring.num_partitions() as u32 {
            if ring.owner(partition) != &self.node_id {
                continue;
            }
            if self.vnodes.contains_key(&partition) {
                continue;
            }
            let vnode = ring.vnode(partition);
            let storage: Arc<dyn Storage> = Arc::new(MemStorage::new());
            let handle = vnode::spawn_with_branching(vnode, storage, self.config.mtree_children);
            self.vnodes.insert(partition, handle);
        }
    }

    fn local_handle(&self, vnode: VnodeId) -> Option<VnodeHandle> {
        self.vnodes.get(&vnode.partition_index).map(|e| e.value().clone())
    }

    fn remote_client(&self) -> NetworkReplicaClient<ClusterAddressBook> {
        let book = ClusterAddressBook {
            peers: Arc::new(self.state.peers.clone()),
            ring: self.state.ring.try_read().map(|g| g.clone()).unwrap_or_else(|_| {
                Arc::new(RingSnapshot::new(self.config.ring_bits, &[self.node_id.clone()]))
            }),
        };
        NetworkReplicaClient::new(book)
    }

    /// Start the cluster node: bind the listener, spawn connection
    /// handling and the heartbeat/gossip/anti-entropy tick loops, and
    /// join an existing cluster if configured.
    pub async fn start(&self) -> DbResult<()> {
        {
            let mut running = self.running.write().await;
            if *running {
                return Err(DbError::NotReady);
            }
            *running = true;
        }

        self.ensure_local_vnodes().await;

        let listener = Listener::bind(self.config.bind_addr).await?;
        let actual_addr = listener.local_addr();
        *self.actual_addr.write().await = Some(actual_addr);

        if let Some(join_addr) = self.config.join_addr {
            self.join_cluster(join_addr).await?;
        }

        let vnodes = Arc::clone(&self.vnodes);
        let state = Arc::clone(&self.state);
        let node_id = self.node_id.clone();
        let ring_bits = self.config.ring_bits;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        if let Ok(conn) = result {
                            let vnodes = Arc::clone(&vnodes);
                            let state = Arc::clone(&state);
                            let node_id = node_id.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(conn, vnodes, state, node_id, ring_bits).await {
                                    tracing::debug!(error = ?e, "connection closed with error");
                                }
                            });
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        {
            let state = Arc::clone(&self.state);
            let node_id = self.node_id.clone();
            let heartbeat_interval = self.config.heartbeat_interval;
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                let mut ticker = interval(heartbeat_interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => send_heartbeats(&state, &node_id).await,
                        _ = shutdown_rx.recv() => break,
                    }
                }
            });
        }

        {
            let state = Arc::clone(&self.state);
            let node_id = self.node_id.clone();
            let gossip_interval = self.config.gossip_interval;
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                let mut ticker = interval(gossip_interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => send_gossip(&state, &node_id, actual_addr).await,
                        _ = shutdown_rx.recv() => break,
                    }
                }
            });
        }

        {
            let node = self.clone_dispatch_handles();
            let sync_interval = self.config.sync_interval;
            let mut shutdown_rx = self.shutdown_tx.subscribe();
            tokio::spawn(async move {
                let mut ticker = interval(sync_interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => node.run_anti_entropy_tick().await,
                        _ = shutdown_rx.recv() => break,
                    }
                }
            });
        }

        Ok(())
    }

    pub async fn stop(&self) -> DbResult<()> {
        let mut running = self.running.write().await;
        if !*running {
            return Ok(());
        }
        *running = false;
        let _ = self.shutdown_tx.send(());
        Ok(())
    }

    /// Cheap clone of just the handles the anti-entropy task needs,
    /// avoiding cloning the whole `ClusterNode`.
    fn clone_dispatch_handles(&self) -> AntiEntropyTask {
        AntiEntropyTask {
            node_id: self.node_id.clone(),
            state: Arc::clone(&self.state),
            vnodes: Arc::clone(&self.vnodes),
            exchange: Arc::clone(&self.exchange),
            replication_factor: self.config.replication_factor,
        }
    }

    async fn join_cluster(&self, peer_addr: SocketAddr) -> DbResult<()> {
        let mut conn = Connection::connect(peer_addr).await?;
        let response = conn
            .request(&Message::Join { node_id: self.node_id.clone(), address: self.config.bind_addr })
            .await?;

        match response {
            Message::JoinAck { node_id, peers } => {
                self.state.upsert_peer(PeerInfo {
                    node_id,
                    address: peer_addr,
                    first_seen: Utc::now(),
                    last_seen: Utc::now(),
                    status: PeerStatus::Healthy,
                });
                for peer in peers {
                    if peer.node_id != self.node_id {
                        self.state.upsert_peer(peer);
                    }
                }
                self.state.rebuild_ring(self.config.ring_bits, &self.node_id).await;
                Ok(())
            }
            Message::Error { message } => {
                Err(DbError::Storage(crate::error::StorageError::Backend(format!(
                    "join failed: {message}"
                ))))
            }
            _ => Err(DbError::Storage(crate::error::StorageError::Backend(
                "unexpected response to join".into(),
            ))),
        }
    }
}

#[async_trait]
impl crate::coordinator::ReplicaClient for ClusterNode {
    async fn read(&self, vnode: VnodeId, key: Bkey) -> DbResult<Clock> {
        match self.local_handle(vnode) {
            Some(handle) => handle.read(key).await,
            None => self.remote_client().read(vnode, key).await,
        }
    }

    async fn write(&self, vnode: VnodeId, key: Bkey, context: Context, value: JsonValue) -> DbResult<Clock> {
        match self.local_handle(vnode) {
            Some(handle) => handle.write(key, context, value).await,
            None => self.remote_client().write(vnode, key, context, value).await,
        }
    }

    async fn repair(&self, vnode: VnodeId, key: Bkey, clock: Clock) -> DbResult<()> {
        match self.local_handle(vnode) {
            Some(handle) => handle.repair(key, clock).await,
            None => self.remote_client().repair(vnode, key, clock).await,
        }
    }
}

/// Handles held by the anti-entropy background task; separated from
/// `ClusterNode` so the task doesn't need to clone the listener/config.
struct AntiEntropyTask {
    node_id: NodeId,
    state: Arc<ClusterState>,
    vnodes: Arc<DashMap<u32, VnodeHandle>>,
    exchange: Arc<Exchange>,
    replication_factor: usize,
}

#[async_trait]
impl ExchangePeer for AntiEntropyTask {
    async fn merkle_root(&self, vnode: VnodeId) -> DbResult<[u8; 32]> {
        self.vnodes.get(&vnode.partition_index).ok_or(DbError::NotReady)?.merkle_root().await
    }
    async fn merkle_branch_hash(&self, vnode: VnodeId, branch: usize) -> DbResult<[u8; 32]> {
        self.vnodes
            .get(&vnode.partition_index)
            .ok_or(DbError::NotReady)?
            .merkle_branch_hash(branch)
            .await
    }
    async fn keys_in_leaf(&self, vnode: VnodeId, leaf: usize) -> DbResult<Vec<Bkey>> {
        self.vnodes.get(&vnode.partition_index).ok_or(DbError::NotReady)?.keys_in_leaf(leaf).await
    }
    async fn read(&self, vnode: VnodeId, key: Bkey) -> DbResult<Clock> {
        self.vnodes.get(&vnode.partition_index).ok_or(DbError::NotReady)?.read(key).await
    }
}

#[async_trait]
impl crate::coordinator::ReplicaClient for AntiEntropyTask {
    async fn read(&self, vnode: VnodeId, key: Bkey) -> DbResult<Clock> {
        self.vnodes.get(&vnode.partition_index).ok_or(DbError::NotReady)?.read(key).await
    }
    async fn write(&self, vnode: VnodeId, key: Bkey, context: Context, value: JsonValue) -> DbResult<Clock> {
        self.vnodes
            .get(&vnode.partition_index)
            .ok_or(DbError::NotReady)?
            .write(key, context, value)
            .await
    }
    async fn repair(&self, vnode: VnodeId, key: Bkey, clock: Clock) -> DbResult<()> {
        self.vnodes.get(&vnode.partition_index).ok_or(DbError::NotReady)?.repair(key, clock).await
    }
}

impl AntiEntropyTask {
    async fn run_anti_entropy_tick(&self) {
        let ring = self.state.ring().await;
        let book = ClusterAddressBook { peers: Arc::new(self.state.peers.clone()), ring: ring.clone() };
        let remote = NetworkReplicaClient::new(book);

        for entry in self.vnodes.iter() {
            let partition = *entry.key();
            let local_vnode = entry.value().id;
            let peer_partitions = ring.peers(partition, self.replication_factor, Some(&self.node_id));
            for peer_partition in peer_partitions {
                let peer_vnode = ring.vnode(peer_partition);
                let peer_node = ring.owner(peer_partition);
                let result = self
                    .exchange
                    .run(local_vnode, peer_vnode, &remote, self, self)
                    .await;
                match result {
                    Ok(repaired) if repaired > 0 => {
                        tracing::debug!(%local_vnode, %peer_node, repaired, "anti-entropy repaired keys");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::debug!(%local_vnode, %peer_node, error = ?e, "anti-entropy exchange failed"),
                }
            }
        }
    }
}

async fn handle_connection(
    mut conn: Connection,
    vnodes: Arc<DashMap<u32, VnodeHandle>>,
    state: Arc<ClusterState>,
    node_id: NodeId,
    ring_bits: u32,
) -> DbResult<()> {
    loop {
        let message = match conn.receive().await {
            Ok(msg) => msg,
            Err(_) => break,
        };
        let response = handle_message(message, &vnodes, &state, &node_id, ring_bits).await;
        if let Some(resp) = response {
            conn.send(&resp).await?;
        }
    }
    Ok(())
}

async fn handle_message(
    message: Message,
    vnodes: &Arc<DashMap<u32, VnodeHandle>>,
    state: &Arc<ClusterState>,
    node_id: &NodeId,
    ring_bits: u32,
) -> Option<Message> {
    match message {
        Message::Join { node_id: peer_id, address } => {
            state.upsert_peer(PeerInfo::new(peer_id, address));
            state.rebuild_ring(ring_bits, node_id).await;
            Some(Message::JoinAck { node_id: node_id.clone(), peers: state.get_peers() })
        }
        Message::Ping { node_id: peer_id } => {
            state.update_peer_status(&peer_id, PeerStatus::Healthy);
            Some(Message::Pong { node_id: node_id.clone() })
        }
        Message::Pong { node_id: peer_id } => {
            state.update_peer_status(&peer_id, PeerStatus::Healthy);
            None
        }
        Message::Announce { node_id: peer_id, address, peers } => {
            state.upsert_peer(PeerInfo { node_id: peer_id, address, first_seen: Utc::now(), last_seen: Utc::now(), status: PeerStatus::Healthy });
            for peer in peers {
                if peer.node_id != *node_id {
                    state.upsert_peer(peer);
                }
            }
            state.rebuild_ring(ring_bits, node_id).await;
            None
        }
        Message::VnodeRead { vnode, key } => {
            let result = match vnodes.get(&vnode.partition_index) {
                Some(h) => h.read(key).await,
                None => Err(DbError::NotReady),
            };
            Some(Message::VnodeReadResult(result))
        }
        Message::VnodeWrite { vnode, key, context, value } => {
            let result = match vnodes.get(&vnode.partition_index) {
                Some(h) => h.write(key, context, value).await,
                None => Err(DbError::NotReady),
            };
            Some(Message::VnodeWriteResult(result))
        }
        Message::VnodeRepair { vnode, key, clock } => {
            let result = match vnodes.get(&vnode.partition_index) {
                Some(h) => h.repair(key, clock).await,
                None => Err(DbError::NotReady),
            };
            Some(Message::VnodeRepairResult(result))
        }
        Message::MerkleRootRequest { vnode } => {
            let result = match vnodes.get(&vnode.partition_index) {
                Some(h) => h.merkle_root().await,
                None => Err(DbError::NotReady),
            };
            Some(Message::MerkleRootResult(result))
        }
        Message::MerkleBranchRequest { vnode, branch } => {
            let result = match vnodes.get(&vnode.partition_index) {
                Some(h) => h.merkle_branch_hash(branch).await,
                None => Err(DbError::NotReady),
            };
            Some(Message::MerkleBranchResult(result))
        }
        Message::KeysInLeafRequest { vnode, leaf } => {
            let result = match vnodes.get(&vnode.partition_index) {
                Some(h) => h.keys_in_leaf(leaf).await,
                None => Err(DbError::NotReady),
            };
            Some(Message::KeysInLeafResult(result))
        }
        _ => None,
    }
}

async fn send_heartbeats(state: &Arc<ClusterState>, node_id: &NodeId) {
    let peers = state.get_peers();
    for peer in peers {
        let node_id = node_id.clone();
        let state = Arc::clone(state);
        tokio::spawn(async move {
            match Connection::connect(peer.address).await {
                Ok(mut conn) => {
                    let msg = Message::Ping { node_id: node_id.clone() };
                    if conn.request(&msg).await.is_ok() {
                        state.update_peer_status(&peer.node_id, PeerStatus::Healthy);
                    } else {
                        state.update_peer_status(&peer.node_id, PeerStatus::Unreachable);
                    }
                }
                Err(_) => state.update_peer_status(&peer.node_id, PeerStatus::Unreachable),
            }
        });
    }
    state.prune_stale_peers(Duration::from_secs(60));
}

async fn send_gossip(state: &Arc<ClusterState>, node_id: &NodeId, bind_addr: SocketAddr) {
    let peers = state.get_peers();
    let message = Message::Announce { node_id: node_id.clone(), address: bind_addr, peers: peers.clone() };
    for peer in peers {
        let message = message.clone();
        tokio::spawn(async move {
            if let Ok(mut conn) = Connection::connect(peer.address).await {
                let _ = conn.send(&message).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn single_node_hosts_every_partition() {
        let config = ClusterConfig::new().bind_addr(([127, 0, 0, 1], 0).into()).ring_bits(3);
        let node = ClusterNode::new(config);
        node.ensure_local_vnodes().await;
        assert_eq!(node.vnodes.len(), 8);
    }

    #[tokio::test]
    async fn start_and_stop_round_trips() {
        let config = ClusterConfig::new().bind_addr(([127, 0, 0, 1], 0).into()).ring_bits(2);
        let node = ClusterNode::new(config);
        node.start().await.unwrap();
        assert!(node.is_running().await);
        node.stop().await.unwrap();
        assert!(!node.is_running().await);
    }
}
