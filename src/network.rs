//! Network layer: node-to-node transport for quorumdb.
//!
//! A simple request-response protocol over TCP: each message is prefixed
//! with a 4-byte big-endian length header followed by a `bincode`-encoded
//! payload (the causal clock and value blob are carried inside `Message`
//! variants, length-prefixed the same way at the field level via
//! `bincode`'s own encoding — one explicit wire format end to end, rather
//! than mixing JSON for control messages and a separate binary format for
//! data).
use crate::clock::{Clock, Context};
use crate::error::{DbError, DbResult, StorageError};
use crate::types::{Bkey, VnodeId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use uuid::Uuid;

/// Default port for quorumdb cluster communication.
pub const DEFAULT_PORT: u16 = 7878;

/// Maximum message size (16 MB).
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

fn net_err(context: &str, e: impl std::fmt::Display) -> DbError {
    DbError::Storage(StorageError::Backend(format!("{context}: {e}")))
}

/// Unique identifier for a node in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub Uuid);

impl NodeId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Information about a peer node in the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub node_id: NodeId,
    pub address: SocketAddr,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub status: PeerStatus,
}

impl PeerInfo {
    pub fn new(node_id: NodeId, address: SocketAddr) -> Self {
        let now = Utc::now();
        Self { node_id, address, first_seen: now, last_seen: now, status: PeerStatus::Unknown }
    }

    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }
}

/// Status of a peer node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerStatus {
    Unknown,
    Healthy,
    Syncing,
    Unreachable,
}

/// Protocol messages for cluster and vnode-to-vnode communication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    // -- Handshake & discovery --
    Join { node_id: NodeId, address: SocketAddr },
    JoinAck { node_id: NodeId, peers: Vec<PeerInfo> },
    Announce { node_id: NodeId, address: SocketAddr, peers: Vec<PeerInfo> },

    // -- Health --
    Ping { node_id: NodeId },
    Pong { node_id: NodeId },

    // -- Vnode data path (coordinator <-> replica) --
    VnodeRead { vnode: VnodeId, key: Bkey },
    VnodeReadResult(Result<Clock, DbError>),

    VnodeWrite { vnode: VnodeId, key: Bkey, context: Context, value: JsonValue },
    VnodeWriteResult(Result<Clock, DbError>),

    VnodeRepair { vnode: VnodeId, key: Bkey, clock: Clock },
    VnodeRepairResult(Result<(), DbError>),

    // -- Anti-entropy exchange --
    MerkleRootRequest { vnode: VnodeId },
    MerkleRootResult(Result<[u8; 32], DbError>),

    MerkleBranchRequest { vnode: VnodeId, branch: usize },
    MerkleBranchResult(Result<[u8; 32], DbError>),

    KeysInLeafRequest { vnode: VnodeId, leaf: usize },
    KeysInLeafResult(Result<Vec<Bkey>, DbError>),

    Error { message: String },
}

impl Message {
    pub fn to_bytes(&self) -> DbResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| net_err("encode message", e))
    }

    pub fn from_bytes(bytes: &[u8]) -> DbResult<Self> {
        bincode::deserialize(bytes).map_err(|e| net_err("decode message", e))
    }
}

/// A connection to a peer, carrying the length-prefixed message protocol.
pub struct Connection {
    stream: TcpStream,
    peer_addr: SocketAddr,
}

impl Connection {
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Self { stream, peer_addr }
    }

    pub async fn connect(addr: SocketAddr) -> DbResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| net_err(&format!("connect to {addr}"), e))?;
        Ok(Self::new(stream, addr))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub async fn send(&mut self, message: &Message) -> DbResult<()> {
        let bytes = message.to_bytes()?;
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(net_err("send", format!("message too large: {} bytes", bytes.len())));
        }
        let len = bytes.len() as u32;
        self.stream
            .write_all(&len.to_be_bytes())
            .await
            .map_err(|e| net_err("write length", e))?;
        self.stream.write_all(&bytes).await.map_err(|e| net_err("write body", e))?;
        self.stream.flush().await.map_err(|e| net_err("flush", e))?;
        Ok(())
    }

    pub async fn receive(&mut self) -> DbResult<Message> {
        let mut len_bytes = [0u8; 4];
        self.stream
            .read_exact(&mut len_bytes)
            .await
            .map_err(|e| net_err("read length", e))?;
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(net_err("receive", format!("message too large: {len} bytes")));
        }
        let mut bytes = vec![0u8; len];
        self.stream.read_exact(&mut bytes).await.map_err(|e| net_err("read body", e))?;
        Message::from_bytes(&bytes)
    }

    pub async fn request(&mut self, message: &Message) -> DbResult<Message> {
        self.send(message).await?;
        self.receive().await
    }
}

/// TCP listener for incoming cluster connections.
pub struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    pub async fn bind(addr: SocketAddr) -> DbResult<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|e| net_err(&format!("bind {addr}"), e))?;
        let local_addr = listener.local_addr().map_err(|e| net_err("local_addr", e))?;
        Ok(Self { listener, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn accept(&self) -> DbResult<Connection> {
        let (stream, peer_addr) = self.listener.accept().await.map_err(|e| net_err("accept", e))?;
        Ok(Connection::new(stream, peer_addr))
    }
}

/// Resolves a vnode to the socket address of the node currently hosting
/// it. `cluster.rs` implements this over a `RingSnapshot` plus the known
/// peer address table.
pub trait AddressBook: Send + Sync {
    fn address_of(&self, vnode: VnodeId) -> Option<SocketAddr>;
}

/// Dispatches coordinator reads/writes/repairs to remote vnodes over the
/// wire. A fresh connection is opened per call; a production deployment
/// would pool these, but request volume here is bounded by the coordinator
/// fan-out (at most N per operation), not worth the added bookkeeping yet.
pub struct NetworkReplicaClient<A: AddressBook> {
    addresses: A,
}

impl<A: AddressBook> NetworkReplicaClient<A> {
    pub fn new(addresses: A) -> Self {
        Self { addresses }
    }

    async fn connect_to(&self, vnode: VnodeId) -> DbResult<Connection> {
        let addr = self
            .addresses
            .address_of(vnode)
            .ok_or(DbError::NotReady)?;
        Connection::connect(addr).await
    }
}

#[async_trait]
impl<A: AddressBook + Send + Sync> crate::coordinator::ReplicaClient for NetworkReplicaClient<A> {
    async fn read(&self, vnode: VnodeId, key: Bkey) -> DbResult<Clock> {
        let mut conn = self.connect_to(vnode).await?;
        match conn.request(&Message::VnodeRead { vnode, key }).await? {
            Message::VnodeReadResult(r) => r,
            _ => Err(net_err("read", "unexpected response")),
        }
    }

    async fn write(&self, vnode: VnodeId, key: Bkey, context: Context, value: JsonValue) -> DbResult<Clock> {
        let mut conn = self.connect_to(vnode).await?;
        match conn.request(&Message::VnodeWrite { vnode, key, context, value }).await? {
            Message::VnodeWriteResult(r) => r,
            _ => Err(net_err("write", "unexpected response")),
        }
    }

    async fn repair(&self, vnode: VnodeId, key: Bkey, clock: Clock) -> DbResult<()> {
        let mut conn = self.connect_to(vnode).await?;
        match conn.request(&Message::VnodeRepair { vnode, key, clock }).await? {
            Message::VnodeRepairResult(r) => r,
            _ => Err(net_err("repair", "unexpected response")),
        }
    }
}

#[async_trait]
impl<A: AddressBook + Send + Sync> crate::reconciliation::ExchangePeer for NetworkReplicaClient<A> {
    async fn merkle_root(&self, vnode: VnodeId) -> DbResult<[u8; 32]> {
        let mut conn = self.connect_to(vnode).await?;
        match conn.request(&Message::MerkleRootRequest { vnode }).await? {
            Message::MerkleRootResult(r) => r,
            _ => Err(net_err("merkle_root", "unexpected response")),
        }
    }

    async fn merkle_branch_hash(&self, vnode: VnodeId, branch: usize) -> DbResult<[u8; 32]> {
        let mut conn = self.connect_to(vnode).await?;
        match conn.request(&Message::MerkleBranchRequest { vnode, branch }).await? {
            Message::MerkleBranchResult(r) => r,
            _ => Err(net_err("merkle_branch_hash", "unexpected response")),
        }
    }

    async fn keys_in_leaf(&self, vnode: VnodeId, leaf: usize) -> DbResult<Vec<Bkey>> {
        let mut conn = self.connect_to(vnode).await?;
        match conn.request(&Message::KeysInLeafRequest { vnode, leaf }).await? {
            Message::KeysInLeafResult(r) => r,
            _ => Err(net_err("keys_in_leaf", "unexpected response")),
        }
    }

    async fn read(&self, vnode: VnodeId, key: Bkey) -> DbResult<Clock> {
        crate::coordinator::ReplicaClient::read(self, vnode, key).await
    }
}
