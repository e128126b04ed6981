//! Coordinator FSMs (C5 get, C6 put) and the replica transport they run
//! over.
pub mod get;
pub mod put;

use crate::clock::{Clock, Context};
use crate::error::DbResult;
use crate::types::{Bkey, VnodeId};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub use get::{GetCoordinator, GetOptions};
pub use put::{PutCoordinator, PutOptions};

/// Everything a coordinator needs to talk to a single replica, whether it
/// lives in this process or across the network. `cluster.rs` provides the
/// local implementation (direct vnode dispatch); `network.rs` provides the
/// remote one (wire RPC).
#[async_trait]
pub trait ReplicaClient: Send + Sync {
    async fn read(&self, vnode: VnodeId, key: Bkey) -> DbResult<Clock>;
    async fn write(&self, vnode: VnodeId, key: Bkey, context: Context, value: serde_json::Value) -> DbResult<Clock>;
    async fn repair(&self, vnode: VnodeId, key: Bkey, clock: Clock) -> DbResult<()>;
}

/// Shared coordinator configuration: the replica transport, the request
/// timeout, and the replica set's intended size.
pub struct CoordinatorEnv {
    pub replicas: Arc<dyn ReplicaClient>,
    pub timeout: Duration,
}

impl CoordinatorEnv {
    pub fn new(replicas: Arc<dyn ReplicaClient>, timeout: Duration) -> Self {
        Self { replicas, timeout }
    }
}
