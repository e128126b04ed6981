//! The top-level `QuorumDb` handle: wires the ring, cluster node, and
//! coordinator FSMs together behind a small, cloneable API.
use crate::clock::Context;
use crate::cluster::ClusterNode;
use crate::config::Config;
use crate::coordinator::{CoordinatorEnv, GetCoordinator, GetOptions, PutCoordinator, PutOptions};
use crate::error::DbResult;
use crate::types::{is_tombstone, tombstone_value, Bkey};
use serde_json::Value as JsonValue;
use std::sync::Arc;

/// A handle to a running quorumdb node. Cheap to clone; every clone
/// shares the same underlying cluster node and coordinator environment.
#[derive(Clone)]
pub struct QuorumDb {
    cluster: Arc<ClusterNode>,
    get_env: Arc<CoordinatorEnv>,
    put_env: Arc<CoordinatorEnv>,
    config: Config,
}

impl QuorumDb {
    /// Start a node with `config`, binding its listener and joining a
    /// peer if one is configured.
    pub async fn start(config: Config) -> DbResult<Self> {
        let cluster = Arc::new(ClusterNode::new(config.to_cluster_config()));
        cluster.start().await?;
        // Get and put each get their own deadline (10s / 20s by default,
        // per spec) but share the same underlying replica dispatch.
        let get_env = Arc::new(CoordinatorEnv::new(cluster.clone(), config.get_timeout));
        let put_env = Arc::new(CoordinatorEnv::new(cluster.clone(), config.put_timeout));
        Ok(Self { cluster, get_env, put_env, config })
    }

    /// Start a single-node instance with default configuration, bound to
    /// an ephemeral port. Convenient for tests and local experimentation.
    pub async fn start_standalone() -> DbResult<Self> {
        let config = Config::new().bind_addr(([127, 0, 0, 1], 0).into());
        Self::start(config).await
    }

    pub fn node_id(&self) -> String {
        self.cluster.node_id().to_string()
    }

    pub async fn stop(&self) -> DbResult<()> {
        self.cluster.stop().await
    }

    /// Fetch the live values for `bucket`/`key`, merging across whatever
    /// replicas answer within quorum and triggering read repair.
    pub async fn get(&self, bucket: &[u8], key: &[u8]) -> DbResult<Vec<JsonValue>> {
        self.get_with(bucket, key, GetOptions { r: self.config.read_quorum, ..Default::default() })
            .await
    }

    pub async fn get_with(&self, bucket: &[u8], key: &[u8], opts: GetOptions) -> DbResult<Vec<JsonValue>> {
        let bkey = Bkey::new(bucket.to_vec(), key.to_vec());
        let preflist = self.cluster.preflist(&bkey).await;
        GetCoordinator::run(&self.get_env, &preflist, bkey, opts).await
    }

    /// Write `value` to `bucket`/`key`, presenting `context` as the
    /// causal context observed on the last read (empty for a first
    /// write). Returns the new context the caller should present on its
    /// next write to this key.
    pub async fn put(
        &self,
        bucket: &[u8],
        key: &[u8],
        context: Context,
        value: JsonValue,
    ) -> DbResult<Context> {
        self.put_with(bucket, key, context, value, PutOptions {
            w: self.config.write_quorum,
            fail_ratio: self.config.replication_fail_ratio,
            ..Default::default()
        })
        .await
    }

    pub async fn put_with(
        &self,
        bucket: &[u8],
        key: &[u8],
        context: Context,
        value: JsonValue,
        opts: PutOptions,
    ) -> DbResult<Context> {
        let bkey = Bkey::new(bucket.to_vec(), key.to_vec());
        let preflist = self.cluster.preflist(&bkey).await;
        PutCoordinator::run(&self.put_env, &preflist, bkey, context, value, opts).await
    }

    /// Delete `bucket`/`key` by writing a tombstone. The tombstone
    /// remains visible to anti-entropy until it has propagated to every
    /// replica; `get` never returns it.
    pub async fn delete(&self, bucket: &[u8], key: &[u8], context: Context) -> DbResult<Context> {
        self.put(bucket, key, context, tombstone_value()).await
    }

    pub fn is_tombstone(value: &JsonValue) -> bool {
        is_tombstone(value)
    }
}
