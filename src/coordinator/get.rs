//! Get coordinator FSM (C5): `execute -> waiting -> waiting2 -> finalize`.
//!
//! `execute` fires a read at every vnode in the preflist concurrently.
//! `waiting` collects replies until `r` of them have arrived or the
//! deadline passes — the client's answer is computed from exactly those
//! replies and returned immediately. If read repair was requested,
//! `waiting2`/`finalize` run afterward as a detached background task: they
//! give the remaining replicas a little more time to answer, merge
//! whatever arrived with [`Clock::sync`], and push the merged clock back
//! to any replica whose reply was strictly behind it. A slow or dead
//! replica never blocks the client past the first deadline — it just
//! misses out on this round's repair.
use super::{CoordinatorEnv, ReplicaClient};
use crate::clock::Clock;
use crate::error::{DbError, DbResult};
use crate::types::{Bkey, VnodeId};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct GetOptions {
    /// Minimum successful reads before a result can be returned.
    pub r: usize,
    /// Merge stragglers and repair divergent replicas before returning.
    pub repair_mode: bool,
    /// Extra time (added to the coordinator's base timeout) `waiting2`
    /// spends collecting stragglers when `repair_mode` is set.
    pub straggler_grace: std::time::Duration,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            r: 1,
            repair_mode: true,
            straggler_grace: std::time::Duration::from_millis(50),
        }
    }
}

pub struct GetCoordinator;

impl GetCoordinator {
    /// Run one get against `preflist`, returning the merged live values
    /// (tombstones excluded) once quorum `r` is reached.
    pub async fn run(
        env: &CoordinatorEnv,
        preflist: &[VnodeId],
        key: Bkey,
        opts: GetOptions,
    ) -> DbResult<Vec<JsonValue>> {
        let mut pending: FuturesUnordered<_> = preflist
            .iter()
            .map(|vnode| {
                let vnode = *vnode;
                let key = key.clone();
                let replicas = env.replicas.clone_arc();
                async move { (vnode, replicas.read(vnode, key).await) }
            })
            .collect();

        let mut replies = Vec::new();
        let deadline = tokio::time::sleep(env.timeout);
        tokio::pin!(deadline);

        // waiting: block until r replies or the deadline. This is the only
        // phase the client waits on.
        loop {
            if replies.len() >= opts.r {
                break;
            }
            tokio::select! {
                next = pending.next() => match next {
                    Some((vnode, Ok(clock))) => replies.push((vnode, clock)),
                    Some((_, Err(_))) => {}
                    None => break,
                },
                _ = &mut deadline => break,
            }
        }

        if replies.len() < opts.r {
            return Err(DbError::Timeout);
        }

        let merged = replies
            .iter()
            .fold(Clock::new(), |acc, (_, clock)| Clock::sync(&acc, clock));
        let values = merged.live_values().into_iter().cloned().collect();

        // waiting2 + finalize: gather any stragglers and repair divergent
        // replicas in the background, without making the client wait past
        // the quorum deadline above.
        if opts.repair_mode {
            let replicas = env.replicas.clone_arc();
            let grace = opts.straggler_grace;
            tokio::spawn(async move {
                if !pending.is_empty() {
                    let sleep = tokio::time::sleep(grace);
                    tokio::pin!(sleep);
                    loop {
                        tokio::select! {
                            next = pending.next() => match next {
                                Some((vnode, Ok(clock))) => replies.push((vnode, clock)),
                                Some((_, Err(_))) => {}
                                None => break,
                            },
                            _ = &mut sleep => break,
                        }
                    }
                }

                let merged = replies
                    .iter()
                    .fold(Clock::new(), |acc, (_, clock)| Clock::sync(&acc, clock));
                for (vnode, clock) in &replies {
                    if clock != &merged {
                        debug!(%vnode, %key, "read repair: pushing merged clock");
                        if let Err(e) = replicas.repair(*vnode, key.clone(), merged.clone()).await {
                            warn!(%vnode, %key, error = ?e, "read repair failed");
                        }
                    }
                }
            });
        }

        Ok(values)
    }
}

/// Helper so `ReplicaClient` trait objects can be cheaply captured by the
/// futures spawned in `collect` without the caller threading an `Arc`
/// through every call site.
trait ReplicaClientExt {
    fn clone_arc(&self) -> std::sync::Arc<dyn ReplicaClient>;
}

impl ReplicaClientExt for std::sync::Arc<dyn ReplicaClient> {
    fn clone_arc(&self) -> std::sync::Arc<dyn ReplicaClient> {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStorage;
    use crate::vnode::{spawn, VnodeHandle};
    use async_trait::async_trait;
    use dashmap::DashMap;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    struct LocalReplicas {
        vnodes: DashMap<VnodeId, VnodeHandle>,
    }

    #[async_trait]
    impl ReplicaClient for LocalReplicas {
        async fn read(&self, vnode: VnodeId, key: Bkey) -> DbResult<Clock> {
            self.vnodes.get(&vnode).unwrap().read(key).await
        }
        async fn write(
            &self,
            vnode: VnodeId,
            key: Bkey,
            context: crate::clock::Context,
            value: JsonValue,
        ) -> DbResult<Clock> {
            self.vnodes.get(&vnode).unwrap().write(key, context, value).await
        }
        async fn repair(&self, vnode: VnodeId, key: Bkey, clock: Clock) -> DbResult<()> {
            self.vnodes.get(&vnode).unwrap().repair(key, clock).await
        }
    }

    fn preflist(n: u32) -> (Vec<VnodeId>, Arc<LocalReplicas>) {
        let vnodes = DashMap::new();
        let mut ids = Vec::new();
        for i in 0..n {
            let id = VnodeId::new(i, 0);
            vnodes.insert(id, spawn(id, Arc::new(MemStorage::new())));
            ids.push(id);
        }
        (ids, Arc::new(LocalReplicas { vnodes }))
    }

    #[tokio::test]
    async fn get_returns_value_written_to_quorum() {
        let (preflist, replicas) = preflist(3);
        let env = CoordinatorEnv::new(replicas.clone(), Duration::from_millis(200));
        let key = Bkey::new(b"b".to_vec(), b"k".to_vec());
        for vnode in &preflist {
            replicas
                .write(*vnode, key.clone(), crate::clock::Context::new(), json!("v1"))
                .await
                .unwrap();
        }
        let values = GetCoordinator::run(
            &env,
            &preflist,
            key,
            GetOptions { r: 2, ..Default::default() },
        )
        .await
        .unwrap();
        assert_eq!(values, vec![json!("v1")]);
    }

    #[tokio::test]
    async fn get_times_out_without_quorum() {
        let (preflist, replicas) = preflist(1);
        let env = CoordinatorEnv::new(replicas, Duration::from_millis(50));
        let key = Bkey::new(b"b".to_vec(), b"missing".to_vec());
        let result = GetCoordinator::run(
            &env,
            &preflist,
            key,
            GetOptions { r: 2, ..Default::default() },
        )
        .await;
        assert!(matches!(result, Err(DbError::Timeout)));
    }

    #[tokio::test]
    async fn read_repair_propagates_missing_value_to_stale_replica() {
        let (preflist, replicas) = preflist(2);
        let key = Bkey::new(b"b".to_vec(), b"k".to_vec());
        replicas
            .write(preflist[0], key.clone(), crate::clock::Context::new(), json!("v1"))
            .await
            .unwrap();
        let env = CoordinatorEnv::new(replicas.clone(), Duration::from_millis(200));
        let values = GetCoordinator::run(
            &env,
            &preflist,
            key.clone(),
            GetOptions { r: 1, repair_mode: true, straggler_grace: Duration::from_millis(100) },
        )
        .await
        .unwrap();
        assert_eq!(values, vec![json!("v1")]);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let repaired = replicas.read(preflist[1], key).await.unwrap();
        assert_eq!(repaired.live_values(), vec![&json!("v1")]);
    }
}
