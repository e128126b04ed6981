//! End-to-end coordinator scenarios against in-process vnodes: a stopped
//! replica still reaches quorum, concurrent writes produce siblings that a
//! later context-aware write can resolve, delete produces a tombstone
//! that `get` hides, and an unreachable preflist times out cleanly.
use async_trait::async_trait;
use dashmap::DashMap;
use quorumdb::clock::{Clock, Context};
use quorumdb::coordinator::{CoordinatorEnv, GetCoordinator, GetOptions, PutCoordinator, PutOptions, ReplicaClient};
use quorumdb::storage::MemStorage;
use quorumdb::vnode::{self, VnodeHandle};
use quorumdb::{Bkey, DbError, VnodeId};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// A preflist of in-process vnodes, some of which may be "stopped" (never
/// inserted), so calls against them return `NotReady` exactly as a dead
/// remote replica would time out or refuse a connection.
struct Preflist {
    vnodes: DashMap<VnodeId, VnodeHandle>,
}

impl Preflist {
    fn new(n: u32, down: &[u32]) -> (Vec<VnodeId>, Arc<Preflist>) {
        let vnodes = DashMap::new();
        let mut ids = Vec::new();
        for i in 0..n {
            let id = VnodeId::new(i, 0);
            ids.push(id);
            if !down.contains(&i) {
                vnodes.insert(id, vnode::spawn(id, Arc::new(MemStorage::new())));
            }
        }
        (ids, Arc::new(Preflist { vnodes }))
    }
}

#[async_trait]
impl ReplicaClient for Preflist {
    async fn read(&self, vnode: VnodeId, key: Bkey) -> Result<Clock, DbError> {
        match self.vnodes.get(&vnode) {
            Some(h) => h.read(key).await,
            None => Err(DbError::NotReady),
        }
    }
    async fn write(&self, vnode: VnodeId, key: Bkey, context: Context, value: serde_json::Value) -> Result<Clock, DbError> {
        match self.vnodes.get(&vnode) {
            Some(h) => h.write(key, context, value).await,
            None => Err(DbError::NotReady),
        }
    }
    async fn repair(&self, vnode: VnodeId, key: Bkey, clock: Clock) -> Result<(), DbError> {
        match self.vnodes.get(&vnode) {
            Some(h) => h.repair(key, clock).await,
            None => Err(DbError::NotReady),
        }
    }
}

fn bkey(bucket: &str, key: &str) -> Bkey {
    Bkey::new(bucket.as_bytes().to_vec(), key.as_bytes().to_vec())
}

/// Scenario A: a put with W=2 against a 3-replica preflist where replica
/// #3 is stopped still succeeds, and a subsequent R=2 get returns the
/// written value.
#[tokio::test]
async fn scenario_a_write_survives_one_stopped_replica() {
    let (preflist, replicas) = Preflist::new(3, &[2]);
    let env = CoordinatorEnv::new(replicas, Duration::from_millis(300));
    let key = bkey("b", "k1");

    let ctx = PutCoordinator::run(
        &env,
        &preflist,
        key.clone(),
        Context::new(),
        json!("v1"),
        PutOptions { w: 2, ..Default::default() },
    )
    .await
    .unwrap();
    assert!(!ctx.is_empty());

    let values = GetCoordinator::run(&env, &preflist, key, GetOptions { r: 2, ..Default::default() }).await.unwrap();
    assert_eq!(values, vec![json!("v1")]);
}

/// Scenario B: two concurrent blind writes to the same key, observed by
/// two different coordinators, both survive as siblings in a later get.
#[tokio::test]
async fn scenario_b_concurrent_blind_writes_produce_siblings() {
    let (preflist, replicas) = Preflist::new(3, &[]);
    let env = CoordinatorEnv::new(replicas, Duration::from_millis(300));
    let key = bkey("b", "k2");

    PutCoordinator::run(&env, &preflist, key.clone(), Context::new(), json!("A"), PutOptions { w: 3, ..Default::default() })
        .await
        .unwrap();
    PutCoordinator::run(&env, &preflist, key.clone(), Context::new(), json!("B"), PutOptions { w: 3, ..Default::default() })
        .await
        .unwrap();

    let values = GetCoordinator::run(&env, &preflist, key, GetOptions { r: 3, ..Default::default() }).await.unwrap();
    let mut sorted: Vec<String> = values.into_iter().map(|v| v.as_str().unwrap().to_string()).collect();
    sorted.sort();
    assert_eq!(sorted, vec!["A", "B"]);
}

/// Scenario C: a write observes a context that covers B's dot but not A's
/// (because the preceding read only reached the replicas that saw B) --
/// the resulting write resolves B but leaves A as a surviving sibling.
#[tokio::test]
async fn scenario_c_write_resolves_only_the_sibling_it_observed() {
    let (preflist, replicas) = Preflist::new(3, &[]);
    let env = CoordinatorEnv::new(replicas, Duration::from_millis(300));
    let key = bkey("b", "k2");

    // A lands only at preflist[0]; B lands at the other two. Both are
    // blind writes, so each vnode mints its own concurrent dot.
    PutCoordinator::run(
        &env,
        &preflist,
        key.clone(),
        Context::new(),
        json!("A"),
        PutOptions { w: 1, replicas_override: Some(vec![preflist[0]]), ..Default::default() },
    )
    .await
    .unwrap();
    PutCoordinator::run(
        &env,
        &preflist,
        key.clone(),
        Context::new(),
        json!("B"),
        PutOptions { w: 2, replicas_override: Some(preflist[1..].to_vec()), ..Default::default() },
    )
    .await
    .unwrap();

    // A read that only reaches the replicas holding B observes a context
    // that doesn't cover A's dot at all. `GetCoordinator::run` only hands
    // back values, not the merged context, so reconstruct it the same way
    // the coordinator itself would -- syncing the replies it collected.
    let values_only_b = GetCoordinator::run(
        &env,
        &preflist[1..],
        key.clone(),
        GetOptions { r: 2, repair_mode: false, ..Default::default() },
    )
    .await
    .unwrap();
    assert_eq!(values_only_b, vec![json!("B")]);

    let mut ctx = Clock::new();
    for vnode in &preflist[1..] {
        let clock = replicas.read(*vnode, key.clone()).await.unwrap();
        ctx = Clock::sync(&ctx, &clock);
    }
    let ctx = ctx.context();

    PutCoordinator::run(&env, &preflist, key.clone(), ctx, json!("C"), PutOptions { w: 3, ..Default::default() })
        .await
        .unwrap();

    let values = GetCoordinator::run(&env, &preflist, key, GetOptions { r: 3, ..Default::default() }).await.unwrap();
    let mut sorted: Vec<String> = values.into_iter().map(|v| v.as_str().unwrap().to_string()).collect();
    sorted.sort();
    assert_eq!(sorted, vec!["A", "C"]);
}

/// Scenario D: delete produces a tombstone; `get` reports it as absent
/// but still yields a non-empty causal context.
#[tokio::test]
async fn scenario_d_delete_hides_value_but_keeps_context() {
    let (preflist, replicas) = Preflist::new(3, &[]);
    let env = CoordinatorEnv::new(replicas, Duration::from_millis(300));
    let key = bkey("b", "k3");

    let ctx = PutCoordinator::run(&env, &preflist, key.clone(), Context::new(), json!("v"), PutOptions { w: 3, ..Default::default() })
        .await
        .unwrap();
    let delete_ctx = PutCoordinator::run(
        &env,
        &preflist,
        key.clone(),
        ctx,
        quorumdb::tombstone_value(),
        PutOptions { w: 3, ..Default::default() },
    )
    .await
    .unwrap();
    assert!(!delete_ctx.is_empty());

    let values = GetCoordinator::run(&env, &preflist, key, GetOptions { r: 3, ..Default::default() }).await.unwrap();
    assert!(values.is_empty());
}

/// Scenario F: every replica in the preflist is unreachable, so the get
/// coordinator times out cleanly rather than hanging or erroring
/// differently.
#[tokio::test]
async fn scenario_f_all_replicas_down_times_out() {
    let (preflist, replicas) = Preflist::new(3, &[0, 1, 2]);
    let env = CoordinatorEnv::new(replicas, Duration::from_millis(50));
    let key = bkey("b", "k4");

    let result = GetCoordinator::run(&env, &preflist, key, GetOptions { r: 1, ..Default::default() }).await;
    assert!(matches!(result, Err(DbError::Timeout)));
}
