//! Dotted version vectors (DVV): the causal-object model (C2).
//!
//! A [`Clock`] is a compact representation of "everything this node knows
//! about the causal history of one key." It tracks, per vnode, the highest
//! counter it has seen (`max_counter`) and the subset of dots that are
//! still causally concurrent with each other (`values`) — dots made
//! obsolete by a later sibling are dropped as soon as they're observed
//! together, which is what keeps the structure from growing without bound
//! the way a naive per-write log would.
//!
//! This module is pure: no I/O, no logging, no knowledge of storage or the
//! network. Its algebraic laws (commutativity, associativity, idempotence
//! of `sync`) are exercised by the `#[cfg(test)]` module below and by the
//! proptest-based cases in `tests/dvv_laws.rs`.
use crate::types::{is_tombstone, Dot, VnodeId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

/// One vnode's contribution to a [`Clock`]: the highest counter it has
/// minted for this key, and the values still reachable at a counter that
/// hasn't been superseded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Entry {
    max_counter: u64,
    values: Vec<(u64, JsonValue)>,
}

/// The causal object: a dotted version vector plus the values it carries.
///
/// `anonymous_values` holds values written without any vnode attribution —
/// in practice this only arises from [`Clock::sync`]ing with a clock
/// constructed directly from a raw value (tests, or migrating a
/// non-replicated write); `update` always mints a dotted value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Clock {
    entries: HashMap<VnodeId, Entry>,
    anonymous_values: Vec<JsonValue>,
}

/// A value-less version vector: "what has been observed," without the
/// values themselves. This is what a client round-trips as its causal
/// context — small, and enough for `update` to know what to discard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    counters: HashMap<VnodeId, u64>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, vnode: &VnodeId) -> u64 {
        self.counters.get(vnode).copied().unwrap_or(0)
    }

    pub fn covers(&self, dot: &Dot) -> bool {
        self.counter(&dot.vnode) >= dot.counter
    }

    /// Pointwise max of two contexts — used to merge causal contexts a
    /// client collected from different replicas before issuing a write.
    pub fn join(&self, other: &Context) -> Context {
        let mut counters = self.counters.clone();
        for (vnode, counter) in &other.counters {
            let entry = counters.entry(*vnode).or_insert(0);
            *entry = (*entry).max(*counter);
        }
        Context { counters }
    }

    pub fn is_empty(&self) -> bool {
        self.counters.values().all(|&c| c == 0)
    }
}

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    /// The causal context this clock represents, without its values.
    pub fn context(&self) -> Context {
        Context {
            counters: self
                .entries
                .iter()
                .map(|(vnode, entry)| (*vnode, entry.max_counter))
                .collect(),
        }
    }

    /// All live values carried by this clock (dotted and anonymous),
    /// deduplicated by content. A write fanned out to every replica in a
    /// preflist is stored as one independently-dotted value per vnode
    /// (§4.6) — from the client's perspective that's a single sibling, not
    /// N identical ones, so dots that happen to carry equal values collapse
    /// here. Includes tombstones; callers that want "the current visible
    /// value" should filter those out (see `Clock::live_values`).
    pub fn values(&self) -> Vec<&JsonValue> {
        let mut out: Vec<&JsonValue> = Vec::new();
        for entry in self.entries.values() {
            for (_, v) in &entry.values {
                if !out.contains(&v) {
                    out.push(v);
                }
            }
        }
        for v in &self.anonymous_values {
            if !out.contains(&v) {
                out.push(v);
            }
        }
        out
    }

    /// Values with tombstones removed — what a `get` returns to a client.
    pub fn live_values(&self) -> Vec<&JsonValue> {
        self.values().into_iter().filter(|v| !is_tombstone(v)).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.anonymous_values.is_empty()
    }

    /// Merge two clocks. Any dot causally dominated by the other clock's
    /// context is dropped; everything else (including values concurrent
    /// with each other) is kept. This is commutative, associative, and
    /// idempotent — see `tests/dvv_laws.rs`.
    pub fn sync(a: &Clock, b: &Clock) -> Clock {
        let mut entries = HashMap::new();
        let vnodes: std::collections::HashSet<VnodeId> =
            a.entries.keys().chain(b.entries.keys()).copied().collect();

        for vnode in vnodes {
            let empty = Entry::default();
            let ea = a.entries.get(&vnode).unwrap_or(&empty);
            let eb = b.entries.get(&vnode).unwrap_or(&empty);

            let max_counter = ea.max_counter.max(eb.max_counter);
            // A dot survives if it's beyond what the other side has seen
            // (genuinely concurrent), or if both sides already settled on
            // the exact same dot -- the steady state after read repair /
            // anti-entropy, where dropping it would break sync(a,a) == a.
            let ea_at: HashMap<u64, &JsonValue> = ea.values.iter().map(|(c, v)| (*c, v)).collect();
            let eb_at: HashMap<u64, &JsonValue> = eb.values.iter().map(|(c, v)| (*c, v)).collect();
            let mut merged: HashMap<u64, JsonValue> = HashMap::new();
            for (counter, value) in &ea.values {
                if *counter > eb.max_counter || (*counter == eb.max_counter && eb_at.contains_key(counter)) {
                    merged.insert(*counter, value.clone());
                }
            }
            for (counter, value) in &eb.values {
                if *counter > ea.max_counter || (*counter == ea.max_counter && ea_at.contains_key(counter)) {
                    merged.entry(*counter).or_insert_with(|| value.clone());
                }
            }
            let mut values: Vec<(u64, JsonValue)> = merged.into_iter().collect();
            values.sort_by_key(|(c, _)| *c);
            entries.insert(vnode, Entry { max_counter, values });
        }

        let mut anonymous_values = a.anonymous_values.clone();
        for v in &b.anonymous_values {
            if !anonymous_values.contains(v) {
                anonymous_values.push(v.clone());
            }
        }

        Clock { entries, anonymous_values }
    }

    /// True if every dot in `a` is covered by `b`'s context and `b` carries
    /// at least one dot `a` does not — i.e. `a` happened-before `b`.
    pub fn less(a: &Clock, b: &Clock) -> bool {
        let b_ctx = b.context();
        let a_dominated = a
            .entries
            .iter()
            .all(|(vnode, entry)| b_ctx.counter(vnode) >= entry.max_counter);
        a_dominated && a != b
    }

    /// Advance this clock with a new write: the caller supplies the causal
    /// context it observed before writing (an empty context for a blind
    /// write/new key). Every dot and anonymous value covered by that
    /// context is discarded — they are now known-superseded — and a fresh
    /// dot is minted for `vnode` carrying `value`.
    pub fn update(&self, context: &Context, value: JsonValue, vnode: VnodeId) -> Clock {
        let mut entries = HashMap::new();
        for (id, entry) in &self.entries {
            let observed = context.counter(id);
            let kept: Vec<(u64, JsonValue)> = entry
                .values
                .iter()
                .filter(|(c, _)| *c > observed)
                .cloned()
                .collect();
            entries.insert(*id, Entry { max_counter: entry.max_counter, values: kept });
        }
        let anonymous_values = if context.is_empty() {
            self.anonymous_values.clone()
        } else {
            Vec::new()
        };

        let next_counter = entries.get(&vnode).map(|e| e.max_counter).unwrap_or(0) + 1;
        entries.entry(vnode).or_default().max_counter = next_counter;
        entries
            .entry(vnode)
            .or_default()
            .values
            .push((next_counter, value));

        Clock { entries, anonymous_values }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vn(i: u32) -> VnodeId {
        VnodeId::new(i, 0)
    }

    #[test]
    fn update_on_empty_clock_mints_first_dot() {
        let c = Clock::new();
        let c2 = c.update(&Context::new(), json!("a"), vn(1));
        assert_eq!(c2.live_values(), vec![&json!("a")]);
        assert_eq!(c2.context().counter(&vn(1)), 1);
    }

    #[test]
    fn concurrent_updates_both_survive_sync() {
        let base = Clock::new().update(&Context::new(), json!("base"), vn(1));
        let ctx = base.context();
        let left = base.update(&ctx, json!("left"), vn(1));
        let right = base.update(&ctx, json!("right"), vn(2));
        let merged = Clock::sync(&left, &right);
        let mut values: Vec<String> = merged
            .live_values()
            .into_iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        values.sort();
        assert_eq!(values, vec!["left", "right"]);
    }

    #[test]
    fn update_with_full_context_resolves_siblings() {
        let base = Clock::new().update(&Context::new(), json!("base"), vn(1));
        let ctx = base.context();
        let left = base.update(&ctx, json!("left"), vn(1));
        let right = base.update(&ctx, json!("right"), vn(2));
        let merged = Clock::sync(&left, &right);
        let resolved = merged.update(&merged.context(), json!("resolved"), vn(1));
        assert_eq!(resolved.live_values(), vec![&json!("resolved")]);
    }

    #[test]
    fn sync_is_commutative() {
        let base = Clock::new().update(&Context::new(), json!("base"), vn(1));
        let ctx = base.context();
        let left = base.update(&ctx, json!("left"), vn(1));
        let right = base.update(&ctx, json!("right"), vn(2));
        assert_eq!(Clock::sync(&left, &right), Clock::sync(&right, &left));
    }

    #[test]
    fn sync_is_idempotent() {
        let c = Clock::new().update(&Context::new(), json!("a"), vn(1));
        assert_eq!(Clock::sync(&c, &c), c);
    }

    #[test]
    fn sync_keeps_value_both_sides_already_settled_on() {
        // Two replicas that already converged on the same dot for a vnode
        // (the steady state after read repair) must not lose that value
        // just because neither side's counter exceeds the other's.
        let a = Clock::new().update(&Context::new(), json!("x"), vn(1));
        let b = a.clone();
        let merged = Clock::sync(&a, &b);
        assert_eq!(merged.live_values(), vec![&json!("x")]);
        assert_eq!(merged, a);
    }

    #[test]
    fn sync_is_associative() {
        let base = Clock::new().update(&Context::new(), json!("base"), vn(1));
        let ctx = base.context();
        let a = base.update(&ctx, json!("a"), vn(1));
        let b = base.update(&ctx, json!("b"), vn(2));
        let c = base.update(&ctx, json!("c"), vn(3));
        let left = Clock::sync(&Clock::sync(&a, &b), &c);
        let right = Clock::sync(&a, &Clock::sync(&b, &c));
        assert_eq!(left, right);
    }

    #[test]
    fn less_detects_strict_happens_before() {
        let a = Clock::new().update(&Context::new(), json!("a"), vn(1));
        let b = a.update(&a.context(), json!("b"), vn(1));
        assert!(Clock::less(&a, &b));
        assert!(!Clock::less(&b, &a));
    }

    #[test]
    fn concurrent_clocks_are_not_less() {
        let base = Clock::new().update(&Context::new(), json!("base"), vn(1));
        let ctx = base.context();
        let left = base.update(&ctx, json!("left"), vn(1));
        let right = base.update(&ctx, json!("right"), vn(2));
        assert!(!Clock::less(&left, &right));
        assert!(!Clock::less(&right, &left));
    }

    #[test]
    fn delete_produces_tombstone_filtered_from_live_values() {
        use crate::types::tombstone_value;
        let base = Clock::new().update(&Context::new(), json!("a"), vn(1));
        let deleted = base.update(&base.context(), tombstone_value(), vn(1));
        assert!(deleted.live_values().is_empty());
        assert_eq!(deleted.values().len(), 1);
    }
}
