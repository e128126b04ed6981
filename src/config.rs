//! Builder-style configuration for a quorumdb node, gathering the knobs
//! scattered across [`crate::cluster::ClusterConfig`],
//! [`crate::coordinator`] options, and anti-entropy tuning into one place
//! for `QuorumDb::start`.
use crate::reconciliation::DEFAULT_HASHTREE_TOKENS;
use std::net::SocketAddr;
use std::time::Duration;

/// Top-level configuration for a `QuorumDb` instance.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind for inter-node cluster traffic.
    pub bind_addr: SocketAddr,
    /// Address of an existing node to join, if any.
    pub join_addr: Option<SocketAddr>,
    /// Number of bits in the ring (`2^ring_bits` partitions).
    pub ring_bits: u32,
    /// Replicas per key (`N`).
    pub replication_factor: usize,
    /// Default read quorum (`R`).
    pub read_quorum: usize,
    /// Default write quorum (`W`).
    pub write_quorum: usize,
    /// Coordinator deadline for a single get (default 10s per spec).
    pub get_timeout: Duration,
    /// Coordinator deadline for a single put (default 20s per spec, longer
    /// than get's since a put fans out to the full preflist rather than
    /// returning as soon as read-repair's grace window closes).
    pub put_timeout: Duration,
    /// Interval between anti-entropy ticks per vnode.
    pub sync_interval: Duration,
    /// Interval between heartbeat pings.
    pub heartbeat_interval: Duration,
    /// Interval between gossip announcements.
    pub gossip_interval: Duration,
    /// Outstanding hashtree-comparison budget shared across local vnodes.
    pub hashtree_tokens: usize,
    /// Merkle tree branching factor per vnode.
    pub mtree_children: usize,
    /// Fraction of replica writes the put coordinator drops before
    /// sending, for fault-injection testing. Must stay `0.0` outside
    /// tests.
    pub replication_fail_ratio: f64,
    /// Fraction of nodes a chaos harness kills per round. No chaos harness
    /// ships in this crate; carried so a caller wiring one in has a place
    /// to put the knob. Must stay `0.0` outside tests.
    pub node_kill_rate: f64,
    /// How often a node would flush aggregate stats to an external
    /// collector, if one were wired in (none is; see DESIGN.md).
    pub stats_flush_interval: Duration,
    /// Fraction of puts that should fan out to every replica rather than
    /// just the preflist, for clients that want belt-and-suspenders
    /// durability at the cost of write latency. Unused until a caller
    /// opts a `put_with` call into it via `PutOptions`.
    pub all_replicas_write_ratio: f64,
    /// How often a node would tick its own status report to an operator
    /// dashboard, if one were wired in (none is; see DESIGN.md).
    pub report_tick_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], crate::network::DEFAULT_PORT)),
            join_addr: None,
            ring_bits: 6,
            replication_factor: 3,
            read_quorum: 2,
            write_quorum: 2,
            get_timeout: Duration::from_secs(10),
            put_timeout: Duration::from_secs(20),
            sync_interval: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(5),
            gossip_interval: Duration::from_secs(10),
            hashtree_tokens: DEFAULT_HASHTREE_TOKENS,
            mtree_children: 16,
            replication_fail_ratio: 0.0,
            node_kill_rate: 0.0,
            stats_flush_interval: Duration::from_secs(10),
            all_replicas_write_ratio: 0.9,
            report_tick_interval: Duration::from_millis(2500),
        }
    }
}

impl Config {
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

    pub fn quorums(mut self, r: usize, w: usize) -> Self {
        self.read_quorum = r;
        self.write_quorum = w;
        self
    }

    pub fn get_timeout(mut self, timeout: Duration) -> Self {
        self.get_timeout = timeout;
        self
    }

    pub fn put_timeout(mut self, timeout: Duration) -> Self {
        self.put_timeout = timeout;
        self
    }

    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub(crate) fn to_cluster_config(&self) -> crate::cluster::ClusterConfig {
        let mut cluster_config = crate::cluster::ClusterConfig::new()
            .bind_addr(self.bind_addr)
            .ring_bits(self.ring_bits)
            .replication_factor(self.replication_factor)
            .sync_interval(self.sync_interval);
        if let Some(join_addr) = self.join_addr {
            cluster_config = cluster_config.join(join_addr);
        }
        cluster_config
    }
}
