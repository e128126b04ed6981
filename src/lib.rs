//! # quorumdb
//!
//! An eventually-consistent, replicated key-value store: consistent-hash
//! ring partitioning, dotted version vectors for causality tracking,
//! sloppy-quorum reads and writes, and Merkle-tree anti-entropy to
//! reconcile replicas that fell behind.
//!
//! ## Quick Start
//!
//! ```ignore
//! use quorumdb::{QuorumDb, Config, Context};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = QuorumDb::start(Config::new()).await?;
//!
//!     let ctx = db.put(b"users", b"alice", Context::new(), json!({"name": "Alice"})).await?;
//!     let values = db.get(b"users", b"alice").await?;
//!     println!("{:?}", values);
//!
//!     db.delete(b"users", b"alice", ctx).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`ring`] — consistent-hash ring and preference lists
//! - [`clock`] — dotted version vectors
//! - [`storage`] — pluggable storage backend trait
//! - [`vnode`] — the per-partition actor owning storage, clock, and Merkle
//!   tree state
//! - [`coordinator`] — get/put quorum FSMs
//! - [`reconciliation`] — Merkle trees and the anti-entropy exchange
//!   protocol
//! - [`network`] / [`cluster`] — wire protocol and cluster membership
//! - [`core`] — the `QuorumDb` handle tying it all together
//!
//! All operations are thread-safe; `QuorumDb` is cheap to clone (an `Arc`
//! internally) and shareable across tasks.

mod core;
mod error;
mod types;

pub mod clock;
pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod network;
pub mod reconciliation;
pub mod ring;
pub mod storage;
pub mod vnode;

#[cfg(feature = "http")]
pub mod http;

pub use clock::{Clock, Context};
pub use cluster::{ClusterConfig, ClusterNode, PartitionState};
pub use config::Config;
pub use core::QuorumDb;
pub use error::{DbError, DbResult, StorageError};
pub use network::{NodeId, PeerInfo, PeerStatus};
pub use ring::RingSnapshot;
pub use types::{tombstone_value, Bkey, Dot, VnodeId};

// Re-export commonly used external types for convenience.
pub use serde_json::{json, Value as JsonValue};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use quorumdb::prelude::*;
/// ```
pub mod prelude {
    pub use crate::clock::{Clock, Context};
    pub use crate::config::Config;
    pub use crate::core::QuorumDb;
    pub use crate::error::{DbError, DbResult};
    pub use crate::types::Bkey;
    pub use serde_json::{json, Value as JsonValue};
}

// ============================================================================
// Logging and Observability
// ============================================================================

/// Initialize the logging system. Call once at application startup.
///
/// The log level is controlled via the `QUORUMDB_LOG` environment
/// variable:
/// - `QUORUMDB_LOG=error` - Only errors
/// - `QUORUMDB_LOG=warn` - Errors and warnings
/// - `QUORUMDB_LOG=info` - General information (default)
/// - `QUORUMDB_LOG=debug` - Debug information
/// - `QUORUMDB_LOG=trace` - Verbose tracing
pub fn init_logging() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env("QUORUMDB_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

/// Initialize logging with a specific level, ignoring `QUORUMDB_LOG`.
pub fn init_logging_with_level(level: &str) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::new(level);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
