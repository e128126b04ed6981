//! Error types for quorumdb operations.
//!
//! All fallible operations return `Result<T, DbError>`. Storage-backend
//! failures are wrapped in `StorageError` and carried through as a variant
//! rather than flattened to a string, so callers can match on the kind.
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by the storage adapter (`Storage` trait, see `storage.rs`).
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageError {
    /// The underlying engine could not be opened after exhausting its retry
    /// budget (see `Storage::open`'s lock-retry policy).
    #[error("storage engine locked after {attempts} attempts")]
    LockContention { attempts: u32 },

    /// A read/write/delete/fold call failed against an already-open engine.
    #[error("storage operation failed: {0}")]
    Backend(String),

    /// `destroy` could not remove the underlying engine files.
    #[error("storage destroy failed after {attempts} attempts: {reason}")]
    DestroyFailed { attempts: u32, reason: String },
}

/// The top-level error type for quorumdb operations. Plain enough to
/// serialize as-is over the wire (`network.rs` RPC responses) rather than
/// flattening to a string and losing the variant.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DbError {
    /// No replica in the preflist held a value for the key (or all
    /// replicas agree it is a tombstone).
    #[error("key not found")]
    NotFound,

    /// The storage adapter failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The coordinator did not reach quorum before its deadline.
    #[error("operation timed out waiting for quorum")]
    Timeout,

    /// Too many in-flight operations; the vnode or coordinator pool is
    /// saturated and the request was rejected rather than queued.
    #[error("node overloaded, try again later")]
    Overload,

    /// The vnode addressed by this request has not finished handoff /
    /// startup and cannot safely serve reads or writes yet.
    #[error("vnode not ready")]
    NotReady,

    /// The causal context supplied with a write does not correspond to
    /// any value this node can reconcile against (malformed or stale
    /// beyond what `sync` can merge).
    #[error("invalid causal context")]
    InvalidContext,
}

/// Result type alias for quorumdb operations.
pub type DbResult<T> = Result<T, DbError>;
