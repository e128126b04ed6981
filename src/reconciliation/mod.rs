//! Anti-entropy: per-vnode Merkle trees (C7) and the exchange protocol
//! that walks them against a peer to find and repair divergence.
pub mod exchange;
pub mod merkle;

pub use exchange::{Exchange, ExchangePeer, TokenBucket, DEFAULT_HASHTREE_TOKENS};
pub use merkle::MerkleTree;
