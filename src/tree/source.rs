//! Remote sources
//!
//! Where the node graph turns when a node or block is not in the local store.

use crate::error::FsError;
use crate::types::{Hash, ReplicaId};
use async_trait::async_trait;

/// Pull side of the replication protocol
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Fetch a serialized node from `owner` (and, failing that, other peers)
    async fn fetch_node(&self, owner: ReplicaId, hash: &Hash) -> Result<Vec<u8>, FsError>;

    /// Fetch a data chunk from `owner` (and, failing that, other peers)
    async fn fetch_block(&self, owner: ReplicaId, hash: &Hash) -> Result<Vec<u8>, FsError>;
}

/// Source for a replica with no peers
#[derive(Debug, Default, Clone, Copy)]
pub struct Offline;

#[async_trait]
impl RemoteSource for Offline {
    async fn fetch_node(&self, owner: ReplicaId, hash: &Hash) -> Result<Vec<u8>, FsError> {
        Err(FsError::NotFound(format!(
            "node {} (owner {}) not stored locally",
            hex::encode(hash),
            owner
        )))
    }

    async fn fetch_block(&self, owner: ReplicaId, hash: &Hash) -> Result<Vec<u8>, FsError> {
        Err(FsError::NotFound(format!(
            "block {} (owner {}) not stored locally",
            hex::encode(hash),
            owner
        )))
    }
}
