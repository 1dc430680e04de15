//! Replica Head
//!
//! Per-replica pointer to the current root version and the allocation counters.
//! Stored under a fixed well-known key next to the content-addressed blobs.

use crate::error::StorageError;
use crate::types::{Hash, Inode, ReplicaId};
use serde::{Deserialize, Serialize};

/// Well-known key of the head record
pub const HEAD_KEY: &[u8] = b"head";

/// Head record: root hash plus allocation state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Head {
    pub root_hash: Hash,
    pub next_inode: Inode,
    pub replica_id: ReplicaId,
}

impl Head {
    pub fn new(root_hash: Hash, next_inode: Inode, replica_id: ReplicaId) -> Self {
        Head {
            root_hash,
            next_inode,
            replica_id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, StorageError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        Ok(bincode::deserialize(bytes)?)
    }
}
