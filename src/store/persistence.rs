//! Sled-backed block store
//!
//! Blobs live in the `blocks` tree keyed by digest; the head record lives in the
//! `meta` tree under `HEAD_KEY`. A root commit writes both in one transaction.

use super::{digest, BlockStore};
use crate::error::StorageError;
use crate::heads::{Head, HEAD_KEY};
use crate::types::{short_hex, Hash, Inode, ReplicaId};
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use std::path::Path;
use tracing::debug;

const BLOCKS_TREE: &str = "blocks";
const META_TREE: &str = "meta";

/// Sled implementation of [`BlockStore`]
#[derive(Clone)]
pub struct SledBlockStore {
    db: sled::Db,
    blocks: sled::Tree,
    meta: sled::Tree,
}

impl SledBlockStore {
    /// Open (or create) a store at `path`; `wipe` discards any existing content
    pub fn open(path: &Path, wipe: bool) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = sled::open(path)?;
        let store = Self::from_db(db)?;
        if wipe {
            store.blocks.clear()?;
            store.meta.clear()?;
            debug!(path = %path.display(), "Wiped block store");
        }
        Ok(store)
    }

    /// Throwaway store that is deleted when dropped
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    pub fn from_db(db: sled::Db) -> Result<Self, StorageError> {
        let blocks = db.open_tree(BLOCKS_TREE)?;
        let meta = db.open_tree(META_TREE)?;
        Ok(Self { db, blocks, meta })
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

impl BlockStore for SledBlockStore {
    fn put(&self, bytes: &[u8]) -> Result<Hash, StorageError> {
        let hash = digest(bytes);
        if !self.blocks.contains_key(hash)? {
            self.blocks.insert(hash, bytes)?;
            debug!(hash = %short_hex(&hash), len = bytes.len(), "Stored blob");
        }
        Ok(hash)
    }

    fn get(&self, hash: &Hash) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.blocks.get(hash)?.map(|v| v.to_vec()))
    }

    fn contains(&self, hash: &Hash) -> Result<bool, StorageError> {
        Ok(self.blocks.contains_key(hash)?)
    }

    fn blob_count(&self) -> usize {
        self.blocks.len()
    }

    fn commit_root(
        &self,
        root_bytes: &[u8],
        next_inode: Inode,
        replica_id: ReplicaId,
    ) -> Result<Head, StorageError> {
        let root_hash = digest(root_bytes);
        let head = Head::new(root_hash, next_inode, replica_id);
        let head_bytes = head.encode()?;

        (&self.blocks, &self.meta)
            .transaction(|(blocks, meta)| {
                blocks.insert(&root_hash[..], root_bytes)?;
                meta.insert(HEAD_KEY, head_bytes.as_slice())?;
                Ok::<(), ConflictableTransactionError<()>>(())
            })
            .map_err(|e| match e {
                TransactionError::Storage(err) => StorageError::Sled(err),
                TransactionError::Abort(()) => {
                    StorageError::Serialization("root commit aborted".to_string())
                }
            })?;

        debug!(
            root = %short_hex(&root_hash),
            next_inode,
            "Committed root and head"
        );
        Ok(head)
    }

    fn load_head(&self) -> Result<Option<Head>, StorageError> {
        match self.meta.get(HEAD_KEY)? {
            Some(bytes) => Ok(Some(Head::decode(&bytes)?)),
            None => Ok(None),
        }
    }
}
