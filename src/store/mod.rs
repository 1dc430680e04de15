//! Block Store
//!
//! Content-addressed blob storage. Keys are blake3 digests of the values, so a
//! put is idempotent and a get either returns the exact bytes or nothing.
//! Serialized nodes and raw data chunks share one namespace.

pub mod chunker;
pub mod persistence;

pub use chunker::Chunker;
pub use persistence::SledBlockStore;

use crate::error::StorageError;
use crate::heads::Head;
use crate::types::{Hash, Inode, ReplicaId};

/// Digest used as the content address of a blob
pub fn digest(bytes: &[u8]) -> Hash {
    blake3::hash(bytes).into()
}

/// Check that `bytes` really are the blob addressed by `expected`
pub fn verify(expected: &Hash, bytes: &[u8]) -> Result<(), StorageError> {
    let actual = digest(bytes);
    if &actual != expected {
        return Err(StorageError::Corrupt {
            expected: *expected,
            actual,
        });
    }
    Ok(())
}

/// Block Store interface
pub trait BlockStore: Send + Sync {
    /// Store a blob under its digest; storing identical bytes again is a no-op
    fn put(&self, bytes: &[u8]) -> Result<Hash, StorageError>;

    /// Fetch a blob; `None` means "not here", callers may try a peer
    fn get(&self, hash: &Hash) -> Result<Option<Vec<u8>>, StorageError>;

    fn contains(&self, hash: &Hash) -> Result<bool, StorageError> {
        Ok(self.get(hash)?.is_some())
    }

    /// Number of distinct blobs held
    fn blob_count(&self) -> usize;

    /// Store a new root blob and the head pointing at it in one atomic step
    fn commit_root(
        &self,
        root_bytes: &[u8],
        next_inode: Inode,
        replica_id: ReplicaId,
    ) -> Result<Head, StorageError>;

    fn load_head(&self) -> Result<Option<Head>, StorageError>;

    /// Chunk `data` and store every chunk, returning the ordered chunk hashes
    fn put_chunked(&self, chunker: &Chunker, data: &[u8]) -> Result<Vec<Hash>, StorageError> {
        chunker.chunks(data).map(|chunk| self.put(chunk)).collect()
    }
}
