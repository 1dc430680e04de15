//! Core types for the versioned distributed file store.

/// Hash: blake3 digest identifying a blob in the block store
pub type Hash = [u8; 32];

/// ReplicaId: numeric replica identity (the `pid` column of the peer table)
pub type ReplicaId = u32;

/// Inode: filesystem inode number, allocated from the head's `next_inode`
pub type Inode = u64;

/// NodeId: arena handle of a materialized node inside one `NodeGraph`
///
/// Only meaningful within the process that produced it; never persisted.
pub type NodeId = usize;

/// Short hex form of a hash for log fields.
pub fn short_hex(hash: &Hash) -> String {
    hex::encode(&hash[..6])
}

/// Parse a full 64-character hex digest.
pub fn parse_hash(s: &str) -> Option<Hash> {
    let bytes = hex::decode(s.trim()).ok()?;
    bytes.try_into().ok()
}
