//! Hash computation for filesystem nodes
//!
//! A node's hash is the blake3 digest of its bincode-encoded `NodeRecord`.
//! `child_hashes` is a `BTreeMap`, so the encoding is deterministic.

use crate::error::FsError;
use crate::store;
use crate::tree::node::NodeRecord;
use crate::types::Hash;

/// Serialize the persistent fields of a node
pub fn encode_record(record: &NodeRecord) -> Result<Vec<u8>, FsError> {
    Ok(bincode::serialize(record)?)
}

/// Deserialize a node blob
///
/// A blob that does not decode is a local-store integrity error.
pub fn decode_record(bytes: &[u8]) -> Result<NodeRecord, FsError> {
    bincode::deserialize(bytes)
        .map_err(|e| FsError::SerializationFailure(format!("corrupt node blob: {}", e)))
}

/// Compute the content hash of a node record
pub fn compute_node_hash(record: &NodeRecord) -> Result<Hash, FsError> {
    Ok(store::digest(&encode_record(record)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::node::{EntryAttrs, NodeAttrs, NodeKind};
    use std::collections::BTreeMap;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    fn record() -> NodeRecord {
        let now = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let mut child_hashes = BTreeMap::new();
        child_hashes.insert("b".to_string(), [2u8; 32]);
        child_hashes.insert("a".to_string(), [1u8; 32]);
        NodeRecord {
            name: "dir".to_string(),
            attrs: NodeAttrs::new(5, NodeKind::Directory, &EntryAttrs::dir(), now),
            version: 3,
            prev_hash: Some([9u8; 32]),
            child_hashes,
            data_block_hashes: Vec::new(),
            owner: 1,
        }
    }

    #[test]
    fn test_hash_is_deterministic_and_field_sensitive() {
        let a = record();
        let b = record();
        assert_eq!(compute_node_hash(&a).unwrap(), compute_node_hash(&b).unwrap());

        let mut renamed = record();
        renamed.name = "other".to_string();
        assert_ne!(compute_node_hash(&a).unwrap(), compute_node_hash(&renamed).unwrap());

        let mut touched = record();
        touched.attrs.mtime = SystemTime::now();
        assert_ne!(compute_node_hash(&a).unwrap(), compute_node_hash(&touched).unwrap());
    }

    #[test]
    fn test_decode_garbage_is_serialization_failure() {
        let err = decode_record(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, FsError::SerializationFailure(_)));
    }

    #[test]
    fn test_decode_matches_encode() {
        let r = record();
        let bytes = encode_record(&r).unwrap();
        assert_eq!(decode_record(&bytes).unwrap(), r);
    }
}
