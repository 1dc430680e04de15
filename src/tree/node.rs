//! Filesystem node types
//!
//! `NodeRecord` is the persistent form that is serialized and hashed.
//! `DNode` is the live, materialized form: the same persistent fields plus the
//! transient state (parent index, buffered data, dirty flags, memoized hash).

use crate::types::{Hash, Inode, NodeId, ReplicaId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::SystemTime;

/// Kind of filesystem entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    File,
    Directory,
    Symlink,
}

/// Node attributes, part of the hashed state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAttrs {
    pub inode: Inode,
    pub kind: NodeKind,
    /// Permission bits
    pub perm: u32,
    pub size: u64,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub crtime: SystemTime,
}

impl NodeAttrs {
    pub fn new(inode: Inode, kind: NodeKind, entry: &EntryAttrs, now: SystemTime) -> Self {
        NodeAttrs {
            inode,
            kind,
            perm: entry.perm,
            size: 0,
            nlink: 1,
            uid: entry.uid,
            gid: entry.gid,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }
}

/// Caller-supplied attributes for a new entry
#[derive(Debug, Clone, Copy)]
pub struct EntryAttrs {
    pub perm: u32,
    pub uid: u32,
    pub gid: u32,
}

impl EntryAttrs {
    pub fn file() -> Self {
        EntryAttrs {
            perm: 0o644,
            uid: 0,
            gid: 0,
        }
    }

    pub fn dir() -> Self {
        EntryAttrs {
            perm: 0o755,
            uid: 0,
            gid: 0,
        }
    }
}

/// Attribute update; `None` fields are left untouched
#[derive(Debug, Clone, Default)]
pub struct SetAttr {
    pub perm: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
}

/// Persistent fields of a node: exactly what is serialized and hashed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub name: String,
    pub attrs: NodeAttrs,
    pub version: u64,
    /// Hash of the immediately preceding persisted version
    pub prev_hash: Option<Hash>,
    pub child_hashes: BTreeMap<String, Hash>,
    pub data_block_hashes: Vec<Hash>,
    pub owner: ReplicaId,
}

/// A directory entry slot: known only by hash, or materialized in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildSlot {
    Unloaded(Hash),
    Loaded(NodeId),
}

/// Live node
#[derive(Debug, Clone)]
pub struct DNode {
    pub name: String,
    pub attrs: NodeAttrs,
    pub version: u64,
    pub prev_hash: Option<Hash>,
    pub children: BTreeMap<String, ChildSlot>,
    pub data_block_hashes: Vec<Hash>,
    pub owner: ReplicaId,

    pub(crate) parent: Option<NodeId>,
    /// Further directories binding this node through hard links
    pub(crate) links: Vec<NodeId>,
    pub(crate) buffered: Option<Vec<u8>>,
    pub(crate) dirty: bool,
    pub(crate) subtree_dirty: bool,
    pub(crate) archived: bool,
    pub(crate) content_hash: Option<Hash>,
    /// `attrs.mtime` as of the last flush
    pub(crate) flushed_mtime: Option<SystemTime>,
}

impl DNode {
    /// Fresh node that has never been flushed
    pub fn new(name: &str, attrs: NodeAttrs, version: u64, owner: ReplicaId) -> Self {
        DNode {
            name: name.to_string(),
            attrs,
            version,
            prev_hash: None,
            children: BTreeMap::new(),
            data_block_hashes: Vec::new(),
            owner,
            parent: None,
            links: Vec::new(),
            buffered: None,
            dirty: false,
            subtree_dirty: false,
            archived: false,
            content_hash: None,
            flushed_mtime: None,
        }
    }

    /// Materialize a stored version; all children start out unloaded
    pub fn from_record(record: NodeRecord, hash: Hash) -> Self {
        let flushed_mtime = Some(record.attrs.mtime);
        DNode {
            name: record.name,
            attrs: record.attrs,
            version: record.version,
            prev_hash: record.prev_hash,
            children: record
                .child_hashes
                .into_iter()
                .map(|(name, hash)| (name, ChildSlot::Unloaded(hash)))
                .collect(),
            data_block_hashes: record.data_block_hashes,
            owner: record.owner,
            parent: None,
            links: Vec::new(),
            buffered: None,
            dirty: false,
            subtree_dirty: false,
            archived: false,
            content_hash: Some(hash),
            flushed_mtime,
        }
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_subtree_dirty(&self) -> bool {
        self.subtree_dirty
    }

    pub fn is_archived(&self) -> bool {
        self.archived
    }

    /// Hash of the last flushed version; stale while dirty
    pub fn content_hash(&self) -> Option<Hash> {
        self.content_hash
    }

    pub fn has_buffered_data(&self) -> bool {
        self.buffered.is_some()
    }
}

/// Directory listing entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub inode: Inode,
    pub kind: NodeKind,
}
