//! Node Graph
//!
//! Arena of live nodes keyed by `NodeId`. A directory owns its entries through
//! `ChildSlot`s: an entry is either known only by hash (`Unloaded`) or
//! materialized in the arena (`Loaded`). The `parent` link is a plain id used
//! for dirty propagation and never owns anything.
//!
//! Every mutation marks the touched node dirty and its ancestors
//! `subtree_dirty`. A flush drains that state bottom-up, writing one immutable
//! blob per changed node, and a root flush commits the new head.

use super::hasher::{decode_record, encode_record};
use super::node::{
    ChildSlot, DNode, DirEntry, EntryAttrs, NodeAttrs, NodeKind, NodeRecord, SetAttr,
};
use super::source::RemoteSource;
use crate::error::FsError;
use crate::heads::Head;
use crate::store::{self, BlockStore, Chunker};
use crate::types::{short_hex, Hash, Inode, NodeId, ReplicaId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Inode of every replica's root directory
pub const ROOT_INODE: Inode = 1;

/// A fresh root is backdated so any peer's first push is accepted
const FRESH_ROOT_AGE: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum BlobKind {
    Node,
    Block,
}

/// What `receive` did with an incoming node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Not newer than the local root; nothing changed
    Stale,
    /// Stored and merged into the live node carrying this inode
    Applied { inode: Inode, root: bool },
    /// Stored, but no live node carries this inode
    Stored { inode: Inode },
}

/// The versioned tree of one replica
pub struct NodeGraph {
    pub(super) store: Arc<dyn BlockStore>,
    chunker: Chunker,
    pub(super) replica_id: ReplicaId,
    pub(super) nodes: HashMap<NodeId, DNode>,
    by_inode: HashMap<Inode, NodeId>,
    /// Historical views, keyed by (directory, requested name)
    pub(super) views: HashMap<(NodeId, String), NodeId>,
    next_id: NodeId,
    root: NodeId,
    pub(super) next_inode: Inode,
    version: u64,
}

impl NodeGraph {
    /// Open the tree recorded by the store's head, or start an empty one
    pub fn open(store: Arc<dyn BlockStore>, replica_id: ReplicaId) -> Result<Self, FsError> {
        let mut graph = NodeGraph {
            store,
            chunker: Chunker::new(),
            replica_id,
            nodes: HashMap::new(),
            by_inode: HashMap::new(),
            views: HashMap::new(),
            next_id: 0,
            root: 0,
            next_inode: ROOT_INODE + 1,
            version: 1,
        };

        match graph.store.load_head()? {
            Some(head) => {
                let bytes = graph.store.get(&head.root_hash)?.ok_or_else(|| {
                    FsError::SerializationFailure(format!(
                        "head points at missing root {}",
                        short_hex(&head.root_hash)
                    ))
                })?;
                store::verify(&head.root_hash, &bytes)?;
                let record = decode_record(&bytes)?;
                graph.version = record.version + 1;
                graph.next_inode = head.next_inode.max(record.attrs.inode + 1);
                graph.root = graph.insert(DNode::from_record(record, head.root_hash));
                info!(
                    root = %short_hex(&head.root_hash),
                    next_inode = graph.next_inode,
                    version = graph.version,
                    "Loaded head"
                );
            }
            None => {
                let now = SystemTime::now();
                let past = now.checked_sub(FRESH_ROOT_AGE).unwrap_or(now);
                let attrs = NodeAttrs::new(ROOT_INODE, NodeKind::Directory, &EntryAttrs::dir(), past);
                let root = DNode::new("", attrs, graph.version, replica_id);
                graph.root = graph.insert(root);
                let (hash, bytes) = graph.seal(graph.root, None)?;
                graph
                    .store
                    .commit_root(&bytes, graph.next_inode, replica_id)?;
                info!(root = %short_hex(&hash), "Initialized empty root");
            }
        }
        Ok(graph)
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    /// Version that the next flush assigns
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn next_inode(&self) -> Inode {
        self.next_inode
    }

    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    /// Whether the root has anything to flush
    pub fn is_dirty(&self) -> bool {
        self.nodes
            .get(&self.root)
            .map(|n| n.dirty || n.subtree_dirty)
            .unwrap_or(false)
    }

    pub fn node(&self, id: NodeId) -> Result<&DNode, FsError> {
        self.nodes
            .get(&id)
            .ok_or_else(|| FsError::NotFound(format!("node {} is no longer live", id)))
    }

    pub(super) fn node_mut(&mut self, id: NodeId) -> Result<&mut DNode, FsError> {
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| FsError::NotFound(format!("node {} is no longer live", id)))
    }

    /// Live node carrying `inode`, if materialized
    pub fn node_by_inode(&self, inode: Inode) -> Option<NodeId> {
        self.by_inode.get(&inode).copied()
    }

    pub fn live_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn get_attr(&self, id: NodeId) -> Result<NodeAttrs, FsError> {
        Ok(self.node(id)?.attrs.clone())
    }

    pub(super) fn insert(&mut self, node: DNode) -> NodeId {
        let id = self.next_id;
        self.next_id += 1;
        if !node.archived {
            self.by_inode.insert(node.attrs.inode, id);
        }
        self.nodes.insert(id, node);
        id
    }

    fn ensure_writable(&self, id: NodeId) -> Result<(), FsError> {
        let node = self.node(id)?;
        if node.archived {
            return Err(FsError::PermissionDenied(format!(
                "'{}' belongs to a historical view",
                node.name
            )));
        }
        Ok(())
    }

    fn ensure_dir(&self, id: NodeId) -> Result<(), FsError> {
        let node = self.node(id)?;
        if !node.attrs.is_dir() {
            return Err(FsError::InvalidOperation(format!(
                "'{}' is not a directory",
                node.name
            )));
        }
        Ok(())
    }

    /// Fetch a blob from the local store, falling back to peers
    ///
    /// A fetched blob is verified against its address and cached locally.
    pub(super) async fn load_blob(
        &self,
        remote: &dyn RemoteSource,
        owner: ReplicaId,
        hash: &Hash,
        kind: BlobKind,
    ) -> Result<Vec<u8>, FsError> {
        if let Some(bytes) = self.store.get(hash)? {
            return Ok(bytes);
        }
        let fetched = match kind {
            BlobKind::Node => remote.fetch_node(owner, hash).await,
            BlobKind::Block => remote.fetch_block(owner, hash).await,
        };
        let bytes = fetched.map_err(|e| {
            if e.is_remote_miss() {
                FsError::NotFound(format!("{} unavailable: {}", short_hex(hash), e))
            } else {
                e
            }
        })?;
        store::verify(hash, &bytes)?;
        self.store.put(&bytes)?;
        debug!(hash = %short_hex(hash), owner, ?kind, "Cached remote blob");
        Ok(bytes)
    }

    pub(super) async fn load_record(
        &self,
        remote: &dyn RemoteSource,
        owner: ReplicaId,
        hash: &Hash,
    ) -> Result<NodeRecord, FsError> {
        let bytes = self.load_blob(remote, owner, hash, BlobKind::Node).await?;
        decode_record(&bytes)
    }

    /// Resolve an entry slot into a live node
    pub(super) async fn materialize(
        &mut self,
        parent: NodeId,
        name: &str,
        remote: &dyn RemoteSource,
    ) -> Result<NodeId, FsError> {
        self.ensure_dir(parent)?;
        let (slot, owner, archived) = {
            let p = self.node(parent)?;
            (p.children.get(name).copied(), p.owner, p.archived)
        };
        match slot {
            None => Err(FsError::NotFound(name.to_string())),
            Some(ChildSlot::Loaded(id)) => Ok(id),
            Some(ChildSlot::Unloaded(hash)) => {
                let record = self.load_record(remote, owner, &hash).await?;
                let mut node = DNode::from_record(record, hash);
                node.parent = Some(parent);
                node.archived = archived;
                let id = self.insert(node);
                self.node_mut(parent)?
                    .children
                    .insert(name.to_string(), ChildSlot::Loaded(id));
                debug!(name, hash = %short_hex(&hash), "Materialized node");
                Ok(id)
            }
        }
    }

    /// Find `name` in directory `parent`
    ///
    /// A name of the form `base@when` that is not itself an entry opens a
    /// historical view of `base`.
    pub async fn lookup(
        &mut self,
        parent: NodeId,
        name: &str,
        remote: &dyn RemoteSource,
    ) -> Result<NodeId, FsError> {
        if let Some(id) = self.views.get(&(parent, name.to_string())) {
            return Ok(*id);
        }
        self.ensure_dir(parent)?;
        if !self.node(parent)?.children.contains_key(name) {
            if let Some((base, when)) = name.rsplit_once('@') {
                if !base.is_empty() && !when.is_empty() {
                    return self.open_historical(parent, base, when, remote).await;
                }
            }
        }
        self.materialize(parent, name, remote).await
    }

    /// Walk a slash-separated path from the root
    pub async fn resolve(&mut self, path: &str, remote: &dyn RemoteSource) -> Result<NodeId, FsError> {
        let mut current = self.root;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current = self.lookup(current, part, remote).await?;
        }
        Ok(current)
    }

    /// Set `dirty` on the node and `subtree_dirty` up to the root
    ///
    /// A hard-linked node has several parents; every chain is marked.
    pub fn mark_dirty(&mut self, id: NodeId) -> Result<(), FsError> {
        self.node_mut(id)?.dirty = true;
        let mut pending = vec![id];
        while let Some(cur) = pending.pop() {
            let node = self.node_mut(cur)?;
            if node.subtree_dirty && cur != id {
                continue;
            }
            node.subtree_dirty = true;
            pending.extend(node.parent);
            pending.extend(node.links.iter().copied());
        }
        Ok(())
    }

    /// Record that `dir` binds `child`
    fn attach(&mut self, child: NodeId, dir: NodeId) -> Result<(), FsError> {
        let node = self.node_mut(child)?;
        match node.parent {
            None => node.parent = Some(dir),
            Some(parent) if parent != dir && !node.links.contains(&dir) => node.links.push(dir),
            Some(_) => {}
        }
        Ok(())
    }

    /// Forget `dir` as a parent of `child` once no name in `dir` binds it
    ///
    /// Returns whether `child` is still bound somewhere.
    fn detach(&mut self, child: NodeId, dir: NodeId) -> bool {
        let still_bound = self.nodes.get(&dir).is_some_and(|d| {
            d.children
                .values()
                .any(|slot| *slot == ChildSlot::Loaded(child))
        });
        let Some(node) = self.nodes.get_mut(&child) else {
            return false;
        };
        if !still_bound {
            if node.parent == Some(dir) {
                node.parent = node.links.pop();
            } else {
                node.links.retain(|d| *d != dir);
            }
        }
        node.parent.is_some()
    }

    fn create_entry(
        &mut self,
        parent: NodeId,
        name: &str,
        kind: NodeKind,
        attrs: &EntryAttrs,
    ) -> Result<NodeId, FsError> {
        self.ensure_writable(parent)?;
        self.ensure_dir(parent)?;
        validate_name(name)?;
        if self.node(parent)?.children.contains_key(name) {
            return Err(FsError::AlreadyExists(name.to_string()));
        }

        let inode = self.next_inode;
        self.next_inode += 1;
        let mut node = DNode::new(
            name,
            NodeAttrs::new(inode, kind, attrs, SystemTime::now()),
            self.version,
            self.replica_id,
        );
        node.parent = Some(parent);
        let id = self.insert(node);
        self.node_mut(parent)?
            .children
            .insert(name.to_string(), ChildSlot::Loaded(id));
        self.mark_dirty(id)?;
        debug!(name, inode, ?kind, "Created entry");
        Ok(id)
    }

    /// Create an empty file
    pub fn create(&mut self, parent: NodeId, name: &str, attrs: &EntryAttrs) -> Result<NodeId, FsError> {
        self.create_entry(parent, name, NodeKind::File, attrs)
    }

    pub fn mkdir(&mut self, parent: NodeId, name: &str, attrs: &EntryAttrs) -> Result<NodeId, FsError> {
        self.create_entry(parent, name, NodeKind::Directory, attrs)
    }

    /// Create a symlink whose content is `target`
    pub fn symlink(&mut self, parent: NodeId, name: &str, target: &str) -> Result<NodeId, FsError> {
        let attrs = EntryAttrs {
            perm: 0o777,
            ..EntryAttrs::file()
        };
        let id = self.create_entry(parent, name, NodeKind::Symlink, &attrs)?;
        let node = self.node_mut(id)?;
        node.buffered = Some(target.as_bytes().to_vec());
        node.attrs.size = target.len() as u64;
        Ok(id)
    }

    pub async fn readlink(&mut self, id: NodeId, remote: &dyn RemoteSource) -> Result<String, FsError> {
        if self.node(id)?.attrs.kind != NodeKind::Symlink {
            return Err(FsError::InvalidOperation(format!(
                "'{}' is not a symlink",
                self.node(id)?.name
            )));
        }
        let bytes = self.read(id, remote).await?;
        String::from_utf8(bytes)
            .map_err(|e| FsError::SerializationFailure(format!("symlink target: {}", e)))
    }

    /// Bind `new_name` in `new_parent` to an existing non-directory node
    pub fn hardlink(&mut self, target: NodeId, new_parent: NodeId, new_name: &str) -> Result<(), FsError> {
        self.ensure_writable(target)?;
        self.ensure_writable(new_parent)?;
        self.ensure_dir(new_parent)?;
        validate_name(new_name)?;
        if self.node(target)?.attrs.is_dir() {
            return Err(FsError::InvalidOperation(
                "hard links to directories are not allowed".to_string(),
            ));
        }
        if self.node(new_parent)?.children.contains_key(new_name) {
            return Err(FsError::AlreadyExists(new_name.to_string()));
        }
        self.node_mut(new_parent)?
            .children
            .insert(new_name.to_string(), ChildSlot::Loaded(target));
        self.attach(target, new_parent)?;
        self.node_mut(target)?.attrs.nlink += 1;
        self.mark_dirty(target)?;
        Ok(())
    }

    async fn read_blocks(&self, id: NodeId, remote: &dyn RemoteSource) -> Result<Vec<u8>, FsError> {
        let node = self.node(id)?;
        let owner = node.owner;
        let hashes = node.data_block_hashes.clone();
        let mut data = Vec::with_capacity(node.attrs.size as usize);
        for hash in &hashes {
            let chunk = self.load_blob(remote, owner, hash, BlobKind::Block).await?;
            data.extend_from_slice(&chunk);
        }
        Ok(data)
    }

    async fn ensure_buffered(&mut self, id: NodeId, remote: &dyn RemoteSource) -> Result<(), FsError> {
        if self.node(id)?.buffered.is_none() {
            let data = self.read_blocks(id, remote).await?;
            self.node_mut(id)?.buffered = Some(data);
        }
        Ok(())
    }

    /// Whole content of a file or symlink
    pub async fn read(&mut self, id: NodeId, remote: &dyn RemoteSource) -> Result<Vec<u8>, FsError> {
        let node = self.node(id)?;
        if node.attrs.is_dir() {
            return Err(FsError::InvalidOperation(format!("'{}' is a directory", node.name)));
        }
        if let Some(buffered) = &node.buffered {
            return Ok(buffered.clone());
        }
        self.read_blocks(id, remote).await
    }

    /// Overwrite `data` at `offset`, growing the file as needed
    pub async fn write(
        &mut self,
        id: NodeId,
        offset: u64,
        data: &[u8],
        remote: &dyn RemoteSource,
    ) -> Result<usize, FsError> {
        self.ensure_writable(id)?;
        if self.node(id)?.attrs.kind != NodeKind::File {
            return Err(FsError::InvalidOperation(format!(
                "'{}' is not a regular file",
                self.node(id)?.name
            )));
        }
        let start = usize::try_from(offset)
            .map_err(|_| FsError::InvalidOperation(format!("offset {} out of range", offset)))?;
        let end = start
            .checked_add(data.len())
            .ok_or_else(|| FsError::InvalidOperation("write past end of address space".to_string()))?;

        self.ensure_buffered(id, remote).await?;
        let node = self.node_mut(id)?;
        let buf = node.buffered.get_or_insert_with(Vec::new);
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[start..end].copy_from_slice(data);
        node.attrs.size = buf.len() as u64;
        self.mark_dirty(id)?;
        Ok(data.len())
    }

    pub async fn set_attr(
        &mut self,
        id: NodeId,
        update: &SetAttr,
        remote: &dyn RemoteSource,
    ) -> Result<NodeAttrs, FsError> {
        self.ensure_writable(id)?;
        if let Some(size) = update.size {
            if self.node(id)?.attrs.is_dir() {
                return Err(FsError::InvalidOperation("cannot resize a directory".to_string()));
            }
            let len = usize::try_from(size)
                .map_err(|_| FsError::InvalidOperation(format!("size {} out of range", size)))?;
            self.ensure_buffered(id, remote).await?;
            let node = self.node_mut(id)?;
            node.buffered.get_or_insert_with(Vec::new).resize(len, 0);
            node.attrs.size = size;
        }

        let node = self.node_mut(id)?;
        if let Some(perm) = update.perm {
            node.attrs.perm = perm;
        }
        if let Some(uid) = update.uid {
            node.attrs.uid = uid;
        }
        if let Some(gid) = update.gid {
            node.attrs.gid = gid;
        }
        if let Some(atime) = update.atime {
            node.attrs.atime = atime;
        }
        if let Some(mtime) = update.mtime {
            node.attrs.mtime = mtime;
        }
        node.attrs.ctime = SystemTime::now();
        let attrs = node.attrs.clone();
        self.mark_dirty(id)?;
        Ok(attrs)
    }

    /// Commit a closed file's buffered bytes to the block store
    ///
    /// The node stays dirty; the next flush records the new block list.
    pub fn flush_on_close(&mut self, id: NodeId) -> Result<(), FsError> {
        let replica_id = self.replica_id;
        let node = self
            .nodes
            .get_mut(&id)
            .ok_or_else(|| FsError::NotFound(format!("node {} is no longer live", id)))?;
        if !node.dirty {
            return Ok(());
        }
        if let Some(buf) = node.buffered.take() {
            node.data_block_hashes = self.store.put_chunked(&self.chunker, &buf)?;
            node.attrs.size = buf.len() as u64;
            node.owner = replica_id;
            debug!(
                name = %node.name,
                blocks = node.data_block_hashes.len(),
                "Committed file data on close"
            );
        }
        Ok(())
    }

    pub async fn read_dir(&mut self, id: NodeId, remote: &dyn RemoteSource) -> Result<Vec<DirEntry>, FsError> {
        self.ensure_dir(id)?;
        let names: Vec<String> = self.node(id)?.children.keys().cloned().collect();
        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            match self.materialize(id, &name, remote).await {
                Ok(child) => {
                    let attrs = &self.node(child)?.attrs;
                    entries.push(DirEntry {
                        inode: attrs.inode,
                        kind: attrs.kind,
                        name,
                    });
                }
                Err(e) => warn!(name = %name, error = %e, "Skipping unreadable entry"),
            }
        }
        Ok(entries)
    }

    /// Drop `name` from `parent`
    pub fn remove(&mut self, parent: NodeId, name: &str) -> Result<(), FsError> {
        self.ensure_writable(parent)?;
        self.ensure_dir(parent)?;
        let slot = self
            .node_mut(parent)?
            .children
            .remove(name)
            .ok_or_else(|| FsError::NotFound(name.to_string()))?;

        if let ChildSlot::Loaded(child) = slot {
            let node = self.node_mut(child)?;
            node.attrs.nlink = node.attrs.nlink.saturating_sub(1);
            if !self.prune(child, parent) {
                self.mark_dirty(child)?;
            }
        }
        self.mark_dirty(parent)?;
        debug!(name, "Removed entry");
        Ok(())
    }

    /// Move an entry, materializing it first
    pub async fn rename(
        &mut self,
        parent: NodeId,
        old_name: &str,
        new_dir: NodeId,
        new_name: &str,
        remote: &dyn RemoteSource,
    ) -> Result<(), FsError> {
        self.ensure_writable(parent)?;
        self.ensure_writable(new_dir)?;
        self.ensure_dir(new_dir)?;
        validate_name(new_name)?;
        if parent == new_dir && old_name == new_name {
            return Ok(());
        }

        let child = self.materialize(parent, old_name, remote).await?;
        let mut current = Some(new_dir);
        while let Some(cur) = current {
            if cur == child {
                return Err(FsError::InvalidOperation(format!(
                    "cannot move '{}' beneath itself",
                    old_name
                )));
            }
            current = self.node(cur)?.parent;
        }

        if self.node(new_dir)?.children.contains_key(new_name) {
            let existing = self.materialize(new_dir, new_name, remote).await?;
            let node = self.node(existing)?;
            if node.attrs.is_dir() && !node.children.is_empty() {
                return Err(FsError::InvalidOperation(format!(
                    "target '{}' is a non-empty directory",
                    new_name
                )));
            }
            self.remove(new_dir, new_name)?;
        }

        self.node_mut(parent)?.children.remove(old_name);
        self.detach(child, parent);
        {
            let node = self.node_mut(child)?;
            node.name = new_name.to_string();
            node.attrs.ctime = SystemTime::now();
        }
        self.node_mut(new_dir)?
            .children
            .insert(new_name.to_string(), ChildSlot::Loaded(child));
        self.attach(child, new_dir)?;
        self.mark_dirty(parent)?;
        self.mark_dirty(child)?;
        debug!(old_name, new_name, "Renamed entry");
        Ok(())
    }

    /// Unbind `id` from directory `from`, dropping it and its loaded
    /// descendants from the arena when nothing else binds it
    ///
    /// Returns whether the node was dropped.
    fn prune(&mut self, id: NodeId, from: NodeId) -> bool {
        if self.detach(id, from) {
            return false;
        }
        let Some(node) = self.nodes.remove(&id) else {
            return false;
        };
        if self.by_inode.get(&node.attrs.inode) == Some(&id) {
            self.by_inode.remove(&node.attrs.inode);
        }
        self.views.retain(|(dir, _), _| *dir != id);
        for slot in node.children.values() {
            if let ChildSlot::Loaded(child) = slot {
                self.prune(*child, id);
            }
        }
        true
    }

    fn child_hashes(&self, id: NodeId) -> Result<BTreeMap<String, Hash>, FsError> {
        self.node(id)?
            .children
            .iter()
            .map(|(name, slot)| -> Result<(String, Hash), FsError> {
                let hash = match slot {
                    ChildSlot::Unloaded(hash) => *hash,
                    ChildSlot::Loaded(child) => self.node(*child)?.content_hash.ok_or_else(|| {
                        FsError::InvalidOperation(format!("child '{}' was never flushed", name))
                    })?,
                };
                Ok((name.clone(), hash))
            })
            .collect()
    }

    /// Produce the next immutable version of a node
    ///
    /// Buffered data is chunked into the store, `prev_hash` takes the old
    /// content hash, and `mtime` is moved to `now` (kept strictly after the
    /// previous version). `now = None` keeps the current `mtime`.
    fn seal(&mut self, id: NodeId, now: Option<SystemTime>) -> Result<(Hash, Vec<u8>), FsError> {
        let child_hashes = self.child_hashes(id)?;
        let version = self.version;
        let replica_id = self.replica_id;
        let node = self
            .nodes
            .get_mut(&id)
            .ok_or_else(|| FsError::NotFound(format!("node {} is no longer live", id)))?;

        if node.dirty {
            if let Some(buf) = node.buffered.take() {
                node.data_block_hashes = self.store.put_chunked(&self.chunker, &buf)?;
                node.attrs.size = buf.len() as u64;
                node.owner = replica_id;
            }
        }
        if node.attrs.is_dir() {
            node.owner = replica_id;
        }
        node.version = match node.content_hash {
            Some(_) => version.max(node.version + 1),
            None => version,
        };
        if let Some(now) = now {
            node.attrs.mtime = match node.flushed_mtime {
                Some(prev) if now <= prev => prev.checked_add(Duration::from_nanos(1)).unwrap_or(now),
                _ => now,
            };
        }
        node.prev_hash = node.content_hash;

        let record = NodeRecord {
            name: node.name.clone(),
            attrs: node.attrs.clone(),
            version: node.version,
            prev_hash: node.prev_hash,
            child_hashes,
            data_block_hashes: node.data_block_hashes.clone(),
            owner: node.owner,
        };
        let bytes = encode_record(&record)?;
        let hash = store::digest(&bytes);

        node.content_hash = Some(hash);
        node.flushed_mtime = Some(node.attrs.mtime);
        node.dirty = false;
        node.subtree_dirty = false;
        Ok((hash, bytes))
    }

    fn flush_children(&mut self, id: NodeId, now: SystemTime) -> Result<(), FsError> {
        let pending: Vec<NodeId> = self
            .node(id)?
            .children
            .values()
            .filter_map(|slot| match slot {
                ChildSlot::Loaded(child) => Some(*child),
                ChildSlot::Unloaded(_) => None,
            })
            .filter(|child| {
                self.nodes
                    .get(child)
                    .map(|n| n.dirty || n.subtree_dirty)
                    .unwrap_or(false)
            })
            .collect();
        for child in pending {
            self.flush_at(child, now)?;
        }
        Ok(())
    }

    fn flush_at(&mut self, id: NodeId, now: SystemTime) -> Result<Hash, FsError> {
        self.flush_children(id, now)?;
        let node = self.node(id)?;
        if !node.dirty && !node.subtree_dirty {
            if let Some(hash) = node.content_hash {
                return Ok(hash);
            }
        }
        let (hash, bytes) = self.seal(id, Some(now))?;
        self.store.put(&bytes)?;
        debug!(id, hash = %short_hex(&hash), "Flushed node");
        Ok(hash)
    }

    /// Flush a subtree bottom-up and return its content hash
    ///
    /// Clean nodes return their existing hash.
    pub fn flush(&mut self, id: NodeId) -> Result<Hash, FsError> {
        self.flush_at(id, SystemTime::now())
    }

    /// Flush the whole tree and commit the new head
    ///
    /// Returns `None` when nothing was dirty.
    pub fn flush_root(&mut self) -> Result<Option<Head>, FsError> {
        if !self.is_dirty() {
            return Ok(None);
        }
        let now = SystemTime::now();
        let root = self.root;
        self.flush_children(root, now)?;
        let (hash, bytes) = self.seal(root, Some(now))?;
        let head = self
            .store
            .commit_root(&bytes, self.next_inode, self.replica_id)?;
        let flushed_version = self.version;
        self.version += 1;
        info!(
            root = %short_hex(&hash),
            version = flushed_version,
            next_inode = self.next_inode,
            "Committed root"
        );
        Ok(Some(head))
    }

    /// Serialized form of the current root version
    pub fn root_blob(&self) -> Result<Vec<u8>, FsError> {
        let hash = self
            .node(self.root)?
            .content_hash
            .ok_or_else(|| FsError::NotFound("root has no persisted version".to_string()))?;
        self.store
            .get(&hash)?
            .ok_or_else(|| FsError::NotFound(format!("root blob {}", short_hex(&hash))))
    }

    /// Apply a node pushed by a peer
    ///
    /// Updates not strictly newer than the local root are ignored. Otherwise
    /// the blob is stored, counters are reconciled, and the live node with
    /// the same inode is updated in place. Locally dirty children survive.
    pub fn receive(&mut self, bytes: &[u8], remote_next_inode: Inode) -> Result<ReceiveOutcome, FsError> {
        let record = decode_record(bytes)?;
        let hash = store::digest(bytes);
        let inode = record.attrs.inode;

        let local = self.node(self.root)?;
        let local_mtime = local.flushed_mtime.unwrap_or(local.attrs.mtime);
        if record.attrs.mtime <= local_mtime {
            warn!(hash = %short_hex(&hash), inode, "Ignoring stale update");
            return Ok(ReceiveOutcome::Stale);
        }

        self.store.put(bytes)?;
        self.next_inode = self.next_inode.max(remote_next_inode).max(inode + 1);
        self.version = self.version.max(record.version + 1);

        let Some(id) = self.by_inode.get(&inode).copied() else {
            debug!(hash = %short_hex(&hash), inode, "Stored update for unloaded node");
            return Ok(ReceiveOutcome::Stored { inode });
        };
        self.merge_into(id, record, hash)?;

        let is_root = id == self.root;
        if is_root {
            self.store
                .commit_root(bytes, self.next_inode, self.replica_id)?;
            info!(root = %short_hex(&hash), version = self.version, "Adopted remote root");
        }
        Ok(ReceiveOutcome::Applied { inode, root: is_root })
    }

    fn merge_into(&mut self, id: NodeId, record: NodeRecord, hash: Hash) -> Result<(), FsError> {
        let previous = std::mem::take(&mut self.node_mut(id)?.children);
        let mut merged = BTreeMap::new();
        let mut pruned = Vec::new();
        let mut kept_dirty = false;

        for (name, slot) in previous {
            let ChildSlot::Loaded(child) = slot else {
                continue;
            };
            let (dirty, current) = self
                .nodes
                .get(&child)
                .map(|n| (n.dirty || n.subtree_dirty, n.content_hash))
                .unwrap_or((false, None));
            match record.child_hashes.get(&name) {
                _ if dirty => {
                    merged.insert(name, ChildSlot::Loaded(child));
                    kept_dirty = true;
                }
                Some(remote) if current == Some(*remote) => {
                    merged.insert(name, ChildSlot::Loaded(child));
                }
                _ => pruned.push(child),
            }
        }
        for (name, child_hash) in &record.child_hashes {
            merged
                .entry(name.clone())
                .or_insert(ChildSlot::Unloaded(*child_hash));
        }
        for child in pruned {
            self.prune(child, id);
        }

        let node = self.node_mut(id)?;
        node.name = record.name;
        node.flushed_mtime = Some(record.attrs.mtime);
        node.attrs = record.attrs;
        node.version = record.version;
        node.prev_hash = record.prev_hash;
        node.data_block_hashes = record.data_block_hashes;
        node.owner = record.owner;
        node.children = merged;
        node.buffered = None;
        node.dirty = false;
        node.subtree_dirty = kept_dirty;
        node.content_hash = Some(hash);
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<(), FsError> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(FsError::InvalidOperation(format!("invalid entry name '{}'", name)));
    }
    Ok(())
}
