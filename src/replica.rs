//! Replica context
//!
//! Everything one replica process owns: its store, the locked node graph,
//! the peer set, the session key, and the write token. Filesystem callbacks,
//! peer RPCs, and the flush timer all go through a shared `Replica`.

use crate::channel::{answer, KeyRing, PendingAuth, SessionKey, SessionSlot};
use crate::concurrency::{TokenGate, TokenState, TreeLock};
use crate::config::{ConsistencyMode, PeerConfig, ReplicaConfig};
use crate::error::FsError;
use crate::heads::Head;
use crate::net::client::DialOptions;
use crate::net::server::RequestHandler;
use crate::net::{open_message, seal_message, Call, PeerClient, PeerSet, Reply, WireRequest, WireResponse};
use crate::replication::{FlushPhase, FlushReport, PhaseTracker};
use crate::store::{BlockStore, SledBlockStore};
use crate::tree::{DirEntry, EntryAttrs, NodeAttrs, NodeGraph, ReceiveOutcome, SetAttr};
use crate::types::{short_hex, NodeId, ReplicaId};
use async_trait::async_trait;
use rsa::RsaPrivateKey;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use tracing::{debug, error, info, warn};

pub struct Replica {
    id: ReplicaId,
    name: String,
    auth_peer: Option<String>,
    consistency: ConsistencyMode,
    token_attempts: u32,
    keys: KeyRing,
    private_key: RsaPrivateKey,
    store: Arc<dyn BlockStore>,
    tree: TreeLock,
    peers: PeerSet,
    session: Arc<SessionSlot>,
    token: TokenGate,
    broadcast: AsyncMutex<()>,
    phase: PhaseTracker,
}

impl Replica {
    /// Open the replica described by `config` on this host
    pub fn open(config: &ReplicaConfig) -> Result<Arc<Self>, FsError> {
        config.validate()?;
        let host = crate::config::host_name();
        let identity = config.identity(host.as_deref())?.clone();
        let store = SledBlockStore::open(&identity.store, config.new_fs)?;
        info!(
            replica = identity.pid,
            name = %identity.name,
            store = %identity.store.display(),
            "Opened block store"
        );
        let host_ip = crate::config::host_ip();
        Ok(Arc::new(Self::with_store(
            config,
            &identity,
            Arc::new(store),
            host_ip.as_deref(),
        )?))
    }

    /// Build a replica over an already opened store
    pub fn with_store(
        config: &ReplicaConfig,
        identity: &PeerConfig,
        store: Arc<dyn BlockStore>,
        host_ip: Option<&str>,
    ) -> Result<Self, FsError> {
        let keys = KeyRing::new(&config.key_dir);
        let private_key = keys.load_private(&identity.name)?;
        let graph = NodeGraph::open(Arc::clone(&store), identity.pid)?;

        let session = Arc::new(SessionSlot::new());
        let options = DialOptions {
            attempts: config.dial_attempts,
            backoff: config.dial_backoff(),
            call_timeout: config.call_timeout(),
        };
        let clients = config
            .peers
            .iter()
            .map(|peer| PeerClient::new(peer.pid, peer.name.clone(), peer.dial_address(host_ip), options))
            .collect();
        let peers = PeerSet::new(identity.pid, clients, Arc::clone(&session));

        let auth_peer = config
            .auth_peer
            .clone()
            .filter(|name| name != &identity.name);
        if auth_peer.is_none() {
            session.set(SessionKey::generate());
            info!(replica = identity.pid, "Minted cluster session key");
        }

        Ok(Replica {
            id: identity.pid,
            name: identity.name.clone(),
            auth_peer,
            consistency: config.consistency,
            token_attempts: config.token_attempts,
            keys,
            private_key,
            store,
            tree: TreeLock::new(graph),
            peers,
            session,
            token: TokenGate::new(config.token, config.token_attempts, config.token_retry()),
            broadcast: AsyncMutex::new(()),
            phase: PhaseTracker::default(),
        })
    }

    pub fn id(&self) -> ReplicaId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    pub fn peers(&self) -> &PeerSet {
        &self.peers
    }

    pub fn session(&self) -> &Arc<SessionSlot> {
        &self.session
    }

    pub fn token_state(&self) -> TokenState {
        self.token.state()
    }

    pub fn flush_phase(&self) -> FlushPhase {
        self.phase.get()
    }

    pub fn head(&self) -> Result<Option<Head>, FsError> {
        Ok(self.store.load_head()?)
    }

    /// Direct access to the locked graph, for tooling and tests
    pub async fn graph(&self) -> MutexGuard<'_, NodeGraph> {
        self.tree.lock().await
    }

    /// Obtain the session key from the auth peer, unless this replica minted it
    pub async fn authenticate(&self) -> Result<(), FsError> {
        let Some(auth_name) = self.auth_peer.as_deref() else {
            return Ok(());
        };
        let client = self.peers.peer_by_name(auth_name).ok_or_else(|| {
            FsError::Config(format!("auth peer '{}' is not in the peer table", auth_name))
        })?;
        let auth_public = self.keys.load_public(auth_name)?;
        let (pending, request) = PendingAuth::begin(&self.name, &auth_public)?;
        let reply = client.authenticate(request).await.inspect_err(|e| {
            error!(auth_peer = auth_name, error = %e, "Authentication failed");
        })?;
        let key = pending.finish(&reply, &self.private_key)?;
        self.session.set(key);
        info!(replica = self.id, auth_peer = auth_name, "Authenticated");
        Ok(())
    }

    /// Tree lock for a mutating operation
    ///
    /// In strong mode the token is acquired first and must still be held
    /// once the lock is taken.
    async fn write_lock(&self) -> Result<MutexGuard<'_, NodeGraph>, FsError> {
        if self.consistency != ConsistencyMode::Strong {
            return Ok(self.tree.lock().await);
        }
        for _ in 0..self.token_attempts.max(1) {
            self.token.acquire(|| self.peers.request_token()).await?;
            let guard = self.tree.lock().await;
            if self.token.is_holder() {
                return Ok(guard);
            }
            debug!(replica = self.id, "Token moved away before the lock was taken");
        }
        Err(FsError::TokenUnavailable(
            "token kept moving away before the lock was taken".to_string(),
        ))
    }

    // Filesystem-callback surface

    pub async fn root(&self) -> NodeId {
        self.tree.lock().await.root()
    }

    pub async fn lookup(&self, parent: NodeId, name: &str) -> Result<NodeId, FsError> {
        self.tree.lock().await.lookup(parent, name, &self.peers).await
    }

    /// Walk a slash-separated path from the root
    pub async fn resolve(&self, path: &str) -> Result<NodeId, FsError> {
        self.tree.lock().await.resolve(path, &self.peers).await
    }

    pub async fn get_attr(&self, id: NodeId) -> Result<NodeAttrs, FsError> {
        self.tree.lock().await.get_attr(id)
    }

    pub async fn set_attr(&self, id: NodeId, update: &SetAttr) -> Result<NodeAttrs, FsError> {
        self.write_lock().await?.set_attr(id, update, &self.peers).await
    }

    pub async fn read_dir(&self, id: NodeId) -> Result<Vec<DirEntry>, FsError> {
        self.tree.lock().await.read_dir(id, &self.peers).await
    }

    pub async fn create(&self, parent: NodeId, name: &str, attrs: &EntryAttrs) -> Result<NodeId, FsError> {
        self.write_lock().await?.create(parent, name, attrs)
    }

    pub async fn mkdir(&self, parent: NodeId, name: &str, attrs: &EntryAttrs) -> Result<NodeId, FsError> {
        self.write_lock().await?.mkdir(parent, name, attrs)
    }

    pub async fn write(&self, id: NodeId, offset: u64, data: &[u8]) -> Result<usize, FsError> {
        self.write_lock().await?.write(id, offset, data, &self.peers).await
    }

    pub async fn read_all(&self, id: NodeId) -> Result<Vec<u8>, FsError> {
        self.tree.lock().await.read(id, &self.peers).await
    }

    pub async fn flush_on_close(&self, id: NodeId) -> Result<(), FsError> {
        self.write_lock().await?.flush_on_close(id)
    }

    pub async fn remove(&self, parent: NodeId, name: &str) -> Result<(), FsError> {
        self.write_lock().await?.remove(parent, name)
    }

    pub async fn rename(
        &self,
        parent: NodeId,
        old_name: &str,
        new_dir: NodeId,
        new_name: &str,
    ) -> Result<(), FsError> {
        self.write_lock()
            .await?
            .rename(parent, old_name, new_dir, new_name, &self.peers)
            .await
    }

    pub async fn symlink(&self, parent: NodeId, name: &str, target: &str) -> Result<NodeId, FsError> {
        self.write_lock().await?.symlink(parent, name, target)
    }

    pub async fn readlink(&self, id: NodeId) -> Result<String, FsError> {
        self.tree.lock().await.readlink(id, &self.peers).await
    }

    pub async fn hardlink(&self, target: NodeId, new_parent: NodeId, new_name: &str) -> Result<(), FsError> {
        self.write_lock().await?.hardlink(target, new_parent, new_name)
    }

    /// Commit dirty state, then push the root to every peer
    ///
    /// The root goes out even when nothing changed, so peers that missed an
    /// earlier push catch up.
    pub async fn flush_cycle(&self) -> Result<FlushReport, FsError> {
        let _cycle = self.phase.enter(FlushPhase::Flushing);
        let (committed, root, next_inode) = {
            let mut graph = self.tree.lock().await;
            let committed = graph.flush_root()?;
            (committed, graph.root_blob()?, graph.next_inode())
        };
        Ok(FlushReport {
            committed,
            broadcast: self.push(&root, next_inode).await,
        })
    }

    /// Broadcast outside the tree lock; pushes from this replica never interleave
    async fn push(&self, root: &[u8], next_inode: u64) -> Option<crate::net::BroadcastReport> {
        if self.peers.is_empty() || !self.session.is_established() {
            return None;
        }
        let _serial = self.broadcast.lock().await;
        self.phase.set(FlushPhase::Broadcasting);
        let report = self.peers.broadcast(root, next_inode).await;
        if !report.all_delivered() {
            warn!(
                delivered = report.delivered.len(),
                failed = report.failed.len(),
                "Root push incomplete"
            );
        }
        Some(report)
    }

    /// Serve one authenticated call
    ///
    /// Local failures become a negative reply; they never tear down the
    /// connection.
    pub async fn dispatch(&self, call: Call) -> Reply {
        let kind = call.name();
        let result = match call {
            Call::ReqToken { from } => self.grant_token(from).await,
            Call::ReqDNode(hash) | Call::ReqData(hash) => match self.store.get(&hash) {
                Ok(Some(bytes)) => Ok(Reply::with_payload(self.id, bytes)),
                Ok(None) => {
                    debug!(hash = %short_hex(&hash), kind, "Requested blob not held");
                    Ok(Reply::nack(self.id))
                }
                Err(e) => Err(e.into()),
            },
            Call::Receive { node, next_inode } => {
                let outcome = self.tree.lock().await.receive(&node, next_inode);
                outcome.map(|outcome| match outcome {
                    ReceiveOutcome::Stale => Reply::nack(self.id),
                    _ => Reply::ack(self.id),
                })
            }
        };
        result.unwrap_or_else(|e| {
            warn!(kind, error = %e, "Call failed");
            Reply::nack(self.id)
        })
    }

    /// Flush, hand the token over, and push the final state
    async fn grant_token(&self, from: ReplicaId) -> Result<Reply, FsError> {
        let (root, next_inode) = {
            let mut graph = self.tree.lock().await;
            if !self.token.is_holder() {
                return Ok(Reply::nack(self.id));
            }
            graph.flush_root()?;
            self.token.relinquish();
            (graph.root_blob()?, graph.next_inode())
        };
        info!(to = from, "Granting write token");
        self.push(&root, next_inode).await;
        Ok(Reply::ack(self.id))
    }

    fn answer_auth(&self, encrypted: &[u8]) -> Result<WireResponse, FsError> {
        if self.auth_peer.is_some() {
            return Err(FsError::AuthenticationFailure(format!(
                "{} is not the auth peer",
                self.name
            )));
        }
        let session = self.session.get()?;
        let (requester, reply) = answer(encrypted, &self.private_key, &self.keys, &session)?;
        info!(requester = %requester, "Handed out session key");
        Ok(WireResponse::Authenticated(reply))
    }
}

#[async_trait]
impl RequestHandler for Replica {
    async fn handle(&self, request: WireRequest) -> Result<WireResponse, FsError> {
        match request {
            WireRequest::Authenticate(encrypted) => self.answer_auth(&encrypted),
            WireRequest::Sealed(body) => {
                let key = self.session.get()?;
                let call: Call = open_message(&key, &body)?;
                let reply = self.dispatch(call).await;
                Ok(WireResponse::Sealed(seal_message(&key, &reply)?))
            }
        }
    }
}
