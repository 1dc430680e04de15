//! Dialing side of the peer protocol

use super::{
    client_transport, open_message, seal_message, Call, ClientTransport, Reply, WireRequest,
    WireResponse,
};
use crate::channel::{AuthReply, SessionSlot};
use crate::error::FsError;
use crate::store;
use crate::tree::RemoteSource;
use crate::types::{short_hex, Hash, Inode, ReplicaId};
use async_trait::async_trait;
use futures::future::join_all;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Connection tuning shared by every peer client
#[derive(Debug, Clone, Copy)]
pub struct DialOptions {
    pub attempts: u32,
    pub backoff: Duration,
    /// Deadline for one request/response exchange
    pub call_timeout: Option<Duration>,
}

impl Default for DialOptions {
    fn default() -> Self {
        DialOptions {
            attempts: 50,
            backoff: Duration::from_millis(20),
            call_timeout: None,
        }
    }
}

/// One remote peer with a lazily dialed, cached connection
pub struct PeerClient {
    pub id: ReplicaId,
    pub name: String,
    address: String,
    options: DialOptions,
    conn: Mutex<Option<ClientTransport>>,
}

impl PeerClient {
    pub fn new(id: ReplicaId, name: impl Into<String>, address: impl Into<String>, options: DialOptions) -> Self {
        PeerClient {
            id,
            name: name.into(),
            address: address.into(),
            options,
            conn: Mutex::new(None),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn dial(&self) -> Result<ClientTransport, FsError> {
        let mut last_error = String::from("no attempts made");
        for attempt in 1..=self.options.attempts.max(1) {
            match TcpStream::connect(&self.address).await {
                Ok(stream) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = self.id, error = %e, "Could not set TCP_NODELAY");
                    }
                    debug!(peer = self.id, addr = %self.address, attempt, "Connected");
                    return Ok(client_transport(stream));
                }
                Err(e) => {
                    last_error = e.to_string();
                    tokio::time::sleep(self.options.backoff).await;
                }
            }
        }
        Err(FsError::RemoteUnavailable(format!(
            "{} ({}) after {} attempts: {}",
            self.name, self.address, self.options.attempts, last_error
        )))
    }

    async fn round_trip(
        transport: &mut ClientTransport,
        request: WireRequest,
    ) -> Result<WireResponse, FsError> {
        transport.send(request).await?;
        match transport.next().await {
            Some(frame) => frame,
            None => Err(FsError::RemoteUnavailable("connection closed by peer".to_string())),
        }
    }

    /// Send one frame and wait for its answer
    ///
    /// Any failure drops the cached connection. A failure on a reused
    /// connection is retried once on a fresh one.
    pub async fn exchange(&self, request: WireRequest) -> Result<WireResponse, FsError> {
        let mut conn = self.conn.lock().await;
        let mut reused = conn.is_some();
        loop {
            if conn.is_none() {
                *conn = Some(self.dial().await?);
            }
            let Some(transport) = conn.as_mut() else {
                return Err(FsError::RemoteUnavailable(format!("{} not connected", self.name)));
            };
            let attempt = Self::round_trip(transport, request.clone());
            let outcome = match self.options.call_timeout {
                Some(limit) => match tokio::time::timeout(limit, attempt).await {
                    Ok(result) => result,
                    Err(_) => Err(FsError::RemoteUnavailable(format!(
                        "{} did not answer within {:?}",
                        self.name, limit
                    ))),
                },
                None => attempt.await,
            };
            match outcome {
                Ok(WireResponse::Rejected(reason)) => {
                    *conn = None;
                    return Err(FsError::AuthenticationFailure(format!(
                        "{} rejected the call: {}",
                        self.name, reason
                    )));
                }
                Ok(response) => return Ok(response),
                Err(e) => {
                    *conn = None;
                    if reused {
                        debug!(peer = self.id, error = %e, "Cached connection failed, redialing");
                        reused = false;
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Authenticated RPC
    pub async fn call(&self, session: &SessionSlot, call: &Call) -> Result<Reply, FsError> {
        let key = session.get()?;
        let request = WireRequest::Sealed(seal_message(&key, call)?);
        match self.exchange(request).await? {
            WireResponse::Sealed(body) => open_message(&key, &body),
            other => Err(FsError::AuthenticationFailure(format!(
                "unexpected answer to {}: {:?}",
                call.name(),
                other
            ))),
        }
    }

    /// Key exchange with this peer acting as auth peer
    pub async fn authenticate(&self, encrypted_request: Vec<u8>) -> Result<AuthReply, FsError> {
        match self
            .exchange(WireRequest::Authenticate(encrypted_request))
            .await?
        {
            WireResponse::Authenticated(reply) => Ok(reply),
            other => Err(FsError::AuthenticationFailure(format!(
                "unexpected answer to Authenticate: {:?}",
                other
            ))),
        }
    }
}

/// Result of pushing one node to every peer
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: Vec<ReplicaId>,
    pub failed: Vec<(ReplicaId, String)>,
}

impl BroadcastReport {
    pub fn all_delivered(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Every other replica in the cluster
pub struct PeerSet {
    self_id: ReplicaId,
    peers: Vec<PeerClient>,
    session: Arc<SessionSlot>,
}

impl PeerSet {
    /// Clients whose id equals `self_id` are dropped.
    pub fn new(self_id: ReplicaId, peers: Vec<PeerClient>, session: Arc<SessionSlot>) -> Self {
        let peers = peers.into_iter().filter(|p| p.id != self_id).collect();
        PeerSet {
            self_id,
            peers,
            session,
        }
    }

    pub fn self_id(&self) -> ReplicaId {
        self.self_id
    }

    pub fn session(&self) -> &Arc<SessionSlot> {
        &self.session
    }

    pub fn peers(&self) -> &[PeerClient] {
        &self.peers
    }

    pub fn peer(&self, id: ReplicaId) -> Option<&PeerClient> {
        self.peers.iter().find(|p| p.id == id)
    }

    pub fn peer_by_name(&self, name: &str) -> Option<&PeerClient> {
        self.peers.iter().find(|p| p.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Owner first, then everyone else
    fn fetch_order(&self, owner: ReplicaId) -> Vec<&PeerClient> {
        let mut order: Vec<&PeerClient> = self.peer(owner).into_iter().collect();
        order.extend(self.peers.iter().filter(|p| p.id != owner));
        order
    }

    async fn fetch(&self, owner: ReplicaId, hash: &Hash, call: Call) -> Result<Vec<u8>, FsError> {
        for peer in self.fetch_order(owner) {
            match peer.call(&self.session, &call).await {
                Ok(Reply {
                    ack: true,
                    payload: Some(bytes),
                    ..
                }) => {
                    if let Err(e) = store::verify(hash, &bytes) {
                        warn!(peer = peer.id, hash = %short_hex(hash), error = %e, "Peer served a corrupt blob");
                        continue;
                    }
                    debug!(peer = peer.id, hash = %short_hex(hash), kind = call.name(), "Fetched from peer");
                    return Ok(bytes);
                }
                Ok(_) => debug!(peer = peer.id, hash = %short_hex(hash), "Peer does not have blob"),
                Err(e) => warn!(peer = peer.id, hash = %short_hex(hash), error = %e, "Fetch failed"),
            }
        }
        Err(FsError::NotFound(format!(
            "{} not held by any reachable peer",
            short_hex(hash)
        )))
    }

    /// Push a node to every peer concurrently; failures are isolated per peer
    pub async fn broadcast(&self, node: &[u8], next_inode: Inode) -> BroadcastReport {
        let call = Call::Receive {
            node: node.to_vec(),
            next_inode,
        };
        let results = join_all(self.peers.iter().map(|peer| {
            let call = &call;
            async move { (peer.id, peer.call(&self.session, call).await) }
        }))
        .await;

        let mut report = BroadcastReport::default();
        for (id, result) in results {
            match result {
                Ok(_) => report.delivered.push(id),
                Err(e) => {
                    warn!(peer = id, error = %e, "Push failed");
                    report.failed.push((id, e.to_string()));
                }
            }
        }
        report
    }

    /// Ask the peers, in table order, for the write token
    ///
    /// Returns the id of the replica that granted it.
    pub async fn request_token(&self) -> Result<Option<ReplicaId>, FsError> {
        let call = Call::ReqToken { from: self.self_id };
        for peer in &self.peers {
            match peer.call(&self.session, &call).await {
                Ok(reply) if reply.ack => {
                    info!(peer = peer.id, "Token granted");
                    return Ok(Some(reply.from));
                }
                Ok(_) => debug!(peer = peer.id, "Peer does not hold the token"),
                Err(e) => warn!(peer = peer.id, error = %e, "Token request failed"),
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl RemoteSource for PeerSet {
    async fn fetch_node(&self, owner: ReplicaId, hash: &Hash) -> Result<Vec<u8>, FsError> {
        self.fetch(owner, hash, Call::ReqDNode(*hash)).await
    }

    async fn fetch_block(&self, owner: ReplicaId, hash: &Hash) -> Result<Vec<u8>, FsError> {
        self.fetch(owner, hash, Call::ReqData(*hash)).await
    }
}
