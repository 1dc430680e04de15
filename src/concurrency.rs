//! Mutual exclusion for a replica
//!
//! One coarse async lock guards the whole node graph; every filesystem
//! operation and every flush cycle runs inside it. Across replicas, strong
//! consistency mode adds a single write token that moves between peers.

use crate::error::FsError;
use crate::tree::NodeGraph;
use crate::types::ReplicaId;
use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use tracing::{debug, error, info};

/// The single lock around a replica's node graph
pub struct TreeLock {
    graph: AsyncMutex<NodeGraph>,
}

impl TreeLock {
    pub fn new(graph: NodeGraph) -> Self {
        Self {
            graph: AsyncMutex::new(graph),
        }
    }

    /// Held for the whole of one operation, released on every exit path
    pub async fn lock(&self) -> MutexGuard<'_, NodeGraph> {
        self.graph.lock().await
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, NodeGraph>> {
        self.graph.try_lock().ok()
    }
}

/// Where this replica stands with respect to the write token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Holder,
    NotHolder,
    /// A request to the peers is in flight
    Requesting,
}

/// Token bookkeeping with a bounded acquisition budget
pub struct TokenGate {
    state: Mutex<TokenState>,
    attempts: u32,
    retry: Duration,
    requests: AsyncMutex<()>,
}

impl TokenGate {
    pub fn new(holder: bool, attempts: u32, retry: Duration) -> Self {
        let state = if holder {
            TokenState::Holder
        } else {
            TokenState::NotHolder
        };
        Self {
            state: Mutex::new(state),
            attempts: attempts.max(1),
            retry,
            requests: AsyncMutex::new(()),
        }
    }

    pub fn state(&self) -> TokenState {
        *self.state.lock()
    }

    pub fn is_holder(&self) -> bool {
        self.state() == TokenState::Holder
    }

    /// Make sure this replica holds the token
    ///
    /// `request` asks the peers once and yields the granting replica, if
    /// any. Concurrent callers share one request sequence.
    pub async fn acquire<F, Fut>(&self, mut request: F) -> Result<(), FsError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<ReplicaId>, FsError>>,
    {
        let _serial = self.requests.lock().await;
        if self.is_holder() {
            return Ok(());
        }
        *self.state.lock() = TokenState::Requesting;
        for attempt in 1..=self.attempts {
            match request().await {
                Ok(Some(from)) => {
                    *self.state.lock() = TokenState::Holder;
                    info!(from, attempt, "Acquired write token");
                    return Ok(());
                }
                Ok(None) => debug!(attempt, "No peer granted the token"),
                Err(e) => debug!(attempt, error = %e, "Token request failed"),
            }
            if attempt < self.attempts {
                tokio::time::sleep(self.retry).await;
            }
        }
        *self.state.lock() = TokenState::NotHolder;
        error!(attempts = self.attempts, "Write token unavailable");
        Err(FsError::TokenUnavailable(format!(
            "no peer granted the token after {} attempts",
            self.attempts
        )))
    }

    /// Give the token away if held; returns whether it was
    pub fn relinquish(&self) -> bool {
        let mut state = self.state.lock();
        if *state == TokenState::Holder {
            *state = TokenState::NotHolder;
            info!("Relinquished write token");
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::persistence::SledBlockStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn gate(holder: bool, attempts: u32) -> TokenGate {
        TokenGate::new(holder, attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_holder_does_not_ask() {
        let gate = gate(true, 3);
        let asked = AtomicU32::new(0);
        gate.acquire(|| {
            asked.fetch_add(1, Ordering::SeqCst);
            async { Ok(None) }
        })
        .await
        .unwrap();
        assert_eq!(asked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_grant_after_retries() {
        let gate = gate(false, 5);
        let asked = AtomicU32::new(0);
        gate.acquire(|| {
            let n = asked.fetch_add(1, Ordering::SeqCst);
            async move { Ok(if n >= 2 { Some(7) } else { None }) }
        })
        .await
        .unwrap();
        assert_eq!(asked.load(Ordering::SeqCst), 3);
        assert_eq!(gate.state(), TokenState::Holder);
    }

    #[tokio::test]
    async fn test_budget_exhausted() {
        let gate = gate(false, 3);
        let err = gate
            .acquire(|| async { Err(FsError::RemoteUnavailable("down".to_string())) })
            .await
            .unwrap_err();
        assert!(matches!(err, FsError::TokenUnavailable(_)));
        assert_eq!(gate.state(), TokenState::NotHolder);
    }

    #[test]
    fn test_relinquish_only_when_held() {
        let gate = gate(true, 1);
        assert!(gate.relinquish());
        assert!(!gate.relinquish());
        assert_eq!(gate.state(), TokenState::NotHolder);
    }

    #[tokio::test]
    async fn test_tree_lock_excludes() {
        let store = Arc::new(SledBlockStore::temporary().unwrap());
        let lock = TreeLock::new(NodeGraph::open(store, 1).unwrap());
        let guard = lock.lock().await;
        assert!(lock.try_lock().is_none());
        drop(guard);
        assert!(lock.try_lock().is_some());
    }
}
