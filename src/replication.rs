//! Periodic flush and push
//!
//! Each replica cycles `Idle -> Flushing -> Broadcasting -> Idle` on a timer.
//! The commit happens under the tree lock; the push to peers does not.

use crate::heads::Head;
use crate::net::BroadcastReport;
use crate::replica::Replica;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPhase {
    Idle,
    Flushing,
    Broadcasting,
}

/// Current phase of the flush cycle
#[derive(Debug)]
pub struct PhaseTracker(Mutex<FlushPhase>);

impl Default for PhaseTracker {
    fn default() -> Self {
        PhaseTracker(Mutex::new(FlushPhase::Idle))
    }
}

impl PhaseTracker {
    pub fn get(&self) -> FlushPhase {
        *self.0.lock()
    }

    /// Move to `phase`; the returned guard moves back to `Idle` when dropped
    pub fn enter(&self, phase: FlushPhase) -> PhaseGuard<'_> {
        *self.0.lock() = phase;
        PhaseGuard(self)
    }

    pub fn set(&self, phase: FlushPhase) {
        *self.0.lock() = phase;
    }
}

pub struct PhaseGuard<'a>(&'a PhaseTracker);

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.0.set(FlushPhase::Idle);
    }
}

/// Outcome of one flush cycle
#[derive(Debug, Clone, Default)]
pub struct FlushReport {
    /// New head, when anything was dirty
    pub committed: Option<Head>,
    /// `None` when there was no one to push to
    pub broadcast: Option<BroadcastReport>,
}

/// Background task driving `Replica::flush_cycle`
pub struct Flusher {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Flusher {
    pub fn start(replica: Arc<Replica>, period: Duration) -> Self {
        let (stop, mut stopped) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            info!(replica = replica.id(), ?period, "Flusher started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => match replica.flush_cycle().await {
                        Ok(report) => debug!(
                            committed = report.committed.is_some(),
                            pushed = report.broadcast.as_ref().map(|b| b.delivered.len()).unwrap_or(0),
                            "Flush cycle done"
                        ),
                        Err(e) => warn!(error = %e, "Flush cycle failed"),
                    },
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                }
            }
            info!(replica = replica.id(), "Flusher stopped");
        });
        Flusher { stop, task }
    }

    /// Stop the timer and wait for an in-flight cycle to finish
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "Flusher task ended abnormally");
        }
    }
}
