// src/core/cluster/observer.rs

//! Publishes and observes cluster-state snapshots. The service holds the
//! latest snapshot behind a `tokio::sync::watch` channel, and every retry
//! attempt in the primary phase gets its own `Observer` cursor over that
//! channel so waiting for "the next strictly-newer state" never races
//! against a shared cursor.

use super::state::ClusterState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Outcome of waiting for the next cluster-state change.
#[derive(Debug, Clone)]
pub enum ObserverEvent {
    /// A snapshot strictly newer than the one last observed.
    NewState(Arc<ClusterState>),
    /// The local cluster service is shutting down; no further states will
    /// ever arrive on this channel.
    Closed,
    /// The wait exceeded its deadline without a newer state arriving.
    TimedOut,
}

/// Owns the authoritative current snapshot and fans it out to observers.
///
/// The consensus layer that decides routing and elects a master is the
/// only expected caller of `publish`; this crate treats it as an external
/// collaborator and never implements it.
#[derive(Clone)]
pub struct ClusterStateService {
    tx: Arc<watch::Sender<Arc<ClusterState>>>,
}

impl ClusterStateService {
    pub fn new(initial: ClusterState) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(initial));
        Self { tx: Arc::new(tx) }
    }

    /// Publishes a new snapshot. No-ops (beyond a version bump check) if the
    /// given state is not newer than the current one, since this service
    /// models a monotonic sequence.
    pub fn publish(&self, new_state: ClusterState) {
        let new_state = Arc::new(new_state);
        self.tx.send_if_modified(|current| {
            if new_state.version > current.version {
                *current = new_state.clone();
                true
            } else {
                false
            }
        });
    }

    pub fn current(&self) -> Arc<ClusterState> {
        self.tx.borrow().clone()
    }

    /// Creates a fresh `Observer` pinned on the current snapshot.
    pub fn observer(&self) -> Observer {
        Observer {
            rx: self.tx.subscribe(),
            observed: self.current(),
            timed_out: false,
        }
    }
}

/// A single caller's cursor over the cluster-state channel. Remembers one
/// observed snapshot; after `wait_for_next_change` fires, the observed
/// snapshot advances to the newer state (or stays pinned on timeout).
pub struct Observer {
    rx: watch::Receiver<Arc<ClusterState>>,
    observed: Arc<ClusterState>,
    timed_out: bool,
}

impl Observer {
    pub fn observed_state(&self) -> Arc<ClusterState> {
        self.observed.clone()
    }

    pub fn is_timed_out(&self) -> bool {
        self.timed_out
    }

    /// Waits for a snapshot strictly newer than the observed one, or for the
    /// timeout to elapse. Fires exactly once per call; after it returns
    /// `NewState`, the observer's pinned snapshot has advanced.
    pub async fn wait_for_next_change(&mut self, timeout: Duration) -> ObserverEvent {
        let observed_version = self.observed.version;
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                changed = self.rx.changed() => {
                    match changed {
                        Ok(()) => {
                            let candidate = self.rx.borrow().clone();
                            if candidate.version > observed_version {
                                self.observed = candidate.clone();
                                self.timed_out = false;
                                return ObserverEvent::NewState(candidate);
                            }
                            // Spurious wakeup (e.g. a republish of the same
                            // version): keep waiting for a strictly newer one.
                            continue;
                        }
                        Err(_) => return ObserverEvent::Closed,
                    }
                }
                _ = &mut deadline => {
                    self.timed_out = true;
                    return ObserverEvent::TimedOut;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cluster::state::ClusterStateBuilder;

    #[tokio::test]
    async fn fires_on_newer_version() {
        let svc = ClusterStateService::new(ClusterStateBuilder::new(1).build());
        let mut obs = svc.observer();
        let svc2 = svc.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            svc2.publish(ClusterStateBuilder::new(2).build());
        });
        let event = obs.wait_for_next_change(Duration::from_secs(5)).await;
        match event {
            ObserverEvent::NewState(s) => assert_eq!(s.version, 2),
            _ => panic!("expected NewState"),
        }
        assert_eq!(obs.observed_state().version, 2);
        assert!(!obs.is_timed_out());
    }

    #[tokio::test]
    async fn times_out_without_newer_state() {
        let svc = ClusterStateService::new(ClusterStateBuilder::new(1).build());
        let mut obs = svc.observer();
        let event = obs.wait_for_next_change(Duration::from_millis(20)).await;
        assert!(matches!(event, ObserverEvent::TimedOut));
        assert!(obs.is_timed_out());
        // Observed snapshot stays pinned on timeout.
        assert_eq!(obs.observed_state().version, 1);
    }

    #[tokio::test]
    async fn ignores_republish_of_same_or_older_version() {
        let svc = ClusterStateService::new(ClusterStateBuilder::new(5).build());
        svc.publish(ClusterStateBuilder::new(3).build());
        assert_eq!(svc.current().version, 5);
        svc.publish(ClusterStateBuilder::new(5).build());
        assert_eq!(svc.current().version, 5);
    }
}
