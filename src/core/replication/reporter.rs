// src/core/replication/reporter.rs

//! The shard-state reporter: the channel by which any node announces
//! shard "started" / "failed" events to the current master, and by which
//! the master batches those into routing-table updates. The drain loop's
//! `tokio::select!` shape and the preference for a couple of small
//! dedicated channels (URGENT/HIGH here) over a generic priority queue
//! follow the same pattern as this crate's other background drain loops.

use crate::core::cluster::state::{
    ClusterState, NodeId, RoutingState, ShardId, ShardRouting, UnassignedInfo, UnassignedReason,
};
use crate::core::cluster::ClusterStateService;
use crate::core::errors::CoreError;
use crate::core::transport::{BoxedHandler, Transport};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

pub const SHARD_STATE_ACTION: &str = "internal:cluster/shard/state";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportKind {
    /// Announces that a local copy finished initializing and is ready to
    /// serve reads/writes. Drained at URGENT priority.
    Started,
    /// Announces that a local copy hit an unrecoverable local failure.
    /// Drained at HIGH priority.
    Failed,
}

/// One submission to the master. Dedup key is `(shard_id, allocation_id)`,
/// deliberately excluding `kind`: a later submission for the same copy
/// before the master drains overwrites the earlier one rather than
/// producing two queue entries' worth of routing change, even when one is a
/// `Started` and the other a `Failed` for that same copy. Which one wins
/// that collision is governed by drain order, not by the dedup map alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardStateUpdate {
    pub routing: ShardRouting,
    pub index_uuid: String,
    pub reason: String,
    pub kind: ReportKind,
}

impl ShardStateUpdate {
    fn dedup_key(&self) -> (ShardId, String) {
        (self.routing.shard_id.clone(), self.routing.allocation_id.clone())
    }
}

/// Client-facing handle: every node holds one, used to submit its own
/// shard events. Submission never blocks the caller on the master's drain
/// progress beyond the bounded channel's own backpressure.
#[derive(Clone)]
pub struct ShardStateReporter {
    local_node: NodeId,
    transport: Arc<dyn Transport>,
    cluster: ClusterStateService,
    /// Present only on the node currently running the master-side drain
    /// loop, letting a same-process master skip the transport round-trip.
    local_master_queues: Option<Arc<MasterQueues>>,
}

impl ShardStateReporter {
    pub fn new(local_node: NodeId, transport: Arc<dyn Transport>, cluster: ClusterStateService) -> Self {
        Self {
            local_node,
            transport,
            cluster,
            local_master_queues: None,
        }
    }

    pub fn with_local_master(mut self, queues: Arc<MasterQueues>) -> Self {
        self.local_master_queues = Some(queues);
        self
    }

    pub async fn shard_started(&self, routing: ShardRouting, index_uuid: impl Into<String>, reason: impl Into<String>) {
        self.submit(ShardStateUpdate {
            routing,
            index_uuid: index_uuid.into(),
            reason: reason.into(),
            kind: ReportKind::Started,
        })
        .await
    }

    pub async fn shard_failed(&self, routing: ShardRouting, index_uuid: impl Into<String>, reason: impl Into<String>) {
        self.submit(ShardStateUpdate {
            routing,
            index_uuid: index_uuid.into(),
            reason: reason.into(),
            kind: ReportKind::Failed,
        })
        .await
    }

    async fn submit(&self, update: ShardStateUpdate) {
        let state = self.cluster.current();
        let Some(master) = state.master_node.clone() else {
            warn!(
                shard = %update.routing.shard_id,
                "no master known, dropping shard state update"
            );
            return;
        };

        if master == self.local_node {
            match &self.local_master_queues {
                Some(queues) => queues.push(update).await,
                None => warn!("local node is master but the drain loop isn't wired up"),
            }
            return;
        }

        let config = bincode::config::standard();
        let Ok(bytes) = bincode::serde::encode_to_vec(&update, config) else {
            warn!("failed to encode shard state update");
            return;
        };
        if let Err(e) = self
            .transport
            .send_request(&master, SHARD_STATE_ACTION, Bytes::from(bytes))
            .await
        {
            // The reporter never retries; the owning node re-announces on
            // its own schedule, and topology churn will eventually route a
            // fresh attempt to a reachable master.
            warn!(error = %e, "failed to submit shard state update to master");
        }
    }
}

/// The master-side bounded queues. Cloned into a transport handler so
/// remote submissions and (when this node is itself master) local
/// short-circuited submissions land in the same place.
pub struct MasterQueues {
    urgent_tx: mpsc::Sender<ShardStateUpdate>,
    high_tx: mpsc::Sender<ShardStateUpdate>,
}

impl MasterQueues {
    pub async fn push(&self, update: ShardStateUpdate) {
        let tx = match update.kind {
            ReportKind::Started => &self.urgent_tx,
            ReportKind::Failed => &self.high_tx,
        };
        // A bounded, blocking send: backpressure is visible to a saturated
        // submitter rather than silently dropped.
        if tx.send(update).await.is_err() {
            warn!("master drain loop is gone, shard state update lost");
        }
    }
}

/// Outcome of one drain pass, returned for tests and diagnostics.
#[derive(Debug, Default, Clone)]
pub struct DrainOutcome {
    pub applied: usize,
    pub discarded_stale_index: usize,
    pub new_version: Option<u64>,
    pub reroute_requested: bool,
}

/// The master-side drain loop: owns both receivers and the cluster-state
/// publishing handle.
pub struct ShardStateDrain {
    urgent_rx: mpsc::Receiver<ShardStateUpdate>,
    high_rx: mpsc::Receiver<ShardStateUpdate>,
    cluster: ClusterStateService,
    reroute_requested: Arc<AtomicBool>,
}

/// Builds a connected `(ShardStateReporter-ready queues, drain loop)` pair.
pub fn master_queues(cluster: ClusterStateService, capacity: usize) -> (Arc<MasterQueues>, ShardStateDrain) {
    let (urgent_tx, urgent_rx) = mpsc::channel(capacity);
    let (high_tx, high_rx) = mpsc::channel(capacity);
    let queues = Arc::new(MasterQueues { urgent_tx, high_tx });
    let drain = ShardStateDrain {
        urgent_rx,
        high_rx,
        cluster,
        reroute_requested: Arc::new(AtomicBool::new(false)),
    };
    (queues, drain)
}

/// Registers a transport handler on `transport` that decodes incoming
/// `ShardStateUpdate`s and pushes them into `queues`. Call this once per
/// master.
pub fn register_master_handler(transport: &dyn Transport, queues: Arc<MasterQueues>) {
    transport.register_handler(
        SHARD_STATE_ACTION,
        Arc::new(BoxedHandler::new(move |payload: Bytes| {
            let queues = queues.clone();
            async move {
                let config = bincode::config::standard();
                let (update, _): (ShardStateUpdate, usize) =
                    bincode::serde::decode_from_slice(&payload, config)
                        .map_err(|e| CoreError::Internal(e.to_string()))?;
                queues.push(update).await;
                Ok(Bytes::new())
            }
        })),
    );
}

impl ShardStateDrain {
    /// Whether a reroute has been requested by a prior drain (set when a
    /// failure left unassigned copies behind) and not yet consumed.
    pub fn take_reroute_requested(&self) -> bool {
        self.reroute_requested.swap(false, Ordering::AcqRel)
    }

    /// Drains whatever is currently queued, URGENT before HIGH, into one
    /// ordered list, then dedups by `(shard_id, allocation_id)` keeping each
    /// key's *last* occurrence in that order. Because HIGH is drained after
    /// URGENT, a same-tick `Started`-then-`Failed` collision for one copy
    /// keeps the `Failed`: the more recent, more severe report wins instead
    /// of being silently discarded or left to hash-map iteration order.
    /// Discards whatever survives dedup but whose index UUID no longer
    /// matches current metadata, and applies the remaining set as one new
    /// cluster-state version. A drain with nothing queued, or whose
    /// surviving set is empty after filtering, is a no-op: no new version
    /// is published.
    pub fn drain_once(&mut self) -> DrainOutcome {
        let mut ordered: Vec<ShardStateUpdate> = Vec::new();
        while let Ok(update) = self.urgent_rx.try_recv() {
            ordered.push(update);
        }
        while let Ok(update) = self.high_rx.try_recv() {
            ordered.push(update);
        }

        if ordered.is_empty() {
            return DrainOutcome::default();
        }

        let mut last_index: HashMap<(ShardId, String), usize> = HashMap::new();
        for (i, update) in ordered.iter().enumerate() {
            last_index.insert(update.dedup_key(), i);
        }
        let deduped: Vec<ShardStateUpdate> = ordered
            .into_iter()
            .enumerate()
            .filter(|(i, update)| last_index.get(&update.dedup_key()) == Some(i))
            .map(|(_, update)| update)
            .collect();

        let current = self.cluster.current();
        let mut discarded_stale_index = 0;
        let mut surviving = Vec::new();
        for update in deduped {
            let index = update.routing.shard_id.index.as_ref();
            match current.metadata.get(index) {
                Some(meta) if meta.uuid == update.index_uuid => surviving.push(update),
                _ => discarded_stale_index += 1,
            }
        }

        if surviving.is_empty() {
            return DrainOutcome {
                discarded_stale_index,
                ..DrainOutcome::default()
            };
        }

        let (new_state, reroute_needed) = apply_updates(&current, &surviving);
        let new_version = new_state.version;
        self.cluster.publish(new_state);
        if reroute_needed {
            self.reroute_requested.store(true, Ordering::Release);
            info!("reroute requested after shard failure batch");
        }

        DrainOutcome {
            applied: surviving.len(),
            discarded_stale_index,
            new_version: Some(new_version),
            reroute_requested: reroute_needed,
        }
    }

    /// Runs the drain loop until `shutdown` fires, ticking every `period`.
    pub async fn run(mut self, period: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!("shard state drain loop shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    let outcome = self.drain_once();
                    if outcome.applied > 0 {
                        info!(applied = outcome.applied, "applied shard state batch");
                    }
                }
            }
        }
    }
}

/// Applies the surviving update set to `current`, producing a new
/// version. Returns whether any unassigned copies remain after the batch
/// (the reroute trigger).
fn apply_updates(current: &ClusterState, updates: &[ShardStateUpdate]) -> (ClusterState, bool) {
    let mut next = current.clone();
    next.version += 1;

    for update in updates {
        let index = update.routing.shard_id.index.to_string();
        let shard = update.routing.shard_id.shard;
        let Some(copies) = next
            .routing_table
            .get_mut(&index)
            .and_then(|shards| shards.get_mut(&shard))
        else {
            continue;
        };
        let Some(copy) = copies
            .iter_mut()
            .find(|c| c.allocation_id == update.routing.allocation_id)
        else {
            continue;
        };

        match update.kind {
            ReportKind::Started => {
                copy.state = RoutingState::Started;
                copy.unassigned_info = None;
            }
            ReportKind::Failed => {
                copy.state = RoutingState::Unassigned;
                copy.node_id = None;
                copy.relocating_to_node_id = None;
                copy.unassigned_info = Some(UnassignedInfo {
                    reason: UnassignedReason::AllocationFailed,
                    timestamp_millis: now_millis(),
                    details: Some(update.reason.clone()),
                });
            }
        }
    }

    let any_unassigned = next
        .routing_table
        .values()
        .flat_map(|shards| shards.values())
        .flatten()
        .any(|c| c.state == RoutingState::Unassigned);

    (next, any_unassigned)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
