// src/core/replication/replication_phase.rs

//! The replication phase: fans a primary-applied write out to every
//! non-unassigned, non-shadow copy in parallel, tallies responses, and
//! classifies non-ignorable replica failures for master notification.
//! Dispatch happens, then callbacks arrive independently: the `pending`
//! counter is an atomic, and the single terminal delivery is gated by a
//! one-way CAS on `finished`.

use super::framing::{ReplicaRequest, ReplicaResponse, ShardReplicationResponse, WriteKind};
use super::reporter::ShardStateReporter;
use crate::core::cluster::state::{ClusterState, NodeId, RoutingState, ShardId, ShardRouting};
use crate::core::cluster::ClusterStateService;
use crate::core::engine::Engine;
use crate::core::errors::CoreError;
use crate::core::replication::translog::ShardReference;
use crate::core::transport::{BoxedHandler, Transport};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::warn;

pub const REPLICA_ACTION: &str = "internal:write/replica";

pub type ReplicationOutcome = ShardReplicationResponse<ReplicaResponse>;

struct DispatchTarget {
    node: NodeId,
    routing: ShardRouting,
}

#[derive(Clone)]
pub struct ReplicationPhase {
    pub local_node: NodeId,
    pub cluster: ClusterStateService,
    pub engine: Arc<dyn Engine>,
    pub transport: Arc<dyn Transport>,
    pub reporter: ShardStateReporter,
}

impl ReplicationPhase {
    /// Runs the replication phase for a write the primary has already
    /// applied locally. `shard_reference` transfers ownership from the
    /// primary phase and is released exactly once, at finalization.
    pub async fn execute(
        &self,
        observed_state: &ClusterState,
        shard_id: ShardId,
        mut replica_request: ReplicaRequest,
        primary_response: ReplicaResponse,
        shard_reference: ShardReference,
        original_primary: ShardRouting,
    ) -> Result<ReplicationOutcome, CoreError> {
        let current = self.cluster.current();
        let working_state: ClusterState = if current.version != observed_state.version {
            replica_request.can_have_duplicates = true;
            (*current).clone()
        } else {
            observed_state.clone()
        };

        let shadow = working_state
            .index_metadata(shard_id.index.as_ref())
            .map(|m| m.shadow_replicas)
            .unwrap_or(false);

        let (dispatch, skipped) = classify_copies(&working_state, &shard_id, &original_primary, shadow);
        let total_shards = 1 + dispatch.len() + skipped;
        let pending = dispatch.len();
        let index_uuid = working_state
            .index_metadata(shard_id.index.as_ref())
            .map(|m| m.uuid.clone())
            .unwrap_or_default();

        // A zero-pending case (no replicas to wait on) finishes immediately;
        // the primary's own apply already counts as the one success.
        if pending == 0 {
            shard_reference.release();
            return Ok(ShardReplicationResponse {
                payload: primary_response,
                total_shards,
                successes: 1,
                failures: 0,
                skipped,
            });
        }

        let config = bincode::config::standard();
        let encoded = bincode::serde::encode_to_vec(&replica_request, config)
            .map_err(|e| CoreError::Internal(e.to_string()))?;

        let finished = Arc::new(AtomicBool::new(false));
        let successes = Arc::new(AtomicUsize::new(1));
        let failures = Arc::new(AtomicUsize::new(0));
        let remaining = Arc::new(AtomicUsize::new(pending));

        let mut joinset = tokio::task::JoinSet::new();
        for target in dispatch {
            let transport = self.transport.clone();
            let reporter = self.reporter.clone();
            let encoded = encoded.clone();
            let shard_id = shard_id.clone();
            let index_uuid = index_uuid.clone();
            joinset.spawn(async move {
                match transport
                    .send_request(&target.node, REPLICA_ACTION, Bytes::from(encoded))
                    .await
                {
                    Ok(_) => true,
                    Err(e) => {
                        if !e.ignorable_on_replica() {
                            warn!(%shard_id, node = %target.node, error = %e, "replica failed, notifying master");
                            reporter.shard_failed(target.routing, index_uuid, e.to_string()).await;
                        }
                        false
                    }
                }
            });
        }

        while let Some(result) = joinset.join_next().await {
            let succeeded = result.unwrap_or(false);
            if succeeded {
                successes.fetch_add(1, Ordering::AcqRel);
            } else {
                failures.fetch_add(1, Ordering::AcqRel);
            }
            if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                // This task observed the transition to zero; finish exactly
                // once even though multiple tasks may race to see it.
                if finished.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok() {
                    shard_reference.release();
                }
            }
        }

        Ok(ShardReplicationResponse {
            payload: primary_response,
            total_shards,
            successes: successes.load(Ordering::Acquire),
            failures: failures.load(Ordering::Acquire),
            skipped,
        })
    }
}

fn classify_copies(
    state: &ClusterState,
    shard_id: &ShardId,
    original_primary: &ShardRouting,
    shadow: bool,
) -> (Vec<DispatchTarget>, usize) {
    let mut dispatch = Vec::new();
    let mut skipped = 0usize;

    for copy in state.shards_for(shard_id) {
        if copy.primary {
            let same_node_as_original = copy.node_id.as_deref() == original_primary.node_id.as_deref();
            if !same_node_as_original {
                if let Some(node) = &copy.node_id {
                    dispatch.push(DispatchTarget {
                        node: node.clone(),
                        routing: copy.clone(),
                    });
                }
            }
            if copy.state == RoutingState::Relocating {
                if let Some(target) = &copy.relocating_to_node_id {
                    dispatch.push(DispatchTarget {
                        node: target.clone(),
                        routing: copy.clone(),
                    });
                }
            }
            continue;
        }

        if shadow {
            skipped += 1;
            continue;
        }

        match copy.state {
            RoutingState::Unassigned => skipped += 1,
            RoutingState::Relocating => {
                if let Some(node) = &copy.node_id {
                    dispatch.push(DispatchTarget {
                        node: node.clone(),
                        routing: copy.clone(),
                    });
                }
                if let Some(target) = &copy.relocating_to_node_id {
                    dispatch.push(DispatchTarget {
                        node: target.clone(),
                        routing: copy.clone(),
                    });
                }
            }
            RoutingState::Started | RoutingState::Initializing => {
                if let Some(node) = &copy.node_id {
                    dispatch.push(DispatchTarget {
                        node: node.clone(),
                        routing: copy.clone(),
                    });
                }
            }
        }
    }

    (dispatch, skipped)
}

/// Registers the receiving side of a replica dispatch on `transport`: apply
/// the operation at the primary-assigned version, and on a non-ignorable
/// local failure take this node's copy of the shard offline. Every node
/// that can host a replica copy registers this once, with `force_execution`
/// so replica work is never rejected for thread-pool saturation.
pub fn register_replica_handler(transport: &dyn Transport, engine: Arc<dyn Engine>) {
    transport.register_handler(
        REPLICA_ACTION,
        Arc::new(
            BoxedHandler::new(move |payload: Bytes| {
                let engine = engine.clone();
                async move {
                    let config = bincode::config::standard();
                    let (request, _): (ReplicaRequest, usize) =
                        bincode::serde::decode_from_slice(&payload, config)
                            .map_err(|e| CoreError::Internal(e.to_string()))?;

                    let result = match &request.kind {
                        WriteKind::Index { uid } => {
                            engine
                                .apply_replicated_index(&request.shard_id, uid, request.body.clone(), request.version)
                                .await
                        }
                        WriteKind::Delete { uid } => {
                            engine.apply_replicated_delete(&request.shard_id, uid, request.version).await
                        }
                    };

                    match result {
                        Ok(applied) => {
                            let response = ReplicaResponse { version: applied.version };
                            bincode::serde::encode_to_vec(&response, config)
                                .map(Bytes::from)
                                .map_err(|e| CoreError::Internal(e.to_string()))
                        }
                        Err(e) => {
                            if !e.ignorable_on_replica() {
                                engine.fail_shard(&request.shard_id, &e.to_string()).await;
                            }
                            Err(e)
                        }
                    }
                }
            })
            .force_execution(),
        ),
    );
}
