// src/core/replication/primary_phase.rs

//! The primary phase: block checks, shard resolution, write-consistency
//! check, route-or-run, and hand-off into the replication phase. "Apply
//! locally, then fan out" happens as two structs sharing a context passed
//! by `Arc` rather than a pair of closures sharing lexical state, and the
//! retry control flow is a tagged `StepOutcome` rather than exceptions.

use super::framing::{ReplicaRequest, ReplicaResponse, WriteKind, WriteRequest, required_active_shards};
use super::replication_phase::{ReplicationOutcome, ReplicationPhase};
use crate::core::cluster::observer::ObserverEvent;
use crate::core::cluster::state::{BlockLevel, ClusterState, NodeId, ShardId};
use crate::core::cluster::ClusterStateService;
use crate::core::engine::Engine;
use crate::core::errors::CoreError;
use crate::core::replication::reporter::ShardStateReporter;
use crate::core::transport::{BoxedHandler, Transport};
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};

pub const PRIMARY_ACTION: &str = "internal:write/primary";

/// What step 2 (shard resolution) found.
enum Resolution {
    Ready(ShardId),
    Retry(String),
}

/// The outcome the caller of `PrimaryPhase::execute` sees.
#[derive(Debug, Clone)]
pub struct PrimaryPhaseOutcome {
    pub replication: ReplicationOutcome,
}

/// Coordinates one write end-to-end: primary apply, then hand-off into the
/// replication phase. Holds everything both phases need; cheap to clone
/// (everything inside is `Arc`).
#[derive(Clone)]
pub struct PrimaryPhase {
    pub local_node: NodeId,
    pub cluster: ClusterStateService,
    pub engine: Arc<dyn Engine>,
    pub transport: Arc<dyn Transport>,
    pub reporter: ShardStateReporter,
}

impl PrimaryPhase {
    pub fn new(
        local_node: impl Into<NodeId>,
        cluster: ClusterStateService,
        engine: Arc<dyn Engine>,
        transport: Arc<dyn Transport>,
        reporter: ShardStateReporter,
    ) -> Self {
        Self {
            local_node: local_node.into(),
            cluster,
            engine,
            transport,
            reporter,
        }
    }

    /// Registers this phase as the handler for forwarded primary requests,
    /// so a node that is not locally the primary for a shard can still
    /// receive a client request addressed to it and forward correctly.
    pub fn register_handler(&self) {
        let phase = self.clone();
        self.transport.register_handler(
            PRIMARY_ACTION,
            Arc::new(BoxedHandler::new(move |payload: Bytes| {
                let phase = phase.clone();
                async move {
                    let config = bincode::config::standard();
                    let (request, _): (WriteRequest, usize) =
                        bincode::serde::decode_from_slice(&payload, config)
                            .map_err(|e| CoreError::Internal(e.to_string()))?;
                    let outcome = phase.execute(request).await?;
                    let config = bincode::config::standard();
                    bincode::serde::encode_to_vec(&outcome.replication, config)
                        .map(Bytes::from)
                        .map_err(|e| CoreError::Internal(e.to_string()))
                }
            })),
        );
    }

    /// Runs the full primary phase for `request`, retrying against fresh
    /// cluster-state snapshots until either success or the request's
    /// timeout elapses.
    #[instrument(skip(self, request), fields(target_index = %request.target_index))]
    pub async fn execute(&self, mut request: WriteRequest) -> Result<PrimaryPhaseOutcome, CoreError> {
        let deadline = Instant::now() + request.timeout;
        let mut observer = self.cluster.observer();

        loop {
            let state = observer.observed_state();

            match self.check_blocks(&state, &request.target_index) {
                StepOutcome::Fail(e) => return Err(e),
                StepOutcome::Retry(reason) => {
                    request.operation_threaded = true;
                    self.await_retry(&mut observer, deadline, reason).await?;
                    continue;
                }
                StepOutcome::Ready(()) => {}
            }

            let shard_id = match self.resolve_shard(&state, &request) {
                Err(e) => return Err(e),
                Ok(Resolution::Retry(reason)) => {
                    request.operation_threaded = true;
                    self.await_retry(&mut observer, deadline, reason).await?;
                    continue;
                }
                Ok(Resolution::Ready(id)) => id,
            };

            let primary = state
                .primary_for(&shard_id)
                .expect("resolve_shard only returns Ready for a present, active primary")
                .clone();

            if let Err(reason) = self.check_write_consistency(&state, &shard_id, request.consistency_level) {
                request.operation_threaded = true;
                self.await_retry(&mut observer, deadline, reason).await?;
                continue;
            }

            if primary.node_id.as_deref() == Some(self.local_node.as_str()) {
                match self.run_locally(&state, &shard_id, &request, &primary).await {
                    Ok(outcome) => return Ok(PrimaryPhaseOutcome { replication: outcome }),
                    Err(e) if e.retryable_on_primary() => {
                        request.operation_threaded = true;
                        self.await_retry(&mut observer, deadline, e.to_string()).await?;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            } else {
                let target = primary.node_id.clone().expect("active primary always has a node");
                match self.forward_to_remote(&target, &request).await {
                    Ok(outcome) => return Ok(outcome),
                    Err(e) if matches!(e, CoreError::TransportDisconnected(_) | CoreError::NodeClosed(_)) => {
                        request.can_have_duplicates = true;
                        request.operation_threaded = true;
                        self.await_retry(&mut observer, deadline, e.to_string()).await?;
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }

    fn check_blocks(&self, state: &ClusterState, target_index: &str) -> StepOutcome<()> {
        for block in &state.global_blocks {
            if block.retryable {
                return StepOutcome::Retry(format!("global block: {}", block.description));
            }
            return StepOutcome::Fail(CoreError::ClusterBlocked {
                retryable: false,
                description: block.description.clone(),
            });
        }
        if let Some(meta) = state.index_metadata(target_index) {
            for block in &meta.blocks {
                let terminal = matches!(block.level, BlockLevel::ReadOnly | BlockLevel::ReadOnlyAllowDelete);
                if block.retryable && !terminal {
                    return StepOutcome::Retry(format!("index block: {}", block.description));
                }
                return StepOutcome::Fail(CoreError::ClusterBlocked {
                    retryable: block.retryable,
                    description: block.description.clone(),
                });
            }
        }
        StepOutcome::Ready(())
    }

    fn resolve_shard(&self, state: &ClusterState, request: &WriteRequest) -> Result<Resolution, CoreError> {
        let meta = state
            .index_metadata(&request.target_index)
            .ok_or_else(|| CoreError::UnavailableShards(format!("unknown index {}", request.target_index)))?;
        let shard_number = request.resolve_shard_number(meta.num_shards);
        let shard_id = ShardId::new(request.target_index.clone(), shard_number);

        let Some(primary) = state.primary_for(&shard_id) else {
            return Ok(Resolution::Retry(format!("no primary routing entry for {shard_id}")));
        };
        if !primary.active() {
            return Ok(Resolution::Retry(format!("primary for {shard_id} not active yet")));
        }
        let Some(node_id) = &primary.node_id else {
            return Ok(Resolution::Retry(format!("primary for {shard_id} has no node assigned")));
        };
        if !state.node_known(node_id) {
            return Ok(Resolution::Retry(format!("primary node {node_id} not in current nodes set")));
        }
        Ok(Resolution::Ready(shard_id))
    }

    fn check_write_consistency(
        &self,
        state: &ClusterState,
        shard_id: &ShardId,
        level: super::framing::WriteConsistencyLevel,
    ) -> Result<(), String> {
        let size = state.total_routing_size(shard_id);
        let required = required_active_shards(level, size);
        let active = state.active_shards(shard_id);
        if active < required {
            return Err(format!(
                "write consistency unmet for {shard_id}: need {required}, have {active}"
            ));
        }
        Ok(())
    }

    async fn run_locally(
        &self,
        state: &ClusterState,
        shard_id: &ShardId,
        request: &WriteRequest,
        original_primary: &crate::core::cluster::state::ShardRouting,
    ) -> Result<ReplicationOutcome, CoreError> {
        let reference = self.engine.acquire_reference(shard_id)?;

        let apply_result = match &request.kind {
            WriteKind::Index { uid } => self.engine.apply_index(shard_id, uid, request.body.clone()).await,
            WriteKind::Delete { uid } => self.engine.apply_delete(shard_id, uid).await,
        };

        let outcome = apply_result.map(|applied| {
            let replica_request = ReplicaRequest {
                shard_id: shard_id.clone(),
                kind: request.kind.clone(),
                body: request.body.clone(),
                version: applied.version,
                can_have_duplicates: request.can_have_duplicates,
            };
            (applied, replica_request)
        });

        let (applied, replica_request) = match outcome {
            Ok(pair) => pair,
            Err(e) => {
                reference.release();
                return Err(e);
            }
        };

        info!(%shard_id, version = applied.version, "primary applied write");

        let phase = ReplicationPhase {
            local_node: self.local_node.clone(),
            cluster: self.cluster.clone(),
            engine: self.engine.clone(),
            transport: self.transport.clone(),
            reporter: self.reporter.clone(),
        };
        phase
            .execute(
                state,
                shard_id.clone(),
                replica_request,
                ReplicaResponse { version: applied.version },
                reference,
                original_primary.clone(),
            )
            .await
    }

    async fn forward_to_remote(
        &self,
        node: &str,
        request: &WriteRequest,
    ) -> Result<PrimaryPhaseOutcome, CoreError> {
        let config = bincode::config::standard();
        let bytes = bincode::serde::encode_to_vec(request, config)
            .map_err(|e| CoreError::Internal(e.to_string()))?;
        let response = self
            .transport
            .send_request(&node.to_string(), PRIMARY_ACTION, Bytes::from(bytes))
            .await?;
        let (replication, _): (ReplicationOutcome, usize) =
            bincode::serde::decode_from_slice(&response, config)
                .map_err(|e| CoreError::Internal(e.to_string()))?;
        Ok(PrimaryPhaseOutcome { replication })
    }

    async fn await_retry(
        &self,
        observer: &mut crate::core::cluster::observer::Observer,
        deadline: Instant,
        reason: String,
    ) -> Result<(), CoreError> {
        if observer.is_timed_out() {
            return Err(CoreError::Timeout(Duration::from_secs(0)));
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(CoreError::Timeout(Duration::from_secs(0)));
        }
        warn!(reason, "primary phase retrying");
        match observer.wait_for_next_change(remaining).await {
            ObserverEvent::NewState(_) => Ok(()),
            ObserverEvent::TimedOut => Err(CoreError::Timeout(remaining)),
            ObserverEvent::Closed => Err(CoreError::NodeClosed("cluster state service closed".into())),
        }
    }
}

enum StepOutcome<T> {
    Ready(T),
    Retry(String),
    Fail(CoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cluster::state::{
        ClusterStateBuilder, IndexMetadata, RoutingState, ShardRouting, UnassignedInfo, UnassignedReason,
    };
    use crate::core::engine::InMemoryEngine;
    use crate::core::replication::replication_phase::register_replica_handler;
    use crate::core::replication::translog::Translog;
    use crate::core::transport::LocalMesh;
    use tempfile::tempdir;

    fn index_meta() -> IndexMetadata {
        IndexMetadata {
            uuid: "uuid-1".into(),
            num_shards: 1,
            num_replicas: 2,
            shadow_replicas: false,
            blocks: vec![],
        }
    }

    fn routing(node: &str, primary: bool, state: RoutingState) -> ShardRouting {
        ShardRouting {
            shard_id: ShardId::new("docs", 0),
            node_id: Some(node.to_string()),
            primary,
            state,
            relocating_to_node_id: None,
            allocation_id: format!("alloc-{node}"),
            unassigned_info: None,
        }
    }

    async fn engine_with_shard(engine: &InMemoryEngine, shard: &ShardId) {
        let dir = tempdir().unwrap();
        let translog = Arc::new(Translog::open(vec![dir.path().to_path_buf()], 1, false).unwrap());
        std::mem::forget(dir);
        engine.register_shard(shard.clone(), translog);
    }

    #[tokio::test]
    async fn happy_path_three_copies_all_started() {
        let state = ClusterStateBuilder::new(1)
            .node("n1")
            .node("n2")
            .node("n3")
            .master("n1")
            .index("docs", index_meta())
            .shard(routing("n1", true, RoutingState::Started))
            .shard(routing("n2", false, RoutingState::Started))
            .shard(routing("n3", false, RoutingState::Started))
            .build();
        let cluster = ClusterStateService::new(state);
        let mesh = LocalMesh::new();

        let shard_id = ShardId::new("docs", 0);
        let engine_n1 = Arc::new(InMemoryEngine::new());
        engine_with_shard(&engine_n1, &shard_id).await;
        let engine_n2 = Arc::new(InMemoryEngine::new());
        engine_with_shard(&engine_n2, &shard_id).await;
        let engine_n3 = Arc::new(InMemoryEngine::new());
        engine_with_shard(&engine_n3, &shard_id).await;

        register_replica_handler(&mesh.handle_for("n2"), engine_n2.clone());
        register_replica_handler(&mesh.handle_for("n3"), engine_n3.clone());

        let transport_n1 = Arc::new(mesh.handle_for("n1"));
        let reporter = ShardStateReporter::new("n1".into(), transport_n1.clone(), cluster.clone());
        let phase = PrimaryPhase::new("n1", cluster.clone(), engine_n1, transport_n1, reporter);
        let request = WriteRequest::index("docs", "doc-1", Bytes::from("hello"));
        let outcome = phase.execute(request).await.unwrap();
        assert_eq!(outcome.replication.successes, 3);
        assert_eq!(outcome.replication.total_shards, 3);
        assert_eq!(outcome.replication.failures, 0);
    }

    #[tokio::test]
    async fn primary_node_unknown_then_retries_to_success() {
        let state = ClusterStateBuilder::new(1)
            .node("n1")
            .master("n1")
            .index("docs", index_meta())
            .shard(ShardRouting {
                unassigned_info: Some(UnassignedInfo {
                    reason: UnassignedReason::Unknown,
                    timestamp_millis: 0,
                    details: None,
                }),
                ..routing("n2", true, RoutingState::Initializing)
            })
            .build();
        let cluster = ClusterStateService::new(state);
        let mesh = LocalMesh::new();
        let engine = Arc::new(InMemoryEngine::new());
        engine_with_shard(&engine, &ShardId::new("docs", 0)).await;

        let transport_n2 = Arc::new(mesh.handle_for("n2"));
        let reporter = ShardStateReporter::new("n2".into(), transport_n2.clone(), cluster.clone());
        let phase = PrimaryPhase::new("n2", cluster.clone(), engine, transport_n2, reporter);
        let request = WriteRequest::index("docs", "doc-1", Bytes::from("hello")).with_timeout(Duration::from_secs(5));

        let cluster2 = cluster.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let next = ClusterStateBuilder::new(2)
                .node("n1")
                .node("n2")
                .master("n1")
                .index("docs", index_meta())
                .shard(routing("n2", true, RoutingState::Started))
                .build();
            cluster2.publish(next);
        });

        let outcome = phase.execute(request).await.unwrap();
        assert_eq!(outcome.replication.successes, 1);
        assert_eq!(outcome.replication.total_shards, 1);
    }
}
