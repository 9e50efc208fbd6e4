// src/core/coordinator.rs

//! `CoordinatorState`: the single `Arc`-shared context every phase, task,
//! and test harness is built from. One struct owns every long-lived
//! collaborator, constructed once at startup and cloned cheaply
//! (everything inside is already `Arc` or otherwise shareable).

use crate::config::Config;
use crate::core::cluster::ClusterStateService;
use crate::core::engine::Engine;
use crate::core::errors::CoreError;
use crate::core::replication::reporter::{self, ShardStateDrain, ShardStateReporter};
use crate::core::replication::{PrimaryPhase, ReplicationPhase};
use crate::core::replication::replication_phase::register_replica_handler;
use crate::core::transport::Transport;
use std::sync::Arc;

/// Everything one node's write-coordination path needs, assembled once at
/// startup. Cheap to clone and pass into spawned tasks.
#[derive(Clone)]
pub struct CoordinatorState {
    pub config: Arc<Config>,
    pub cluster: ClusterStateService,
    pub engine: Arc<dyn Engine>,
    pub transport: Arc<dyn Transport>,
    pub reporter: ShardStateReporter,
    pub primary_phase: PrimaryPhase,
}

impl CoordinatorState {
    /// Wires a node's collaborators together and registers the transport
    /// handlers every node needs regardless of whether it is master:
    /// the primary-forwarding handler and the replica-apply handler.
    /// Returns the context plus the master-side drain loop when this node
    /// is the master in `cluster`'s initial snapshot (the caller is
    /// responsible for spawning `ShardStateDrain::run` and for re-deriving
    /// mastership on every snapshot change, since that decision belongs to
    /// the out-of-scope consensus layer, not this crate).
    pub fn bootstrap(
        config: Config,
        cluster: ClusterStateService,
        engine: Arc<dyn Engine>,
        transport: Arc<dyn Transport>,
    ) -> (Self, Option<ShardStateDrain>) {
        let local_node = transport.local_node();
        let reporter = ShardStateReporter::new(local_node.clone(), transport.clone(), cluster.clone());

        let is_local_master = cluster.current().master_node.as_deref() == Some(local_node.as_str());
        let (reporter, drain) = if is_local_master {
            let (queues, drain) = reporter::master_queues(cluster.clone(), config.reporter.queue_capacity);
            reporter::register_master_handler(transport.as_ref(), queues.clone());
            (reporter.with_local_master(queues), Some(drain))
        } else {
            (reporter, None)
        };

        let primary_phase = PrimaryPhase::new(
            local_node,
            cluster.clone(),
            engine.clone(),
            transport.clone(),
            reporter.clone(),
        );
        primary_phase.register_handler();
        register_replica_handler(transport.as_ref(), engine.clone());

        (
            Self {
                config: Arc::new(config),
                cluster,
                engine,
                transport,
                reporter,
                primary_phase,
            },
            drain,
        )
    }

    /// Submits a write through the primary phase, using the default timeout
    /// from config if the request didn't already set one explicitly.
    pub async fn submit(
        &self,
        request: crate::core::replication::WriteRequest,
    ) -> Result<crate::core::replication::primary_phase::PrimaryPhaseOutcome, CoreError> {
        self.primary_phase.execute(request).await
    }

    /// Constructs the `ReplicationPhase` this coordinator's primary phase
    /// hands off to. Exposed for tests that need to drive the replication
    /// phase directly rather than through a full `submit()` call.
    pub fn replication_phase(&self) -> ReplicationPhase {
        ReplicationPhase {
            local_node: self.transport.local_node(),
            cluster: self.cluster.clone(),
            engine: self.engine.clone(),
            transport: self.transport.clone(),
            reporter: self.reporter.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cluster::state::{ClusterStateBuilder, IndexMetadata, RoutingState, ShardId, ShardRouting};
    use crate::core::engine::InMemoryEngine;
    use crate::core::replication::translog::Translog;
    use crate::core::replication::WriteRequest;
    use crate::core::transport::LocalMesh;
    use bytes::Bytes;
    use tempfile::tempdir;

    fn index_meta() -> IndexMetadata {
        IndexMetadata {
            uuid: "uuid-1".into(),
            num_shards: 1,
            num_replicas: 0,
            shadow_replicas: false,
            blocks: vec![],
        }
    }

    fn test_config() -> Config {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        use std::io::Write;
        writeln!(file, "node_id = \"n1\"").unwrap();
        writeln!(file, "translog.data_dirs = [\"/tmp\"]").unwrap();
        Config::from_file(file.path().to_str().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn bootstrap_as_sole_master_and_primary_submits_a_write() {
        let shard_id = ShardId::new("docs", 0);
        let state = ClusterStateBuilder::new(1)
            .node("n1")
            .master("n1")
            .index("docs", index_meta())
            .shard(ShardRouting {
                shard_id: shard_id.clone(),
                node_id: Some("n1".into()),
                primary: true,
                state: RoutingState::Started,
                relocating_to_node_id: None,
                allocation_id: "alloc-n1".into(),
                unassigned_info: None,
            })
            .build();
        let cluster = ClusterStateService::new(state);
        let mesh = LocalMesh::new();
        let engine = Arc::new(InMemoryEngine::new());
        let dir = tempdir().unwrap();
        let translog = Arc::new(Translog::open(vec![dir.path().to_path_buf()], 1, false).unwrap());
        std::mem::forget(dir);
        engine.register_shard(shard_id, translog);

        let (coordinator, drain) = CoordinatorState::bootstrap(
            test_config(),
            cluster,
            engine,
            Arc::new(mesh.handle_for("n1")),
        );
        assert!(drain.is_some());

        let request = WriteRequest::index("docs", "doc-1", Bytes::from("hello"));
        let outcome = coordinator.submit(request).await.unwrap();
        assert_eq!(outcome.replication.successes, 1);
        assert_eq!(outcome.replication.total_shards, 1);
    }
}
