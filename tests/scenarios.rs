// tests/scenarios.rs
//
// End-to-end scenario tests driven entirely through the crate's public API
// (`shardrepl::core::...` / `shardrepl::CoordinatorState`), exercising a
// simulated multi-node mesh via `LocalMesh` and the in-memory engine fake.
// Distinct from the inline unit tests colocated with each module: these
// drive full write requests across several simulated nodes rather than a
// single phase in isolation.

use bytes::Bytes;
use shardrepl::core::cluster::state::{
    ClusterStateBuilder, IndexMetadata, RoutingState, ShardId, ShardRouting, UnassignedInfo, UnassignedReason,
};
use shardrepl::core::cluster::ClusterStateService;
use shardrepl::core::engine::InMemoryEngine;
use shardrepl::core::replication::reporter::{master_queues, register_master_handler, ShardStateReporter};
use shardrepl::core::replication::translog::Translog;
use shardrepl::core::replication::{PrimaryPhase, WriteConsistencyLevel, WriteRequest};
use shardrepl::core::replication::replication_phase::register_replica_handler;
use shardrepl::core::transport::LocalMesh;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

fn index_meta(num_replicas: u32) -> IndexMetadata {
    IndexMetadata {
        uuid: "uuid-1".into(),
        num_shards: 1,
        num_replicas,
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

async fn engine_with_shard(shard: &ShardId) -> Arc<InMemoryEngine> {
    let engine = Arc::new(InMemoryEngine::new());
    let dir = tempdir().unwrap();
    let translog = Arc::new(Translog::open(vec![dir.path().to_path_buf()], 1, false).unwrap());
    std::mem::forget(dir);
    engine.register_shard(shard.clone(), translog);
    engine
}

/// S1: 3-copy shard, all STARTED. The write applies on the primary and both
/// replicas succeed: one reference acquired and released, `successes=3`.
#[tokio::test]
async fn happy_path_three_started_copies_all_succeed() {
    let shard_id = ShardId::new("docs", 0);
    let state = ClusterStateBuilder::new(1)
        .node("n1")
        .node("n2")
        .node("n3")
        .master("n1")
        .index("docs", index_meta(2))
        .shard(routing("n1", true, RoutingState::Started))
        .shard(routing("n2", false, RoutingState::Started))
        .shard(routing("n3", false, RoutingState::Started))
        .build();
    let cluster = ClusterStateService::new(state);
    let mesh = LocalMesh::new();

    let engine_n1 = engine_with_shard(&shard_id).await;
    let engine_n2 = engine_with_shard(&shard_id).await;
    let engine_n3 = engine_with_shard(&shard_id).await;
    register_replica_handler(&mesh.handle_for("n2"), engine_n2);
    register_replica_handler(&mesh.handle_for("n3"), engine_n3);

    let transport_n1 = Arc::new(mesh.handle_for("n1"));
    let reporter = ShardStateReporter::new("n1".into(), transport_n1.clone(), cluster.clone());
    let phase = PrimaryPhase::new("n1", cluster, engine_n1, transport_n1, reporter);

    let outcome = phase
        .execute(WriteRequest::index("docs", "doc-1", Bytes::from("hello")))
        .await
        .unwrap();
    assert_eq!(outcome.replication.total_shards, 3);
    assert_eq!(outcome.replication.successes, 3);
    assert_eq!(outcome.replication.failures, 0);
}

/// S2: the initial snapshot names the primary on a node absent from the
/// nodes set. The write retries; once a later snapshot both adds the node
/// and starts the primary, it completes.
#[tokio::test]
async fn primary_node_unknown_retries_until_state_names_it() {
    let shard_id = ShardId::new("docs", 0);
    let state = ClusterStateBuilder::new(1)
        .node("n1")
        .master("n1")
        .index("docs", index_meta(0))
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
    let engine = engine_with_shard(&shard_id).await;

    let transport_n2 = Arc::new(mesh.handle_for("n2"));
    let reporter = ShardStateReporter::new("n2".into(), transport_n2.clone(), cluster.clone());
    let phase = PrimaryPhase::new("n2", cluster.clone(), engine, transport_n2, reporter);

    let cluster_writer = cluster.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        let next = ClusterStateBuilder::new(2)
            .node("n1")
            .node("n2")
            .master("n1")
            .index("docs", index_meta(0))
            .shard(routing("n2", true, RoutingState::Started))
            .build();
        cluster_writer.publish(next);
    });

    let request = WriteRequest::index("docs", "doc-1", Bytes::from("hello")).with_timeout(Duration::from_secs(5));
    let outcome = phase.execute(request).await.unwrap();
    assert_eq!(outcome.replication.total_shards, 1);
    assert_eq!(outcome.replication.successes, 1);
}

/// S3: a 5-copy shard with only 2 active and QUORUM consistency (requires
/// 3). The write retries twice; the third state change brings active count
/// to 3 and the write completes.
#[tokio::test]
async fn quorum_unmet_then_met_after_two_retries() {
    let shard_id = ShardId::new("docs", 0);
    fn five_copy_state(version: u64, active_replicas: &[&str]) -> shardrepl::core::cluster::state::ClusterState {
        let mut builder = ClusterStateBuilder::new(version)
            .node("n1")
            .node("n2")
            .node("n3")
            .node("n4")
            .node("n5")
            .master("n1")
            .index("docs", index_meta(4))
            .shard(routing("n1", true, RoutingState::Started));
        for node in ["n2", "n3", "n4", "n5"] {
            let state = if active_replicas.contains(&node) {
                RoutingState::Started
            } else {
                RoutingState::Initializing
            };
            builder = builder.shard(routing(node, false, state));
        }
        builder.build()
    }

    // Initially only n1 (primary) + n2 active: 2 active of 5 copies.
    let state = five_copy_state(1, &["n2"]);
    let cluster = ClusterStateService::new(state);
    let mesh = LocalMesh::new();

    let engine_n1 = engine_with_shard(&shard_id).await;
    for node in ["n2", "n3", "n4", "n5"] {
        let engine = engine_with_shard(&shard_id).await;
        register_replica_handler(&mesh.handle_for(node), engine);
    }

    let transport_n1 = Arc::new(mesh.handle_for("n1"));
    let reporter = ShardStateReporter::new("n1".into(), transport_n1.clone(), cluster.clone());
    let phase = PrimaryPhase::new("n1", cluster.clone(), engine_n1, transport_n1, reporter);

    let cluster_writer = cluster.clone();
    tokio::spawn(async move {
        // Still unmet: 2 active (n1 + n2).
        tokio::time::sleep(Duration::from_millis(20)).await;
        cluster_writer.publish(five_copy_state(2, &["n2"]));
        // Still unmet: 2 active (n1 + n3), simulating churn rather than
        // simple accretion.
        tokio::time::sleep(Duration::from_millis(20)).await;
        cluster_writer.publish(five_copy_state(3, &["n3"]));
        // Now met: n1 + n2 + n3 -> 3 active, satisfying QUORUM for size 5.
        tokio::time::sleep(Duration::from_millis(20)).await;
        cluster_writer.publish(five_copy_state(4, &["n2", "n3"]));
    });

    let request = WriteRequest::index("docs", "doc-1", Bytes::from("hello"))
        .with_consistency(WriteConsistencyLevel::Quorum)
        .with_timeout(Duration::from_secs(5));
    let outcome = phase.execute(request).await.unwrap();
    // Dispatch targets every non-unassigned, non-shadow copy regardless of
    // which ones counted toward the quorum check itself; all 4 replicas
    // here are Initializing or Started, so all 5 copies end up applied.
    assert_eq!(outcome.replication.total_shards, 5);
    assert_eq!(outcome.replication.successes, 5);
    assert_eq!(outcome.replication.failures, 0);
}

/// S4: primary succeeds, one replica's transport disconnects. The caller
/// still sees success; the master is notified of the failed replica exactly
/// once.
#[tokio::test]
async fn replica_disconnect_still_yields_success_and_notifies_master() {
    let shard_id = ShardId::new("docs", 0);
    let state = ClusterStateBuilder::new(1)
        .node("n1")
        .node("n2")
        .node("n3")
        .master("n1")
        .index("docs", index_meta(2))
        .shard(routing("n1", true, RoutingState::Started))
        .shard(routing("n2", false, RoutingState::Started))
        .shard(routing("n3", false, RoutingState::Started))
        .build();
    let cluster = ClusterStateService::new(state);
    let mesh = LocalMesh::new();
    mesh.partition("n3");

    let engine_n2 = engine_with_shard(&shard_id).await;
    register_replica_handler(&mesh.handle_for("n2"), engine_n2);

    let (master_queues, mut drain) = master_queues(cluster.clone(), 16);
    register_master_handler(&mesh.handle_for("n1"), master_queues);

    let engine_n1 = engine_with_shard(&shard_id).await;
    let transport_n1 = Arc::new(mesh.handle_for("n1"));
    let reporter = ShardStateReporter::new("n1".into(), transport_n1.clone(), cluster.clone());
    let phase = PrimaryPhase::new("n1", cluster, engine_n1, transport_n1, reporter);

    let outcome = phase
        .execute(WriteRequest::index("docs", "doc-1", Bytes::from("hello")))
        .await
        .unwrap();
    assert_eq!(outcome.replication.total_shards, 3);
    assert_eq!(outcome.replication.successes, 2);
    assert_eq!(outcome.replication.failures, 1);

    let drained = drain.drain_once();
    assert_eq!(drained.applied, 1);
}

/// S5: index flagged shadow-replicas. Only the primary applies; the two
/// shadow copies are skipped entirely, `pending=0` at the start.
#[tokio::test]
async fn shadow_replicas_skip_dispatch() {
    let shard_id = ShardId::new("docs", 0);
    let mut meta = index_meta(2);
    meta.shadow_replicas = true;
    let state = ClusterStateBuilder::new(1)
        .node("n1")
        .node("n2")
        .node("n3")
        .master("n1")
        .index("docs", meta)
        .shard(routing("n1", true, RoutingState::Started))
        .shard(routing("n2", false, RoutingState::Started))
        .shard(routing("n3", false, RoutingState::Started))
        .build();
    let cluster = ClusterStateService::new(state);
    let mesh = LocalMesh::new();
    let engine_n1 = engine_with_shard(&shard_id).await;

    let transport_n1 = Arc::new(mesh.handle_for("n1"));
    let reporter = ShardStateReporter::new("n1".into(), transport_n1.clone(), cluster.clone());
    let phase = PrimaryPhase::new("n1", cluster, engine_n1, transport_n1, reporter);

    let outcome = phase
        .execute(WriteRequest::index("docs", "doc-1", Bytes::from("hello")))
        .await
        .unwrap();
    assert_eq!(outcome.replication.total_shards, 3);
    assert_eq!(outcome.replication.successes, 1);
    assert_eq!(outcome.replication.skipped, 2);
    assert_eq!(outcome.replication.failures, 0);
}

/// S6: translog rotation. Appending to a current file, opening a transient
/// file, and appending further ops writes to both files; after promoting
/// the transient file, the old current file is gone and a fresh snapshot
/// returns only the post-swap operations in order.
#[tokio::test]
async fn translog_rotation_promotes_transient_and_drops_old_current() {
    use shardrepl::core::replication::TranslogOperation;

    let dir = tempdir().unwrap();
    let translog = Translog::open(vec![dir.path().to_path_buf()], 7, false).unwrap();

    let mut first_batch_locations = Vec::new();
    for i in 0..10u64 {
        let loc = translog
            .add(TranslogOperation::Index {
                uid: format!("doc-{i}"),
                source: Bytes::from(format!("body-{i}")),
                version: i + 1,
            })
            .await
            .unwrap();
        assert_eq!(loc.file_id, 7);
        first_batch_locations.push(loc);
    }

    translog.new_transient_translog(8).await.unwrap();

    let mut second_batch_locations = Vec::new();
    for i in 10..15u64 {
        let loc = translog
            .add(TranslogOperation::Index {
                uid: format!("doc-{i}"),
                source: Bytes::from(format!("body-{i}")),
                version: i + 1,
            })
            .await
            .unwrap();
        // Ops appended while a transient file is open still land in the
        // current file (id 7); they are mirrored into the transient file
        // internally but the caller-visible Location addresses current.
        assert_eq!(loc.file_id, 7);
        second_batch_locations.push(loc);
    }

    translog.make_transient_current().await.unwrap();
    assert_eq!(translog.current_id(), 8);

    let on_disk = translog.on_disk_ids().await.unwrap();
    assert!(!on_disk.contains(&7), "old current file translog-7 must be gone");
    assert!(on_disk.contains(&8));

    // Locations obtained before the swap addressed file 7, which no longer
    // exists: reads against them must fail now.
    let stale = first_batch_locations[0];
    assert!(translog.read(stale).await.is_err());

    // A fresh snapshot returns exactly the 5 post-swap ops, in order.
    let mut snapshot = translog.snapshot().await.unwrap();
    assert_eq!(snapshot.file_id(), 8);
    assert_eq!(snapshot.remaining(), 5);
    let mut seen = Vec::new();
    while let Some((_, op)) = snapshot.next_operation() {
        if let TranslogOperation::Index { uid, .. } = op {
            seen.push(uid);
        }
    }
    let expected: Vec<String> = (10..15).map(|i| format!("doc-{i}")).collect();
    assert_eq!(seen, expected);
}

/// S7: two nodes each report `shardFailed` for the same shard/allocation
/// three times within one master tick. Exactly one routing update applies;
/// a subsequent drain with nothing new queued is a no-op.
#[tokio::test]
async fn reporter_dedups_repeated_failures_from_two_nodes_in_one_tick() {
    let state = ClusterStateBuilder::new(1)
        .node("n1")
        .node("n2")
        .node("n3")
        .master("n1")
        .index("docs", index_meta(1))
        .shard(routing("n2", false, RoutingState::Started))
        .build();
    let cluster = ClusterStateService::new(state);
    let mesh = LocalMesh::new();

    let (queues, mut drain) = master_queues(cluster.clone(), 64);
    register_master_handler(&mesh.handle_for("n1"), queues);

    let reporter_n2 = ShardStateReporter::new("n2".into(), Arc::new(mesh.handle_for("n2")), cluster.clone());
    let reporter_n3 = ShardStateReporter::new("n3".into(), Arc::new(mesh.handle_for("n3")), cluster.clone());

    for _ in 0..3 {
        reporter_n2
            .shard_failed(routing("n2", false, RoutingState::Started), "uuid-1", "disconnect")
            .await;
        reporter_n3
            .shard_failed(routing("n2", false, RoutingState::Started), "uuid-1", "disconnect")
            .await;
    }

    let outcome = drain.drain_once();
    assert_eq!(outcome.applied, 1);

    let second = drain.drain_once();
    assert_eq!(second.applied, 0);
}
