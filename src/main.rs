// src/main.rs

//! Entry point for a standalone node running the write-coordination core.
//!
//! This crate implements the coordination path only: the consensus layer
//! that publishes cluster-state snapshots, and the Lucene-level engine that
//! actually stores documents, are external collaborators. This binary boots
//! a single-node, self-hosted cluster snapshot (this node is its own master
//! and primary for one shard) against the in-memory engine fake, to prove
//! the wiring end to end; a real deployment supplies its own `Engine` and
//! wires `ClusterStateService::publish` to its consensus layer instead.

use anyhow::Result;
use bytes::Bytes;
use shardrepl::config::Config;
use shardrepl::core::cluster::state::{ClusterStateBuilder, IndexMetadata, RoutingState, ShardId, ShardRouting};
use shardrepl::core::cluster::ClusterStateService;
use shardrepl::core::engine::InMemoryEngine;
use shardrepl::core::replication::translog::Translog;
use shardrepl::core::replication::WriteRequest;
use shardrepl::core::transport::TcpTransport;
use shardrepl::CoordinatorState;
use std::env;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("config.toml");

    let config = match Config::from_file(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e}");
            std::process::exit(1);
        }
    };

    let log_level = env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .compact()
        .with_ansi(true)
        .init();

    info!(node_id = %config.node_id, bind_addr = %config.bind_addr, "starting coordination core");

    if let Err(e) = run(config).await {
        error!("node runtime error: {e}");
        return Err(e);
    }
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    let shard_id = ShardId::new("docs", 0);
    let node_id = config.node_id.clone();

    let state = ClusterStateBuilder::new(1)
        .node(node_id.clone())
        .master(node_id.clone())
        .index(
            "docs",
            IndexMetadata {
                uuid: "uuid-1".into(),
                num_shards: 1,
                num_replicas: 0,
                shadow_replicas: false,
                blocks: vec![],
            },
        )
        .shard(ShardRouting {
            shard_id: shard_id.clone(),
            node_id: Some(node_id.clone()),
            primary: true,
            state: RoutingState::Started,
            relocating_to_node_id: None,
            allocation_id: "alloc-boot".into(),
            unassigned_info: None,
        })
        .build();
    let cluster = ClusterStateService::new(state);

    let engine = Arc::new(InMemoryEngine::new());
    let translog = Arc::new(Translog::open(
        config.translog.data_dirs.clone(),
        1,
        config.translog.sync_on_each_operation(),
    )?);
    engine.register_shard(shard_id, translog);

    let transport = TcpTransport::new(node_id);
    let (coordinator, drain) = CoordinatorState::bootstrap(config, cluster, engine, transport);

    let (shutdown_tx, _) = broadcast::channel(1);
    let mut background = JoinSet::new();
    if let Some(drain) = drain {
        background.spawn(drain.run(std::time::Duration::from_millis(200), shutdown_tx.subscribe()));
    }

    let outcome = coordinator
        .submit(WriteRequest::index("docs", "boot-check", Bytes::from_static(b"hello")))
        .await?;
    info!(
        successes = outcome.replication.successes,
        total_shards = outcome.replication.total_shards,
        "bootstrap self-check write applied"
    );

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(());
    while background.join_next().await.is_some() {}
    Ok(())
}
