// src/core/cluster/mod.rs

//! Cluster-state model and the observer that lets write-path code wait for
//! a newer snapshot instead of polling.

pub mod observer;
pub mod state;

pub use observer::{ClusterStateService, Observer, ObserverEvent};
pub use state::{
    AllocationId, BlockLevel, ClusterBlock, ClusterState, ClusterStateBuilder, IndexMetadata,
    NodeId, NodeInfo, RoutingState, ShardId, ShardRouting, UnassignedInfo, UnassignedReason,
};
