// src/core/cluster/state.rs

//! The cluster-state snapshot: node set, index metadata, and the routing
//! table that enumerates every shard copy and its placement.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Identifies one horizontal partition of an index. Immutable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardId {
    pub index: Arc<str>,
    pub shard: u32,
}

impl ShardId {
    pub fn new(index: impl Into<Arc<str>>, shard: u32) -> Self {
        Self {
            index: index.into(),
            shard,
        }
    }
}

impl std::fmt::Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}][{}]", self.index, self.shard)
    }
}

/// Opaque stable identifier of a copy across restarts and relocations.
pub type AllocationId = String;
pub type NodeId = String;

/// The routing state of one shard copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoutingState {
    Unassigned,
    Initializing,
    Started,
    Relocating,
}

impl RoutingState {
    /// A copy is "active" when it is eligible to serve as primary or
    /// receive replica writes: STARTED or RELOCATING.
    pub fn active(self) -> bool {
        matches!(self, RoutingState::Started | RoutingState::Relocating)
    }
}

/// Reason a copy is unassigned. Ordinal is part of the wire form: new
/// reasons must only be appended, never reordered or removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum UnassignedReason {
    Unknown = 0,
    IndexCreated = 1,
    ClusterRecovered = 2,
    IndexReopened = 3,
    DanglingIndexImported = 4,
    NewIndexRestored = 5,
    ExistingIndexRestored = 6,
    ReplicaAdded = 7,
    AllocationFailed = 8,
    NodeLeft = 9,
    RerouteCancelled = 10,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnassignedInfo {
    pub reason: UnassignedReason,
    pub timestamp_millis: u64,
    pub details: Option<String>,
}

/// One copy's placement within the routing table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRouting {
    pub shard_id: ShardId,
    pub node_id: Option<NodeId>,
    pub primary: bool,
    pub state: RoutingState,
    /// Set only when `state == Relocating`: the copy logically represents
    /// both the source (`node_id`) and this target node.
    pub relocating_to_node_id: Option<NodeId>,
    pub allocation_id: AllocationId,
    pub unassigned_info: Option<UnassignedInfo>,
}

impl ShardRouting {
    pub fn active(&self) -> bool {
        self.state.active()
    }

    pub fn started(&self) -> bool {
        self.state == RoutingState::Started
    }
}

/// A node known to the cluster, as published by the external cluster-state
/// service. Versioned independently of the cluster-state snapshot version
/// so stale membership can be detected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub version: u64,
}

/// Severity / scope of a write block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockLevel {
    /// An operator-declared read-only freeze. Not retryable: the caller
    /// must be told explicitly rather than spin.
    ReadOnly,
    /// Read-only except for deletes (used when reclaiming disk space).
    ReadOnlyAllowDelete,
    /// Disk usage exceeded the high watermark. Retryable: expected to
    /// clear once disk pressure is relieved.
    DiskFull,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterBlock {
    pub level: BlockLevel,
    pub retryable: bool,
    pub description: String,
}

impl ClusterBlock {
    pub fn read_only(description: impl Into<String>) -> Self {
        Self {
            level: BlockLevel::ReadOnly,
            retryable: false,
            description: description.into(),
        }
    }

    pub fn read_only_allow_delete(description: impl Into<String>) -> Self {
        Self {
            level: BlockLevel::ReadOnlyAllowDelete,
            retryable: false,
            description: description.into(),
        }
    }

    pub fn disk_full(description: impl Into<String>) -> Self {
        Self {
            level: BlockLevel::DiskFull,
            retryable: true,
            description: description.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct IndexMetadata {
    pub uuid: String,
    pub num_shards: u32,
    pub num_replicas: u32,
    pub shadow_replicas: bool,
    /// Per-index write blocks (e.g. a frozen index).
    pub blocks: Vec<ClusterBlock>,
}

/// A versioned, immutable snapshot of cluster topology and metadata.
///
/// Invariant: for every allocated shard, exactly one copy has
/// `primary == true` with `state` in `{Initializing, Started, Relocating}`.
/// This invariant is checked by `validate()` and enforced by the only
/// constructor paths (`ClusterStateBuilder`), matching the "immutable
/// snapshot, arena-indexed" re-architecture guidance for the original
/// mutable, back-pointer-laden routing tables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterState {
    pub version: u64,
    pub nodes: Vec<NodeInfo>,
    pub metadata: HashMap<String, IndexMetadata>,
    /// index name -> shard id -> copies of that shard.
    pub routing_table: HashMap<String, BTreeMap<u32, Vec<ShardRouting>>>,
    pub global_blocks: Vec<ClusterBlock>,
    /// The node currently holding mastership, if any is known. Absent
    /// immediately after mastership churn until the (out-of-scope)
    /// consensus layer publishes a state naming a new one.
    pub master_node: Option<NodeId>,
}

impl ClusterState {
    pub fn empty() -> Self {
        Self {
            version: 0,
            nodes: Vec::new(),
            metadata: HashMap::new(),
            routing_table: HashMap::new(),
            global_blocks: Vec::new(),
            master_node: None,
        }
    }

    pub fn node_known(&self, node_id: &str) -> bool {
        self.nodes.iter().any(|n| n.node_id == node_id)
    }

    pub fn shards_for(&self, shard_id: &ShardId) -> &[ShardRouting] {
        self.routing_table
            .get(shard_id.index.as_ref())
            .and_then(|shards| shards.get(&shard_id.shard))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn primary_for(&self, shard_id: &ShardId) -> Option<&ShardRouting> {
        self.shards_for(shard_id).iter().find(|r| r.primary)
    }

    pub fn active_shards(&self, shard_id: &ShardId) -> usize {
        self.shards_for(shard_id).iter().filter(|r| r.active()).count()
    }

    pub fn total_routing_size(&self, shard_id: &ShardId) -> usize {
        self.shards_for(shard_id).len()
    }

    pub fn index_metadata(&self, index: &str) -> Option<&IndexMetadata> {
        self.metadata.get(index)
    }

    /// Checks the single-primary invariant across the whole routing table.
    /// Intended for use in tests and when constructing fixtures; production
    /// snapshots are assumed valid as published by the consensus layer.
    pub fn validate(&self) -> Result<(), String> {
        for (index, shards) in &self.routing_table {
            for (shard, copies) in shards {
                let primaries = copies
                    .iter()
                    .filter(|c| {
                        c.primary
                            && matches!(
                                c.state,
                                RoutingState::Initializing
                                    | RoutingState::Started
                                    | RoutingState::Relocating
                            )
                    })
                    .count();
                if primaries > 1 {
                    return Err(format!(
                        "index {index} shard {shard} has {primaries} primaries"
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Incrementally builds a `ClusterState`, used by tests and by the (out of
/// scope) consensus-consuming layer that assembles snapshots from raw
/// allocation decisions.
#[derive(Default)]
pub struct ClusterStateBuilder {
    state: ClusterState,
}

impl ClusterStateBuilder {
    pub fn new(version: u64) -> Self {
        let mut state = ClusterState::empty();
        state.version = version;
        Self { state }
    }

    pub fn node(mut self, node_id: impl Into<String>) -> Self {
        self.state.nodes.push(NodeInfo {
            node_id: node_id.into(),
            version: self.state.version,
        });
        self
    }

    pub fn index(mut self, name: impl Into<String>, metadata: IndexMetadata) -> Self {
        self.state.metadata.insert(name.into(), metadata);
        self
    }

    pub fn shard(mut self, routing: ShardRouting) -> Self {
        self.state
            .routing_table
            .entry(routing.shard_id.index.to_string())
            .or_default()
            .entry(routing.shard_id.shard)
            .or_default()
            .push(routing);
        self
    }

    pub fn global_block(mut self, block: ClusterBlock) -> Self {
        self.state.global_blocks.push(block);
        self
    }

    pub fn master(mut self, node_id: impl Into<String>) -> Self {
        self.state.master_node = Some(node_id.into());
        self
    }

    pub fn build(self) -> ClusterState {
        self.state
    }
}
