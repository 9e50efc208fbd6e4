// src/core/replication/mod.rs

//! The write-coordination path: wire framing, the durable per-shard
//! translog, the shard-state reporter, and the primary/replication phase
//! pair that together implement a two-phase write.

pub mod framing;
pub mod primary_phase;
pub mod replication_phase;
pub mod reporter;
pub mod translog;

pub use framing::{
    ProtocolVersion, ShardReplicationRequest, ShardReplicationResponse, WriteConsistencyLevel,
    WriteRequest, required_active_shards,
};
pub use primary_phase::{PrimaryPhase, PrimaryPhaseOutcome};
pub use replication_phase::{ReplicationPhase, ReplicationOutcome};
pub use reporter::{ShardStateReporter, ShardStateUpdate};
pub use translog::{Location, RefCounter, ShardReference, Snapshot, Translog, TranslogOperation};
