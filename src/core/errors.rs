// src/core/errors.rs

//! Defines the primary error type for the coordination core.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum for the replicated-write coordination core.
///
/// `retryable()` and `ignorable_on_replica()` replace the runtime-type
/// matching the original distributed-write-path implementation used to
/// classify failures; retryability is a property of the variant, not of
/// an exception hierarchy.
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("cluster block: {description} (retryable={retryable})")]
    ClusterBlocked {
        retryable: bool,
        description: String,
    },

    #[error("unavailable shards: {0}")]
    UnavailableShards(String),

    #[error("write consistency not met: {0}")]
    WriteConsistencyUnmet(String),

    #[error("transport disconnected: {0}")]
    TransportDisconnected(String),

    #[error("node closed: {0}")]
    NodeClosed(String),

    #[error("version conflict on shard {shard}: expected {expected}, found {found}")]
    VersionConflict {
        shard: String,
        expected: u64,
        found: u64,
    },

    #[error("document already exists")]
    DocumentAlreadyExists,

    #[error("engine not available yet: {0}")]
    EngineUnavailable(String),

    #[error("translog corrupted: {0}")]
    TranslogCorrupted(String),

    #[error("translog closed")]
    TranslogClosed,

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Io(Arc::new(e))
    }
}

/// Disposition of an error encountered while routing or applying a primary
/// write: retryable conditions cause the primary phase to re-observe cluster
/// state and try again; everything else is terminal.
impl CoreError {
    /// True if the primary phase should retry (re-observe cluster state and
    /// restart from the block-check step) instead of failing the caller.
    pub fn retryable_on_primary(&self) -> bool {
        matches!(
            self,
            CoreError::ClusterBlocked { retryable: true, .. }
                | CoreError::UnavailableShards(_)
                | CoreError::WriteConsistencyUnmet(_)
                | CoreError::TransportDisconnected(_)
                | CoreError::NodeClosed(_)
                | CoreError::EngineUnavailable(_)
        )
    }

    /// True if a replica reporting this error should be left alone rather
    /// than failed to the master. These indicate the replica is already at
    /// or past the write's effective state.
    pub fn ignorable_on_replica(&self) -> bool {
        matches!(
            self,
            CoreError::EngineUnavailable(_)
                | CoreError::VersionConflict { .. }
                | CoreError::DocumentAlreadyExists
        )
    }
}
