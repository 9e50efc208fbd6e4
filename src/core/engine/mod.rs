// src/core/engine/mod.rs

//! The local storage surface the coordination core depends on: applying an
//! operation, taking a shard offline on unrecoverable failure, and a
//! scoped in-use counter that defers teardown while an operation is
//! in-flight. Stands in for the Lucene-level index engine this crate does
//! not implement, behind the same trait boundary a real one would sit
//! behind.

use crate::core::cluster::state::ShardId;
use crate::core::errors::CoreError;
use crate::core::replication::translog::{RefCounter, ShardReference, Translog, TranslogOperation};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub version: u64,
}

/// The mutable-state surface a primary or replica copy exposes locally.
/// One implementor instance is shared by every shard this node hosts; it
/// is keyed internally by `ShardId`.
#[async_trait]
pub trait Engine: Send + Sync {
    async fn apply_index(&self, shard: &ShardId, uid: &str, source: Bytes) -> Result<ApplyOutcome, CoreError>;

    async fn apply_delete(&self, shard: &ShardId, uid: &str) -> Result<ApplyOutcome, CoreError>;

    /// Applies an operation at an explicit, primary-assigned version rather
    /// than minting a new one. Used on replicas, where the primary is the
    /// sole serialization point: a replica that has already observed a
    /// version greater than or equal to `version` returns `VersionConflict`,
    /// which the replication phase classifies as ignorable.
    async fn apply_replicated_index(
        &self,
        shard: &ShardId,
        uid: &str,
        source: Bytes,
        version: u64,
    ) -> Result<ApplyOutcome, CoreError>;

    async fn apply_replicated_delete(
        &self,
        shard: &ShardId,
        uid: &str,
        version: u64,
    ) -> Result<ApplyOutcome, CoreError>;

    /// Takes the local copy of `shard` offline. Idempotent: failing an
    /// already-failed shard is a no-op beyond logging.
    async fn fail_shard(&self, shard: &ShardId, reason: &str);

    fn is_failed(&self, shard: &ShardId) -> bool;

    /// Acquires a scoped reference on `shard`, deferring local teardown
    /// until it (and every other outstanding reference) is released.
    /// Fails if the shard is not known to this engine or already failed.
    fn acquire_reference(&self, shard: &ShardId) -> Result<ShardReference, CoreError>;

    fn translog(&self, shard: &ShardId) -> Option<Arc<Translog>>;
}

struct ShardState {
    version_counter: AtomicU64,
    refs: RefCounter,
    failed: AtomicBool,
    translog: Arc<Translog>,
}

/// An in-memory `Engine` used by tests in place of the Lucene-level index
/// engine. Each shard gets its own translog directory under a temporary
/// root supplied by the caller.
pub struct InMemoryEngine {
    shards: DashMap<ShardId, Arc<ShardState>>,
}

impl InMemoryEngine {
    pub fn new() -> Self {
        Self {
            shards: DashMap::new(),
        }
    }

    pub fn register_shard(&self, shard: ShardId, translog: Arc<Translog>) {
        self.shards.insert(
            shard,
            Arc::new(ShardState {
                version_counter: AtomicU64::new(0),
                refs: RefCounter::new(),
                failed: AtomicBool::new(false),
                translog,
            }),
        );
    }

    fn state_for(&self, shard: &ShardId) -> Result<Arc<ShardState>, CoreError> {
        self.shards
            .get(shard)
            .map(|e| e.clone())
            .ok_or_else(|| CoreError::EngineUnavailable(format!("shard {shard} not registered")))
    }
}

impl Default for InMemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Engine for InMemoryEngine {
    async fn apply_index(&self, shard: &ShardId, uid: &str, source: Bytes) -> Result<ApplyOutcome, CoreError> {
        let state = self.state_for(shard)?;
        if state.failed.load(Ordering::Acquire) {
            return Err(CoreError::EngineUnavailable(format!("shard {shard} failed")));
        }
        let version = state.version_counter.fetch_add(1, Ordering::AcqRel) + 1;
        state
            .translog
            .add(TranslogOperation::Index {
                uid: uid.to_string(),
                source,
                version,
            })
            .await?;
        Ok(ApplyOutcome { version })
    }

    async fn apply_delete(&self, shard: &ShardId, uid: &str) -> Result<ApplyOutcome, CoreError> {
        let state = self.state_for(shard)?;
        if state.failed.load(Ordering::Acquire) {
            return Err(CoreError::EngineUnavailable(format!("shard {shard} failed")));
        }
        let version = state.version_counter.fetch_add(1, Ordering::AcqRel) + 1;
        state
            .translog
            .add(TranslogOperation::Delete {
                uid: uid.to_string(),
                version,
            })
            .await?;
        Ok(ApplyOutcome { version })
    }

    async fn apply_replicated_index(
        &self,
        shard: &ShardId,
        uid: &str,
        source: Bytes,
        version: u64,
    ) -> Result<ApplyOutcome, CoreError> {
        let state = self.state_for(shard)?;
        if state.failed.load(Ordering::Acquire) {
            return Err(CoreError::EngineUnavailable(format!("shard {shard} failed")));
        }
        let current = state.version_counter.load(Ordering::Acquire);
        if version <= current {
            return Err(CoreError::VersionConflict {
                shard: shard.to_string(),
                expected: current,
                found: version,
            });
        }
        state.version_counter.store(version, Ordering::Release);
        state
            .translog
            .add(TranslogOperation::Index {
                uid: uid.to_string(),
                source,
                version,
            })
            .await?;
        Ok(ApplyOutcome { version })
    }

    async fn apply_replicated_delete(
        &self,
        shard: &ShardId,
        uid: &str,
        version: u64,
    ) -> Result<ApplyOutcome, CoreError> {
        let state = self.state_for(shard)?;
        if state.failed.load(Ordering::Acquire) {
            return Err(CoreError::EngineUnavailable(format!("shard {shard} failed")));
        }
        let current = state.version_counter.load(Ordering::Acquire);
        if version <= current {
            return Err(CoreError::VersionConflict {
                shard: shard.to_string(),
                expected: current,
                found: version,
            });
        }
        state.version_counter.store(version, Ordering::Release);
        state
            .translog
            .add(TranslogOperation::Delete {
                uid: uid.to_string(),
                version,
            })
            .await?;
        Ok(ApplyOutcome { version })
    }

    async fn fail_shard(&self, shard: &ShardId, reason: &str) {
        if let Ok(state) = self.state_for(shard) {
            if !state.failed.swap(true, Ordering::AcqRel) {
                warn!(%shard, reason, "local shard failed");
            }
        }
    }

    fn is_failed(&self, shard: &ShardId) -> bool {
        self.state_for(shard)
            .map(|s| s.failed.load(Ordering::Acquire))
            .unwrap_or(true)
    }

    fn acquire_reference(&self, shard: &ShardId) -> Result<ShardReference, CoreError> {
        let state = self.state_for(shard)?;
        if state.failed.load(Ordering::Acquire) {
            return Err(CoreError::EngineUnavailable(format!("shard {shard} failed")));
        }
        Ok(state.refs.acquire())
    }

    fn translog(&self, shard: &ShardId) -> Option<Arc<Translog>> {
        self.shards.get(shard).map(|s| s.translog.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn engine_with_shard(shard: &ShardId) -> InMemoryEngine {
        let engine = InMemoryEngine::new();
        let dir = tempdir().unwrap();
        let translog = Arc::new(Translog::open(vec![dir.path().to_path_buf()], 1, false).unwrap());
        std::mem::forget(dir); // keep the tempdir alive for the test's duration
        engine.register_shard(shard.clone(), translog);
        engine
    }

    #[tokio::test]
    async fn apply_index_assigns_increasing_versions() {
        let shard = ShardId::new("docs", 0);
        let engine = engine_with_shard(&shard).await;
        let v1 = engine.apply_index(&shard, "doc-1", Bytes::from("a")).await.unwrap();
        let v2 = engine.apply_index(&shard, "doc-2", Bytes::from("b")).await.unwrap();
        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);
    }

    #[tokio::test]
    async fn failed_shard_rejects_further_applies_and_references() {
        let shard = ShardId::new("docs", 0);
        let engine = engine_with_shard(&shard).await;
        engine.fail_shard(&shard, "disk error").await;
        assert!(engine.is_failed(&shard));
        assert!(engine.apply_index(&shard, "doc-1", Bytes::from("a")).await.is_err());
        assert!(engine.acquire_reference(&shard).is_err());
    }
}
