// src/core/replication/framing.rs

//! Request/response data model and the versioned wire envelope that
//! addresses a request to a specific shard.

use crate::core::cluster::state::ShardId;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The minimum write-consistency level a write must satisfy before the
/// primary phase proceeds past its write-consistency check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum WriteConsistencyLevel {
    #[default]
    Default,
    One,
    Quorum,
    All,
}

/// Computes the minimum count of active copies required before a write is
/// admitted: ALL -> routing-table size; QUORUM -> floor(size/2)+1 only when
/// size > 2, else 1; ONE/DEFAULT -> 1.
pub fn required_active_shards(level: WriteConsistencyLevel, routing_table_size: usize) -> usize {
    match level {
        WriteConsistencyLevel::All => routing_table_size,
        WriteConsistencyLevel::Quorum => {
            if routing_table_size > 2 {
                routing_table_size / 2 + 1
            } else {
                1
            }
        }
        WriteConsistencyLevel::One | WriteConsistencyLevel::Default => 1,
    }
}

/// The document-level operation a write request carries. `TranslogOperation`
/// mirrors this shape on the durability side; this is the pre-apply form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteKind {
    Index { uid: String },
    Delete { uid: String },
}

/// A client write request targeting an index, prior to shard resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteRequest {
    pub target_index: String,
    pub routing_key: Option<Bytes>,
    pub kind: WriteKind,
    pub body: Bytes,
    pub consistency_level: WriteConsistencyLevel,
    pub timeout: Duration,
    /// Set once a retry may have caused the primary to apply this request
    /// more than once (e.g. after a transport error whose outcome is
    /// unknown, or after re-enumerating replicas with a fresh topology).
    pub can_have_duplicates: bool,
    /// When true, the request must not run on the thread that observed the
    /// retry-triggering cluster-state change (it is handed to the general
    /// write pool instead). Every retry sets this.
    pub operation_threaded: bool,
}

impl WriteRequest {
    pub fn index(target_index: impl Into<String>, uid: impl Into<String>, body: Bytes) -> Self {
        Self {
            target_index: target_index.into(),
            routing_key: None,
            kind: WriteKind::Index { uid: uid.into() },
            body,
            consistency_level: WriteConsistencyLevel::Default,
            timeout: Duration::from_secs(30),
            can_have_duplicates: false,
            operation_threaded: false,
        }
    }

    pub fn delete(target_index: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            target_index: target_index.into(),
            routing_key: None,
            kind: WriteKind::Delete { uid: uid.into() },
            body: Bytes::new(),
            consistency_level: WriteConsistencyLevel::Default,
            timeout: Duration::from_secs(30),
            can_have_duplicates: false,
            operation_threaded: false,
        }
    }

    pub fn with_consistency(mut self, level: WriteConsistencyLevel) -> Self {
        self.consistency_level = level;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_routing_key(mut self, key: Bytes) -> Self {
        self.routing_key = Some(key);
        self
    }

    fn routing_bytes(&self) -> &[u8] {
        self.routing_key
            .as_deref()
            .unwrap_or_else(|| match &self.kind {
                WriteKind::Index { uid } | WriteKind::Delete { uid } => uid.as_bytes(),
            })
    }

    /// Resolves the numeric shard this request lands on, given the index's
    /// shard count. Hashes the routing key (or document uid) and reduces
    /// mod the shard count, since this domain has no fixed slot count to
    /// hash against.
    pub fn resolve_shard_number(&self, num_shards: u32) -> u32 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.routing_bytes().hash(&mut hasher);
        (hasher.finish() % num_shards as u64) as u32
    }
}

/// The request handed from the primary apply to the replication phase: the
/// same document-level operation, now tagged with the version the primary
/// assigned, to be applied identically (not re-assigned) on every replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaRequest {
    pub shard_id: ShardId,
    pub kind: WriteKind,
    pub body: Bytes,
    pub version: u64,
    pub can_have_duplicates: bool,
}

/// What a replica returns after applying (or being told to ignore) a
/// `ReplicaRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaResponse {
    pub version: u64,
}

/// The protocol version of a peer, governing which optional fields a
/// serialized request/response carries. Cross-version compatibility is a
/// correctness requirement of every serializable type in the core (the
/// translog is the one exception: it is local-only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProtocolVersion(pub u32);

impl ProtocolVersion {
    /// The version at which a full `ShardId` (index name + numeric shard)
    /// was added to the wire form of a shard-addressed request. Peers older
    /// than this only understand a bare numeric shard id and carry the
    /// concrete index name inside the embedded request body instead.
    pub const SHARD_ID_INTRODUCED: ProtocolVersion = ProtocolVersion(2);
    pub const CURRENT: ProtocolVersion = ProtocolVersion(2);
}

/// A shard-addressed request envelope. `encode`/`decode` are version-aware:
/// a peer below `SHARD_ID_INTRODUCED` receives only the numeric shard id
/// (the index name must already be present in the embedded `payload`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardReplicationRequest<P> {
    pub shard_id: ShardId,
    pub payload: P,
}

impl<P: Serialize + for<'de> Deserialize<'de>> ShardReplicationRequest<P> {
    pub fn new(shard_id: ShardId, payload: P) -> Self {
        Self { shard_id, payload }
    }

    /// Encodes for a peer at the given protocol version. Below
    /// `SHARD_ID_INTRODUCED` the wire form is `(shard_number, payload)`;
    /// at or above it, the wire form is `(shard_id, payload)`.
    pub fn encode(&self, peer_version: ProtocolVersion) -> Result<Vec<u8>, bincode::error::EncodeError> {
        let config = bincode::config::standard();
        if peer_version >= ProtocolVersion::SHARD_ID_INTRODUCED {
            bincode::serde::encode_to_vec((true, &self.shard_id, &self.payload), config)
        } else {
            bincode::serde::encode_to_vec((false, self.shard_id.shard, &self.payload), config)
        }
    }

    pub fn decode(
        bytes: &[u8],
        fallback_index: &str,
    ) -> Result<Self, bincode::error::DecodeError> {
        let config = bincode::config::standard();
        // Try the modern (has_full_id, ShardId, payload) form first.
        if let Ok((decoded, _len)) =
            bincode::serde::decode_from_slice::<(bool, ShardId, P), _>(bytes, config)
        {
            let (has_full_id, shard_id, payload) = decoded;
            if has_full_id {
                return Ok(Self { shard_id, payload });
            }
        }
        let ((_has_full_id, shard_num, payload), _len) =
            bincode::serde::decode_from_slice::<(bool, u32, P), _>(bytes, config)?;
        Ok(Self {
            shard_id: ShardId::new(fallback_index.to_string(), shard_num),
            payload,
        })
    }
}

/// Aggregate outcome of one write request, as handed back to the client
/// once the replication phase finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardReplicationResponse<R> {
    pub payload: R,
    pub total_shards: usize,
    pub successes: usize,
    pub failures: usize,
    pub skipped: usize,
}
