//! RPC seam between migration coordinator instances.
//!
//! Each side of a migration reacts only to calls received through this
//! trait, never to the peer's internal state. The bytes-on-the-wire protocol
//! is not defined here; `InProcessTransport` serves tests and single-process
//! clusters, with fault strategies injected at construction.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use strata_log::{GenerationNumber, LogPosition, PartitionId, ShardId};

use crate::error::MigrationError;
use crate::ShardNode;

/// Source-side answer to a successful quiesce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QuiesceGrant {
    /// First source log position not covered by the closing generation; the
    /// span `[.., cut)` holds every operation visible before the handoff.
    pub cut: LogPosition,
    /// Generation the source currently holds open for the partition.
    pub generation: GenerationNumber,
}

/// One page of a partition transfer.
#[derive(Clone, Debug, Default)]
pub struct PartitionChunk {
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
    pub next_cursor: Vec<u8>,
    pub done: bool,
}

#[async_trait]
pub trait MigrationTransport: Send + Sync + 'static {
    /// Version/compatibility precheck. The callee validates the caller's
    /// protocol version and answers with its own; no state is mutated.
    async fn handshake(&self, shard: ShardId, proto_version: u32)
        -> Result<u32, MigrationError>;

    /// Ask `shard` to quiesce `partition` and fix the cut position.
    async fn quiesce_partition(
        &self,
        shard: ShardId,
        partition: PartitionId,
    ) -> Result<QuiesceGrant, MigrationError>;

    /// Read the next transfer page from the source's transactional read path.
    async fn fetch_partition_chunk(
        &self,
        shard: ShardId,
        partition: PartitionId,
        cursor: Vec<u8>,
        limit: usize,
    ) -> Result<PartitionChunk, MigrationError>;

    /// Ask the losing shard to close its open generation at the agreed cut.
    async fn close_generation(
        &self,
        shard: ShardId,
        partition: PartitionId,
        generation: GenerationNumber,
        cut: LogPosition,
    ) -> Result<(), MigrationError>;

    /// Tell the losing shard the attempt failed or was cancelled, so it
    /// resumes normal operation for the partition.
    async fn abort_transfer(
        &self,
        shard: ShardId,
        partition: PartitionId,
    ) -> Result<(), MigrationError>;
}

/// Fault strategy consulted by `InProcessTransport`. Production wiring uses
/// `NoTransportFaults`; tests inject unreachable shards and mid-transfer
/// read failures.
pub trait TransportFaults: Send + Sync + 'static {
    fn reachable(&self, _shard: ShardId) -> bool {
        true
    }

    /// Consulted before every transfer-page read on the source.
    fn check_fetch(
        &self,
        _shard: ShardId,
        _partition: PartitionId,
    ) -> Result<(), MigrationError> {
        Ok(())
    }
}

pub struct NoTransportFaults;

impl TransportFaults for NoTransportFaults {}

/// Transport that dispatches directly to registered in-process nodes.
pub struct InProcessTransport {
    peers: RwLock<HashMap<ShardId, Arc<ShardNode>>>,
    faults: Arc<dyn TransportFaults>,
}

impl InProcessTransport {
    pub fn new(faults: Arc<dyn TransportFaults>) -> Arc<Self> {
        Arc::new(Self {
            peers: RwLock::new(HashMap::new()),
            faults,
        })
    }

    pub fn without_faults() -> Arc<Self> {
        Self::new(Arc::new(NoTransportFaults))
    }

    /// Make a node addressable by its shard id.
    pub fn register(&self, node: Arc<ShardNode>) {
        let mut peers = self.peers.write().expect("transport peers lock");
        peers.insert(node.shard(), node);
    }

    /// Drop a node from the registry, e.g. when restarting it in tests.
    pub fn deregister(&self, shard: ShardId) {
        let mut peers = self.peers.write().expect("transport peers lock");
        peers.remove(&shard);
    }

    fn peer(&self, shard: ShardId) -> Result<Arc<ShardNode>, MigrationError> {
        if !self.faults.reachable(shard) {
            return Err(MigrationError::Unreachable {
                shard,
                reason: "peer not reachable".to_string(),
            });
        }
        let peers = self.peers.read().expect("transport peers lock");
        peers
            .get(&shard)
            .cloned()
            .ok_or_else(|| MigrationError::Unreachable {
                shard,
                reason: "no such shard registered".to_string(),
            })
    }
}

#[async_trait]
impl MigrationTransport for InProcessTransport {
    async fn handshake(
        &self,
        shard: ShardId,
        proto_version: u32,
    ) -> Result<u32, MigrationError> {
        self.peer(shard)?.handle_handshake(proto_version)
    }

    async fn quiesce_partition(
        &self,
        shard: ShardId,
        partition: PartitionId,
    ) -> Result<QuiesceGrant, MigrationError> {
        self.peer(shard)?.handle_quiesce(partition).await
    }

    async fn fetch_partition_chunk(
        &self,
        shard: ShardId,
        partition: PartitionId,
        cursor: Vec<u8>,
        limit: usize,
    ) -> Result<PartitionChunk, MigrationError> {
        self.faults.check_fetch(shard, partition)?;
        self.peer(shard)?.handle_fetch_chunk(partition, &cursor, limit)
    }

    async fn close_generation(
        &self,
        shard: ShardId,
        partition: PartitionId,
        generation: GenerationNumber,
        cut: LogPosition,
    ) -> Result<(), MigrationError> {
        self.peer(shard)?
            .handle_close_generation(partition, generation, cut)
    }

    async fn abort_transfer(
        &self,
        shard: ShardId,
        partition: PartitionId,
    ) -> Result<(), MigrationError> {
        self.peer(shard)?.handle_abort_transfer(partition);
        Ok(())
    }
}
