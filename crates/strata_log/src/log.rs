//! Traits and records for the replicated per-shard log.
//!
//! These types are kept in a small, dependency-light module because they are
//! used by both the log implementation and the ledger/stream layers above it.

use tokio::sync::broadcast;

use crate::{LogPosition, PartitionId, ShardId};

/// One committed log entry, as replayed to state machines and subscribers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommittedEntry {
    pub position: LogPosition,
    pub command: Vec<u8>,
}

/// One externally visible write operation on the change stream.
///
/// Operations delivered for a given partition, concatenated across all shards
/// ever streamed from, are gap-free and duplicate-free by position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamOperation {
    pub partition: PartitionId,
    pub shard: ShardId,
    pub position: LogPosition,
    pub payload: Vec<u8>,
}

/// Command consumer driven by the log on every committed entry.
///
/// Leader-applied and follower-replayed entries go through the same path so
/// replicas converge to identical state.
pub trait StateMachine: Send + Sync + 'static {
    fn apply(&self, command: &[u8], position: LogPosition) -> anyhow::Result<()>;
}

/// Handle to one shard's replicated log.
///
/// The consensus engine behind this trait is not part of this repository;
/// the core only needs leadership, proposal, durable positions, and a tail.
pub trait ReplicatedLog: Send + Sync + 'static {
    /// Whether this node currently leads the shard owning the log.
    fn is_leader(&self) -> bool;

    /// Replicate one command; resolves once the command is durably committed
    /// and applied locally. Returns the position assigned to the command.
    fn propose(&self, command: Vec<u8>) -> anyhow::Result<LogPosition>;

    /// Highest durably committed position, 0 when the log is empty.
    fn last_position(&self) -> LogPosition;

    /// Tail of committed entries, starting after the current position.
    fn subscribe(&self) -> broadcast::Receiver<CommittedEntry>;

    /// Committed entries with positions in `[from, to]`, for replay.
    fn range(&self, from: LogPosition, to: LogPosition) -> anyhow::Result<Vec<CommittedEntry>>;
}
