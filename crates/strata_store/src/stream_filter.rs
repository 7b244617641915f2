//! Per-subscription stream ownership filtering.
//!
//! Every change-stream subscription holds its own `OwnershipFilter`: an
//! immutable owned-partition snapshot published by atomic swap, consulted
//! once per operation on the hot path. The snapshot is derived from the
//! generation ledger; a ledger with no metadata contributes nothing beyond
//! the shard's static partition assignment, so a missing or not-ready ledger
//! is never an error.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use tokio::sync::{broadcast, mpsc};

use strata_log::{LogPosition, PartitionId, ReplicatedLog, ShardId, StreamOperation};

use crate::generation_ledger::GenerationLedger;
use crate::ShardCommand;

/// Ownership predicate for one (shard, subscription) pair.
///
/// Snapshots are never shared between filters: mutating one subscription's
/// view can not affect another's.
pub struct OwnershipFilter {
    shard: ShardId,
    initial: BTreeSet<PartitionId>,
    ledger: Arc<GenerationLedger>,
    owned: RwLock<Arc<BTreeSet<PartitionId>>>,
}

impl OwnershipFilter {
    pub fn new(
        shard: ShardId,
        initial_partitions: &[PartitionId],
        ledger: Arc<GenerationLedger>,
    ) -> Self {
        let initial: BTreeSet<PartitionId> = initial_partitions.iter().copied().collect();
        let filter = Self {
            shard,
            initial,
            ledger,
            owned: RwLock::new(Arc::new(BTreeSet::new())),
        };
        filter.refresh();
        filter
    }

    /// Recompute the owned set from the ledger and swap it in atomically.
    pub fn refresh(&self) {
        let mut owned = BTreeSet::new();
        // Statically assigned partitions with no migration history are owned
        // implicitly under generation 0.
        for partition in &self.initial {
            if !self.ledger.has_partition(*partition) {
                owned.insert(*partition);
            }
        }
        // Partitions with history are owned iff a generation is open here.
        owned.extend(self.ledger.open_partitions());

        *self.owned.write().expect("owned snapshot lock") = Arc::new(owned);
    }

    /// Hot-path check: forward iff the operation's partition is owned now.
    pub fn admits(&self, partition: PartitionId) -> bool {
        self.owned
            .read()
            .expect("owned snapshot lock")
            .contains(&partition)
    }

    /// Replay check for a historical operation: the shard's recorded
    /// generation spans decide ownership at `position`, falling back to the
    /// current snapshot for partitions without history.
    pub fn admits_at(&self, partition: PartitionId, position: LogPosition) -> bool {
        if self.ledger.has_partition(partition) {
            self.ledger.covers_position(partition, position)
        } else {
            self.admits(partition)
        }
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    /// Current snapshot, for diagnostics and tests.
    pub fn snapshot(&self) -> Arc<BTreeSet<PartitionId>> {
        self.owned.read().expect("owned snapshot lock").clone()
    }
}

/// One change-stream subscription, fed by a background forwarding task.
pub struct Subscription {
    rx: mpsc::Receiver<StreamOperation>,
}

impl Subscription {
    pub async fn next(&mut self) -> Option<StreamOperation> {
        self.rx.recv().await
    }

    /// Drain whatever has been delivered so far without waiting.
    pub fn drain_ready(&mut self) -> Vec<StreamOperation> {
        let mut out = Vec::new();
        while let Ok(op) = self.rx.try_recv() {
            out.push(op);
        }
        out
    }
}

/// Start a subscription on `shard`'s change stream from `from` (inclusive).
///
/// The task replays committed history first, then follows the live tail.
/// Ledger commands observed on the stream swap the filter's snapshot before
/// any later operation is checked, which pins the ownership boundary to the
/// generation-boundary commit exactly.
pub fn spawn_subscription(
    shard: ShardId,
    log: Arc<dyn ReplicatedLog>,
    filter: OwnershipFilter,
    from: LogPosition,
    buffer: usize,
) -> Subscription {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    tokio::spawn(async move {
        if let Err(err) = run_subscription(shard, log, filter, from, tx).await {
            tracing::warn!(shard, error = ?err, "subscription task stopped");
        }
    });
    Subscription { rx }
}

async fn run_subscription(
    shard: ShardId,
    log: Arc<dyn ReplicatedLog>,
    filter: OwnershipFilter,
    from: LogPosition,
    tx: mpsc::Sender<StreamOperation>,
) -> anyhow::Result<()> {
    // Subscribe before snapshotting the high position so no entry can fall
    // between replay and the live tail.
    let mut live = log.subscribe();
    let high = log.last_position();

    if from <= high {
        for entry in log.range(from, high)? {
            if let Some(op) = screen_replay(shard, &filter, &entry.command, entry.position)? {
                if tx.send(op).await.is_err() {
                    return Ok(());
                }
            }
        }
    }

    loop {
        let entry = match live.recv().await {
            Ok(entry) => entry,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(shard, skipped, "subscription lagged behind the live tail");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return Ok(()),
        };
        // Replay already delivered everything up to `high`.
        if entry.position <= high {
            continue;
        }
        if let Some(op) = screen_live(shard, &filter, &entry.command, entry.position)? {
            if tx.send(op).await.is_err() {
                return Ok(());
            }
        }
    }
}

fn screen_live(
    shard: ShardId,
    filter: &OwnershipFilter,
    command: &[u8],
    position: LogPosition,
) -> anyhow::Result<Option<StreamOperation>> {
    match crate::decode_command(command)? {
        ShardCommand::Ledger(_) => {
            // The generation boundary moved: swap the snapshot before any
            // later operation is screened.
            filter.refresh();
            Ok(None)
        }
        ShardCommand::Data(data) => {
            let partition = data.partition();
            if !filter.admits(partition) {
                return Ok(None);
            }
            Ok(Some(StreamOperation {
                partition,
                shard,
                position,
                payload: command.to_vec(),
            }))
        }
    }
}

fn screen_replay(
    shard: ShardId,
    filter: &OwnershipFilter,
    command: &[u8],
    position: LogPosition,
) -> anyhow::Result<Option<StreamOperation>> {
    match crate::decode_command(command)? {
        ShardCommand::Ledger(_) => Ok(None),
        ShardCommand::Data(data) => {
            let partition = data.partition();
            if !filter.admits_at(partition, position) {
                return Ok(None);
            }
            Ok(Some(StreamOperation {
                partition,
                shard,
                position,
                payload: command.to_vec(),
            }))
        }
    }
}
