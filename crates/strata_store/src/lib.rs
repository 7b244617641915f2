//! Strata: a sharded KV store core built around a durable history of which
//! shard owned which partition over which span of the log.
//!
//! The pieces: the generation store/ledger (ownership history and queries),
//! the migration manager (live partition handoff between shards), and the
//! stream ownership filter (exactly-once change-stream delivery across a
//! handoff). Consensus and the physical storage engine are consumed through
//! seams: `strata_log::ReplicatedLog` and a transactional fjall keyspace.

use std::fs;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use strata_log::{
    GenerationNumber, LogPosition, PartitionId, ReplicatedLog, ShardId, StateMachine,
};

pub mod config;
pub mod error;
pub mod generation_ledger;
pub mod generation_store;
pub mod kv;
pub mod migration_manager;
pub mod quiesce;
pub mod shard_log;
pub mod stream_filter;
pub mod transport;

pub use config::{NodeArgs, NodeConfig};
pub use error::{LedgerError, MigrationError};
pub use generation_ledger::GenerationLedger;
pub use generation_store::{CommitProbe, GenerationRecord, GenerationStore, LedgerCommand, NoProbe};
pub use kv::{DataCommand, PartitionStore};
pub use migration_manager::{MigrationHandle, MigrationManager, MigrationState};
pub use quiesce::{PendingOpTracker, PendingOps};
pub use shard_log::FileShardLog;
pub use stream_filter::{OwnershipFilter, Subscription};
pub use transport::{InProcessTransport, MigrationTransport, PartitionChunk, QuiesceGrant};

/// Envelope for every command replicated through a shard's log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardCommand {
    Data(kv::DataCommand),
    Ledger(generation_store::LedgerCommand),
}

pub fn encode_command(command: &ShardCommand) -> anyhow::Result<Vec<u8>> {
    Ok(serde_json::to_vec(command)?)
}

pub fn decode_command(data: &[u8]) -> anyhow::Result<ShardCommand> {
    Ok(serde_json::from_slice(data)?)
}

/// Applies committed commands to the node's durable state. Leader writes and
/// follower replay share this path, so replicas converge.
struct ShardStateMachine {
    data: Arc<PartitionStore>,
    generations: Arc<GenerationStore>,
    ledger: Arc<GenerationLedger>,
}

impl StateMachine for ShardStateMachine {
    fn apply(&self, command: &[u8], _position: LogPosition) -> anyhow::Result<()> {
        match decode_command(command)? {
            ShardCommand::Data(cmd) => self.data.apply(&cmd),
            ShardCommand::Ledger(cmd) => {
                self.generations.apply(&cmd)?;
                self.ledger.refresh()?;
                Ok(())
            }
        }
    }
}

/// Construction-time strategy hooks. Production wiring uses the defaults;
/// the test suite injects failing probes and stalled counters.
pub struct NodeHooks {
    pub commit_probe: Arc<dyn CommitProbe>,
    /// Pending-op counter source consulted by the quiesce wait; defaults to
    /// the node's own tracker.
    pub quiesce_ops: Option<Arc<dyn PendingOps>>,
}

impl Default for NodeHooks {
    fn default() -> Self {
        Self {
            commit_probe: Arc::new(NoProbe),
            quiesce_ops: None,
        }
    }
}

/// One shard replica: storage, log, ledger, migration coordinator, and the
/// change-stream surface.
pub struct ShardNode {
    cfg: NodeConfig,
    keyspace: Arc<fjall::Keyspace>,
    log: Arc<FileShardLog>,
    data: Arc<PartitionStore>,
    ledger: Arc<GenerationLedger>,
    pending: Arc<PendingOpTracker>,
    quiesce_ops: Arc<dyn PendingOps>,
    manager: Arc<MigrationManager>,
}

impl ShardNode {
    /// Open storage and the shard log, replay, and wire the coordinator.
    pub fn open(
        cfg: NodeConfig,
        transport: Arc<dyn MigrationTransport>,
        hooks: NodeHooks,
    ) -> anyhow::Result<Arc<Self>> {
        use anyhow::Context;

        fs::create_dir_all(&cfg.data_dir).context("create data dir")?;
        let storage_dir = cfg.data_dir.join("storage");
        let log_dir = cfg.data_dir.join("log");

        let keyspace = Arc::new(
            fjall::Config::new(&storage_dir)
                .open()
                .context("open fjall keyspace")?,
        );
        let generations = Arc::new(GenerationStore::open(
            keyspace.clone(),
            hooks.commit_probe,
        )?);
        let ledger = GenerationLedger::open(cfg.shard_id, generations.clone())
            .context("open generation ledger")?;
        let data = Arc::new(PartitionStore::open(keyspace.clone())?);

        let state_machine: Arc<dyn StateMachine> = Arc::new(ShardStateMachine {
            data: data.clone(),
            generations: generations.clone(),
            ledger: ledger.clone(),
        });
        let log = FileShardLog::open_dir(&log_dir, cfg.log_sync, vec![state_machine])?;

        let manager = MigrationManager::open(
            cfg.shard_id,
            cfg.migration,
            keyspace.clone(),
            transport,
            log.clone() as Arc<dyn ReplicatedLog>,
            ledger.clone(),
            data.clone(),
        )?;

        let pending = PendingOpTracker::new();
        let quiesce_ops = hooks
            .quiesce_ops
            .unwrap_or_else(|| pending.clone() as Arc<dyn PendingOps>);

        if cfg.retry_task_enabled {
            migration_manager::spawn(manager.clone());
        }

        tracing::info!(
            node_id = cfg.node_id,
            shard_id = cfg.shard_id,
            partitions = cfg.initial_partitions.len(),
            ledger_ready = ledger.is_ready(),
            "shard node open"
        );

        Ok(Arc::new(Self {
            cfg,
            keyspace,
            log,
            data,
            ledger,
            pending,
            quiesce_ops,
            manager,
        }))
    }

    pub fn shard(&self) -> ShardId {
        self.cfg.shard_id
    }

    pub fn ledger(&self) -> &Arc<GenerationLedger> {
        &self.ledger
    }

    pub fn log(&self) -> Arc<dyn ReplicatedLog> {
        self.log.clone()
    }

    pub fn keyspace(&self) -> &Arc<fjall::Keyspace> {
        &self.keyspace
    }

    pub fn pending_tracker(&self) -> &Arc<PendingOpTracker> {
        &self.pending
    }

    /// Whether writes to `partition` route to this shard right now.
    ///
    /// Partitions without migration history fall back to the static
    /// assignment; once a history exists, only an open generation grants
    /// ownership.
    pub fn owns_partition(&self, partition: PartitionId) -> bool {
        if self.ledger.has_partition(partition) {
            self.ledger.open_generation(partition).is_some()
        } else {
            self.cfg.initial_partitions.contains(&partition)
        }
    }

    /// Replicate one client write. The pending-op guard spans admission to
    /// durable application, which is what the quiesce wait drains.
    pub fn put(&self, partition: PartitionId, key: &[u8], value: &[u8]) -> anyhow::Result<LogPosition> {
        anyhow::ensure!(
            self.owns_partition(partition),
            "partition {partition} does not route to shard {}",
            self.cfg.shard_id
        );
        let _guard = self.pending.admit(partition)?;
        let command = ShardCommand::Data(DataCommand::Put {
            partition,
            key: key.to_vec(),
            value: value.to_vec(),
        });
        self.log.propose(encode_command(&command)?)
    }

    pub fn get(&self, partition: PartitionId, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        self.data.get(partition, key)
    }

    pub fn row_count(&self, partition: PartitionId) -> anyhow::Result<u64> {
        self.data.row_count(partition)
    }

    // Control API ---------------------------------------------------------

    pub async fn migrate_partition(
        &self,
        partition: PartitionId,
        source_shard: ShardId,
    ) -> MigrationHandle {
        self.manager.migrate_partition(partition, source_shard).await
    }

    pub fn migration_state(&self, partition: PartitionId) -> Option<MigrationState> {
        self.manager.migration_state(partition)
    }

    pub async fn cancel_migration(
        &self,
        partition: PartitionId,
    ) -> Result<MigrationState, MigrationError> {
        self.manager.cancel_migration(partition).await
    }

    /// Failed or aborted handoffs observed by this node as the losing side.
    pub fn source_error_count(&self) -> u64 {
        self.manager.source_error_count()
    }

    // Change stream -------------------------------------------------------

    /// Start a change-stream subscription from `from` (inclusive). Each
    /// subscription owns an independent ownership filter.
    pub fn subscribe(&self, from: LogPosition, buffer: usize) -> Subscription {
        let filter = OwnershipFilter::new(
            self.cfg.shard_id,
            &self.cfg.initial_partitions,
            self.ledger.clone(),
        );
        stream_filter::spawn_subscription(
            self.cfg.shard_id,
            self.log.clone(),
            filter,
            from,
            buffer,
        )
    }

    // Source-side migration handlers --------------------------------------

    /// Version precheck answered by the losing shard; mutates nothing.
    pub(crate) fn handle_handshake(&self, peer_version: u32) -> Result<u32, MigrationError> {
        if peer_version < self.cfg.migration.min_protocol_version {
            return Err(MigrationError::IncompatibleVersion {
                required: self.cfg.migration.min_protocol_version,
                actual: peer_version,
            });
        }
        Ok(self.cfg.migration.protocol_version)
    }

    /// Fence the partition, drain pending operations, and fix the cut.
    pub(crate) async fn handle_quiesce(
        &self,
        partition: PartitionId,
    ) -> Result<QuiesceGrant, MigrationError> {
        if !self.owns_partition(partition) {
            return Err(MigrationError::InvalidState {
                partition,
                reason: format!("not owned by shard {}", self.cfg.shard_id),
            });
        }
        self.pending.fence(partition);
        if let Err(err) = quiesce::wait_quiesced(
            self.quiesce_ops.as_ref(),
            partition,
            self.cfg.migration.quiesce_timeout,
        )
        .await
        {
            // Resume normal operation; the target will retry.
            self.pending.unfence(partition);
            return Err(err);
        }
        // The cut is the first position NOT covered by the closing
        // generation: the drained log ends at `last_position`, so
        // `[.., cut)` spans every operation admitted before the handoff.
        let cut = self.log.last_position() + 1;
        let generation = self
            .ledger
            .open_generation(partition)
            .map(|r| r.generation)
            .unwrap_or(0);
        tracing::debug!(partition, cut, generation, "partition quiesced for handoff");
        Ok(QuiesceGrant { cut, generation })
    }

    /// Transactional read path for one transfer page.
    pub(crate) fn handle_fetch_chunk(
        &self,
        partition: PartitionId,
        cursor: &[u8],
        limit: usize,
    ) -> Result<PartitionChunk, MigrationError> {
        let (entries, next_cursor, done) = self
            .data
            .scan_chunk(partition, cursor, limit)
            .map_err(|err| MigrationError::TransferInterrupted {
                reason: format!("source read path failed: {err}"),
            })?;
        Ok(PartitionChunk {
            entries,
            next_cursor,
            done,
        })
    }

    /// Source half of the generation-boundary commit: close the open
    /// generation at the agreed cut, within this shard's own transaction.
    pub(crate) fn handle_close_generation(
        &self,
        partition: PartitionId,
        generation: GenerationNumber,
        cut: LogPosition,
    ) -> Result<(), MigrationError> {
        // First handoff on a shard lazily initializes its generation table:
        // the implicit generation-0 residency becomes an explicit record.
        if self.ledger.history(partition).is_empty() {
            if generation != 0 {
                return Err(MigrationError::Metadata(LedgerError::NotFound {
                    partition,
                    generation,
                }));
            }
            let init = ShardCommand::Ledger(LedgerCommand::OpenGeneration {
                partition,
                generation: 0,
                shard: self.cfg.shard_id,
                start: None,
                previous_shard: None,
                previous_end: None,
            });
            self.propose_ledger(&init)?;
        }

        let close = ShardCommand::Ledger(LedgerCommand::CloseGeneration {
            partition,
            generation,
            end: cut,
        });
        self.propose_ledger(&close)?;
        self.pending.unfence(partition);
        tracing::info!(
            partition,
            generation,
            cut,
            "closed generation after handoff"
        );
        Ok(())
    }

    /// The target gave up on the attempt: resume normal operation and count
    /// the failure.
    pub(crate) fn handle_abort_transfer(&self, partition: PartitionId) {
        self.pending.unfence(partition);
        self.manager.note_source_error();
        tracing::warn!(partition, "handoff aborted by peer; resuming partition");
    }

    fn propose_ledger(&self, command: &ShardCommand) -> Result<(), MigrationError> {
        let payload = encode_command(command).map_err(|err| {
            MigrationError::Metadata(LedgerError::WriteFailed {
                reason: err.to_string(),
            })
        })?;
        self.log.propose(payload).map_err(|err| {
            MigrationError::Metadata(LedgerError::WriteFailed {
                reason: err.to_string(),
            })
        })?;
        Ok(())
    }
}
