//! Live partition migration between shards.
//!
//! The gaining (target) shard drives the handshake:
//! 1. record durable intent (`PENDING`)
//! 2. version/compatibility precheck on both sides, before any mutation
//! 3. source quiesces the partition and fixes the cut position (`RUNNING`)
//! 4. source streams the partition's rows in cursor-paged chunks
//! 5. target opens generation `prev + 1`, source closes its generation at
//!    the cut, each within its own local transaction
//! 6. `SUCCEEDED`; repeat calls for the same pair are idempotent
//!
//! Transient failures revert the attempt to `PENDING` and a background task
//! retries after a backoff; version and metadata failures are terminal for
//! the attempt. Intent records are durable so a newly elected target leader
//! resumes or safely restarts in-flight work.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use fjall::{Keyspace, PartitionCreateOptions};
use serde::{Deserialize, Serialize};

use strata_log::{PartitionId, ReplicatedLog, ShardId};

use crate::error::{LedgerError, MigrationError};
use crate::generation_ledger::GenerationLedger;
use crate::generation_store::LedgerCommand;
use crate::kv::PartitionStore;
use crate::transport::MigrationTransport;
use crate::ShardCommand;

/// Hard cap on pages per partition transfer, as a cursor-stall backstop.
const TRANSFER_MAX_PAGES: usize = 1_000_000;

/// Externally observable state of one migration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationState {
    Pending,
    Running,
    Succeeded,
    Error,
}

/// Durable migration intent, keyed by partition in the `migrations` store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationIntent {
    pub partition: PartitionId,
    pub source_shard: ShardId,
    pub state: MigrationState,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: String,
    #[serde(default)]
    pub cancelled: bool,
}

/// Handle returned from the control API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationHandle {
    pub partition: PartitionId,
    pub state: MigrationState,
}

/// Configuration for the migration coordinator and its retry task.
#[derive(Clone, Copy, Debug)]
pub struct MigrationManagerConfig {
    /// Protocol version this node speaks.
    pub protocol_version: u32,
    /// Cluster-wide minimum a peer must meet before any state is mutated.
    pub min_protocol_version: u32,
    /// Bound on the source-side pending-operation drain.
    pub quiesce_timeout: Duration,
    /// Rows per transfer page.
    pub transfer_page_limit: usize,
    /// Evaluation interval of the background retry task.
    pub retry_interval: Duration,
    /// Minimum delay between attempts for one partition.
    pub retry_backoff: Duration,
    /// Give up after this many attempts; 0 retries indefinitely.
    pub retry_limit: u32,
}

/// Per-partition attempt bookkeeping kept in memory on the target.
struct AttemptCtl {
    cancelled: AtomicBool,
    /// Serializes attempts for one partition across the control API and the
    /// retry task.
    running: tokio::sync::Mutex<()>,
    last_attempt: Mutex<Option<Instant>>,
}

impl AttemptCtl {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            cancelled: AtomicBool::new(false),
            running: tokio::sync::Mutex::new(()),
            last_attempt: Mutex::new(None),
        })
    }
}

pub struct MigrationManager {
    shard: ShardId,
    cfg: MigrationManagerConfig,
    keyspace: Arc<Keyspace>,
    intents: fjall::PartitionHandle,
    transport: Arc<dyn MigrationTransport>,
    log: Arc<dyn ReplicatedLog>,
    ledger: Arc<GenerationLedger>,
    data: Arc<PartitionStore>,
    attempts: RwLock<HashMap<PartitionId, Arc<AttemptCtl>>>,
    /// Failed/aborted handoffs observed on this node as a source.
    source_errors: AtomicU64,
}

impl MigrationManager {
    pub fn open(
        shard: ShardId,
        cfg: MigrationManagerConfig,
        keyspace: Arc<Keyspace>,
        transport: Arc<dyn MigrationTransport>,
        log: Arc<dyn ReplicatedLog>,
        ledger: Arc<GenerationLedger>,
        data: Arc<PartitionStore>,
    ) -> anyhow::Result<Arc<Self>> {
        let intents = keyspace.open_partition("migrations", PartitionCreateOptions::default())?;
        let manager = Arc::new(Self {
            shard,
            cfg,
            keyspace,
            intents,
            transport,
            log,
            ledger,
            data,
            attempts: RwLock::new(HashMap::new()),
            source_errors: AtomicU64::new(0),
        });
        manager.recover()?;
        Ok(manager)
    }

    /// Recover in-flight intent after a (re)start: an attempt that was
    /// RUNNING when the previous leader died restarts from PENDING.
    fn recover(&self) -> anyhow::Result<()> {
        for intent in self.scan_intents()? {
            if intent.state == MigrationState::Running {
                tracing::info!(
                    partition = intent.partition,
                    source = intent.source_shard,
                    "recovering interrupted migration intent"
                );
                let mut recovered = intent;
                recovered.state = MigrationState::Pending;
                self.store_intent(&recovered)?;
            }
        }
        Ok(())
    }

    /// Target-initiated migration of `partition` away from `source_shard`.
    ///
    /// Drives one attempt to completion. A transient failure leaves the
    /// intent PENDING for the retry task; calling again for an already
    /// succeeded pair returns SUCCEEDED without re-running the protocol.
    pub async fn migrate_partition(
        &self,
        partition: PartitionId,
        source_shard: ShardId,
    ) -> MigrationHandle {
        if source_shard == self.shard {
            return MigrationHandle {
                partition,
                state: MigrationState::Error,
            };
        }

        if let Ok(Some(intent)) = self.intent(partition) {
            if intent.state == MigrationState::Succeeded {
                return MigrationHandle {
                    partition,
                    state: MigrationState::Succeeded,
                };
            }
        }

        let ctl = self.attempt_ctl(partition);
        let _running = ctl.running.lock().await;
        // An explicit call restarts a cancelled or errored attempt.
        ctl.cancelled.store(false, Ordering::Release);

        let state = self.run_attempt(partition, source_shard, &ctl).await;
        MigrationHandle { partition, state }
    }

    /// Current state for the control API.
    pub fn migration_state(&self, partition: PartitionId) -> Option<MigrationState> {
        self.intent(partition).ok().flatten().map(|i| i.state)
    }

    /// Cancel a migration that has not succeeded yet. The ledger is left
    /// unchanged and the source resumes normal operation.
    pub async fn cancel_migration(
        &self,
        partition: PartitionId,
    ) -> Result<MigrationState, MigrationError> {
        let Some(mut intent) = self.intent(partition).map_err(MigrationError::Metadata)? else {
            return Err(MigrationError::InvalidState {
                partition,
                reason: "no migration recorded".to_string(),
            });
        };
        match intent.state {
            MigrationState::Succeeded => Err(MigrationError::InvalidState {
                partition,
                reason: "migration already succeeded".to_string(),
            }),
            MigrationState::Error => Ok(MigrationState::Error),
            MigrationState::Pending | MigrationState::Running => {
                let ctl = self.attempt_ctl(partition);
                ctl.cancelled.store(true, Ordering::Release);
                intent.state = MigrationState::Error;
                intent.cancelled = true;
                intent.last_error = "cancelled".to_string();
                self.store_intent(&intent).map_err(|err| {
                    MigrationError::Metadata(LedgerError::WriteFailed {
                        reason: err.to_string(),
                    })
                })?;
                // Let the source resume non-quiesced operation.
                let _ = self
                    .transport
                    .abort_transfer(intent.source_shard, partition)
                    .await;
                tracing::info!(partition, source = intent.source_shard, "migration cancelled");
                Ok(MigrationState::Error)
            }
        }
    }

    /// Failed or aborted handoffs seen by this node as the losing side.
    pub fn source_error_count(&self) -> u64 {
        self.source_errors.load(Ordering::Acquire)
    }

    pub(crate) fn note_source_error(&self) {
        self.source_errors.fetch_add(1, Ordering::AcqRel);
    }

    /// One attempt from PENDING through the full handshake.
    async fn run_attempt(
        &self,
        partition: PartitionId,
        source_shard: ShardId,
        ctl: &AttemptCtl,
    ) -> MigrationState {
        *ctl.last_attempt.lock().expect("attempt clock lock") = Some(Instant::now());
        let attempts = self
            .intent(partition)
            .ok()
            .flatten()
            .map(|i| i.attempts)
            .unwrap_or(0)
            .saturating_add(1);

        let mut intent = MigrationIntent {
            partition,
            source_shard,
            state: MigrationState::Pending,
            attempts,
            last_error: String::new(),
            cancelled: false,
        };
        if self.store_intent(&intent).is_err() {
            return MigrationState::Error;
        }

        match self.drive_handshake(partition, source_shard, ctl, &mut intent).await {
            Ok(()) => {
                intent.state = MigrationState::Succeeded;
                intent.last_error = String::new();
                let _ = self.store_intent(&intent);
                tracing::info!(partition, source = source_shard, "partition migration succeeded");
                MigrationState::Succeeded
            }
            Err(err) => {
                // A cancel that landed mid-attempt wins over the attempt's
                // own failure classification.
                let cancelled = ctl.cancelled.load(Ordering::Acquire)
                    || matches!(err, MigrationError::Cancelled { .. });
                let state = if cancelled {
                    MigrationState::Error
                } else {
                    state_after_failure(&err)
                };
                intent.state = state;
                intent.cancelled = cancelled;
                intent.last_error = err.to_string();
                let _ = self.store_intent(&intent);
                tracing::warn!(
                    partition,
                    source = source_shard,
                    attempts,
                    state = ?state,
                    error = %err,
                    "partition migration attempt failed"
                );
                state
            }
        }
    }

    async fn drive_handshake(
        &self,
        partition: PartitionId,
        source_shard: ShardId,
        ctl: &AttemptCtl,
        intent: &mut MigrationIntent,
    ) -> Result<(), MigrationError> {
        // Resume path: a previous leader already opened our generation for
        // this pair; only the source-side close may still be outstanding.
        if let Some(open) = self.ledger.open_generation(partition) {
            if open.previous_shard == Some(source_shard) {
                if let (Some(prev_end), Some(prev_gen)) =
                    (open.previous_end, open.generation.checked_sub(1))
                {
                    self.transport
                        .close_generation(source_shard, partition, prev_gen, prev_end)
                        .await?;
                }
                return Ok(());
            }
            return Err(MigrationError::InvalidState {
                partition,
                reason: format!("partition already open on shard {} here", open.shard),
            });
        }

        self.check_cancelled(partition, ctl)?;

        // Version precheck on both sides; the source validates our version
        // inside the handshake, we validate its answer. Nothing is mutated
        // on either side before this passes.
        let peer_version = self
            .transport
            .handshake(source_shard, self.cfg.protocol_version)
            .await?;
        if peer_version < self.cfg.min_protocol_version {
            return Err(MigrationError::IncompatibleVersion {
                required: self.cfg.min_protocol_version,
                actual: peer_version,
            });
        }

        intent.state = MigrationState::Running;
        self.store_intent(intent)
            .map_err(|err| MigrationError::Metadata(LedgerError::WriteFailed {
                reason: err.to_string(),
            }))?;

        // Quiesce fixes the cut: after this the source admits no new writes
        // for the partition and `cut` bounds its generation.
        let grant = self
            .transport
            .quiesce_partition(source_shard, partition)
            .await?;

        if let Err(err) = self.check_cancelled(partition, ctl) {
            let _ = self.transport.abort_transfer(source_shard, partition).await;
            return Err(err);
        }

        if let Err(err) = self.transfer_rows(partition, source_shard, ctl).await {
            let _ = self.transport.abort_transfer(source_shard, partition).await;
            return Err(err);
        }

        if let Err(err) = self.check_cancelled(partition, ctl) {
            let _ = self.transport.abort_transfer(source_shard, partition).await;
            return Err(err);
        }

        // Generation-boundary commit, target side: open `prev + 1` starting
        // at our next log position. The command flows through the shard log,
        // so replicas and stream filters observe it in position order.
        let generation = grant.generation + 1;
        let start = self.log.last_position() + 1;
        let open = ShardCommand::Ledger(LedgerCommand::OpenGeneration {
            partition,
            generation,
            shard: self.shard,
            start: Some(start),
            previous_shard: Some(source_shard),
            previous_end: Some(grant.cut),
        });
        let payload = crate::encode_command(&open).map_err(|err| {
            MigrationError::Metadata(LedgerError::WriteFailed {
                reason: err.to_string(),
            })
        })?;
        if let Err(err) = self.log.propose(payload) {
            // Our ledger is unchanged; release the source.
            let _ = self.transport.abort_transfer(source_shard, partition).await;
            return Err(MigrationError::Metadata(LedgerError::WriteFailed {
                reason: err.to_string(),
            }));
        }

        // Generation-boundary commit, source side: close at the cut. Safe to
        // re-issue; the close is idempotent at the same cut.
        self.transport
            .close_generation(source_shard, partition, grant.generation, grant.cut)
            .await?;

        Ok(())
    }

    /// Stream the partition's rows from the source's transactional read
    /// path. Any failure here is terminal for the attempt, never silent
    /// data loss.
    async fn transfer_rows(
        &self,
        partition: PartitionId,
        source_shard: ShardId,
        ctl: &AttemptCtl,
    ) -> Result<(), MigrationError> {
        let mut cursor = Vec::new();
        let mut pages = 0usize;
        let mut rows = 0u64;

        loop {
            self.check_cancelled(partition, ctl)?;
            if pages >= TRANSFER_MAX_PAGES {
                return Err(MigrationError::TransferInterrupted {
                    reason: format!("transfer exceeded {TRANSFER_MAX_PAGES} pages"),
                });
            }
            pages += 1;

            let chunk = self
                .transport
                .fetch_partition_chunk(
                    source_shard,
                    partition,
                    cursor.clone(),
                    self.cfg.transfer_page_limit,
                )
                .await?;

            rows += self
                .data
                .apply_transferred(partition, &chunk.entries)
                .map_err(|err| MigrationError::TransferInterrupted {
                    reason: format!("installing transferred rows failed: {err}"),
                })?;

            if chunk.done {
                tracing::debug!(partition, source = source_shard, pages, rows, "transfer complete");
                return Ok(());
            }
            if chunk.next_cursor == cursor {
                return Err(MigrationError::TransferInterrupted {
                    reason: "transfer cursor stalled".to_string(),
                });
            }
            cursor = chunk.next_cursor;
        }
    }

    fn check_cancelled(
        &self,
        partition: PartitionId,
        ctl: &AttemptCtl,
    ) -> Result<(), MigrationError> {
        if ctl.cancelled.load(Ordering::Acquire) {
            Err(MigrationError::Cancelled { partition })
        } else {
            Ok(())
        }
    }

    fn attempt_ctl(&self, partition: PartitionId) -> Arc<AttemptCtl> {
        if let Some(ctl) = self.attempts.read().expect("attempts lock").get(&partition) {
            return ctl.clone();
        }
        let mut attempts = self.attempts.write().expect("attempts lock");
        attempts.entry(partition).or_insert_with(AttemptCtl::new).clone()
    }

    fn intent(&self, partition: PartitionId) -> Result<Option<MigrationIntent>, LedgerError> {
        let value = self
            .intents
            .get(partition.to_be_bytes())
            .map_err(|err| LedgerError::Corrupt {
                partition,
                reason: format!("intent read failed: {err}"),
            })?;
        match value {
            None => Ok(None),
            Some(bytes) => {
                serde_json::from_slice(&bytes).map(Some).map_err(|err| {
                    LedgerError::Corrupt {
                        partition,
                        reason: format!("intent decode failed: {err}"),
                    }
                })
            }
        }
    }

    fn store_intent(&self, intent: &MigrationIntent) -> anyhow::Result<()> {
        let value = serde_json::to_vec(intent)?;
        let mut batch = self.keyspace.batch();
        batch.insert(
            &self.intents,
            intent.partition.to_be_bytes().to_vec(),
            value,
        );
        batch.commit()?;
        Ok(())
    }

    fn scan_intents(&self) -> anyhow::Result<Vec<MigrationIntent>> {
        let mut out = Vec::new();
        for item in self.intents.iter() {
            let (_, value) = item?;
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }

    /// One pass of the background retry task.
    async fn retry_pending_once(self: &Arc<Self>) {
        let intents = match self.scan_intents() {
            Ok(intents) => intents,
            Err(err) => {
                tracing::warn!(error = ?err, "retry task failed to read migration intents");
                return;
            }
        };

        for intent in intents {
            let ctl = self.attempt_ctl(intent.partition);
            let last = *ctl.last_attempt.lock().expect("attempt clock lock");
            let decision = plan_retry(&intent, last.map(|t| t.elapsed()), &self.cfg);
            match decision {
                RetryDecision::Skip => {}
                RetryDecision::Exhausted => {
                    let mut exhausted = intent;
                    exhausted.state = MigrationState::Error;
                    exhausted.last_error = "retry limit exhausted".to_string();
                    if let Err(err) = self.store_intent(&exhausted) {
                        tracing::warn!(error = ?err, "failed to persist exhausted migration");
                    }
                }
                RetryDecision::Run => {
                    let Ok(_running) = ctl.running.try_lock() else {
                        continue;
                    };
                    tracing::info!(
                        partition = intent.partition,
                        source = intent.source_shard,
                        attempts = intent.attempts,
                        "retrying migration"
                    );
                    self.run_attempt(intent.partition, intent.source_shard, &ctl)
                        .await;
                }
            }
        }
    }
}

/// Spawn the background retry task for transiently failed migrations.
pub fn spawn(manager: Arc<MigrationManager>) {
    let interval = manager.cfg.retry_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            manager.retry_pending_once().await;
        }
    });
}

/// Map a failed attempt onto its externally visible state: transient
/// failures return to PENDING for the retry task, everything else is
/// terminal for the attempt.
fn state_after_failure(err: &MigrationError) -> MigrationState {
    if matches!(err, MigrationError::Cancelled { .. }) {
        return MigrationState::Error;
    }
    if err.is_retryable() {
        MigrationState::Pending
    } else {
        MigrationState::Error
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryDecision {
    Skip,
    Run,
    Exhausted,
}

/// Pure retry planning for one durable intent.
fn plan_retry(
    intent: &MigrationIntent,
    elapsed_since_attempt: Option<Duration>,
    cfg: &MigrationManagerConfig,
) -> RetryDecision {
    if intent.state != MigrationState::Pending || intent.cancelled {
        return RetryDecision::Skip;
    }
    if cfg.retry_limit > 0 && intent.attempts >= cfg.retry_limit {
        return RetryDecision::Exhausted;
    }
    match elapsed_since_attempt {
        Some(elapsed) if elapsed < cfg.retry_backoff => RetryDecision::Skip,
        _ => RetryDecision::Run,
    }
}
