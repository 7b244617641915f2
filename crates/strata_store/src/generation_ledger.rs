//! Per-node cached view over the generation store.
//!
//! Reads are non-blocking and served from a snapshot rebuilt after every
//! applied ledger command; writes never go through this type. The ledger is
//! lazily initialized: a shard that has never participated in a migration
//! holds no generation metadata and stays "not ready".

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use tokio::sync::watch;

use strata_log::{GenerationNumber, LogPosition, PartitionId, ShardId};

use crate::error::LedgerError;
use crate::generation_store::{GenerationRecord, GenerationStore};

#[derive(Default)]
struct LedgerView {
    /// Per-partition history, ordered by generation number.
    histories: BTreeMap<PartitionId, Vec<GenerationRecord>>,
}

pub struct GenerationLedger {
    shard: ShardId,
    store: Arc<GenerationStore>,
    view: RwLock<Arc<LedgerView>>,
    ready_tx: watch::Sender<bool>,
}

impl GenerationLedger {
    pub fn open(shard: ShardId, store: Arc<GenerationStore>) -> Result<Arc<Self>, LedgerError> {
        let (ready_tx, _) = watch::channel(false);
        let ledger = Arc::new(Self {
            shard,
            store,
            view: RwLock::new(Arc::new(LedgerView::default())),
            ready_tx,
        });
        ledger.refresh()?;
        Ok(ledger)
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    /// Rebuild the cached view from the store and publish it atomically.
    pub fn refresh(&self) -> Result<(), LedgerError> {
        let records = self.store.scan_all()?;
        let mut histories: BTreeMap<PartitionId, Vec<GenerationRecord>> = BTreeMap::new();
        for record in records {
            histories.entry(record.partition).or_default().push(record);
        }
        for (partition, history) in &histories {
            validate_history(*partition, history)?;
        }

        let ready = !histories.is_empty();
        *self.view.write().expect("ledger view lock") = Arc::new(LedgerView { histories });

        if ready {
            // Readiness is sticky: history is never deleted.
            self.ready_tx.send_replace(true);
        }
        Ok(())
    }

    /// True once any generation record has been durably observed here.
    pub fn is_ready(&self) -> bool {
        *self.ready_tx.borrow()
    }

    /// Readiness notification, so consumers need not poll `is_ready`.
    pub fn ready_watch(&self) -> watch::Receiver<bool> {
        self.ready_tx.subscribe()
    }

    pub fn has_partition(&self, partition: PartitionId) -> bool {
        self.snapshot().histories.contains_key(&partition)
    }

    /// The currently open generation for `partition` on this shard, if any.
    pub fn open_generation(&self, partition: PartitionId) -> Option<GenerationRecord> {
        self.snapshot()
            .histories
            .get(&partition)?
            .iter()
            .find(|r| r.is_open())
            .cloned()
    }

    pub fn generation(
        &self,
        partition: PartitionId,
        generation: GenerationNumber,
    ) -> Result<GenerationRecord, LedgerError> {
        self.snapshot()
            .histories
            .get(&partition)
            .and_then(|history| history.iter().find(|r| r.generation == generation))
            .cloned()
            .ok_or(LedgerError::NotFound {
                partition,
                generation,
            })
    }

    /// This shard's recorded history for `partition`, ordered by generation.
    pub fn history(&self, partition: PartitionId) -> Vec<GenerationRecord> {
        self.snapshot()
            .histories
            .get(&partition)
            .cloned()
            .unwrap_or_default()
    }

    /// For every partition this shard has ever held, the record (if any)
    /// whose span contains `pos`. This is the resume primitive for stream
    /// consumers restarting at an arbitrary position.
    pub fn generations_covering(&self, pos: LogPosition) -> Vec<GenerationRecord> {
        let view = self.snapshot();
        let mut out = Vec::new();
        for history in view.histories.values() {
            if let Some(record) = history.iter().find(|r| r.covers(pos)) {
                out.push(record.clone());
            }
        }
        out
    }

    /// Whether this shard's history for `partition` covers `pos`.
    pub fn covers_position(&self, partition: PartitionId, pos: LogPosition) -> bool {
        self.snapshot()
            .histories
            .get(&partition)
            .map(|history| history.iter().any(|r| r.covers(pos)))
            .unwrap_or(false)
    }

    /// Partitions whose latest recorded generation is open on this shard.
    pub fn open_partitions(&self) -> Vec<PartitionId> {
        self.snapshot()
            .histories
            .iter()
            .filter(|(_, history)| history.iter().any(|r| r.is_open()))
            .map(|(partition, _)| *partition)
            .collect()
    }

    fn snapshot(&self) -> Arc<LedgerView> {
        self.view.read().expect("ledger view lock").clone()
    }
}

/// Invariant checks applied on every refresh; a violation means the stored
/// metadata is corrupt and must not be served.
fn validate_history(
    partition: PartitionId,
    history: &[GenerationRecord],
) -> Result<(), LedgerError> {
    let mut open = 0usize;
    for pair in history.windows(2) {
        if pair[1].generation <= pair[0].generation {
            return Err(LedgerError::Inconsistent {
                partition,
                reason: format!(
                    "generation {} does not follow {}",
                    pair[1].generation, pair[0].generation
                ),
            });
        }
    }
    for record in history {
        if record.is_open() {
            open += 1;
        }
    }
    if open > 1 {
        return Err(LedgerError::Inconsistent {
            partition,
            reason: format!("{open} open generations recorded"),
        });
    }
    Ok(())
}
