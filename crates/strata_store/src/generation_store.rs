//! Durable store for partition-generation records.
//!
//! One record describes a contiguous span of a partition's residency on one
//! shard, bounded by log positions. Records are keyed by
//! `(partition, generation)` in a fixed big-endian layout so a prefix scan
//! yields a partition's history in generation order. All mutations arrive as
//! replicated `LedgerCommand`s and commit through a keyspace batch, so a
//! failed write leaves no partial record visible.

use std::sync::Arc;

use fjall::{Keyspace, PartitionCreateOptions};
use serde::{Deserialize, Serialize};

use strata_log::{GenerationNumber, LogPosition, PartitionId, ShardId, NO_POSITION};

use crate::error::LedgerError;

/// Version byte prefixed to every stored record value.
const RECORD_LAYOUT_VERSION: u8 = 1;

/// Encoded value size: layout byte plus five u64 fields.
const RECORD_VALUE_LEN: usize = 1 + 5 * 8;

/// One generation of one partition's residency on one shard.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenerationRecord {
    pub partition: PartitionId,
    pub generation: GenerationNumber,
    pub shard: ShardId,
    /// First position durably written under this generation; `None` for
    /// generation 0, which has no migration predecessor.
    pub start: Option<LogPosition>,
    /// `None` while this generation is the open one on its shard.
    pub end: Option<LogPosition>,
    pub previous_shard: Option<ShardId>,
    pub previous_end: Option<LogPosition>,
}

impl GenerationRecord {
    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }

    /// Whether `[start, end)` contains `pos`, treating an open end as
    /// +infinity and an absent start as the beginning of the log.
    pub fn covers(&self, pos: LogPosition) -> bool {
        self.start.unwrap_or(0) <= pos && self.end.map_or(true, |end| pos < end)
    }
}

/// Replicated mutation applied to the generation store.
///
/// Commands are proposed through the shard's log and replayed identically on
/// follower replicas, which is what makes their ledgers converge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerCommand {
    OpenGeneration {
        partition: PartitionId,
        generation: GenerationNumber,
        shard: ShardId,
        start: Option<LogPosition>,
        previous_shard: Option<ShardId>,
        previous_end: Option<LogPosition>,
    },
    CloseGeneration {
        partition: PartitionId,
        generation: GenerationNumber,
        end: LogPosition,
    },
}

/// Strategy hook consulted immediately before a generation-record commit.
///
/// Production wiring installs `NoProbe`; tests inject failures to exercise
/// the initialization-failure paths.
pub trait CommitProbe: Send + Sync + 'static {
    fn before_commit(&self, command: &LedgerCommand) -> Result<(), LedgerError>;
}

/// Default probe: commits always proceed.
pub struct NoProbe;

impl CommitProbe for NoProbe {
    fn before_commit(&self, _command: &LedgerCommand) -> Result<(), LedgerError> {
        Ok(())
    }
}

pub struct GenerationStore {
    keyspace: Arc<Keyspace>,
    records: fjall::PartitionHandle,
    probe: Arc<dyn CommitProbe>,
}

impl GenerationStore {
    pub fn open(keyspace: Arc<Keyspace>, probe: Arc<dyn CommitProbe>) -> anyhow::Result<Self> {
        let records = keyspace.open_partition("generations", PartitionCreateOptions::default())?;
        Ok(Self {
            keyspace,
            records,
            probe,
        })
    }

    /// Fetch one record. Decoding failures surface as `Corrupt`, never as
    /// absence.
    pub fn get(
        &self,
        partition: PartitionId,
        generation: GenerationNumber,
    ) -> Result<Option<GenerationRecord>, LedgerError> {
        let key = encode_record_key(partition, generation);
        let value = self.records.get(key).map_err(|err| LedgerError::Corrupt {
            partition,
            reason: format!("read failed: {err}"),
        })?;
        match value {
            None => Ok(None),
            Some(bytes) => Ok(Some(decode_record(partition, generation, &bytes)?)),
        }
    }

    /// All records for one partition, ordered by generation number.
    pub fn scan_partition(
        &self,
        partition: PartitionId,
    ) -> Result<Vec<GenerationRecord>, LedgerError> {
        let mut out = Vec::new();
        for item in self.records.prefix(partition.to_be_bytes()) {
            let (key, value) = item.map_err(|err| LedgerError::Corrupt {
                partition,
                reason: format!("scan failed: {err}"),
            })?;
            let (partition, generation) = decode_record_key(&key)?;
            out.push(decode_record(partition, generation, &value)?);
        }
        Ok(out)
    }

    /// Every record this shard holds, ordered by `(partition, generation)`.
    pub fn scan_all(&self) -> Result<Vec<GenerationRecord>, LedgerError> {
        let mut out = Vec::new();
        for item in self.records.iter() {
            let (key, value) = item.map_err(|err| LedgerError::Corrupt {
                partition: 0,
                reason: format!("scan failed: {err}"),
            })?;
            let (partition, generation) = decode_record_key(&key)?;
            out.push(decode_record(partition, generation, &value)?);
        }
        Ok(out)
    }

    /// Apply one replicated command inside a keyspace batch.
    ///
    /// Re-applying a command that already took effect is a no-op so log
    /// replay stays idempotent; a conflicting re-apply is an invariant
    /// violation and fails.
    pub fn apply(&self, command: &LedgerCommand) -> Result<(), LedgerError> {
        self.probe.before_commit(command)?;

        match command {
            LedgerCommand::OpenGeneration {
                partition,
                generation,
                shard,
                start,
                previous_shard,
                previous_end,
            } => {
                let record = GenerationRecord {
                    partition: *partition,
                    generation: *generation,
                    shard: *shard,
                    start: *start,
                    end: None,
                    previous_shard: *previous_shard,
                    previous_end: *previous_end,
                };
                if let Some(existing) = self.get(*partition, *generation)? {
                    let mut reopened = existing.clone();
                    reopened.end = None;
                    if reopened == record {
                        return Ok(());
                    }
                    return Err(LedgerError::Inconsistent {
                        partition: *partition,
                        reason: format!(
                            "generation {generation} already recorded with different fields"
                        ),
                    });
                }
                self.write_record(&record)
            }
            LedgerCommand::CloseGeneration {
                partition,
                generation,
                end,
            } => {
                let Some(mut record) = self.get(*partition, *generation)? else {
                    return Err(LedgerError::NotFound {
                        partition: *partition,
                        generation: *generation,
                    });
                };
                match record.end {
                    // Closing an already-closed generation at the same cut is
                    // a replayed command; at a different cut it would mutate
                    // an immutable record.
                    Some(existing) if existing == *end => Ok(()),
                    Some(existing) => Err(LedgerError::Inconsistent {
                        partition: *partition,
                        reason: format!(
                            "generation {generation} already closed at {existing}, refusing {end}"
                        ),
                    }),
                    None => {
                        record.end = Some(*end);
                        self.write_record(&record)
                    }
                }
            }
        }
    }

    fn write_record(&self, record: &GenerationRecord) -> Result<(), LedgerError> {
        let key = encode_record_key(record.partition, record.generation);
        let value = encode_record(record);
        let mut batch = self.keyspace.batch();
        batch.insert(&self.records, key.to_vec(), value);
        batch.commit().map_err(|err| LedgerError::WriteFailed {
            reason: err.to_string(),
        })
    }
}

pub fn encode_command(command: &LedgerCommand) -> anyhow::Result<Vec<u8>> {
    Ok(serde_json::to_vec(command)?)
}

pub fn decode_command(data: &[u8]) -> anyhow::Result<LedgerCommand> {
    Ok(serde_json::from_slice(data)?)
}

fn encode_record_key(partition: PartitionId, generation: GenerationNumber) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&partition.to_be_bytes());
    out[8..].copy_from_slice(&generation.to_be_bytes());
    out
}

fn decode_record_key(key: &[u8]) -> Result<(PartitionId, GenerationNumber), LedgerError> {
    if key.len() != 16 {
        return Err(LedgerError::Corrupt {
            partition: 0,
            reason: format!("record key has length {}", key.len()),
        });
    }
    let mut partition = [0u8; 8];
    partition.copy_from_slice(&key[..8]);
    let mut generation = [0u8; 8];
    generation.copy_from_slice(&key[8..]);
    Ok((
        PartitionId::from_be_bytes(partition),
        GenerationNumber::from_be_bytes(generation),
    ))
}

/// Encode a record value in the fixed layout. Absent and open markers are
/// stored as `NO_POSITION`, which is never a valid position or shard id.
fn encode_record(record: &GenerationRecord) -> Vec<u8> {
    let mut out = Vec::with_capacity(RECORD_VALUE_LEN);
    out.push(RECORD_LAYOUT_VERSION);
    out.extend_from_slice(&record.shard.to_be_bytes());
    out.extend_from_slice(&record.start.unwrap_or(NO_POSITION).to_be_bytes());
    out.extend_from_slice(&record.end.unwrap_or(NO_POSITION).to_be_bytes());
    out.extend_from_slice(&record.previous_shard.unwrap_or(NO_POSITION).to_be_bytes());
    out.extend_from_slice(&record.previous_end.unwrap_or(NO_POSITION).to_be_bytes());
    out
}

fn decode_record(
    partition: PartitionId,
    generation: GenerationNumber,
    value: &[u8],
) -> Result<GenerationRecord, LedgerError> {
    let corrupt = |reason: String| LedgerError::Corrupt { partition, reason };

    if value.len() != RECORD_VALUE_LEN {
        return Err(corrupt(format!(
            "record value has length {}, expected {RECORD_VALUE_LEN}",
            value.len()
        )));
    }
    if value[0] != RECORD_LAYOUT_VERSION {
        return Err(corrupt(format!("unknown record layout version {}", value[0])));
    }

    let mut offset = 1usize;
    let mut read_u64 = |field: &'static str| -> Result<u64, LedgerError> {
        let end = offset + 8;
        let bytes: [u8; 8] = value[offset..end]
            .try_into()
            .map_err(|_| LedgerError::Corrupt {
                partition,
                reason: format!("short {field} field"),
            })?;
        offset = end;
        Ok(u64::from_be_bytes(bytes))
    };

    let shard = read_u64("shard")?;
    let start = read_u64("start")?;
    let end = read_u64("end")?;
    let previous_shard = read_u64("previous_shard")?;
    let previous_end = read_u64("previous_end")?;

    Ok(GenerationRecord {
        partition,
        generation,
        shard,
        start: from_sentinel(start),
        end: from_sentinel(end),
        previous_shard: from_sentinel(previous_shard),
        previous_end: from_sentinel(previous_end),
    })
}

fn from_sentinel(value: u64) -> Option<u64> {
    (value != NO_POSITION).then_some(value)
}
