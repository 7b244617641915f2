//! Error taxonomy for the generation ledger and migration coordinator.
//!
//! Metadata failures are kept distinct from generic storage errors so the
//! coordinator and callers can tell "the ledger did not change" apart from
//! "the ledger may be in an unknown state".

use thiserror::Error;

use strata_log::{GenerationNumber, PartitionId, ShardId};

/// Errors raised by the generation metadata layer.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// A generation-record transaction failed to commit. The ledger is
    /// unchanged on the failing side.
    #[error("generation metadata write failed: {reason}")]
    WriteFailed { reason: String },

    /// A stored generation record could not be decoded. Never treated as
    /// absent.
    #[error("corrupt generation record for partition {partition}: {reason}")]
    Corrupt {
        partition: PartitionId,
        reason: String,
    },

    #[error("no generation {generation} recorded for partition {partition}")]
    NotFound {
        partition: PartitionId,
        generation: GenerationNumber,
    },

    /// The persisted history violates an invariant (two open records,
    /// non-monotonic generation numbers).
    #[error("generation history for partition {partition} is inconsistent: {reason}")]
    Inconsistent {
        partition: PartitionId,
        reason: String,
    },
}

/// Errors raised by the migration coordinator and its transport.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Detected during the precheck, before any state mutation.
    #[error("peer protocol version {actual} is below the required minimum {required}")]
    IncompatibleVersion { required: u32, actual: u32 },

    #[error("partition {partition} did not quiesce within {waited_ms}ms ({pending} operations pending)")]
    QuiesceTimeout {
        partition: PartitionId,
        pending: u64,
        waited_ms: u64,
    },

    /// The source read path broke mid-transfer. Terminal for the attempt,
    /// never silent data loss.
    #[error("partition transfer interrupted: {reason}")]
    TransferInterrupted { reason: String },

    #[error("shard {shard} is unreachable: {reason}")]
    Unreachable { shard: ShardId, reason: String },

    #[error(transparent)]
    Metadata(#[from] LedgerError),

    #[error("migration for partition {partition} rejected: {reason}")]
    InvalidState {
        partition: PartitionId,
        reason: String,
    },

    #[error("migration for partition {partition} was cancelled")]
    Cancelled { partition: PartitionId },
}

impl MigrationError {
    /// Transient failures are re-driven from PENDING by the retry task;
    /// everything else is terminal for the current attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MigrationError::QuiesceTimeout { .. }
                | MigrationError::TransferInterrupted { .. }
                | MigrationError::Unreachable { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_failures_are_retryable() {
        let err = MigrationError::Unreachable {
            shard: 2,
            reason: "connection refused".to_string(),
        };
        assert!(err.is_retryable());

        let err = MigrationError::TransferInterrupted {
            reason: "channel closed".to_string(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn version_and_metadata_failures_are_terminal() {
        let err = MigrationError::IncompatibleVersion {
            required: 3,
            actual: 2,
        };
        assert!(!err.is_retryable());

        let err = MigrationError::Metadata(LedgerError::WriteFailed {
            reason: "injected".to_string(),
        });
        assert!(!err.is_retryable());
    }
}
