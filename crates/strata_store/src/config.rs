//! Node configuration and CLI argument parsing.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use strata_log::{NodeId, PartitionId, ShardId};

use crate::migration_manager::MigrationManagerConfig;
use crate::shard_log::SyncMode;

/// Log sync strategy selected on the command line.
#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum LogSyncArg {
    None,
    Data,
    All,
}

impl LogSyncArg {
    pub fn to_sync_mode(self) -> SyncMode {
        match self {
            LogSyncArg::None => SyncMode::None,
            LogSyncArg::Data => SyncMode::Data,
            LogSyncArg::All => SyncMode::All,
        }
    }
}

#[derive(Parser, Debug)]
pub struct NodeArgs {
    #[arg(long, env = "STRATA_NODE_ID")]
    pub node_id: NodeId,

    /// Replication group this node belongs to.
    #[arg(long, env = "STRATA_SHARD_ID")]
    pub shard_id: ShardId,

    #[arg(long, env = "STRATA_DATA_DIR")]
    pub data_dir: PathBuf,

    /// Comma-separated list of partition ids statically assigned to this
    /// shard, like: `1,2,3`. Partitions gained through migration are tracked
    /// in the generation ledger instead.
    #[arg(long, env = "STRATA_INITIAL_PARTITIONS", default_value = "")]
    pub initial_partitions: String,

    /// Protocol version this node advertises during migration prechecks.
    #[arg(long, env = "STRATA_PROTOCOL_VERSION", default_value_t = 1)]
    pub protocol_version: u32,

    /// Minimum peer protocol version accepted before any migration state is
    /// mutated.
    #[arg(long, env = "STRATA_MIN_PROTOCOL_VERSION", default_value_t = 1)]
    pub min_protocol_version: u32,

    /// Bound on the pending-operation drain before a partition is streamed
    /// out (ms).
    #[arg(long, env = "STRATA_QUIESCE_TIMEOUT_MS", default_value_t = 5_000)]
    pub quiesce_timeout_ms: u64,

    /// Rows per migration transfer page.
    #[arg(long, env = "STRATA_TRANSFER_PAGE_LIMIT", default_value_t = 2_000)]
    pub transfer_page_limit: usize,

    /// Evaluation interval of the migration retry task (ms).
    #[arg(long, env = "STRATA_MIGRATION_RETRY_INTERVAL_MS", default_value_t = 1_000)]
    pub migration_retry_interval_ms: u64,

    /// Minimum delay between migration attempts for one partition (ms).
    #[arg(long, env = "STRATA_MIGRATION_RETRY_BACKOFF_MS", default_value_t = 500)]
    pub migration_retry_backoff_ms: u64,

    /// Give up on a migration after this many attempts; 0 retries
    /// indefinitely while the source is unreachable.
    #[arg(long, env = "STRATA_MIGRATION_RETRY_LIMIT", default_value_t = 0)]
    pub migration_retry_limit: u32,

    /// Shard log sync mode.
    #[arg(long, env = "STRATA_LOG_SYNC", value_enum, default_value = "data")]
    pub log_sync: LogSyncArg,
}

impl NodeArgs {
    pub fn to_config(&self) -> anyhow::Result<NodeConfig> {
        Ok(NodeConfig {
            node_id: self.node_id,
            shard_id: self.shard_id,
            data_dir: self.data_dir.clone(),
            initial_partitions: parse_partition_list(&self.initial_partitions)?,
            log_sync: self.log_sync.to_sync_mode(),
            migration: MigrationManagerConfig {
                protocol_version: self.protocol_version,
                min_protocol_version: self.min_protocol_version,
                quiesce_timeout: Duration::from_millis(self.quiesce_timeout_ms),
                transfer_page_limit: self.transfer_page_limit.max(1),
                retry_interval: Duration::from_millis(self.migration_retry_interval_ms.max(1)),
                retry_backoff: Duration::from_millis(self.migration_retry_backoff_ms),
                retry_limit: self.migration_retry_limit,
            },
            retry_task_enabled: true,
        })
    }
}

/// Everything a `ShardNode` needs to start.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub shard_id: ShardId,
    pub data_dir: PathBuf,
    pub initial_partitions: Vec<PartitionId>,
    pub log_sync: SyncMode,
    pub migration: MigrationManagerConfig,
    /// Disabled by tests that drive retries deterministically.
    pub retry_task_enabled: bool,
}

/// Parse a comma-separated partition list like `1,2,3`.
pub fn parse_partition_list(raw: &str) -> anyhow::Result<Vec<PartitionId>> {
    let mut out = Vec::new();
    for item in raw.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let id: PartitionId = item
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid partition id {item:?}"))?;
        out.push(id);
    }
    out.sort_unstable();
    out.dedup();
    Ok(out)
}
