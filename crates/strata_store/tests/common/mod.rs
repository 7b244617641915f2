//! Shared helpers for integration tests: an in-process two-shard cluster
//! wired over the loopback migration transport, with short test timeouts.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use strata_log::{PartitionId, ShardId};
use strata_store::migration_manager::MigrationManagerConfig;
use strata_store::shard_log::SyncMode;
use strata_store::stream_filter::Subscription;
use strata_store::transport::{InProcessTransport, TransportFaults};
use strata_store::{NodeConfig, NodeHooks, ShardNode};

pub const SOURCE_SHARD: ShardId = 1;
pub const TARGET_SHARD: ShardId = 2;

/// Node config with short, test-only timeouts and retry knobs.
pub fn node_config(shard: ShardId, dir: &Path, partitions: &[PartitionId]) -> NodeConfig {
    NodeConfig {
        node_id: shard,
        shard_id: shard,
        data_dir: dir.join(format!("shard{shard}")),
        initial_partitions: partitions.to_vec(),
        log_sync: SyncMode::None,
        migration: MigrationManagerConfig {
            protocol_version: 1,
            min_protocol_version: 1,
            quiesce_timeout: Duration::from_millis(500),
            transfer_page_limit: 2,
            retry_interval: Duration::from_millis(25),
            retry_backoff: Duration::from_millis(10),
            retry_limit: 0,
        },
        // Tests that exercise autonomous retry flip this on.
        retry_task_enabled: false,
    }
}

pub struct Cluster {
    pub transport: Arc<InProcessTransport>,
    pub source: Arc<ShardNode>,
    pub target: Arc<ShardNode>,
    _dir: tempfile::TempDir,
}

/// Two shards: the source statically owns `partitions`, the target owns
/// nothing until a migration completes.
pub fn two_shards(partitions: &[PartitionId]) -> Cluster {
    two_shards_with(
        partitions,
        Arc::new(NoFaults),
        NodeHooks::default(),
        NodeHooks::default(),
        |cfg| cfg,
    )
}

/// Fully customizable cluster: transport faults, per-node hooks, and a
/// target-config tweak (e.g. enabling the retry task).
pub fn two_shards_with(
    partitions: &[PartitionId],
    faults: Arc<dyn TransportFaults>,
    source_hooks: NodeHooks,
    target_hooks: NodeHooks,
    tweak_target: impl FnOnce(NodeConfig) -> NodeConfig,
) -> Cluster {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = InProcessTransport::new(faults);

    let source = ShardNode::open(
        node_config(SOURCE_SHARD, dir.path(), partitions),
        transport.clone(),
        source_hooks,
    )
    .expect("open source node");
    let target = ShardNode::open(
        tweak_target(node_config(TARGET_SHARD, dir.path(), &[])),
        transport.clone(),
        target_hooks,
    )
    .expect("open target node");

    transport.register(source.clone());
    transport.register(target.clone());

    Cluster {
        transport,
        source,
        target,
        _dir: dir,
    }
}

/// Poll `check` until it returns true or the deadline passes.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Collect exactly `n` operations from a subscription, panicking if they do
/// not arrive before the deadline.
pub async fn collect_ops(
    sub: &mut Subscription,
    n: usize,
    timeout: Duration,
) -> Vec<strata_log::StreamOperation> {
    let mut out = Vec::with_capacity(n);
    let deadline = Instant::now() + timeout;
    while out.len() < n {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .unwrap_or_default();
        match tokio::time::timeout(remaining, sub.next()).await {
            Ok(Some(op)) => out.push(op),
            Ok(None) => panic!("subscription closed after {} of {n} operations", out.len()),
            Err(_) => panic!("timed out after {} of {n} operations", out.len()),
        }
    }
    out
}

struct NoFaults;

impl TransportFaults for NoFaults {}
