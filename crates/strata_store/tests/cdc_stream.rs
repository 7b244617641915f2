//! Change-stream integration tests: exactly-once delivery across a live
//! migration, filtering of foreign partitions, and resume via the
//! position-covering query.

mod common;

use std::time::Duration;

use common::{collect_ops, two_shards, SOURCE_SHARD, TARGET_SHARD};
use strata_log::StreamOperation;
use strata_store::{DataCommand, MigrationState, ShardCommand};

const P1: u64 = 10;
const P2: u64 = 11;

/// Decode the user key carried by one delivered operation.
fn op_key(op: &StreamOperation) -> Vec<u8> {
    match strata_store::decode_command(&op.payload).expect("decode payload") {
        ShardCommand::Data(DataCommand::Put { key, .. }) => key,
        other => panic!("unexpected command on the stream: {other:?}"),
    }
}

#[tokio::test]
async fn migration_splits_the_stream_without_loss_or_duplication() {
    let cluster = two_shards(&[P1, P2]);

    // Live subscriptions on both shards, from the beginning of each log.
    let mut source_sub = cluster.source.subscribe(1, 128);
    let mut target_sub = cluster.target.subscribe(1, 128);

    // Writes before the handoff land on the source.
    for i in 0..3u8 {
        cluster.source.put(P1, &[b'w', i], &[i]).expect("write");
    }
    cluster.source.put(P2, b"other", b"x").expect("write");

    assert_eq!(
        cluster.target.migrate_partition(P1, SOURCE_SHARD).await.state,
        MigrationState::Succeeded
    );

    // Writes after the handoff land on the target.
    for i in 3..5u8 {
        cluster.target.put(P1, &[b'w', i], &[i]).expect("write");
    }

    // Source delivers exactly its pre-handoff P1 writes plus P2.
    let source_ops = collect_ops(&mut source_sub, 4, Duration::from_secs(5)).await;
    let source_p1: Vec<_> = source_ops
        .iter()
        .filter(|op| op.partition == P1)
        .map(op_key)
        .collect();
    assert_eq!(
        source_p1,
        vec![vec![b'w', 0], vec![b'w', 1], vec![b'w', 2]]
    );
    assert!(source_ops.iter().all(|op| op.shard == SOURCE_SHARD));

    // Target delivers exactly the post-handoff writes: the transferred
    // snapshot and pre-generation admissions never reach its stream.
    let target_ops = collect_ops(&mut target_sub, 2, Duration::from_secs(5)).await;
    let target_p1: Vec<_> = target_ops.iter().map(op_key).collect();
    assert_eq!(target_p1, vec![vec![b'w', 3], vec![b'w', 4]]);
    assert!(target_ops.iter().all(|op| op.partition == P1));
    assert!(target_ops.iter().all(|op| op.shard == TARGET_SHARD));
    let open_start = cluster
        .target
        .ledger()
        .open_generation(P1)
        .expect("open generation")
        .start
        .expect("start");
    assert!(target_ops.iter().all(|op| op.position >= open_start));

    // Concatenated, the two delivered halves reproduce every P1 write
    // exactly once, in order.
    let mut p1_keys = source_p1;
    p1_keys.extend(target_p1);
    assert_eq!(
        p1_keys,
        (0..5u8).map(|i| vec![b'w', i]).collect::<Vec<_>>()
    );

    // Nothing further arrives on either side for the migrated span.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(source_sub.drain_ready().is_empty());
    assert!(target_sub.drain_ready().is_empty());
}

#[tokio::test]
async fn resuming_subscribers_replay_only_owned_spans() {
    let cluster = two_shards(&[P1, P2]);

    for i in 0..3u8 {
        cluster.source.put(P1, &[b'w', i], &[i]).expect("write");
    }
    assert_eq!(
        cluster.target.migrate_partition(P1, SOURCE_SHARD).await.state,
        MigrationState::Succeeded
    );
    for i in 3..5u8 {
        cluster.target.put(P1, &[b'w', i], &[i]).expect("write");
    }

    // A consumer resuming from the beginning on the source sees the closed
    // generation's span and nothing past the cut.
    let mut source_replay = cluster.source.subscribe(1, 128);
    let replayed = collect_ops(&mut source_replay, 3, Duration::from_secs(5)).await;
    assert_eq!(
        replayed.iter().map(op_key).collect::<Vec<_>>(),
        vec![vec![b'w', 0], vec![b'w', 1], vec![b'w', 2]]
    );

    // Same on the target: only operations under its open generation.
    let mut target_replay = cluster.target.subscribe(1, 128);
    let replayed = collect_ops(&mut target_replay, 2, Duration::from_secs(5)).await;
    assert_eq!(
        replayed.iter().map(op_key).collect::<Vec<_>>(),
        vec![vec![b'w', 3], vec![b'w', 4]]
    );

    // The covering query is the resume primitive: each delivered position
    // maps back to the generation that owned it.
    let cut = cluster
        .target
        .ledger()
        .open_generation(P1)
        .expect("open")
        .previous_end
        .expect("cut");
    let covering = cluster.source.ledger().generations_covering(cut - 1);
    assert!(covering.iter().any(|r| r.partition == P1 && r.generation == 0));
    assert!(cluster
        .source
        .ledger()
        .generations_covering(cut)
        .iter()
        .all(|r| r.partition != P1));
}

#[tokio::test]
async fn unready_ledger_owns_nothing_and_snapshots_are_independent() {
    let cluster = two_shards(&[P1]);

    // Subscribe on the target while its ledger is still empty: it owns
    // nothing, so nothing is forwarded, and nothing errors.
    let mut target_sub = cluster.target.subscribe(1, 16);
    cluster.source.put(P1, b"a", b"1").expect("write");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(target_sub.drain_ready().is_empty());

    // Two subscriptions on one shard never alias snapshots: dropping one
    // does not disturb the other.
    let mut first = cluster.source.subscribe(1, 16);
    let second = cluster.source.subscribe(1, 16);
    drop(second);
    let ops = collect_ops(&mut first, 1, Duration::from_secs(5)).await;
    assert_eq!(op_key(&ops[0]), b"a".to_vec());
}
