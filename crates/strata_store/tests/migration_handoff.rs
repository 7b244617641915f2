//! Integration tests for the happy-path partition handoff: generation
//! records on both ends, ownership routing, durability across a target
//! restart, and idempotent re-invocation.

mod common;

use std::time::Duration;

use common::{two_shards, wait_until, SOURCE_SHARD, TARGET_SHARD};
use strata_log::ReplicatedLog;
use strata_store::MigrationState;

const P1: u64 = 10;
const P2: u64 = 11;

#[tokio::test]
async fn handoff_opens_generation_one_on_the_target() {
    let cluster = two_shards(&[P1, P2]);

    for i in 0..5u8 {
        cluster
            .source
            .put(P1, &[b'k', i], &[b'v', i])
            .expect("write to source");
    }
    let source_cut_floor = cluster.source.log().last_position();

    let handle = cluster.target.migrate_partition(P1, SOURCE_SHARD).await;
    assert_eq!(handle.state, MigrationState::Succeeded);
    assert_eq!(
        cluster.target.migration_state(P1),
        Some(MigrationState::Succeeded)
    );

    // Target side: generation 1, attributed to the source, started past 0.
    let open = cluster
        .target
        .ledger()
        .open_generation(P1)
        .expect("open generation on target");
    assert_eq!(open.generation, 1);
    assert_eq!(open.shard, TARGET_SHARD);
    assert_eq!(open.previous_shard, Some(SOURCE_SHARD));
    assert!(open.start.expect("start position") > 0);
    assert!(open.previous_end.expect("cut") >= source_cut_floor);
    assert!(cluster.target.ledger().is_ready());

    // Source side: exactly one record, generation 0, closed at the cut.
    let history = cluster.source.ledger().history(P1);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].generation, 0);
    assert_eq!(history[0].start, None);
    assert_eq!(history[0].end, open.previous_end);
    assert!(cluster.source.ledger().is_ready());
    let by_number = cluster.source.ledger().generation(P1, 0).expect("lookup");
    assert_eq!(by_number, history[0]);
    assert!(cluster.source.ledger().generation(P1, 7).is_err());

    // Routing follows the ledger.
    assert!(!cluster.source.owns_partition(P1));
    assert!(cluster.target.owns_partition(P1));
    assert!(cluster.source.owns_partition(P2));
    assert!(cluster.source.put(P1, b"late", b"write").is_err());
    cluster.target.put(P1, b"late", b"write").expect("target write");

    // Transferred rows are readable on the target.
    assert_eq!(
        cluster.target.get(P1, &[b'k', 0]).expect("get"),
        Some(vec![b'v', 0])
    );
    assert_eq!(cluster.target.row_count(P1).expect("count"), 6);
}

#[tokio::test]
async fn repeat_migration_call_is_idempotent() {
    let cluster = two_shards(&[P1]);
    cluster.source.put(P1, b"a", b"1").expect("write");

    let first = cluster.target.migrate_partition(P1, SOURCE_SHARD).await;
    assert_eq!(first.state, MigrationState::Succeeded);

    let source_history = cluster.source.ledger().history(P1);
    let target_history = cluster.target.ledger().history(P1);
    let target_log_high = cluster.target.log().last_position();

    let second = cluster.target.migrate_partition(P1, SOURCE_SHARD).await;
    assert_eq!(second.state, MigrationState::Succeeded);

    // No ledger state moved and no new commands were replicated.
    assert_eq!(cluster.source.ledger().history(P1), source_history);
    assert_eq!(cluster.target.ledger().history(P1), target_history);
    assert_eq!(cluster.target.log().last_position(), target_log_high);
}

#[tokio::test]
async fn generation_history_is_contiguous_across_round_trip() {
    let cluster = two_shards(&[P1]);
    cluster.source.put(P1, b"a", b"1").expect("write");

    assert_eq!(
        cluster.target.migrate_partition(P1, SOURCE_SHARD).await.state,
        MigrationState::Succeeded
    );
    cluster.target.put(P1, b"b", b"2").expect("write on target");

    // Migrate it back.
    assert_eq!(
        cluster.source.migrate_partition(P1, TARGET_SHARD).await.state,
        MigrationState::Succeeded
    );

    // Across both shards the generation numbers form 0, 1, 2.
    let mut all: Vec<_> = cluster
        .source
        .ledger()
        .history(P1)
        .into_iter()
        .chain(cluster.target.ledger().history(P1))
        .collect();
    all.sort_by_key(|r| r.generation);
    let generations: Vec<_> = all.iter().map(|r| r.generation).collect();
    assert_eq!(generations, vec![0, 1, 2]);

    // Exactly one open generation cluster-wide.
    let open: Vec<_> = all.iter().filter(|r| r.is_open()).collect();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].generation, 2);
    assert_eq!(open[0].shard, SOURCE_SHARD);
    assert!(cluster.source.owns_partition(P1));
    assert!(!cluster.target.owns_partition(P1));

    // Both rows made the round trip.
    assert_eq!(cluster.source.get(P1, b"a").expect("get"), Some(b"1".to_vec()));
    assert_eq!(cluster.source.get(P1, b"b").expect("get"), Some(b"2".to_vec()));
}

#[tokio::test]
async fn ready_watch_fires_when_the_first_migration_lands() {
    let cluster = two_shards(&[P1]);
    let mut ready = cluster.target.ledger().ready_watch();
    assert!(!*ready.borrow_and_update());

    let waiter = tokio::spawn(async move {
        ready.wait_for(|ready| *ready).await.map(|r| *r)
    });

    assert_eq!(
        cluster.target.migrate_partition(P1, SOURCE_SHARD).await.state,
        MigrationState::Succeeded
    );

    let became_ready = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("readiness notification timed out")
        .expect("join")
        .expect("watch alive");
    assert!(became_ready);

    // Ownership exclusivity for every recorded position.
    assert!(wait_until(Duration::from_secs(1), || {
        let cut = cluster
            .target
            .ledger()
            .open_generation(P1)
            .and_then(|r| r.previous_end)
            .unwrap_or(0);
        let source_covers = cluster.source.ledger().covers_position(P1, cut);
        let target_covers = cluster.target.ledger().covers_position(P1, cut);
        !(source_covers && target_covers)
    })
    .await);
}
