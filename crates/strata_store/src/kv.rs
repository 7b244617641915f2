//! Partition-scoped key/value data store.
//!
//! Rows live in one fjall partition keyed by `8B partition BE || user key`,
//! so one keyspace partition's rows form a contiguous prefix range. Client
//! writes arrive as replicated `DataCommand`s through the shard log;
//! migration backfill applies transferred rows out-of-band so they never
//! appear on the gaining shard's change stream.

use std::sync::Arc;

use fjall::{Keyspace, PartitionCreateOptions};
use serde::{Deserialize, Serialize};

use strata_log::PartitionId;

/// Replicated data mutation applied through the shard log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataCommand {
    Put {
        partition: PartitionId,
        key: Vec<u8>,
        value: Vec<u8>,
    },
}

impl DataCommand {
    pub fn partition(&self) -> PartitionId {
        match self {
            DataCommand::Put { partition, .. } => *partition,
        }
    }
}

pub struct PartitionStore {
    keyspace: Arc<Keyspace>,
    rows: fjall::PartitionHandle,
}

impl PartitionStore {
    pub fn open(keyspace: Arc<Keyspace>) -> anyhow::Result<Self> {
        let rows = keyspace.open_partition("partition_rows", PartitionCreateOptions::default())?;
        Ok(Self { keyspace, rows })
    }

    pub fn get(&self, partition: PartitionId, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        let row_key = encode_row_key(partition, key);
        Ok(self.rows.get(row_key)?.map(|v| v.to_vec()))
    }

    /// Apply one replicated command. Idempotent so log replay is safe.
    pub fn apply(&self, command: &DataCommand) -> anyhow::Result<()> {
        match command {
            DataCommand::Put {
                partition,
                key,
                value,
            } => {
                let row_key = encode_row_key(*partition, key);
                self.rows.insert(row_key, value.clone())?;
                Ok(())
            }
        }
    }

    /// Read one page of a partition's rows for transfer.
    ///
    /// `cursor` is the last user key of the previous page (empty for the
    /// first page). Returns the page, the next cursor, and whether the scan
    /// is complete. Each page is read under its own store snapshot; the
    /// partition is quiesced for the duration of a transfer, so pages
    /// compose into one consistent snapshot.
    pub fn scan_chunk(
        &self,
        partition: PartitionId,
        cursor: &[u8],
        limit: usize,
    ) -> anyhow::Result<(Vec<(Vec<u8>, Vec<u8>)>, Vec<u8>, bool)> {
        let limit = limit.max(1);
        let prefix = partition.to_be_bytes();
        let mut entries = Vec::with_capacity(limit);
        let mut done = true;

        for item in self.rows.prefix(prefix) {
            let (row_key, value) = item?;
            let user_key = decode_row_key(partition, &row_key)?;
            if !cursor.is_empty() && user_key.as_slice() <= cursor {
                continue;
            }
            if entries.len() == limit {
                // One more row exists beyond this page.
                done = false;
                break;
            }
            entries.push((user_key, value.to_vec()));
        }

        let next_cursor = entries
            .last()
            .map(|(k, _)| k.clone())
            .unwrap_or_else(|| cursor.to_vec());
        Ok((entries, next_cursor, done))
    }

    /// Install one transferred page on the gaining shard, atomically.
    pub fn apply_transferred(
        &self,
        partition: PartitionId,
        entries: &[(Vec<u8>, Vec<u8>)],
    ) -> anyhow::Result<u64> {
        if entries.is_empty() {
            return Ok(0);
        }
        let mut batch = self.keyspace.batch();
        for (key, value) in entries {
            batch.insert(&self.rows, encode_row_key(partition, key), value.clone());
        }
        batch.commit()?;
        Ok(entries.len() as u64)
    }

    /// Number of rows stored for one partition.
    pub fn row_count(&self, partition: PartitionId) -> anyhow::Result<u64> {
        let mut count = 0u64;
        for item in self.rows.prefix(partition.to_be_bytes()) {
            item?;
            count += 1;
        }
        Ok(count)
    }
}

pub fn encode_row_key(partition: PartitionId, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + key.len());
    out.extend_from_slice(&partition.to_be_bytes());
    out.extend_from_slice(key);
    out
}

fn decode_row_key(partition: PartitionId, row_key: &[u8]) -> anyhow::Result<Vec<u8>> {
    anyhow::ensure!(row_key.len() >= 8, "short row key");
    anyhow::ensure!(
        row_key[..8] == partition.to_be_bytes(),
        "row key outside partition {partition}"
    );
    Ok(row_key[8..].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> (tempfile::TempDir, PartitionStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let keyspace = Arc::new(
            fjall::Config::new(dir.path().join("storage"))
                .open()
                .expect("open keyspace"),
        );
        let store = PartitionStore::open(keyspace).expect("open store");
        (dir, store)
    }

    fn put(store: &PartitionStore, partition: PartitionId, key: &[u8], value: &[u8]) {
        store
            .apply(&DataCommand::Put {
                partition,
                key: key.to_vec(),
                value: value.to_vec(),
            })
            .expect("apply put");
    }

    #[test]
    fn scan_chunk_pages_through_one_partition_only() {
        let (_dir, store) = open_store();
        for i in 0..5u8 {
            put(&store, 1, &[i], b"one");
        }
        // A neighboring partition must never leak into the scan.
        put(&store, 2, b"x", b"two");

        let mut cursor = Vec::new();
        let mut seen = Vec::new();
        loop {
            let (entries, next_cursor, done) =
                store.scan_chunk(1, &cursor, 2).expect("scan chunk");
            assert_ne!(
                next_cursor, cursor,
                "cursor must advance while rows remain"
            );
            seen.extend(entries.into_iter().map(|(k, _)| k));
            cursor = next_cursor;
            if done {
                break;
            }
        }
        assert_eq!(seen, vec![vec![0], vec![1], vec![2], vec![3], vec![4]]);
    }

    #[test]
    fn scan_chunk_of_empty_partition_is_done_immediately() {
        let (_dir, store) = open_store();
        let (entries, next_cursor, done) = store.scan_chunk(7, &[], 10).expect("scan chunk");
        assert!(entries.is_empty());
        assert!(next_cursor.is_empty());
        assert!(done);
    }

    #[test]
    fn transferred_rows_land_atomically() {
        let (_dir, store) = open_store();
        let page = vec![
            (b"a".to_vec(), b"1".to_vec()),
            (b"b".to_vec(), b"2".to_vec()),
        ];
        assert_eq!(store.apply_transferred(3, &page).expect("apply"), 2);
        assert_eq!(store.get(3, b"a").expect("get"), Some(b"1".to_vec()));
        assert_eq!(store.row_count(3).expect("count"), 2);
    }
}
