//! File-backed replicated-log implementation for a single-replica shard.
//!
//! This module provides a `ReplicatedLog` backed by one append-only file of
//! length-prefixed, checksummed records. Committed entries are applied to the
//! registered state machines in position order before the proposer is
//! acknowledged, and fanned out to change-stream subscribers.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use crc32fast::Hasher;
use tokio::sync::broadcast;

use strata_log::{CommittedEntry, LogPosition, ReplicatedLog, StateMachine};

/// File name used for the log within the shard's log directory.
const LOG_FILE: &str = "shard.log";

/// Capacity of the committed-entry broadcast channel feeding live tails.
const TAIL_CAPACITY: usize = 1024;

/// Sync strategy used when persisting appended entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncMode {
    None,
    Data,
    All,
}

/// Snapshot of log performance counters for logging/monitoring.
#[derive(Default, Debug, Clone, Copy)]
pub struct LogStatsSnapshot {
    pub append_count: u64,
    pub append_bytes: u64,
    pub fsync_count: u64,
    pub fsync_total_us: u64,
    pub fsync_max_us: u64,
}

/// Internal counters used to build `LogStatsSnapshot`.
struct LogStats {
    append_count: AtomicU64,
    append_bytes: AtomicU64,
    fsync_count: AtomicU64,
    fsync_total_us: AtomicU64,
    fsync_max_us: AtomicU64,
}

impl LogStats {
    const fn new() -> Self {
        Self {
            append_count: AtomicU64::new(0),
            append_bytes: AtomicU64::new(0),
            fsync_count: AtomicU64::new(0),
            fsync_total_us: AtomicU64::new(0),
            fsync_max_us: AtomicU64::new(0),
        }
    }

    fn record_append(&self, bytes: u64) {
        self.append_count.fetch_add(1, Ordering::Relaxed);
        self.append_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    fn record_fsync(&self, dur: Duration) {
        let us = dur.as_micros().min(u128::from(u64::MAX)) as u64;
        self.fsync_count.fetch_add(1, Ordering::Relaxed);
        self.fsync_total_us.fetch_add(us, Ordering::Relaxed);
        self.fsync_max_us.fetch_max(us, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LogStatsSnapshot {
        LogStatsSnapshot {
            append_count: self.append_count.load(Ordering::Relaxed),
            append_bytes: self.append_bytes.load(Ordering::Relaxed),
            fsync_count: self.fsync_count.load(Ordering::Relaxed),
            fsync_total_us: self.fsync_total_us.load(Ordering::Relaxed),
            fsync_max_us: self.fsync_max_us.load(Ordering::Relaxed),
        }
    }
}

/// Work item sent to the log worker for one proposed command.
struct AppendWork {
    command: Vec<u8>,
    tx: mpsc::Sender<anyhow::Result<LogPosition>>,
}

/// Range-read request served from the worker's in-memory entry cache, so
/// readers never observe a partially flushed tail record.
struct RangeWork {
    from: LogPosition,
    to: LogPosition,
    tx: mpsc::Sender<Vec<CommittedEntry>>,
}

enum LogCommand {
    Append(AppendWork),
    Range(RangeWork),
}

/// File-backed log with a dedicated worker thread that owns the file, the
/// position counter, and state-machine application order.
pub struct FileShardLog {
    dir: PathBuf,
    tx: mpsc::Sender<LogCommand>,
    last_position: Arc<AtomicU64>,
    tail: broadcast::Sender<CommittedEntry>,
    stats: Arc<LogStats>,
}

impl FileShardLog {
    /// Open or create the log directory, replay existing entries through the
    /// given state machines, and spawn the worker thread.
    ///
    /// Replay re-applies every entry; state machines must therefore apply
    /// idempotently, which also gives follower replicas a single code path.
    pub fn open_dir(
        path: impl AsRef<Path>,
        sync: SyncMode,
        state_machines: Vec<Arc<dyn StateMachine>>,
    ) -> anyhow::Result<Arc<Self>> {
        let dir = path.as_ref().to_path_buf();
        fs::create_dir_all(&dir).context("create shard log dir")?;
        let log_path = dir.join(LOG_FILE);

        let entries = read_log_entries(&log_path)?;
        for entry in &entries {
            for sm in &state_machines {
                sm.apply(&entry.command, entry.position)
                    .with_context(|| format!("replay log entry at position {}", entry.position))?;
            }
        }
        let replayed = entries.len();
        let last = entries.last().map(|e| e.position).unwrap_or(0);
        if replayed > 0 {
            tracing::info!(replayed, last_position = last, "shard log replay complete");
        }

        let last_position = Arc::new(AtomicU64::new(last));
        let stats = Arc::new(LogStats::new());
        let (tail, _) = broadcast::channel(TAIL_CAPACITY);

        let (tx, rx) = mpsc::channel();
        let worker_last = last_position.clone();
        let worker_tail = tail.clone();
        let worker_stats = stats.clone();
        let worker_path = log_path.clone();
        thread::Builder::new()
            .name("shard-log".to_string())
            .spawn(move || {
                log_worker(
                    &worker_path,
                    rx,
                    sync,
                    entries,
                    state_machines,
                    worker_last,
                    worker_tail,
                    worker_stats,
                )
            })
            .context("spawn shard log thread")?;

        Ok(Arc::new(Self {
            dir,
            tx,
            last_position,
            tail,
            stats,
        }))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Fetch the current performance counters.
    pub fn stats_snapshot(&self) -> LogStatsSnapshot {
        self.stats.snapshot()
    }
}

impl ReplicatedLog for FileShardLog {
    fn is_leader(&self) -> bool {
        // A single-replica log always leads its shard.
        true
    }

    fn propose(&self, command: Vec<u8>) -> anyhow::Result<LogPosition> {
        let (tx, rx) = mpsc::channel();
        self.tx
            .send(LogCommand::Append(AppendWork { command, tx }))
            .map_err(|_| anyhow::anyhow!("shard log worker closed"))?;
        rx.recv().context("shard log append response dropped")?
    }

    fn last_position(&self) -> LogPosition {
        self.last_position.load(Ordering::Acquire)
    }

    fn subscribe(&self) -> broadcast::Receiver<CommittedEntry> {
        self.tail.subscribe()
    }

    fn range(&self, from: LogPosition, to: LogPosition) -> anyhow::Result<Vec<CommittedEntry>> {
        let (tx, rx) = mpsc::channel();
        self.tx
            .send(LogCommand::Range(RangeWork { from, to, tx }))
            .map_err(|_| anyhow::anyhow!("shard log worker closed"))?;
        rx.recv().context("shard log range response dropped")
    }
}

/// Worker loop that appends records, applies state machines, and serves reads.
#[allow(clippy::too_many_arguments)]
fn log_worker(
    log_path: &Path,
    rx: mpsc::Receiver<LogCommand>,
    sync: SyncMode,
    mut entries: Vec<CommittedEntry>,
    state_machines: Vec<Arc<dyn StateMachine>>,
    last_position: Arc<AtomicU64>,
    tail: broadcast::Sender<CommittedEntry>,
    stats: Arc<LogStats>,
) {
    let mut file = match open_log_for_append(log_path) {
        Ok(file) => file,
        Err(err) => {
            tracing::error!(error = ?err, "open shard log failed");
            return;
        }
    };
    let mut next = last_position.load(Ordering::Acquire) + 1;

    while let Ok(cmd) = rx.recv() {
        match cmd {
            LogCommand::Append(work) => {
                let entry = CommittedEntry {
                    position: next,
                    command: work.command,
                };
                let len_before = file.metadata().map(|m| m.len()).unwrap_or(0);
                let res = append_entry(&mut file, &entry, sync, &stats)
                    .map_err(anyhow::Error::from)
                    .and_then(|()| {
                        for sm in &state_machines {
                            sm.apply(&entry.command, entry.position)?;
                        }
                        Ok(entry.position)
                    });
                if res.is_err() {
                    // A failed transaction must not occupy a position:
                    // truncate the record so the file never carries entries
                    // that were not applied.
                    if let Err(err) = file.set_len(len_before) {
                        tracing::error!(error = ?err, "shard log rollback failed");
                        return;
                    }
                }
                if res.is_ok() {
                    next += 1;
                    last_position.store(entry.position, Ordering::Release);
                    // Lagging subscribers surface as `Lagged` on their end.
                    let _ = tail.send(entry.clone());
                    entries.push(entry);
                }
                let _ = work.tx.send(res);
            }
            LogCommand::Range(work) => {
                let out = entries
                    .iter()
                    .filter(|e| e.position >= work.from && e.position <= work.to)
                    .cloned()
                    .collect();
                let _ = work.tx.send(out);
            }
        }
    }
}

/// Append one entry as a length-prefixed record with a CRC32 checksum.
fn append_entry(
    file: &mut File,
    entry: &CommittedEntry,
    sync: SyncMode,
    stats: &LogStats,
) -> std::io::Result<()> {
    let payload = encode_entry(entry);
    let len = payload.len() as u32;
    let mut hasher = Hasher::new();
    hasher.update(&payload);
    let checksum = hasher.finalize();

    file.write_all(&len.to_be_bytes())?;
    file.write_all(&checksum.to_be_bytes())?;
    file.write_all(&payload)?;
    file.flush()?;
    stats.record_append(8 + payload.len() as u64);

    match sync {
        SyncMode::None => Ok(()),
        SyncMode::Data => {
            let start = Instant::now();
            let res = file.sync_data();
            stats.record_fsync(start.elapsed());
            res
        }
        SyncMode::All => {
            let start = Instant::now();
            let res = file.sync_all();
            stats.record_fsync(start.elapsed());
            res
        }
    }
}

/// Read and decode all committed records from disk.
///
/// A checksum mismatch fails fast; a missing file means an empty log.
fn read_log_entries(path: &Path) -> anyhow::Result<Vec<CommittedEntry>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut reader = std::io::BufReader::new(file);
    let mut entries: Vec<CommittedEntry> = Vec::new();
    loop {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            // EOF at a record boundary means we have read all records.
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut crc_buf = [0u8; 4];
        reader.read_exact(&mut crc_buf)?;
        let expected_crc = u32::from_be_bytes(crc_buf);
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;
        let mut hasher = Hasher::new();
        hasher.update(&payload);
        anyhow::ensure!(
            hasher.finalize() == expected_crc,
            "shard log checksum mismatch"
        );
        let entry = decode_entry(&payload)?;
        if let Some(prev) = entries.last() {
            anyhow::ensure!(
                entry.position == prev.position + 1,
                "shard log position gap: {} follows {}",
                entry.position,
                prev.position
            );
        }
        entries.push(entry);
    }
    Ok(entries)
}

fn open_log_for_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Encode a committed entry to a compact binary representation.
fn encode_entry(entry: &CommittedEntry) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + 4 + entry.command.len());
    out.extend_from_slice(&entry.position.to_be_bytes());
    out.extend_from_slice(&(entry.command.len() as u32).to_be_bytes());
    out.extend_from_slice(&entry.command);
    out
}

/// Decode a committed entry from a record payload.
fn decode_entry(buf: &[u8]) -> anyhow::Result<CommittedEntry> {
    let mut offset = 0usize;
    let position = read_u64_at(buf, &mut offset)?;
    let cmd_len = read_u32_at(buf, &mut offset)? as usize;
    anyhow::ensure!(offset + cmd_len <= buf.len(), "log entry short command");
    let command = buf[offset..offset + cmd_len].to_vec();
    Ok(CommittedEntry { position, command })
}

fn read_u64_at(data: &[u8], offset: &mut usize) -> anyhow::Result<u64> {
    anyhow::ensure!(*offset + 8 <= data.len(), "log entry short u64");
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_be_bytes(buf))
}

fn read_u32_at(data: &[u8], offset: &mut usize) -> anyhow::Result<u32> {
    anyhow::ensure!(*offset + 4 <= data.len(), "log entry short u32");
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[*offset..*offset + 4]);
    *offset += 4;
    Ok(u32::from_be_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_are_assigned_contiguously_and_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let log = FileShardLog::open_dir(dir.path(), SyncMode::None, Vec::new())
                .expect("open log");
            assert_eq!(log.propose(b"a".to_vec()).expect("propose"), 1);
            assert_eq!(log.propose(b"b".to_vec()).expect("propose"), 2);
            assert_eq!(log.last_position(), 2);
        }

        let log =
            FileShardLog::open_dir(dir.path(), SyncMode::None, Vec::new()).expect("reopen log");
        assert_eq!(log.last_position(), 2);
        assert_eq!(log.propose(b"c".to_vec()).expect("propose"), 3);

        let entries = log.range(1, 3).expect("range");
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].command, b"a".to_vec());
        assert_eq!(entries[2].position, 3);
    }

    #[test]
    fn corrupted_record_fails_replay() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let log = FileShardLog::open_dir(dir.path(), SyncMode::None, Vec::new())
                .expect("open log");
            log.propose(b"payload".to_vec()).expect("propose");
        }

        // Flip a byte inside the record payload.
        let path = dir.path().join(LOG_FILE);
        let mut bytes = std::fs::read(&path).expect("read log");
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, bytes).expect("rewrite log");

        let err = FileShardLog::open_dir(dir.path(), SyncMode::None, Vec::new())
            .err()
            .expect("expected checksum failure");
        assert!(err.to_string().contains("checksum"), "unexpected: {err:#}");
    }

    #[test]
    fn state_machines_see_replayed_entries_in_order() {
        struct Recorder(std::sync::Mutex<Vec<LogPosition>>);
        impl StateMachine for Recorder {
            fn apply(&self, _command: &[u8], position: LogPosition) -> anyhow::Result<()> {
                self.0.lock().expect("lock").push(position);
                Ok(())
            }
        }

        let dir = tempfile::tempdir().expect("tempdir");
        {
            let log = FileShardLog::open_dir(dir.path(), SyncMode::None, Vec::new())
                .expect("open log");
            for i in 0..4u8 {
                log.propose(vec![i]).expect("propose");
            }
        }

        let recorder = Arc::new(Recorder(std::sync::Mutex::new(Vec::new())));
        let _log = FileShardLog::open_dir(
            dir.path(),
            SyncMode::None,
            vec![recorder.clone() as Arc<dyn StateMachine>],
        )
        .expect("reopen log");
        assert_eq!(*recorder.0.lock().expect("lock"), vec![1, 2, 3, 4]);
    }
}
