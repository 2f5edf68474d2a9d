//! Write-ahead transaction log: worker thread and file I/O
//!
//! Records are appended to `transaction.log` as a 4 byte little-endian length
//! followed by the `bincode` encoded [`LogRecord`]. Appends go through a
//! dedicated worker thread so the dispatch loop never waits for the disk, except
//! in [`WalLog::persist`], which waits for `sync_data`.
//!
//! ## Checkpoints
//!
//! The log only has to remember prepared transactions that are not yet removed.
//! Once the file has grown past [`LogConfig::checkpoint_threshold_bytes`] it is
//! rewritten with just those (often none) behind a checkpoint marker. The new
//! file is written to a temporary file next to the log and renamed over it, so a
//! crash mid-checkpoint leaves either the old or the new log.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::JoinHandle;

use super::record::{LogOperation, LogRecord, Lsn, Prepared};
use super::recovery;
use super::{LogStatistics, TransactionLog};
use crate::error::{Result, TmError};
use crate::state::transaction::Transaction;
use crate::types::{timestamp_micros, Gtrid};

/// File name of the log inside the log directory
pub const LOG_FILE: &str = "transaction.log";

/// Configuration of the transaction log and the replies gated on it.
///
/// # Presets
///
/// - [`LogConfig::default()`] - Balanced, replies are flushed in batches of 64
/// - [`LogConfig::low_latency()`] - Every durable reply is flushed on its own
/// - [`LogConfig::high_throughput()`] - Larger batches, fewer syncs
#[derive(Debug, Clone, PartialEq)]
pub struct LogConfig {
    /// Replies held back before the log is persisted and they are sent
    pub batch_size: usize,
    /// Log file size that triggers a checkpoint (bytes)
    pub checkpoint_threshold_bytes: u64,
    /// Capacity of the channel to the worker thread
    pub channel_capacity: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            checkpoint_threshold_bytes: 4 * 1024 * 1024, // 4 MB
            channel_capacity: 10000,
        }
    }
}

impl LogConfig {
    pub fn low_latency() -> Self {
        Self {
            batch_size: 1,
            ..Default::default()
        }
    }

    pub fn high_throughput() -> Self {
        Self {
            batch_size: 512,
            checkpoint_threshold_bytes: 16 * 1024 * 1024,
            ..Default::default()
        }
    }
}

/// Control messages for the log worker thread
enum WalMessage {
    Write(LogRecord),
    /// Sync the file, respond with its size
    Persist(mpsc::SyncSender<Result<u64>>),
    /// Replace the file with `records`, respond with the new size
    Compact {
        records: Vec<LogRecord>,
        responder: mpsc::SyncSender<Result<u64>>,
    },
    Shutdown,
}

/// The bundled [`TransactionLog`]
pub struct WalLog {
    path: PathBuf,
    config: LogConfig,
    sender: mpsc::SyncSender<WalMessage>,
    worker: Option<JoinHandle<()>>,
    next_lsn: Lsn,
    /// Prepared transactions not yet removed
    live: BTreeMap<Gtrid, Prepared>,
    /// Gtrids that were outstanding when the log was opened
    recovered: BTreeSet<Gtrid>,
    statistics: LogStatistics,
    dirty: bool,
}

impl WalLog {
    /// Open (or create) the log in `dir`, replaying what is already there
    pub fn open(dir: &Path, config: LogConfig) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(LOG_FILE);

        let replay = recovery::replay(&path)?;
        let recovered: BTreeSet<Gtrid> = replay.outstanding.keys().cloned().collect();

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut size = file.metadata()?.len();
        if size > replay.bytes {
            log::warn!(
                "transaction log has {} bytes of partial record at the end - action: truncate",
                size - replay.bytes
            );
            file.set_len(replay.bytes)?;
            size = replay.bytes;
        }

        let (tx, rx) = mpsc::sync_channel::<WalMessage>(config.channel_capacity);
        let worker_path = path.clone();
        let worker = std::thread::Builder::new()
            .name("transaction-log".to_string())
            .spawn(move || log_worker_thread(file, size, rx, worker_path))?;

        Ok(Self {
            path,
            config,
            sender: tx,
            worker: Some(worker),
            next_lsn: replay.next_lsn,
            live: replay.outstanding,
            recovered,
            statistics: LogStatistics::default(),
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Prepared transactions not yet removed, recovered ones included
    pub fn outstanding(&self) -> usize {
        self.live.len()
    }

    fn record(&mut self, op: LogOperation) -> LogRecord {
        let record = LogRecord {
            lsn: self.next_lsn,
            op,
            timestamp: timestamp_micros(),
        };
        self.next_lsn += 1;
        record
    }

    fn write(&mut self, op: LogOperation) -> Result<()> {
        let record = self.record(op);
        self.sender
            .send(WalMessage::Write(record))
            .map_err(|_| TmError::log_worker_gone("write"))?;
        self.dirty = true;
        Ok(())
    }

    fn request<F>(&self, what: &str, message: F) -> Result<u64>
    where
        F: FnOnce(mpsc::SyncSender<Result<u64>>) -> WalMessage,
    {
        let (tx, rx) = mpsc::sync_channel(1);
        self.sender
            .send(message(tx))
            .map_err(|_| TmError::log_worker_gone(what))?;
        rx.recv().map_err(|_| TmError::log_worker_gone(what))?
    }

    /// Rewrite the file with only the live prepared transactions
    pub fn checkpoint(&mut self) -> Result<()> {
        let outstanding = self.live.len();
        let mut ops = vec![LogOperation::Checkpoint { outstanding }];
        ops.extend(self.live.values().cloned().map(LogOperation::Prepare));
        let records: Vec<LogRecord> = ops.into_iter().map(|op| self.record(op)).collect();

        let size = self.request("checkpoint", |responder| WalMessage::Compact { records, responder })?;
        log::info!("transaction log checkpoint: {} outstanding, {} bytes", outstanding, size);
        Ok(())
    }
}

impl TransactionLog for WalLog {
    fn prepare(&mut self, transaction: &Transaction) -> Result<()> {
        let prepared = Prepared::from(transaction);
        self.live.insert(prepared.global.clone(), prepared.clone());
        self.write(LogOperation::Prepare(prepared))?;
        self.statistics.prepare += 1;
        Ok(())
    }

    fn remove(&mut self, global: &Gtrid) -> Result<()> {
        if self.live.remove(global).is_none() {
            return Ok(());
        }
        if self.recovered.remove(global) {
            log::info!("in-doubt transaction {} resolved", global);
        }
        self.write(LogOperation::Remove { global: global.clone() })?;
        self.statistics.remove += 1;
        Ok(())
    }

    fn persist(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let size = self.request("persist", WalMessage::Persist)?;
        self.dirty = false;
        self.statistics.writes += 1;

        if size >= self.config.checkpoint_threshold_bytes {
            self.checkpoint()?;
        }
        Ok(())
    }

    fn statistics(&self) -> LogStatistics {
        self.statistics
    }

    fn in_doubt(&self) -> Vec<Prepared> {
        self.recovered
            .iter()
            .filter_map(|global| self.live.get(global))
            .cloned()
            .collect()
    }
}

impl Drop for WalLog {
    fn drop(&mut self) {
        let _ = self.sender.send(WalMessage::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("transaction log worker panicked");
            }
        }
    }
}

/// Log worker thread: appends records, syncs and compacts on request
fn log_worker_thread(mut file: File, mut size: u64, rx: mpsc::Receiver<WalMessage>, path: PathBuf) {
    // First write error, reported to the next persist
    let mut failure: Option<String> = None;

    loop {
        match rx.recv() {
            Ok(WalMessage::Write(record)) => {
                if failure.is_some() {
                    continue;
                }
                match write_record(&mut file, &record) {
                    Ok(bytes) => size += bytes,
                    Err(e) => {
                        log::error!("transaction log write failed: {}", e);
                        failure = Some(e.to_string());
                    }
                }
            }
            Ok(WalMessage::Persist(responder)) => {
                let result = match failure.take() {
                    Some(e) => Err(TmError::Log(e)),
                    None => file.sync_data().map(|()| size).map_err(TmError::from),
                };
                let _ = responder.send(result);
            }
            Ok(WalMessage::Compact { records, responder }) => {
                let result = compact(&path, &records).and_then(|(new_file, new_size)| {
                    file = new_file;
                    size = new_size;
                    Ok(size)
                });
                let _ = responder.send(result);
            }
            Ok(WalMessage::Shutdown) => {
                if let Err(e) = file.sync_data() {
                    log::error!("transaction log sync at shutdown failed: {}", e);
                }
                log::debug!("transaction log worker shutting down");
                break;
            }
            Err(mpsc::RecvError) => {
                log::info!("transaction log worker shutting down (channel closed)");
                break;
            }
        }
    }
}

/// Append one length-prefixed record, returns the bytes written
fn write_record(file: &mut File, record: &LogRecord) -> Result<u64> {
    let encoded = bincode::serialize(record)?;
    let mut frame = Vec::with_capacity(4 + encoded.len());
    frame.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
    frame.extend_from_slice(&encoded);
    file.write_all(&frame)?;
    Ok(frame.len() as u64)
}

/// Write `records` to a temporary file and rename it over the log
fn compact(path: &Path, records: &[LogRecord]) -> Result<(File, u64)> {
    let dir = path
        .parent()
        .ok_or_else(|| TmError::Log(format!("log path {:?} has no directory", path)))?;

    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    let mut size = 0;
    for record in records {
        size += write_record(temp.as_file_mut(), record)?;
    }
    temp.as_file().sync_data()?;
    temp.persist(path).map_err(|e| TmError::Io(e.error))?;
    sync_dir(dir)?;

    let file = OpenOptions::new().append(true).open(path)?;
    Ok((file, size))
}

/// Make a rename in `dir` durable
#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ResourceId, Trid};

    fn transaction(gtrid: u8) -> Transaction {
        let trid = Trid::new(1, vec![gtrid], vec![1]);
        let mut transaction = Transaction::new(trid.clone());
        transaction.involve(&trid, [ResourceId(1), ResourceId(2)]);
        transaction
    }

    #[test]
    fn test_log_config_presets() {
        assert_eq!(LogConfig::default().batch_size, 64);
        assert_eq!(LogConfig::low_latency().batch_size, 1);
        assert_eq!(LogConfig::high_throughput().batch_size, 512);
        assert_eq!(LogConfig::default().checkpoint_threshold_bytes, 4 * 1024 * 1024);
    }

    #[test]
    fn test_remove_of_unprepared_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = WalLog::open(dir.path(), LogConfig::default()).unwrap();

        log.remove(&Gtrid(vec![9])).unwrap();
        log.persist().unwrap();

        assert_eq!(log.statistics(), LogStatistics::default());
    }

    #[test]
    fn test_persist_counts_writes() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = WalLog::open(dir.path(), LogConfig::default()).unwrap();

        log.prepare(&transaction(1)).unwrap();
        log.persist().unwrap();
        log.persist().unwrap();
        log.remove(&transaction(1).global).unwrap();
        log.persist().unwrap();

        let statistics = log.statistics();
        assert_eq!((statistics.prepare, statistics.remove, statistics.writes), (1, 1, 2));
        assert_eq!(log.outstanding(), 0);
    }

    #[test]
    fn test_reopen_reports_in_doubt() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut log = WalLog::open(dir.path(), LogConfig::default()).unwrap();
            log.prepare(&transaction(1)).unwrap();
            log.prepare(&transaction(2)).unwrap();
            log.remove(&transaction(1).global).unwrap();
            log.persist().unwrap();
        }

        let mut log = WalLog::open(dir.path(), LogConfig::default()).unwrap();
        let in_doubt = log.in_doubt();
        assert_eq!(in_doubt.len(), 1);
        assert_eq!(in_doubt[0].global, transaction(2).global);

        log.remove(&transaction(2).global).unwrap();
        assert!(log.in_doubt().is_empty());
    }

    #[test]
    fn test_checkpoint_keeps_outstanding_only() {
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig {
            checkpoint_threshold_bytes: 1,
            ..LogConfig::default()
        };
        {
            let mut log = WalLog::open(dir.path(), config.clone()).unwrap();
            for gtrid in 1..=10 {
                log.prepare(&transaction(gtrid)).unwrap();
            }
            for gtrid in 1..=9 {
                log.remove(&transaction(gtrid).global).unwrap();
            }
            log.persist().unwrap();
        }

        let replay = recovery::replay(&dir.path().join(LOG_FILE)).unwrap();
        // checkpoint marker + the one outstanding prepare
        assert_eq!(replay.records, 2);
        assert_eq!(replay.in_doubt()[0].global, transaction(10).global);
    }

    #[test]
    fn test_compact_replaces_log_and_syncs_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOG_FILE);
        std::fs::write(&path, b"stale contents").unwrap();

        let record = LogRecord {
            lsn: 5,
            op: LogOperation::Checkpoint { outstanding: 0 },
            timestamp: 0,
        };
        let (_, size) = compact(&path, &[record]).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), size);
        sync_dir(dir.path()).unwrap();

        // only the log itself is left, no temporary file
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
        let replay = recovery::replay(&path).unwrap();
        assert_eq!(replay.records, 1);
        assert_eq!(replay.next_lsn, 6);
    }
}
