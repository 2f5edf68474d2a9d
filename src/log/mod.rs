//! Persistent transaction log
//!
//! The engine only needs a narrow contract from the log, [`TransactionLog`]:
//! remember prepared transactions, forget completed ones, and make everything
//! durable on [`TransactionLog::persist`]. Replies that promise durability are
//! held back until `persist` returns.
//!
//! - [`wal::WalLog`]: append-only file written by a dedicated worker thread
//! - [`MemoryLog`]: keeps everything in memory, for embedding and tests

pub mod record;
pub mod recovery;
pub mod wal;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::state::transaction::Transaction;
use crate::types::Gtrid;

pub use record::{LogOperation, LogRecord, Lsn, Prepared};
pub use wal::{LogConfig, WalLog};

/// Counters of a transaction log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LogStatistics {
    /// Prepared transactions logged
    pub prepare: u64,
    /// Removals logged
    pub remove: u64,
    /// Durable writes (persists that had something to write)
    pub writes: u64,
}

pub trait TransactionLog: Send {
    /// Log that `transaction` is prepared
    fn prepare(&mut self, transaction: &Transaction) -> Result<()>;

    /// Forget the transaction. Only transactions that were prepared leave a record.
    fn remove(&mut self, global: &Gtrid) -> Result<()>;

    /// Make everything logged so far durable
    fn persist(&mut self) -> Result<()>;

    fn statistics(&self) -> LogStatistics;

    /// Transactions found prepared, but never removed, when the log was opened
    fn in_doubt(&self) -> Vec<Prepared> {
        Vec::new()
    }
}

/// Something that happened to a [`MemoryLog`]
#[derive(Debug, Clone, PartialEq)]
pub enum LogEvent {
    Prepare(Gtrid),
    Remove(Gtrid),
    Persist,
}

#[derive(Default)]
struct MemoryState {
    events: Vec<LogEvent>,
    prepared: HashSet<Gtrid>,
    statistics: LogStatistics,
    dirty: bool,
}

/// In-memory log. Clones share the same state.
#[derive(Clone, Default)]
pub struct MemoryLog {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LogEvent> {
        self.inner.lock().expect("log lock poisoned").events.clone()
    }

    /// Gtrids currently logged as prepared
    pub fn prepared(&self) -> Vec<Gtrid> {
        let mut prepared: Vec<Gtrid> = self
            .inner
            .lock()
            .expect("log lock poisoned")
            .prepared
            .iter()
            .cloned()
            .collect();
        prepared.sort();
        prepared
    }
}

impl TransactionLog for MemoryLog {
    fn prepare(&mut self, transaction: &Transaction) -> Result<()> {
        let mut inner = self.inner.lock().expect("log lock poisoned");
        inner.prepared.insert(transaction.global.clone());
        inner.events.push(LogEvent::Prepare(transaction.global.clone()));
        inner.statistics.prepare += 1;
        inner.dirty = true;
        Ok(())
    }

    fn remove(&mut self, global: &Gtrid) -> Result<()> {
        let mut inner = self.inner.lock().expect("log lock poisoned");
        if inner.prepared.remove(global) {
            inner.events.push(LogEvent::Remove(global.clone()));
            inner.statistics.remove += 1;
            inner.dirty = true;
        }
        Ok(())
    }

    fn persist(&mut self) -> Result<()> {
        let mut inner = self.inner.lock().expect("log lock poisoned");
        inner.events.push(LogEvent::Persist);
        if inner.dirty {
            inner.statistics.writes += 1;
            inner.dirty = false;
        }
        Ok(())
    }

    fn statistics(&self) -> LogStatistics {
        self.inner.lock().expect("log lock poisoned").statistics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Trid;

    #[test]
    fn test_memory_log_remove_only_prepared() {
        let mut log = MemoryLog::new();
        let trid = Trid::new(1, vec![1], vec![1]);
        let transaction = Transaction::new(trid.clone());

        log.remove(&trid.gtrid).unwrap();
        assert!(log.events().is_empty());

        log.prepare(&transaction).unwrap();
        log.persist().unwrap();
        log.remove(&trid.gtrid).unwrap();

        assert_eq!(
            log.events(),
            vec![
                LogEvent::Prepare(trid.gtrid.clone()),
                LogEvent::Persist,
                LogEvent::Remove(trid.gtrid.clone())
            ]
        );
        let statistics = log.statistics();
        assert_eq!((statistics.prepare, statistics.remove, statistics.writes), (1, 1, 1));
        assert!(log.prepared().is_empty());
    }

    #[test]
    fn test_memory_log_persist_without_changes() {
        let mut log = MemoryLog::new();
        log.persist().unwrap();
        assert_eq!(log.statistics().writes, 0);
    }
}
