//! Transaction log record structures

use serde::{Deserialize, Serialize};

use crate::state::transaction::Transaction;
use crate::types::{Gtrid, Pid, ResourceId, Trid};

/// Log Sequence Number
pub type Lsn = u64;

/// A log record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub op: LogOperation,
    /// Unix epoch micros
    pub timestamp: u64,
}

/// What can be logged
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogOperation {
    /// Every resource voted ok, the transaction will be committed
    Prepare(Prepared),
    /// The transaction is completed and can be forgotten
    Remove { global: Gtrid },
    /// Head of a compacted log: how many prepared records follow
    Checkpoint { outstanding: usize },
}

/// A branch as it was when the transaction was prepared
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedBranch {
    pub trid: Trid,
    pub resources: Vec<ResourceId>,
}

/// A prepared transaction, as logged
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prepared {
    pub global: Gtrid,
    pub trid: Trid,
    pub owner: Option<Pid>,
    pub branches: Vec<LoggedBranch>,
    /// When the transaction was started, unix epoch micros
    pub started: u64,
}

impl From<&Transaction> for Prepared {
    fn from(transaction: &Transaction) -> Self {
        Self {
            global: transaction.global.clone(),
            trid: transaction.trid.clone(),
            owner: transaction.owner.map(|p| p.pid),
            branches: transaction
                .branches
                .iter()
                .map(|b| LoggedBranch {
                    trid: b.trid.clone(),
                    resources: b.resources.iter().copied().collect(),
                })
                .collect(),
            started: transaction.started,
        }
    }
}
