//! XA result codes and outcome classification
//!
//! Every resource reply carries a [`Code`]. The transaction manager summarizes the
//! codes of all participants into one code with [`accumulate`]: the most severe code
//! wins. Severity follows [`Code::priority`], where a lower number is more severe.

use serde::{Deserialize, Serialize};

/// XA return codes, ordered from most to least severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Code {
    /// XA_HEURHAZ - the branch may have been heuristically completed
    HeuristicHazard,
    /// XA_HEURMIX
    HeuristicMixed,
    /// XA_HEURCOM
    HeuristicCommit,
    /// XA_HEURRB
    HeuristicRollback,
    /// XAER_RMFAIL
    ResourceFail,
    /// XAER_RMERR
    ResourceError,
    /// XA_RBINTEGRITY
    RollbackIntegrity,
    /// XA_RBCOMMFAIL
    RollbackCommunication,
    /// XA_RBROLLBACK
    Rollback,
    /// XA_RBOTHER
    RollbackOther,
    /// XA_RBDEADLOCK
    RollbackDeadlock,
    /// XAER_PROTO
    Protocol,
    /// XA_RBPROTO
    RollbackProtocol,
    /// XA_RBTIMEOUT
    RollbackTimeout,
    /// XA_RBTRANSIENT
    RollbackTransient,
    /// XAER_INVAL
    Invalid,
    /// XA_NOMIGRATE
    NoMigrate,
    /// XAER_OUTSIDE
    Outside,
    /// XAER_ASYNC
    Async,
    /// XA_RETRY
    Retry,
    /// XAER_DUPID
    DuplicateId,
    /// XAER_NOTA - nothing to do
    NotATransaction,
    /// XA_OK
    Ok,
    /// XA_RDONLY - went better than expected
    ReadOnly,
}

impl Code {
    /// Rank of the code: the lower the value, the more severe the outcome
    pub fn priority(&self) -> u8 {
        *self as u8
    }

    /// The XA integer value
    pub fn xa(&self) -> i32 {
        match self {
            Code::HeuristicHazard => 8,
            Code::HeuristicMixed => 5,
            Code::HeuristicCommit => 7,
            Code::HeuristicRollback => 6,
            Code::ResourceFail => -7,
            Code::ResourceError => -3,
            Code::RollbackIntegrity => 103,
            Code::RollbackCommunication => 101,
            Code::Rollback => 100,
            Code::RollbackOther => 104,
            Code::RollbackDeadlock => 102,
            Code::Protocol => -6,
            Code::RollbackProtocol => 105,
            Code::RollbackTimeout => 106,
            Code::RollbackTransient => 107,
            Code::Invalid => -5,
            Code::NoMigrate => 9,
            Code::Outside => -9,
            Code::Async => -2,
            Code::Retry => 4,
            Code::DuplicateId => -8,
            Code::NotATransaction => -4,
            Code::Ok => 0,
            Code::ReadOnly => 3,
        }
    }

    /// Map an XA integer value to a code
    pub fn from_xa(value: i32) -> Option<Code> {
        let code = match value {
            8 => Code::HeuristicHazard,
            5 => Code::HeuristicMixed,
            7 => Code::HeuristicCommit,
            6 => Code::HeuristicRollback,
            -7 => Code::ResourceFail,
            -3 => Code::ResourceError,
            103 => Code::RollbackIntegrity,
            101 => Code::RollbackCommunication,
            100 => Code::Rollback,
            104 => Code::RollbackOther,
            102 => Code::RollbackDeadlock,
            -6 => Code::Protocol,
            105 => Code::RollbackProtocol,
            106 => Code::RollbackTimeout,
            107 => Code::RollbackTransient,
            -5 => Code::Invalid,
            9 => Code::NoMigrate,
            -9 => Code::Outside,
            -2 => Code::Async,
            4 => Code::Retry,
            -8 => Code::DuplicateId,
            -4 => Code::NotATransaction,
            0 => Code::Ok,
            3 => Code::ReadOnly,
            _ => return None,
        };
        Some(code)
    }

    /// The more severe of two codes
    pub fn min(self, other: Code) -> Code {
        if other.priority() < self.priority() {
            other
        } else {
            self
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self, Code::ReadOnly)
    }
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self, self.xa())
    }
}

/// Summarize participant codes into one code.
///
/// Starts from `read_only` (every participant had nothing to do) and takes the most
/// severe code. When a request could not be completed at all (`failed`), nobody knows
/// what the branch did, so the starting point is `heuristic_hazard` instead.
pub fn accumulate<I>(codes: I, failed: bool) -> Code
where
    I: IntoIterator<Item = Code>,
{
    let base = if failed { Code::HeuristicHazard } else { Code::ReadOnly };
    codes.into_iter().fold(base, Code::min)
}

/// [`accumulate`] over any reply type, with `extract` pulling the code out of each reply
pub fn accumulate_by<'a, R, F>(replies: impl IntoIterator<Item = &'a R>, extract: F, failed: bool) -> Code
where
    R: 'a,
    F: Fn(&R) -> Code,
{
    accumulate(replies.into_iter().map(extract), failed)
}
