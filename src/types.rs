//! Core identifier types shared by messages, state and the log
//!
//! - [`Process`]: a process handle (pid + inbound queue)
//! - [`Trid`]: an XA transaction id, `(format, gtrid, bqual)`
//! - [`ResourceId`]: a resource manager id; positive ids are locally spawned
//!   resource proxies, negative ids are external proxies of other domains

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Operating system process id
pub type Pid = u32;

/// Identifier of a process' inbound message queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct QueueId(pub u64);

/// A process handle: who the process is and where to send it messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Process {
    pub pid: Pid,
    pub queue: QueueId,
}

impl Process {
    pub fn new(pid: Pid, queue: QueueId) -> Self {
        Self { pid, queue }
    }
}

impl fmt::Display for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{pid: {}, queue: {}}}", self.pid, self.queue.0)
    }
}

/// Correlates a request with its reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Correlation(pub u64);

impl fmt::Display for Correlation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Resource manager id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(pub i64);

impl ResourceId {
    /// A resource proxy spawned and supervised by this domain
    pub fn is_local(&self) -> bool {
        self.0 > 0
    }

    /// A proxy for a resource living in another domain
    pub fn is_external(&self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// XA flags carried on resource requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Flags(pub i64);

impl Flags {
    pub const NONE: Flags = Flags(0);
    /// TMONEPHASE
    pub const ONE_PHASE: Flags = Flags(0x4000_0000);

    pub fn contains(&self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Global transaction id, shared by every branch of a distributed transaction
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gtrid(pub Vec<u8>);

impl fmt::Display for Gtrid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_hex(f, &self.0)
    }
}

/// XA transaction id. Equality and ordering are over `(format, gtrid, bqual)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Trid {
    pub format: i64,
    pub gtrid: Gtrid,
    pub bqual: Vec<u8>,
}

/// Format id used for generated trids
pub const FORMAT_ID: i64 = 42;

const ID_LENGTH: usize = 16;

impl Trid {
    pub fn new(format: i64, gtrid: impl Into<Vec<u8>>, bqual: impl Into<Vec<u8>>) -> Self {
        Self {
            format,
            gtrid: Gtrid(gtrid.into()),
            bqual: bqual.into(),
        }
    }

    /// Create a new, random transaction id
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut gtrid = vec![0u8; ID_LENGTH];
        let mut bqual = vec![0u8; ID_LENGTH];
        rng.fill_bytes(&mut gtrid);
        rng.fill_bytes(&mut bqual);
        Self::new(FORMAT_ID, gtrid, bqual)
    }

    /// Create a new branch of the same distributed transaction
    pub fn branch(&self) -> Self {
        let mut bqual = vec![0u8; ID_LENGTH];
        rand::thread_rng().fill_bytes(&mut bqual);
        Self {
            format: self.format,
            gtrid: self.gtrid.clone(),
            bqual,
        }
    }

    pub fn global(&self) -> &Gtrid {
        &self.gtrid
    }
}

impl fmt::Display for Trid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.format)?;
        write_hex(f, &self.gtrid.0)?;
        write!(f, ":")?;
        write_hex(f, &self.bqual)
    }
}

fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for byte in bytes {
        write!(f, "{:02x}", byte)?;
    }
    Ok(())
}

/// Start/end of a resource's work on a request, in microseconds since the unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Timing {
    pub start: u64,
    pub end: u64,
}

/// Current time in microseconds since the unix epoch
pub fn timestamp_micros() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(dur) => dur.as_micros() as u64,
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_id_locality() {
        assert!(ResourceId(1).is_local());
        assert!(!ResourceId(1).is_external());
        assert!(ResourceId(-3).is_external());
        assert!(!ResourceId(0).is_local());
        assert!(!ResourceId(0).is_external());
    }

    #[test]
    fn test_flags_contains() {
        let flags = Flags(Flags::ONE_PHASE.0 | 0x1);
        assert!(flags.contains(Flags::ONE_PHASE));
        assert!(!Flags::NONE.contains(Flags::ONE_PHASE));
        assert!(Flags::NONE.contains(Flags::NONE));
    }

    #[test]
    fn test_branch_shares_gtrid() {
        let trid = Trid::generate();
        let branch = trid.branch();
        assert_eq!(trid.gtrid, branch.gtrid);
        assert_ne!(trid, branch);
        assert_eq!(branch.bqual.len(), 16);
    }

    #[test]
    fn test_trid_ordering_over_bytes() {
        let a = Trid::new(1, vec![1, 2], vec![1]);
        let b = Trid::new(1, vec![1, 2], vec![2]);
        let c = Trid::new(1, vec![1, 3], vec![0]);
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a, Trid::new(1, vec![1, 2], vec![1]));
    }

    #[test]
    fn test_trid_display() {
        let trid = Trid::new(42, vec![0xab, 0x01], vec![0xff]);
        assert_eq!(trid.to_string(), "42:ab01:ff");
    }
}
