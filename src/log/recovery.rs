//! Transaction log replay

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use super::record::{LogOperation, LogRecord, Lsn, Prepared};
use crate::error::Result;
use crate::types::Gtrid;

/// What a replay of the log found
#[derive(Debug, Default)]
pub struct Replay {
    /// Transactions prepared but never removed
    pub outstanding: BTreeMap<Gtrid, Prepared>,
    /// LSN to continue from
    pub next_lsn: Lsn,
    /// Records read
    pub records: usize,
    /// Records that could not be decoded
    pub skipped: usize,
    /// Bytes of complete records, where the next record goes
    pub bytes: u64,
}

impl Replay {
    pub fn in_doubt(&self) -> Vec<Prepared> {
        self.outstanding.values().cloned().collect()
    }
}

/// Replay the log at `path`. A missing file is an empty log.
///
/// A record cut short at the end of the file (crash mid-write) ends the replay;
/// records that don't decode are skipped.
pub fn replay(path: &Path) -> Result<Replay> {
    let mut replay = Replay {
        next_lsn: 1,
        ..Replay::default()
    };

    if !path.exists() {
        return Ok(replay);
    }

    log::info!("replaying transaction log {:?}", path);

    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut max_lsn: Lsn = 0;

    loop {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_buf) as usize;

        let remaining = file_len.saturating_sub(replay.bytes + 4);
        if len as u64 > remaining {
            log::warn!(
                "transaction log ends with a partial record ({} bytes expected, {} left) - action: ignore",
                len,
                remaining
            );
            break;
        }

        let mut record_buf = vec![0u8; len];
        match reader.read_exact(&mut record_buf) {
            Ok(()) => {}
            Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                log::warn!("transaction log ends with a partial record ({} bytes expected) - action: ignore", len);
                break;
            }
            Err(e) => return Err(e.into()),
        }
        replay.bytes += 4 + len as u64;

        let record: LogRecord = match bincode::deserialize(&record_buf) {
            Ok(r) => r,
            Err(e) => {
                log::warn!("skipping malformed transaction log record: {}", e);
                replay.skipped += 1;
                continue;
            }
        };

        replay.records += 1;
        max_lsn = max_lsn.max(record.lsn);

        match record.op {
            LogOperation::Prepare(prepared) => {
                replay.outstanding.insert(prepared.global.clone(), prepared);
            }
            LogOperation::Remove { global } => {
                replay.outstanding.remove(&global);
            }
            LogOperation::Checkpoint { outstanding } => {
                log::debug!("checkpoint at lsn {} with {} outstanding", record.lsn, outstanding);
            }
        }
    }

    replay.next_lsn = max_lsn + 1;

    for prepared in replay.outstanding.values() {
        log::warn!(
            "in-doubt transaction {} (owner: {:?}, branches: {}) - prepared but never completed",
            prepared.trid,
            prepared.owner,
            prepared.branches.len()
        );
    }
    log::info!(
        "transaction log replay complete: {} records, {} in-doubt, next lsn {}",
        replay.records,
        replay.outstanding.len(),
        replay.next_lsn
    );

    Ok(replay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use crate::types::Trid;

    fn write(file: &mut File, record: &LogRecord) {
        let encoded = bincode::serialize(record).unwrap();
        file.write_all(&(encoded.len() as u32).to_le_bytes()).unwrap();
        file.write_all(&encoded).unwrap();
    }

    fn prepared(gtrid: u8) -> Prepared {
        let trid = Trid::new(1, vec![gtrid], vec![1]);
        Prepared {
            global: trid.gtrid.clone(),
            trid,
            owner: None,
            branches: Vec::new(),
            started: 0,
        }
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let replay = replay(&dir.path().join("nope.log")).unwrap();
        assert!(replay.outstanding.is_empty());
        assert_eq!(replay.next_lsn, 1);
    }

    #[test]
    fn test_prepared_without_remove_is_outstanding() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transaction.log");
        let mut file = File::create(&path).unwrap();

        write(&mut file, &LogRecord { lsn: 1, op: LogOperation::Prepare(prepared(1)), timestamp: 0 });
        write(&mut file, &LogRecord { lsn: 2, op: LogOperation::Prepare(prepared(2)), timestamp: 0 });
        write(
            &mut file,
            &LogRecord { lsn: 3, op: LogOperation::Remove { global: prepared(1).global }, timestamp: 0 },
        );
        drop(file);

        let replay = replay(&path).unwrap();
        assert_eq!(replay.records, 3);
        assert_eq!(replay.next_lsn, 4);
        assert_eq!(replay.in_doubt(), vec![prepared(2)]);
    }

    #[test]
    fn test_partial_tail_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transaction.log");
        let mut file = File::create(&path).unwrap();

        write(&mut file, &LogRecord { lsn: 1, op: LogOperation::Prepare(prepared(1)), timestamp: 0 });
        file.write_all(&100u32.to_le_bytes()).unwrap();
        file.write_all(&[1, 2, 3]).unwrap();
        drop(file);

        let replay = replay(&path).unwrap();
        assert_eq!(replay.records, 1);
        assert_eq!(replay.outstanding.len(), 1);
    }

    #[test]
    fn test_oversized_length_is_a_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transaction.log");
        let mut file = File::create(&path).unwrap();

        write(&mut file, &LogRecord { lsn: 1, op: LogOperation::Prepare(prepared(1)), timestamp: 0 });
        let valid = file.metadata().unwrap().len();
        file.write_all(&u32::MAX.to_le_bytes()).unwrap();
        file.write_all(&[0; 16]).unwrap();
        drop(file);

        let replay = replay(&path).unwrap();
        assert_eq!(replay.records, 1);
        assert_eq!(replay.bytes, valid);
        assert_eq!(replay.in_doubt(), vec![prepared(1)]);
    }

    #[test]
    fn test_malformed_record_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transaction.log");
        let mut file = File::create(&path).unwrap();

        file.write_all(&2u32.to_le_bytes()).unwrap();
        file.write_all(&[0xff, 0xff]).unwrap();
        write(&mut file, &LogRecord { lsn: 7, op: LogOperation::Prepare(prepared(1)), timestamp: 0 });
        drop(file);

        let replay = replay(&path).unwrap();
        assert_eq!(replay.skipped, 1);
        assert_eq!(replay.records, 1);
        assert_eq!(replay.next_lsn, 8);
    }
}
