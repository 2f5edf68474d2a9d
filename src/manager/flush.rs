//! Work gated on log durability
//!
//! A reply that tells the caller something was made durable may only leave once
//! the log has been persisted. The same holds for the commit decision that follows
//! a logged prepare: no resource may commit before the prepare record is on disk.
//! Both are held here and released in batches, so many of them share a single
//! `persist`.

use crate::error::Result;
use crate::log::TransactionLog;
use crate::message::Message;
use crate::state::resource::Phase;
use crate::transport::{send_or_pend, Transport};
use crate::types::{Flags, Gtrid, Process};

use super::engine::Continuation;

/// A fan-out that may only start once the log is durable
#[derive(Debug, Clone, PartialEq)]
pub struct Deferred {
    pub global: Gtrid,
    pub phase: Phase,
    pub flags: Flags,
    pub token: Continuation,
}

#[derive(Debug)]
pub struct FlushBuffer {
    replies: Vec<(Process, Message)>,
    deferred: Vec<Deferred>,
    batch_size: usize,
}

impl FlushBuffer {
    pub fn new(batch_size: usize) -> Self {
        Self {
            replies: Vec::new(),
            deferred: Vec::new(),
            batch_size: batch_size.max(1),
        }
    }

    /// Hold a reply, returns true when the batch is full
    pub fn enqueue(&mut self, destination: Process, message: Message) -> bool {
        self.replies.push((destination, message));
        self.is_full()
    }

    /// Hold a fan-out, returns true when the batch is full
    pub fn defer(&mut self, deferred: Deferred) -> bool {
        self.deferred.push(deferred);
        self.is_full()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.batch_size
    }

    /// Held replies and fan-outs
    pub fn len(&self) -> usize {
        self.replies.len() + self.deferred.len()
    }

    pub fn replies(&self) -> usize {
        self.replies.len()
    }

    pub fn deferred(&self) -> usize {
        self.deferred.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replies.is_empty() && self.deferred.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Persist the log, then send the held replies in the order they were enqueued.
    /// Returns the held fan-outs, which the caller starts after the replies are out.
    pub fn flush(&mut self, log: &mut dyn TransactionLog, transport: &mut dyn Transport) -> Result<Vec<Deferred>> {
        if self.is_empty() {
            return Ok(Vec::new());
        }

        log.persist()?;

        let count = self.replies.len();
        for (destination, message) in self.replies.drain(..) {
            send_or_pend(transport, &destination, message);
        }
        log::debug!("flushed {} persistent replies, {} deferred fan-outs", count, self.deferred.len());
        Ok(std::mem::take(&mut self.deferred))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::{LogEvent, MemoryLog};
    use crate::manager::engine::Mode;
    use crate::message::ProcessExit;
    use crate::transport::MemoryTransport;
    use crate::types::QueueId;

    fn message(pid: u32) -> Message {
        Message::ProcessExit(ProcessExit::new(pid))
    }

    #[test]
    fn test_enqueue_reports_full_batch() {
        let mut buffer = FlushBuffer::new(2);
        let destination = Process::new(1, QueueId(1));
        assert!(!buffer.enqueue(destination, message(1)));
        assert!(buffer.enqueue(destination, message(2)));
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_zero_batch_size_is_one() {
        assert_eq!(FlushBuffer::new(0).batch_size(), 1);
    }

    #[test]
    fn test_flush_persists_before_sending_in_order() {
        let mut buffer = FlushBuffer::new(10);
        let mut log = MemoryLog::new();
        let transport = MemoryTransport::new();
        let mut sender = transport.clone();
        let destination = Process::new(1, QueueId(1));

        buffer.enqueue(destination, message(1));
        buffer.enqueue(destination, message(2));
        assert!(transport.sent().is_empty());

        assert!(buffer.flush(&mut log, &mut sender).unwrap().is_empty());
        assert_eq!(log.events(), vec![LogEvent::Persist]);
        let sent: Vec<Message> = transport.sent().into_iter().map(|(_, m)| m).collect();
        assert_eq!(sent, vec![message(1), message(2)]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_flush_empty_does_not_persist() {
        let mut buffer = FlushBuffer::new(10);
        let mut log = MemoryLog::new();
        let mut transport = MemoryTransport::new();
        assert!(buffer.flush(&mut log, &mut transport).unwrap().is_empty());
        assert!(log.events().is_empty());
    }

    #[test]
    fn test_deferred_fan_out_is_released_after_persist() {
        let mut buffer = FlushBuffer::new(2);
        let mut log = MemoryLog::new();
        let transport = MemoryTransport::new();
        let mut sender = transport.clone();
        let global = Gtrid(vec![7; 4]);
        let deferred = Deferred {
            global: global.clone(),
            phase: Phase::Commit,
            flags: Flags::NONE,
            token: Continuation::Commit {
                global,
                mode: Mode::Local,
                gated: true,
            },
        };

        assert!(!buffer.defer(deferred.clone()));
        assert_eq!(buffer.deferred(), 1);
        assert!(buffer.enqueue(Process::new(1, QueueId(1)), message(1)));

        let released = buffer.flush(&mut log, &mut sender).unwrap();
        assert_eq!(log.events(), vec![LogEvent::Persist]);
        assert_eq!(transport.sent().len(), 1);
        assert_eq!(released, vec![deferred]);
        assert!(buffer.is_empty());
    }
}
