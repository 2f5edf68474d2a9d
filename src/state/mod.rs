//! The state of the transaction manager
//!
//! [`State`] is owned by the dispatch loop. Every handler gets it by `&mut`, there is
//! no other shared state apart from what the log worker keeps behind its channel.

pub mod resource;
pub mod transaction;

use crate::coordinator::Coordinator;
use crate::error::Result;
use crate::log::TransactionLog;
use crate::manager::engine::{self, Continuation};
use crate::manager::flush::{Deferred, FlushBuffer};
use crate::message::{Message, ResourceReply};
use crate::transport::{send_or_pend, Transport};
use crate::types::{Correlation, Process};

use resource::{Phase, Registry};
use transaction::TransactionTable;

pub type PhaseCoordinator = Coordinator<ResourceReply, Continuation>;

/// One coordinator per phase
#[derive(Debug, Default)]
pub struct Coordinators {
    pub prepare: PhaseCoordinator,
    pub commit: PhaseCoordinator,
    pub rollback: PhaseCoordinator,
}

impl Coordinators {
    pub fn get(&mut self, phase: Phase) -> &mut PhaseCoordinator {
        match phase {
            Phase::Prepare => &mut self.prepare,
            Phase::Commit => &mut self.commit,
            Phase::Rollback => &mut self.rollback,
        }
    }

    /// Groups still waiting for replies, over all phases
    pub fn waiting(&self) -> usize {
        self.prepare.len() + self.commit.len() + self.rollback.len()
    }
}

pub struct State {
    pub transactions: TransactionTable,
    pub resources: Registry,
    pub coordinators: Coordinators,
    pub log: Box<dyn TransactionLog>,
    pub transport: Box<dyn Transport>,
    /// Replies held until the log is durable
    pub persistent: FlushBuffer,
    /// The TM's own handle, the sender of every request it sends
    pub process: Process,
    /// Gets the exit events of resource proxy instances
    pub supervisor: Option<Process>,
    correlation: u64,
}

impl State {
    pub fn new(
        resources: Registry,
        log: Box<dyn TransactionLog>,
        transport: Box<dyn Transport>,
        batch_size: usize,
    ) -> Self {
        Self {
            transactions: TransactionTable::new(),
            resources,
            coordinators: Coordinators::default(),
            log,
            transport,
            persistent: FlushBuffer::new(batch_size),
            process: Process::default(),
            supervisor: None,
            correlation: 0,
        }
    }

    pub fn with_process(mut self, process: Process) -> Self {
        self.process = process;
        self
    }

    pub fn with_supervisor(mut self, supervisor: Process) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn next_correlation(&mut self) -> Correlation {
        self.correlation += 1;
        Correlation(self.correlation)
    }

    /// Send right away, or through the pending path if the destination is busy
    pub fn send(&mut self, destination: &Process, message: Message) {
        send_or_pend(self.transport.as_mut(), destination, message);
    }

    /// Hold the reply until the log is durable. Flushes when the batch is full.
    pub fn persistent_reply(&mut self, destination: &Process, message: Message) -> Result<()> {
        if self.persistent.enqueue(*destination, message) {
            self.flush()?;
        }
        Ok(())
    }

    /// Hold a fan-out until the log is durable. Flushes when the batch is full.
    pub fn persistent_fan_out(&mut self, deferred: Deferred) -> Result<()> {
        if self.persistent.defer(deferred) {
            self.flush()?;
        }
        Ok(())
    }

    /// Persist the log, send every held reply, then start the held fan-outs.
    /// Repeats until nothing is held, a fan-out may complete on the spot.
    pub fn flush(&mut self) -> Result<()> {
        while !self.persistent.is_empty() {
            let deferred = self.persistent.flush(self.log.as_mut(), self.transport.as_mut())?;
            for Deferred { global, phase, flags, token } in deferred {
                engine::fan_out(self, &global, phase, flags, token)?;
            }
        }
        Ok(())
    }
}
