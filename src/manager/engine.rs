//! Transaction protocol engine
//!
//! Fans requests out to every participant of a transaction, and runs the
//! continuation of a phase once the [`Coordinator`](crate::coordinator::Coordinator)
//! has every reply:
//!
//! ```text
//!            ┌──── read_only ──▶ reply, remove
//! prepare ───┼──── ok ─────────▶ log prepare, persist, provisional reply ──▶ commit ──▶ reply, remove
//!            └──── error ──────▶ rollback ──▶ reply, remove
//! ```
//!
//! The same continuations serve a local caller (a commit/rollback request) and a
//! TM of another domain that uses us as a resource, see [`Mode`].

use crate::code::{accumulate_by, Code};
use crate::coordinator::{Completed, Pending};
use crate::manager::flush::Deferred;
use crate::error::Result;
use crate::message::{CommitReply, Message, ReplyStage, ResourceReply, ResourceRequest, RollbackReply};
use crate::state::resource::{Dispatched, Phase};
use crate::state::transaction::{Stage, Transaction};
use crate::state::State;
use crate::types::{timestamp_micros, Correlation, Flags, Gtrid, Process, ResourceId, Timing, Trid};

/// Who drives the transaction, and so what the replies look like
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// A local caller sent a commit or rollback request
    Local,
    /// Another domain's TM drives us as a resource. `one_phase` when it asked for a
    /// one-phase commit and we have to run both phases ourselves.
    External { one_phase: bool },
}

/// What to do once a phase has completed
#[derive(Debug, Clone, PartialEq)]
pub enum Continuation {
    Prepare {
        global: Gtrid,
        mode: Mode,
    },
    Commit {
        global: Gtrid,
        mode: Mode,
        /// The reply has to wait for the log, it must not overtake the provisional one
        gated: bool,
    },
    Rollback {
        global: Gtrid,
        mode: Mode,
        /// Aggregate of the prepare phase that failed, if this rollback is the result of one
        prepare: Option<Code>,
    },
}

/// Where and how to reply for a transaction
#[derive(Debug, Clone)]
pub struct Target {
    pub owner: Option<Process>,
    pub correlation: Correlation,
    pub trid: Trid,
    pub resource: Option<ResourceId>,
    pub started: u64,
}

impl Target {
    pub fn of(transaction: &Transaction) -> Self {
        Self {
            owner: transaction.owner,
            correlation: transaction.correlation,
            trid: transaction.trid.clone(),
            resource: transaction.resource,
            started: transaction.started,
        }
    }

    /// Reply to a request the transaction was never taken over for
    pub fn request(process: Process, correlation: Correlation, trid: Trid, resource: Option<ResourceId>) -> Self {
        Self {
            owner: Some(process),
            correlation,
            trid,
            resource,
            started: timestamp_micros(),
        }
    }
}

pub fn commit_reply(state: &State, target: &Target, code: Code, stage: ReplyStage) -> Message {
    Message::CommitReply(CommitReply {
        process: state.process,
        correlation: target.correlation,
        trid: target.trid.clone(),
        state: code,
        stage,
    })
}

pub fn rollback_reply(state: &State, target: &Target, code: Code) -> Message {
    Message::RollbackReply(RollbackReply {
        process: state.process,
        correlation: target.correlation,
        trid: target.trid.clone(),
        state: code,
        stage: ReplyStage::Rollback,
    })
}

/// Reply to another domain's TM, as the resource it knows us as
pub fn external_reply(state: &State, target: &Target, phase: Phase, code: Code) -> Message {
    let reply = ResourceReply {
        process: state.process,
        correlation: target.correlation,
        trid: target.trid.clone(),
        resource: target.resource.unwrap_or(ResourceId(0)),
        state: code,
        statistics: Timing {
            start: target.started,
            end: timestamp_micros(),
        },
    };
    match phase {
        Phase::Prepare => Message::ExternalPrepareReply(reply),
        Phase::Commit => Message::ExternalCommitReply(reply),
        Phase::Rollback => Message::ExternalRollbackReply(reply),
    }
}

/// Send a reply to the owner, held until the log is durable when `gated`
pub fn reply(state: &mut State, target: &Target, message: Message, gated: bool) -> Result<()> {
    let Some(owner) = target.owner else {
        log::debug!("no reply destination for {} - action: discard {:?}", target.trid, message.kind());
        return Ok(());
    };
    if gated {
        state.persistent_reply(&owner, message)
    } else {
        state.send(&owner, message);
        Ok(())
    }
}

/// A commit that completed without error reports `ok`, even if nobody had anything to do
fn normalize_commit(code: Code) -> Code {
    match code {
        Code::ReadOnly => Code::Ok,
        other => other,
    }
}

/// A rollback of something that is already gone is as good as done
fn normalize_rollback(code: Code) -> Code {
    match code {
        Code::ReadOnly | Code::NotATransaction => Code::Ok,
        other => other,
    }
}

/// Send a `phase` request to every participant of the transaction and wait for the
/// replies in the phase's coordinator. Requests to unknown resources are folded in
/// as failed.
pub fn fan_out(state: &mut State, global: &Gtrid, phase: Phase, flags: Flags, token: Continuation) -> Result<()> {
    let participants = match state.transactions.get(global) {
        Some(transaction) => transaction.participants(),
        None => {
            log::warn!("transaction {} is gone - action: discard {:?}", global, phase);
            return Ok(());
        }
    };

    let mut pending = Vec::with_capacity(participants.len());
    let mut unknown = Vec::new();

    for (trid, resource) in participants {
        let correlation = state.next_correlation();
        let request = ResourceRequest {
            process: state.process,
            correlation,
            trid,
            resource,
            flags,
        };
        if state.resources.dispatch(phase, request, state.transport.as_mut()) == Dispatched::Unknown {
            log::error!("invalid resource id: {} - action: {:?} counted as failed", resource, phase);
            unknown.push(correlation);
        }
        pending.push(Pending::new(correlation, resource));
    }

    log::debug!("{:?} sent to {} resources of {}", phase, pending.len(), global);

    let coordinator = state.coordinators.get(phase);
    let mut completed = coordinator.register(token, pending);
    for correlation in unknown {
        if let Some(done) = coordinator.fail(correlation) {
            completed = Some(done);
        }
    }

    match completed {
        Some(done) => complete(state, done),
        None => Ok(()),
    }
}

/// Run the continuation of a completed group
pub fn complete(state: &mut State, done: Completed<ResourceReply, Continuation>) -> Result<()> {
    let failed = done.is_failed();
    match done.token {
        Continuation::Prepare { global, mode } => prepared(state, global, mode, done.replies, failed),
        Continuation::Commit { global, mode, gated } => committed(state, global, mode, gated, done.replies, failed),
        Continuation::Rollback { global, mode, prepare } => {
            rolled_back(state, global, mode, prepare, done.replies, failed)
        }
    }
}

fn prepared(state: &mut State, global: Gtrid, mode: Mode, replies: Vec<ResourceReply>, failed: bool) -> Result<()> {
    let Some(transaction) = state.transactions.get_mut(&global) else {
        log::warn!("prepare completed for unknown transaction {} - action: discard", global);
        return Ok(());
    };

    let (read_only, active): (Vec<ResourceReply>, Vec<ResourceReply>) =
        replies.into_iter().partition(|r| r.state.is_read_only());
    transaction.purge(read_only.iter().map(|r| (&r.trid, r.resource)));

    let code = accumulate_by(&active, |r| r.state, failed);
    let target = Target::of(transaction);
    log::debug!("prepare completed - {} {}", transaction, code);

    match code {
        Code::ReadOnly => {
            let message = match mode {
                Mode::Local => commit_reply(state, &target, Code::Ok, ReplyStage::Commit),
                Mode::External { one_phase: false } => external_reply(state, &target, Phase::Prepare, Code::ReadOnly),
                Mode::External { one_phase: true } => external_reply(state, &target, Phase::Commit, Code::ReadOnly),
            };
            state.transactions.remove(&global, state.log.as_mut())?;
            reply(state, &target, message, false)
        }
        Code::Ok => {
            state.log.prepare(transaction)?;
            match mode {
                Mode::Local => {
                    transaction.stage = Stage::Commit;
                    transaction.prepared = true;
                    // the provisional reply leaves first, the commit requests right after it
                    state.persistent.defer(Deferred {
                        global: global.clone(),
                        phase: Phase::Commit,
                        flags: Flags::NONE,
                        token: Continuation::Commit {
                            global: global.clone(),
                            mode,
                            gated: true,
                        },
                    });
                    let message = commit_reply(state, &target, Code::Ok, ReplyStage::Prepare);
                    reply(state, &target, message, true)
                }
                Mode::External { one_phase: false } => {
                    transaction.prepared = true;
                    let message = external_reply(state, &target, Phase::Prepare, Code::Ok);
                    reply(state, &target, message, true)
                }
                Mode::External { one_phase: true } => {
                    transaction.stage = Stage::Commit;
                    transaction.prepared = true;
                    state.persistent_fan_out(Deferred {
                        global: global.clone(),
                        phase: Phase::Commit,
                        flags: Flags::NONE,
                        token: Continuation::Commit {
                            global: global.clone(),
                            mode,
                            gated: false,
                        },
                    })
                }
            }
        }
        error => match mode {
            Mode::External { one_phase: false } => {
                // the calling TM decides, and will send us a rollback
                log::warn!("prepare failed - {} {} - action: wait for rollback", target.trid, error);
                let message = external_reply(state, &target, Phase::Prepare, error);
                reply(state, &target, message, false)
            }
            _ => {
                log::warn!("prepare failed - {} {} - action: rollback", target.trid, error);
                transaction.stage = Stage::Rollback;
                let token = Continuation::Rollback {
                    global: global.clone(),
                    mode,
                    prepare: Some(error),
                };
                fan_out(state, &global, Phase::Rollback, Flags::NONE, token)
            }
        },
    }
}

fn committed(
    state: &mut State,
    global: Gtrid,
    mode: Mode,
    gated: bool,
    replies: Vec<ResourceReply>,
    failed: bool,
) -> Result<()> {
    let Some(transaction) = state.transactions.get(&global) else {
        log::warn!("commit completed for unknown transaction {} - action: discard", global);
        return Ok(());
    };
    let target = Target::of(transaction);
    let code = accumulate_by(&replies, |r| r.state, failed);
    log::debug!("commit completed - {} {}", transaction, code);

    let message = match mode {
        Mode::Local => commit_reply(state, &target, normalize_commit(code), ReplyStage::Commit),
        Mode::External { .. } => external_reply(state, &target, Phase::Commit, code),
    };

    state.transactions.remove(&global, state.log.as_mut())?;
    reply(state, &target, message, gated)
}

fn rolled_back(
    state: &mut State,
    global: Gtrid,
    mode: Mode,
    prepare: Option<Code>,
    replies: Vec<ResourceReply>,
    failed: bool,
) -> Result<()> {
    let Some(transaction) = state.transactions.get(&global) else {
        log::warn!("rollback completed for unknown transaction {} - action: discard", global);
        return Ok(());
    };
    let target = Target::of(transaction);
    let code = accumulate_by(&replies, |r| r.state, failed);
    log::debug!("rollback completed - {} {}", transaction, code);

    let message = match (mode, prepare) {
        (Mode::Local, Some(prepare)) => {
            commit_reply(state, &target, normalize_rollback(code).min(prepare), ReplyStage::Rollback)
        }
        (Mode::Local, None) => rollback_reply(state, &target, normalize_rollback(code)),
        (Mode::External { one_phase: true }, Some(prepare)) => {
            external_reply(state, &target, Phase::Commit, code.min(prepare))
        }
        (Mode::External { .. }, _) => external_reply(state, &target, Phase::Rollback, code),
    };

    state.transactions.remove(&global, state.log.as_mut())?;
    reply(state, &target, message, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize_commit(Code::ReadOnly), Code::Ok);
        assert_eq!(normalize_commit(Code::HeuristicMixed), Code::HeuristicMixed);
        assert_eq!(normalize_rollback(Code::NotATransaction), Code::Ok);
        assert_eq!(normalize_rollback(Code::ResourceError), Code::ResourceError);
    }

    #[test]
    fn test_prepare_failure_dominates_clean_rollback() {
        assert_eq!(normalize_rollback(Code::ReadOnly).min(Code::RollbackDeadlock), Code::RollbackDeadlock);
    }
}
