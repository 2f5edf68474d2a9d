//! Message handlers
//!
//! One handler per inbound message type. Handlers own nothing: everything they
//! need is in the [`State`] they are given.

use std::collections::HashMap;

use super::admin::Snapshot;
use super::engine::{self, commit_reply, external_reply, rollback_reply, Continuation, Mode, Target};
use super::Handler;
use crate::code::Code;
use crate::error::{Result, TmError};
use crate::message::{
    CommitRequest, ConfigurationReply, ConfigurationRequest, ExternalInvolved, InvolvedReply, InvolvedRequest,
    Message, MessageType, ProcessExit, ReplyStage, ResourceConfigurationReply, ResourceConfigurationRequest,
    ResourceReady, ResourceReply, ResourceRequest, RollbackRequest,
};
use crate::state::resource::Phase;
use crate::state::transaction::{Stage, Transaction};
use crate::state::State;
use crate::types::{Flags, ResourceId, Trid};

/// The handler table of the dispatch loop
pub fn handlers() -> HashMap<MessageType, Handler> {
    let mut handlers: HashMap<MessageType, Handler> = HashMap::new();
    handlers.insert(MessageType::CommitRequest, commit);
    handlers.insert(MessageType::RollbackRequest, rollback);
    handlers.insert(MessageType::InvolvedRequest, involved);

    handlers.insert(MessageType::ResourcePrepareReply, resource_reply);
    handlers.insert(MessageType::ResourceCommitReply, resource_reply);
    handlers.insert(MessageType::ResourceRollbackReply, resource_reply);
    handlers.insert(MessageType::ResourceReady, ready);
    handlers.insert(MessageType::ResourceConfigurationRequest, resource_configuration);

    handlers.insert(MessageType::ExternalInvolved, external_involved);
    handlers.insert(MessageType::ExternalPrepareRequest, external_request);
    handlers.insert(MessageType::ExternalCommitRequest, external_request);
    handlers.insert(MessageType::ExternalRollbackRequest, external_request);
    handlers.insert(MessageType::ExternalPrepareReply, resource_reply);
    handlers.insert(MessageType::ExternalCommitReply, resource_reply);
    handlers.insert(MessageType::ExternalRollbackReply, resource_reply);

    handlers.insert(MessageType::ProcessExit, process_exit);
    handlers.insert(MessageType::ConfigurationRequest, configuration);
    handlers
}

fn commit(state: &mut State, message: Message) -> Result<()> {
    match message {
        Message::CommitRequest(request) => commit_request(state, request),
        other => Err(TmError::unexpected_message("commit", other.kind())),
    }
}

fn rollback(state: &mut State, message: Message) -> Result<()> {
    match message {
        Message::RollbackRequest(request) => rollback_request(state, request),
        other => Err(TmError::unexpected_message("rollback", other.kind())),
    }
}

fn involved(state: &mut State, message: Message) -> Result<()> {
    match message {
        Message::InvolvedRequest(request) => involved_request(state, request),
        other => Err(TmError::unexpected_message("involved", other.kind())),
    }
}

fn resource_reply(state: &mut State, message: Message) -> Result<()> {
    let (phase, reply) = match message {
        Message::ResourcePrepareReply(reply) | Message::ExternalPrepareReply(reply) => (Phase::Prepare, reply),
        Message::ResourceCommitReply(reply) | Message::ExternalCommitReply(reply) => (Phase::Commit, reply),
        Message::ResourceRollbackReply(reply) | Message::ExternalRollbackReply(reply) => (Phase::Rollback, reply),
        other => return Err(TmError::unexpected_message("resource reply", other.kind())),
    };
    resource_replied(state, phase, reply)
}

fn ready(state: &mut State, message: Message) -> Result<()> {
    match message {
        Message::ResourceReady(ResourceReady { process, resource }) => {
            state.resources.ready(resource, process, state.transport.as_mut());
            Ok(())
        }
        other => Err(TmError::unexpected_message("ready", other.kind())),
    }
}

fn resource_configuration(state: &mut State, message: Message) -> Result<()> {
    match message {
        Message::ResourceConfigurationRequest(request) => resource_configuration_request(state, request),
        other => Err(TmError::unexpected_message("resource configuration", other.kind())),
    }
}

fn external_involved(state: &mut State, message: Message) -> Result<()> {
    match message {
        Message::ExternalInvolved(involved) => external_involved_request(state, involved),
        other => Err(TmError::unexpected_message("external involved", other.kind())),
    }
}

fn external_request(state: &mut State, message: Message) -> Result<()> {
    match message {
        Message::ExternalPrepareRequest(request) => external_prepare(state, request),
        Message::ExternalCommitRequest(request) => external_commit(state, request),
        Message::ExternalRollbackRequest(request) => external_rollback(state, request),
        other => Err(TmError::unexpected_message("external request", other.kind())),
    }
}

fn process_exit(state: &mut State, message: Message) -> Result<()> {
    match message {
        Message::ProcessExit(exit) => exited(state, exit),
        other => Err(TmError::unexpected_message("process exit", other.kind())),
    }
}

fn configuration(state: &mut State, message: Message) -> Result<()> {
    match message {
        Message::ConfigurationRequest(request) => configuration_request(state, request),
        other => Err(TmError::unexpected_message("configuration", other.kind())),
    }
}

/// Involve the known resources of `involved`, logging the unknown ones
fn involve_known(state: &mut State, trid: &Trid, involved: &[ResourceId]) {
    let (known, unknown): (Vec<ResourceId>, Vec<ResourceId>) =
        involved.iter().copied().partition(|id| state.resources.is_known(*id));

    for id in unknown {
        log::error!("invalid resource id: {} - involved with {} - action: discard", id, trid);
    }
    if let Some(transaction) = state.transactions.get_mut(&trid.gtrid) {
        transaction.involve(trid, known);
    }
}

fn commit_request(state: &mut State, request: CommitRequest) -> Result<()> {
    let global = request.trid.gtrid.clone();
    let stage = state.transactions.find_or_create(&request.trid).stage;

    if stage > Stage::Involved {
        log::error!(
            "commit of {} which is at stage {:?} - action: reply protocol error",
            request.trid,
            stage
        );
        let target = Target::request(request.process, request.correlation, request.trid, None);
        let message = commit_reply(state, &target, Code::Protocol, ReplyStage::Commit);
        return engine::reply(state, &target, message, false);
    }

    involve_known(state, &request.trid, &request.involved);

    let Some(transaction) = state.transactions.get_mut(&global) else {
        return Ok(());
    };
    transaction.owner = Some(request.process);
    transaction.correlation = request.correlation;
    transaction.trid = request.trid.clone();

    let resources = transaction.resource_count();
    let single = resources == 1 && transaction.branches.len() == 1;

    if resources == 0 {
        log::debug!("no resources involved - {} - action: commit", request.trid);
        let target = Target::of(transaction);
        state.transactions.remove(&global, state.log.as_mut())?;
        let message = commit_reply(state, &target, Code::Ok, ReplyStage::Commit);
        return engine::reply(state, &target, message, false);
    }

    if single {
        log::debug!("only one resource involved - {} - action: one-phase commit", request.trid);
        transaction.stage = Stage::Commit;
        let token = Continuation::Commit {
            global: global.clone(),
            mode: Mode::Local,
            gated: false,
        };
        return engine::fan_out(state, &global, Phase::Commit, Flags::ONE_PHASE, token);
    }

    log::debug!("{} resources involved - {} - action: prepare", resources, request.trid);
    transaction.stage = Stage::Prepare;
    let token = Continuation::Prepare {
        global: global.clone(),
        mode: Mode::Local,
    };
    engine::fan_out(state, &global, Phase::Prepare, Flags::NONE, token)
}

fn rollback_request(state: &mut State, request: RollbackRequest) -> Result<()> {
    let global = request.trid.gtrid.clone();
    let stage = state.transactions.find_or_create(&request.trid).stage;

    if stage > Stage::Involved {
        log::error!(
            "rollback of {} which is at stage {:?} - action: reply protocol error",
            request.trid,
            stage
        );
        let target = Target::request(request.process, request.correlation, request.trid, None);
        let message = rollback_reply(state, &target, Code::Protocol);
        return engine::reply(state, &target, message, false);
    }

    involve_known(state, &request.trid, &request.involved);

    let Some(transaction) = state.transactions.get_mut(&global) else {
        return Ok(());
    };
    transaction.owner = Some(request.process);
    transaction.correlation = request.correlation;
    transaction.trid = request.trid.clone();
    transaction.stage = Stage::Rollback;

    let token = Continuation::Rollback {
        global: global.clone(),
        mode: Mode::Local,
        prepare: None,
    };
    engine::fan_out(state, &global, Phase::Rollback, Flags::NONE, token)
}

fn involved_request(state: &mut State, request: InvolvedRequest) -> Result<()> {
    let global = request.trid.gtrid.clone();
    let transaction = state.transactions.find_or_create(&request.trid);
    transaction.owner.get_or_insert(request.process);
    let stage = transaction.stage;

    if stage > Stage::Involved {
        log::warn!(
            "involved with {} which is at stage {:?} - action: discard {:?}",
            request.trid,
            stage,
            request.involved
        );
    } else {
        let known = state
            .transactions
            .get(&global)
            .and_then(|t| t.branch(&request.trid))
            .map(|b| b.resources.clone())
            .unwrap_or_default();
        let new: Vec<ResourceId> = request.involved.iter().copied().filter(|id| !known.contains(id)).collect();
        involve_known(state, &request.trid, &new);
    }

    let mut involved = Vec::new();
    if let Some(transaction) = state.transactions.get(&global) {
        if let Some(branch) = transaction.branch(&request.trid) {
            involved = branch.resources.iter().copied().collect();
        }
        if transaction.stage == Stage::Involved && transaction.is_empty() {
            log::debug!("nothing involved in {} - action: discard", request.trid);
            state.transactions.remove(&global, state.log.as_mut())?;
        }
    }

    let reply = Message::InvolvedReply(InvolvedReply {
        process: state.process,
        correlation: request.correlation,
        trid: request.trid,
        involved,
    });
    state.send(&request.process, reply);
    Ok(())
}

fn resource_replied(state: &mut State, phase: Phase, reply: ResourceReply) -> Result<()> {
    log::debug!(
        "{:?} reply from resource {} {} - {}",
        phase,
        reply.resource,
        reply.correlation,
        reply.state
    );

    if reply.resource.is_local() {
        state.resources.instance_done(
            reply.resource,
            reply.process.pid,
            reply.state,
            reply.statistics,
            state.transport.as_mut(),
        );
    }

    match state.coordinators.get(phase).accept(reply) {
        Some(done) => engine::complete(state, done),
        None => Ok(()),
    }
}

fn resource_configuration_request(state: &mut State, request: ResourceConfigurationRequest) -> Result<()> {
    state.resources.spawned(request.resource, request.process);

    let reply = match state.resources.proxy(request.resource) {
        Some(proxy) => ResourceConfigurationReply {
            process: state.process,
            correlation: request.correlation,
            resource: request.resource,
            found: true,
            key: proxy.key.clone(),
            openinfo: proxy.openinfo.clone(),
            closeinfo: proxy.closeinfo.clone(),
        },
        None => {
            log::error!("invalid resource id: {} - configuration requested by {}", request.resource, request.process);
            ResourceConfigurationReply {
                process: state.process,
                correlation: request.correlation,
                resource: request.resource,
                found: false,
                key: String::new(),
                openinfo: String::new(),
                closeinfo: String::new(),
            }
        }
    };
    state.send(&request.process, Message::ResourceConfigurationReply(reply));
    Ok(())
}

fn external_involved_request(state: &mut State, involved: ExternalInvolved) -> Result<()> {
    let id = state.resources.external_id(&involved.process);
    let transaction = state.transactions.find_or_create(&involved.trid);

    if transaction.stage > Stage::Involved {
        log::warn!(
            "external {} involved with {} at stage {:?} - action: discard",
            involved.process,
            involved.trid,
            transaction.stage
        );
        return Ok(());
    }
    log::debug!("external {} ({}) involved with {}", id, involved.process, involved.trid);
    transaction.involve(&involved.trid, [id]);
    Ok(())
}

/// Reply to another domain's TM without touching any transaction
fn external_immediate(state: &mut State, request: &ResourceRequest, phase: Phase, code: Code) -> Result<()> {
    let target = Target::request(
        request.process,
        request.correlation,
        request.trid.clone(),
        Some(request.resource),
    );
    let message = external_reply(state, &target, phase, code);
    engine::reply(state, &target, message, false)
}

/// Take over a transaction for a request from another domain's TM
fn take_over(transaction: &mut Transaction, request: &ResourceRequest) {
    transaction.owner = Some(request.process);
    transaction.correlation = request.correlation;
    transaction.trid = request.trid.clone();
    transaction.resource = Some(request.resource);
}

fn external_prepare(state: &mut State, request: ResourceRequest) -> Result<()> {
    let global = request.trid.gtrid.clone();

    let Some(transaction) = state.transactions.get_mut(&global) else {
        log::debug!("prepare of {} which is unknown here - action: reply read only", request.trid);
        return external_immediate(state, &request, Phase::Prepare, Code::ReadOnly);
    };
    if transaction.stage > Stage::Involved {
        log::debug!(
            "prepare of {} which is at stage {:?} - action: reply read only",
            request.trid,
            transaction.stage
        );
        return external_immediate(state, &request, Phase::Prepare, Code::ReadOnly);
    }

    take_over(transaction, &request);

    if transaction.resource_count() == 0 {
        let target = Target::of(transaction);
        state.transactions.remove(&global, state.log.as_mut())?;
        let message = external_reply(state, &target, Phase::Prepare, Code::ReadOnly);
        return engine::reply(state, &target, message, false);
    }

    transaction.stage = Stage::Prepare;
    let token = Continuation::Prepare {
        global: global.clone(),
        mode: Mode::External { one_phase: false },
    };
    engine::fan_out(state, &global, Phase::Prepare, Flags::NONE, token)
}

fn external_commit(state: &mut State, request: ResourceRequest) -> Result<()> {
    let global = request.trid.gtrid.clone();

    let Some(transaction) = state.transactions.get_mut(&global) else {
        log::debug!("commit of {} which is unknown here - action: reply read only", request.trid);
        return external_immediate(state, &request, Phase::Commit, Code::ReadOnly);
    };

    match transaction.stage {
        Stage::Prepare if transaction.prepared => {
            take_over(transaction, &request);
            transaction.stage = Stage::Commit;
            let token = Continuation::Commit {
                global: global.clone(),
                mode: Mode::External { one_phase: false },
                gated: false,
            };
            engine::fan_out(state, &global, Phase::Commit, Flags::NONE, token)
        }
        Stage::Involved if request.flags.contains(Flags::ONE_PHASE) => {
            take_over(transaction, &request);
            let resources = transaction.resource_count();

            if resources == 0 {
                let target = Target::of(transaction);
                state.transactions.remove(&global, state.log.as_mut())?;
                let message = external_reply(state, &target, Phase::Commit, Code::ReadOnly);
                return engine::reply(state, &target, message, false);
            }

            let mode = Mode::External { one_phase: true };
            if resources == 1 && transaction.branches.len() == 1 {
                transaction.stage = Stage::Commit;
                let token = Continuation::Commit {
                    global: global.clone(),
                    mode,
                    gated: false,
                };
                return engine::fan_out(state, &global, Phase::Commit, Flags::ONE_PHASE, token);
            }

            transaction.stage = Stage::Prepare;
            let token = Continuation::Prepare {
                global: global.clone(),
                mode,
            };
            engine::fan_out(state, &global, Phase::Prepare, Flags::NONE, token)
        }
        Stage::Involved | Stage::Prepare => {
            log::error!(
                "commit of {} which is at stage {:?} and not prepared - action: reply protocol error",
                request.trid,
                transaction.stage
            );
            external_immediate(state, &request, Phase::Commit, Code::Protocol)
        }
        Stage::Commit | Stage::Rollback => {
            log::debug!(
                "commit of {} which is already at stage {:?} - action: reply read only",
                request.trid,
                transaction.stage
            );
            external_immediate(state, &request, Phase::Commit, Code::ReadOnly)
        }
    }
}

fn external_rollback(state: &mut State, request: ResourceRequest) -> Result<()> {
    let global = request.trid.gtrid.clone();

    let Some(transaction) = state.transactions.get_mut(&global) else {
        log::debug!("rollback of {} which is unknown here - action: reply read only", request.trid);
        return external_immediate(state, &request, Phase::Rollback, Code::ReadOnly);
    };
    if transaction.stage >= Stage::Commit {
        log::debug!(
            "rollback of {} which is already at stage {:?} - action: reply read only",
            request.trid,
            transaction.stage
        );
        return external_immediate(state, &request, Phase::Rollback, Code::ReadOnly);
    }

    take_over(transaction, &request);
    transaction.stage = Stage::Rollback;
    let token = Continuation::Rollback {
        global: global.clone(),
        mode: Mode::External { one_phase: false },
        prepare: None,
    };
    engine::fan_out(state, &global, Phase::Rollback, Flags::NONE, token)
}

fn exited(state: &mut State, exit: ProcessExit) -> Result<()> {
    if let Some(instance) = state.resources.remove_instance(exit.pid) {
        log::warn!(
            "resource {} instance {} exited ({:?}, status {})",
            instance.id,
            instance.process,
            exit.reason,
            exit.status
        );

        if let Some(correlation) = instance.in_flight {
            for phase in [Phase::Prepare, Phase::Commit, Phase::Rollback] {
                if let Some(done) = state.coordinators.get(phase).fail(correlation) {
                    engine::complete(state, done)?;
                }
            }
        }

        if let Some(supervisor) = state.supervisor {
            state.send(&supervisor, Message::ProcessExit(exit));
        }
        return Ok(());
    }

    for global in state.transactions.owned_by(exit.pid) {
        let Some(transaction) = state.transactions.get_mut(&global) else {
            continue;
        };
        if transaction.stage != Stage::Involved {
            continue;
        }
        log::warn!("owner {} of {} has exited - action: rollback", exit.pid, transaction.trid);
        transaction.owner = None;
        transaction.stage = Stage::Rollback;

        let token = Continuation::Rollback {
            global: global.clone(),
            mode: Mode::Local,
            prepare: None,
        };
        engine::fan_out(state, &global, Phase::Rollback, Flags::NONE, token)?;
    }
    Ok(())
}

fn configuration_request(state: &mut State, request: ConfigurationRequest) -> Result<()> {
    let snapshot = Snapshot::build(state, request.alias.as_deref());
    let reply = ConfigurationReply {
        process: state.process,
        correlation: request.correlation,
        snapshot,
    };
    state.send(&request.process, Message::ConfigurationReply(Box::new(reply)));
    Ok(())
}
