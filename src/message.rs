//! Message contracts of the transaction manager
//!
//! Every message the TM consumes or produces is a variant of [`Message`]. The
//! transport delivers them already deserialized; the ingress encodes them as JSON.
//!
//! ```text
//! client ── CommitRequest ──▶ TM ── ResourcePrepareRequest ──▶ resource proxy
//! client ◀── CommitReply ──── TM ◀── ResourcePrepareReply ──── resource proxy
//! ```

use serde::{Deserialize, Serialize};

use crate::code::Code;
use crate::manager::admin::Snapshot;
use crate::types::{Correlation, Flags, Pid, Process, ResourceId, Timing, Trid};

/// Which phase a commit/rollback reply reports on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStage {
    /// Provisional: the prepare phase is durable, the commit phase follows
    Prepare,
    Commit,
    Rollback,
    Error,
}

/// Request to commit a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRequest {
    pub process: Process,
    pub correlation: Correlation,
    pub trid: Trid,
    /// Resources the caller knows are involved
    #[serde(default)]
    pub involved: Vec<ResourceId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitReply {
    pub process: Process,
    pub correlation: Correlation,
    pub trid: Trid,
    pub state: Code,
    pub stage: ReplyStage,
}

/// Request to roll back a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackRequest {
    pub process: Process,
    pub correlation: Correlation,
    pub trid: Trid,
    #[serde(default)]
    pub involved: Vec<ResourceId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackReply {
    pub process: Process,
    pub correlation: Correlation,
    pub trid: Trid,
    pub state: Code,
    pub stage: ReplyStage,
}

/// A caller declares resources involved in a transaction branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvolvedRequest {
    pub process: Process,
    pub correlation: Correlation,
    pub trid: Trid,
    pub involved: Vec<ResourceId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvolvedReply {
    pub process: Process,
    pub correlation: Correlation,
    pub trid: Trid,
    /// Every resource involved in the branch after the request was applied
    pub involved: Vec<ResourceId>,
}

/// Prepare/commit/rollback request to one resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub process: Process,
    pub correlation: Correlation,
    pub trid: Trid,
    pub resource: ResourceId,
    #[serde(default)]
    pub flags: Flags,
}

/// Outcome of a prepare/commit/rollback on one resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceReply {
    pub process: Process,
    pub correlation: Correlation,
    pub trid: Trid,
    pub resource: ResourceId,
    pub state: Code,
    #[serde(default)]
    pub statistics: Timing,
}

/// A proxy of another domain declares itself involved in a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalInvolved {
    pub process: Process,
    pub trid: Trid,
}

/// A resource proxy instance is up and ready for work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceReady {
    pub process: Process,
    pub resource: ResourceId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfigurationRequest {
    pub process: Process,
    pub correlation: Correlation,
    pub resource: ResourceId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfigurationReply {
    pub process: Process,
    pub correlation: Correlation,
    pub resource: ResourceId,
    pub found: bool,
    pub key: String,
    pub openinfo: String,
    pub closeinfo: String,
}

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Exited,
    Signaled,
    Core,
    Unknown,
}

/// A process has died
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessExit {
    pub pid: Pid,
    pub status: i32,
    pub reason: ExitReason,
}

impl ProcessExit {
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            status: 0,
            reason: ExitReason::Unknown,
        }
    }
}

/// Administrative read of the current state, optionally only the resources named `alias`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationRequest {
    pub process: Process,
    pub correlation: Correlation,
    #[serde(default)]
    pub alias: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationReply {
    pub process: Process,
    pub correlation: Correlation,
    pub snapshot: Snapshot,
}

/// Every message the TM knows about
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum Message {
    CommitRequest(CommitRequest),
    CommitReply(CommitReply),
    RollbackRequest(RollbackRequest),
    RollbackReply(RollbackReply),
    InvolvedRequest(InvolvedRequest),
    InvolvedReply(InvolvedReply),

    ResourcePrepareRequest(ResourceRequest),
    ResourceCommitRequest(ResourceRequest),
    ResourceRollbackRequest(ResourceRequest),
    ResourcePrepareReply(ResourceReply),
    ResourceCommitReply(ResourceReply),
    ResourceRollbackReply(ResourceReply),
    ResourceReady(ResourceReady),
    ResourceConfigurationRequest(ResourceConfigurationRequest),
    ResourceConfigurationReply(ResourceConfigurationReply),

    ExternalInvolved(ExternalInvolved),
    ExternalPrepareRequest(ResourceRequest),
    ExternalCommitRequest(ResourceRequest),
    ExternalRollbackRequest(ResourceRequest),
    ExternalPrepareReply(ResourceReply),
    ExternalCommitReply(ResourceReply),
    ExternalRollbackReply(ResourceReply),

    ProcessExit(ProcessExit),

    ConfigurationRequest(ConfigurationRequest),
    ConfigurationReply(Box<ConfigurationReply>),
}

/// Tag of a [`Message`] variant, the key of the handler table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    CommitRequest,
    CommitReply,
    RollbackRequest,
    RollbackReply,
    InvolvedRequest,
    InvolvedReply,
    ResourcePrepareRequest,
    ResourceCommitRequest,
    ResourceRollbackRequest,
    ResourcePrepareReply,
    ResourceCommitReply,
    ResourceRollbackReply,
    ResourceReady,
    ResourceConfigurationRequest,
    ResourceConfigurationReply,
    ExternalInvolved,
    ExternalPrepareRequest,
    ExternalCommitRequest,
    ExternalRollbackRequest,
    ExternalPrepareReply,
    ExternalCommitReply,
    ExternalRollbackReply,
    ProcessExit,
    ConfigurationRequest,
    ConfigurationReply,
}

impl Message {
    pub fn kind(&self) -> MessageType {
        match self {
            Message::CommitRequest(_) => MessageType::CommitRequest,
            Message::CommitReply(_) => MessageType::CommitReply,
            Message::RollbackRequest(_) => MessageType::RollbackRequest,
            Message::RollbackReply(_) => MessageType::RollbackReply,
            Message::InvolvedRequest(_) => MessageType::InvolvedRequest,
            Message::InvolvedReply(_) => MessageType::InvolvedReply,
            Message::ResourcePrepareRequest(_) => MessageType::ResourcePrepareRequest,
            Message::ResourceCommitRequest(_) => MessageType::ResourceCommitRequest,
            Message::ResourceRollbackRequest(_) => MessageType::ResourceRollbackRequest,
            Message::ResourcePrepareReply(_) => MessageType::ResourcePrepareReply,
            Message::ResourceCommitReply(_) => MessageType::ResourceCommitReply,
            Message::ResourceRollbackReply(_) => MessageType::ResourceRollbackReply,
            Message::ResourceReady(_) => MessageType::ResourceReady,
            Message::ResourceConfigurationRequest(_) => MessageType::ResourceConfigurationRequest,
            Message::ResourceConfigurationReply(_) => MessageType::ResourceConfigurationReply,
            Message::ExternalInvolved(_) => MessageType::ExternalInvolved,
            Message::ExternalPrepareRequest(_) => MessageType::ExternalPrepareRequest,
            Message::ExternalCommitRequest(_) => MessageType::ExternalCommitRequest,
            Message::ExternalRollbackRequest(_) => MessageType::ExternalRollbackRequest,
            Message::ExternalPrepareReply(_) => MessageType::ExternalPrepareReply,
            Message::ExternalCommitReply(_) => MessageType::ExternalCommitReply,
            Message::ExternalRollbackReply(_) => MessageType::ExternalRollbackReply,
            Message::ProcessExit(_) => MessageType::ProcessExit,
            Message::ConfigurationRequest(_) => MessageType::ConfigurationRequest,
            Message::ConfigurationReply(_) => MessageType::ConfigurationReply,
        }
    }

    /// Overwrite the sender handle of the message.
    ///
    /// The ingress uses this so a peer can only ever speak for its own connection.
    pub fn stamp(&mut self, sender: Process) {
        match self {
            Message::CommitRequest(m) => m.process = sender,
            Message::CommitReply(m) => m.process = sender,
            Message::RollbackRequest(m) => m.process = sender,
            Message::RollbackReply(m) => m.process = sender,
            Message::InvolvedRequest(m) => m.process = sender,
            Message::InvolvedReply(m) => m.process = sender,
            Message::ResourcePrepareRequest(m)
            | Message::ResourceCommitRequest(m)
            | Message::ResourceRollbackRequest(m)
            | Message::ExternalPrepareRequest(m)
            | Message::ExternalCommitRequest(m)
            | Message::ExternalRollbackRequest(m) => m.process = sender,
            Message::ResourcePrepareReply(m)
            | Message::ResourceCommitReply(m)
            | Message::ResourceRollbackReply(m)
            | Message::ExternalPrepareReply(m)
            | Message::ExternalCommitReply(m)
            | Message::ExternalRollbackReply(m) => m.process = sender,
            Message::ResourceReady(m) => m.process = sender,
            Message::ResourceConfigurationRequest(m) => m.process = sender,
            Message::ResourceConfigurationReply(m) => m.process = sender,
            Message::ExternalInvolved(m) => m.process = sender,
            Message::ConfigurationRequest(m) => m.process = sender,
            Message::ConfigurationReply(m) => m.process = sender,
            // Exit events are about another process, the ingress never forwards one from a peer
            Message::ProcessExit(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QueueId;

    fn commit_request() -> CommitRequest {
        CommitRequest {
            process: Process::new(10, QueueId(1)),
            correlation: Correlation(7),
            trid: Trid::new(1, vec![1], vec![2]),
            involved: vec![ResourceId(1)],
        }
    }

    #[test]
    fn test_kind_matches_variant() {
        let message = Message::CommitRequest(commit_request());
        assert_eq!(message.kind(), MessageType::CommitRequest);

        let message = Message::ProcessExit(ProcessExit::new(3));
        assert_eq!(message.kind(), MessageType::ProcessExit);
    }

    #[test]
    fn test_stamp_overwrites_sender() {
        let mut message = Message::CommitRequest(commit_request());
        let sender = Process::new(99, QueueId(5));
        message.stamp(sender);

        match message {
            Message::CommitRequest(request) => assert_eq!(request.process, sender),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_stamp_leaves_exit_event_alone() {
        let mut message = Message::ProcessExit(ProcessExit::new(3));
        message.stamp(Process::new(99, QueueId(5)));
        assert_eq!(message, Message::ProcessExit(ProcessExit::new(3)));
    }

    #[test]
    fn test_json_shape_is_tagged() {
        let json = serde_json::to_value(Message::CommitRequest(commit_request())).unwrap();
        assert_eq!(json["type"], "commit_request");
        assert_eq!(json["body"]["correlation"], 7);
    }

    #[test]
    fn test_involved_defaults_to_empty() {
        let json = r#"{"type":"rollback_request","body":{
            "process":{"pid":1,"queue":1},"correlation":3,
            "trid":{"format":1,"gtrid":[1],"bqual":[2]}}}"#;
        let message: Message = serde_json::from_str(json).unwrap();
        match message {
            Message::RollbackRequest(request) => assert!(request.involved.is_empty()),
            other => panic!("unexpected {:?}", other),
        }
    }
}
