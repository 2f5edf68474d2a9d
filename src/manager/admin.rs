//! Administrative view of the transaction manager

use serde::{Deserialize, Serialize};

use crate::log::{LogStatistics, Prepared};
use crate::state::resource::{External, InstanceState, Metrics};
use crate::state::transaction::Stage;
use crate::state::State;
use crate::types::{Correlation, Process, ResourceId, Trid};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchView {
    pub trid: Trid,
    pub resources: Vec<ResourceId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionView {
    pub trid: Trid,
    pub owner: Option<Process>,
    pub stage: Stage,
    pub prepared: bool,
    pub branches: Vec<BranchView>,
    pub started: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceView {
    pub process: Process,
    pub state: InstanceState,
    pub in_flight: Option<Correlation>,
    pub metrics: Metrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceView {
    pub id: ResourceId,
    pub key: String,
    pub name: String,
    pub openinfo: String,
    pub closeinfo: String,
    pub concurrency: usize,
    pub instances: Vec<InstanceView>,
    /// Over the resource's whole history, gone instances included
    pub metrics: Metrics,
    /// Requests waiting for an idle instance
    pub pending: usize,
}

/// State of the transaction manager at one point in time
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub transactions: Vec<TransactionView>,
    pub resources: Vec<ResourceView>,
    pub externals: Vec<External>,
    /// Replies waiting for the log to be persisted
    pub persistent_replies: usize,
    /// Commit fan-outs waiting for the log to be persisted
    pub persistent_requests: usize,
    /// Phase groups waiting for resource replies
    pub coordinating: usize,
    pub log: LogStatistics,
    pub in_doubt: Vec<Prepared>,
}

impl Snapshot {
    /// Build the snapshot. With an `alias`, only the resources with that name and
    /// the transactions they are involved in are included.
    pub fn build(state: &State, alias: Option<&str>) -> Self {
        let resources: Vec<ResourceView> = state
            .resources
            .proxies()
            .iter()
            .filter(|proxy| alias.map_or(true, |alias| proxy.name == alias))
            .map(|proxy| ResourceView {
                id: proxy.id,
                key: proxy.key.clone(),
                name: proxy.name.clone(),
                openinfo: proxy.openinfo.clone(),
                closeinfo: proxy.closeinfo.clone(),
                concurrency: proxy.concurrency,
                instances: proxy
                    .instances
                    .iter()
                    .map(|instance| InstanceView {
                        process: instance.process,
                        state: instance.state,
                        in_flight: instance.in_flight,
                        metrics: instance.metrics,
                    })
                    .collect(),
                metrics: proxy.total_metrics(),
                pending: state.resources.pending_count(proxy.id),
            })
            .collect();

        let selected: Vec<ResourceId> = resources.iter().map(|r| r.id).collect();

        let transactions = state
            .transactions
            .iter()
            .filter(|transaction| {
                alias.is_none()
                    || transaction
                        .branches
                        .iter()
                        .any(|b| b.resources.iter().any(|id| selected.contains(id)))
            })
            .map(|transaction| TransactionView {
                trid: transaction.trid.clone(),
                owner: transaction.owner,
                stage: transaction.stage,
                prepared: transaction.prepared,
                branches: transaction
                    .branches
                    .iter()
                    .map(|b| BranchView {
                        trid: b.trid.clone(),
                        resources: b.resources.iter().copied().collect(),
                    })
                    .collect(),
                started: transaction.started,
            })
            .collect();

        Self {
            transactions,
            resources,
            externals: state.resources.externals().to_vec(),
            persistent_replies: state.persistent.replies(),
            persistent_requests: state.persistent.deferred(),
            coordinating: state.coordinators.waiting(),
            log: state.log.statistics(),
            in_doubt: state.log.in_doubt(),
        }
    }
}
