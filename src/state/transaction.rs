//! Transactions, branches and the transaction table

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::log::TransactionLog;
use crate::types::{timestamp_micros, Correlation, Gtrid, Pid, Process, ResourceId, Trid};

/// Where a transaction is in the commit protocol.
///
/// Never goes backwards during the lifetime of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Involved,
    Prepare,
    Commit,
    Rollback,
}

/// One trid's participation: the resources involved in that branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Branch {
    pub trid: Trid,
    pub resources: BTreeSet<ResourceId>,
}

impl Branch {
    pub fn new(trid: Trid) -> Self {
        Self {
            trid,
            resources: BTreeSet::new(),
        }
    }

    /// Add resources, returns the ones that were not already involved
    pub fn involve<I>(&mut self, resources: I) -> Vec<ResourceId>
    where
        I: IntoIterator<Item = ResourceId>,
    {
        resources.into_iter().filter(|id| self.resources.insert(*id)).collect()
    }
}

/// A distributed transaction as known to this TM
#[derive(Debug, Clone)]
pub struct Transaction {
    pub global: Gtrid,
    /// Trid of the request currently driving the transaction
    pub trid: Trid,
    /// Who gets the reply. `None` for transactions rolled back on behalf of a dead owner.
    pub owner: Option<Process>,
    /// Correlation of the request currently driving the transaction
    pub correlation: Correlation,
    /// The resource id a calling domain knows this TM as
    pub resource: Option<ResourceId>,
    pub stage: Stage,
    /// The prepare phase has completed and been logged
    pub prepared: bool,
    pub branches: Vec<Branch>,
    /// Creation time, microseconds since the unix epoch
    pub started: u64,
}

impl Transaction {
    pub fn new(trid: Trid) -> Self {
        Self {
            global: trid.gtrid.clone(),
            trid,
            owner: None,
            correlation: Correlation::default(),
            resource: None,
            stage: Stage::Involved,
            prepared: false,
            branches: Vec::new(),
            started: timestamp_micros(),
        }
    }

    pub fn branch(&self, trid: &Trid) -> Option<&Branch> {
        self.branches.iter().find(|b| &b.trid == trid)
    }

    pub fn find_or_add_branch(&mut self, trid: &Trid) -> &mut Branch {
        match self.branches.iter().position(|b| &b.trid == trid) {
            Some(index) => &mut self.branches[index],
            None => {
                self.branches.push(Branch::new(trid.clone()));
                let last = self.branches.len() - 1;
                &mut self.branches[last]
            }
        }
    }

    /// Involve resources in the branch `trid`, adding the branch if needed.
    /// Returns the resources that were newly involved.
    pub fn involve<I>(&mut self, trid: &Trid, resources: I) -> Vec<ResourceId>
    where
        I: IntoIterator<Item = ResourceId>,
    {
        self.find_or_add_branch(trid).involve(resources)
    }

    /// Number of distinct resources over all branches
    pub fn resource_count(&self) -> usize {
        self.branches
            .iter()
            .flat_map(|b| b.resources.iter())
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Every (branch, resource) participation, in branch order
    pub fn participants(&self) -> Vec<(Trid, ResourceId)> {
        self.branches
            .iter()
            .flat_map(|b| b.resources.iter().map(move |id| (b.trid.clone(), *id)))
            .collect()
    }

    /// Remove read-only participations and drop branches left without resources
    pub fn purge<'a, I>(&mut self, read_only: I)
    where
        I: IntoIterator<Item = (&'a Trid, ResourceId)>,
    {
        for (trid, id) in read_only {
            if let Some(branch) = self.branches.iter_mut().find(|b| &b.trid == trid) {
                branch.resources.remove(&id);
            }
        }
        self.branches.retain(|b| !b.resources.is_empty());
    }

    pub fn is_empty(&self) -> bool {
        self.branches.iter().all(|b| b.resources.is_empty())
    }
}

impl std::fmt::Display for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{global: {}, stage: {:?}, branches: [", self.global, self.stage)?;
        for (index, branch) in self.branches.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            let ids: Vec<i64> = branch.resources.iter().map(|id| id.0).collect();
            write!(f, "{}: {:?}", branch.trid, ids)?;
        }
        write!(f, "]}}")
    }
}

/// Every transaction this TM knows about, keyed by gtrid
#[derive(Debug, Default)]
pub struct TransactionTable {
    transactions: BTreeMap<Gtrid, Transaction>,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the transaction of `trid`, creating it at stage `involved` if unseen
    pub fn find_or_create(&mut self, trid: &Trid) -> &mut Transaction {
        self.transactions
            .entry(trid.gtrid.clone())
            .or_insert_with(|| Transaction::new(trid.clone()))
    }

    pub fn get(&self, gtrid: &Gtrid) -> Option<&Transaction> {
        self.transactions.get(gtrid)
    }

    pub fn get_mut(&mut self, gtrid: &Gtrid) -> Option<&mut Transaction> {
        self.transactions.get_mut(gtrid)
    }

    pub fn contains(&self, gtrid: &Gtrid) -> bool {
        self.transactions.contains_key(gtrid)
    }

    /// Erase the transaction and have the log forget it
    pub fn remove(&mut self, gtrid: &Gtrid, log: &mut dyn TransactionLog) -> Result<Option<Transaction>> {
        let removed = self.transactions.remove(gtrid);
        log.remove(gtrid)?;
        Ok(removed)
    }

    /// Transactions driven by the process `pid`
    pub fn owned_by(&self, pid: Pid) -> Vec<Gtrid> {
        self.transactions
            .values()
            .filter(|t| t.owner.map(|o| o.pid) == Some(pid))
            .map(|t| t.global.clone())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transaction> {
        self.transactions.values()
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QueueId;

    fn trid() -> Trid {
        Trid::new(1, vec![1, 1], vec![1])
    }

    #[test]
    fn test_involve_is_idempotent() {
        let mut transaction = Transaction::new(trid());
        assert_eq!(transaction.involve(&trid(), [ResourceId(1)]), vec![ResourceId(1)]);
        assert!(transaction.involve(&trid(), [ResourceId(1)]).is_empty());

        assert_eq!(transaction.branches.len(), 1);
        assert_eq!(transaction.branches[0].resources.len(), 1);
    }

    #[test]
    fn test_branches_per_trid() {
        let first = trid();
        let second = Trid::new(1, vec![1, 1], vec![2]);
        let mut transaction = Transaction::new(first.clone());
        transaction.involve(&first, [ResourceId(1), ResourceId(2)]);
        transaction.involve(&second, [ResourceId(2)]);

        assert_eq!(transaction.branches.len(), 2);
        assert_eq!(transaction.resource_count(), 2);
        assert_eq!(transaction.participants().len(), 3);
    }

    #[test]
    fn test_purge_drops_empty_branches() {
        let first = trid();
        let second = Trid::new(1, vec![1, 1], vec![2]);
        let mut transaction = Transaction::new(first.clone());
        transaction.involve(&first, [ResourceId(1), ResourceId(2)]);
        transaction.involve(&second, [ResourceId(3)]);

        transaction.purge([(&first, ResourceId(1)), (&second, ResourceId(3))]);

        assert_eq!(transaction.branches.len(), 1);
        assert_eq!(transaction.participants(), vec![(first, ResourceId(2))]);
        assert!(!transaction.is_empty());
    }

    #[test]
    fn test_table_find_or_create_by_gtrid() {
        let mut table = TransactionTable::new();
        let first = trid();
        let other_branch = Trid::new(1, vec![1, 1], vec![9]);

        table.find_or_create(&first).stage = Stage::Prepare;
        assert_eq!(table.find_or_create(&other_branch).stage, Stage::Prepare);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_owned_by() {
        let mut table = TransactionTable::new();
        table.find_or_create(&trid()).owner = Some(Process::new(5, QueueId(1)));
        table.find_or_create(&Trid::new(1, vec![2], vec![1]));

        assert_eq!(table.owned_by(5), vec![trid().gtrid]);
        assert!(table.owned_by(6).is_empty());
    }

    #[test]
    fn test_stage_ordering() {
        assert!(Stage::Involved < Stage::Prepare);
        assert!(Stage::Prepare < Stage::Commit);
        assert!(Stage::Prepare < Stage::Rollback);
    }
}
