//! Fan-out/fan-in of resource requests
//!
//! A [`Coordinator`] holds groups of outstanding requests. Each group is registered
//! with the correlations it waits for and a token saying what to do once it's done.
//! Replies and failures are recorded as they arrive; when nothing is outstanding the
//! group is handed back, exactly once, as a [`Completed`].

use std::collections::HashMap;

use crate::message::ResourceReply;
use crate::types::{Correlation, ResourceId};

/// A reply that can be matched to its request
pub trait Correlated {
    fn correlation(&self) -> Correlation;
}

impl Correlated for ResourceReply {
    fn correlation(&self) -> Correlation {
        self.correlation
    }
}

/// An outstanding request of a group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pending {
    pub correlation: Correlation,
    pub resource: ResourceId,
}

impl Pending {
    pub fn new(correlation: Correlation, resource: ResourceId) -> Self {
        Self { correlation, resource }
    }
}

/// A finished group
#[derive(Debug)]
pub struct Completed<R, K> {
    pub token: K,
    pub replies: Vec<R>,
    /// Requests that will never get a reply
    pub failed: Vec<Pending>,
}

impl<R, K> Completed<R, K> {
    pub fn is_failed(&self) -> bool {
        !self.failed.is_empty()
    }
}

#[derive(Debug)]
struct Group<R, K> {
    token: K,
    pending: Vec<Pending>,
    replies: Vec<R>,
    failed: Vec<Pending>,
}

impl<R, K> Group<R, K> {
    fn take(&mut self, correlation: Correlation) -> Option<Pending> {
        let index = self.pending.iter().position(|p| p.correlation == correlation)?;
        Some(self.pending.swap_remove(index))
    }

    fn complete(self) -> Completed<R, K> {
        Completed {
            token: self.token,
            replies: self.replies,
            failed: self.failed,
        }
    }
}

/// Groups of outstanding requests of one phase
#[derive(Debug)]
pub struct Coordinator<R, K> {
    groups: HashMap<u64, Group<R, K>>,
    index: HashMap<Correlation, u64>,
    next_group: u64,
}

impl<R, K> Default for Coordinator<R, K> {
    fn default() -> Self {
        Self {
            groups: HashMap::new(),
            index: HashMap::new(),
            next_group: 0,
        }
    }
}

impl<R: Correlated, K> Coordinator<R, K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start waiting for `pending`. A group with nothing to wait for completes at once.
    pub fn register(&mut self, token: K, pending: Vec<Pending>) -> Option<Completed<R, K>> {
        if pending.is_empty() {
            return Some(Completed {
                token,
                replies: Vec::new(),
                failed: Vec::new(),
            });
        }

        self.next_group += 1;
        let group = self.next_group;
        for p in &pending {
            self.index.insert(p.correlation, group);
        }
        self.groups.insert(
            group,
            Group {
                token,
                pending,
                replies: Vec::new(),
                failed: Vec::new(),
            },
        );
        None
    }

    /// Record a reply. Replies nobody waits for are logged and dropped.
    pub fn accept(&mut self, reply: R) -> Option<Completed<R, K>> {
        let correlation = reply.correlation();
        let Some(group) = self.index.remove(&correlation) else {
            log::warn!("reply for unknown correlation {} - action: discard", correlation);
            return None;
        };
        let entry = self.groups.get_mut(&group)?;
        entry.take(correlation)?;
        entry.replies.push(reply);
        self.finish(group)
    }

    /// Record that the request `correlation` will never get a reply
    pub fn fail(&mut self, correlation: Correlation) -> Option<Completed<R, K>> {
        let group = self.index.remove(&correlation)?;
        let entry = self.groups.get_mut(&group)?;
        let pending = entry.take(correlation)?;
        log::debug!("request {} to resource {} failed", correlation, pending.resource);
        entry.failed.push(pending);
        self.finish(group)
    }

    pub fn is_waiting(&self, correlation: Correlation) -> bool {
        self.index.contains_key(&correlation)
    }

    /// Number of groups still waiting
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    fn finish(&mut self, group: u64) -> Option<Completed<R, K>> {
        if self.groups.get(&group)?.pending.is_empty() {
            self.groups.remove(&group).map(Group::complete)
        } else {
            None
        }
    }
}
