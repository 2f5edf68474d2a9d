//! Resource proxies, their instances and the external proxies of other domains

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::code::Code;
use crate::message::{Message, ResourceRequest};
use crate::transport::{send_or_pend, Transport};
use crate::types::{Correlation, Pid, Process, ResourceId, Timing};

/// Configuration of one resource manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    /// Resource manager type, e.g. `db2` or `rm-mockup`
    pub key: String,
    /// Name the resource is known by
    pub name: String,
    #[serde(default)]
    pub openinfo: String,
    #[serde(default)]
    pub closeinfo: String,
    /// Number of proxy instances
    #[serde(default = "default_instances")]
    pub instances: usize,
}

fn default_instances() -> usize {
    1
}

/// min/max/total over a number of invocations, in microseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Statistics {
    pub min: u64,
    pub max: u64,
    pub total: u64,
    pub invoked: u64,
}

impl Statistics {
    pub fn record(&mut self, micros: u64) {
        if self.invoked == 0 || micros < self.min {
            self.min = micros;
        }
        self.max = self.max.max(micros);
        self.total += micros;
        self.invoked += 1;
    }

    pub fn fold(&mut self, other: &Statistics) {
        if other.invoked == 0 {
            return;
        }
        if self.invoked == 0 || other.min < self.min {
            self.min = other.min;
        }
        self.max = self.max.max(other.max);
        self.total += other.total;
        self.invoked += other.invoked;
    }

    pub fn average(&self) -> u64 {
        if self.invoked == 0 {
            0
        } else {
            self.total / self.invoked
        }
    }
}

/// Time spent in the resource, and time from request to reply as seen by the TM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Metrics {
    pub resource: Statistics,
    pub roundtrip: Statistics,
}

impl Metrics {
    pub fn fold(&mut self, other: &Metrics) {
        self.resource.fold(&other.resource);
        self.roundtrip.fold(&other.roundtrip);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Spawned,
    Idle,
    Busy,
    Error,
    Shutdown,
}

/// One running resource proxy process
#[derive(Debug, Clone)]
pub struct Instance {
    pub id: ResourceId,
    pub process: Process,
    pub state: InstanceState,
    pub metrics: Metrics,
    /// Correlation of the request the instance is working on
    pub in_flight: Option<Correlation>,
    started: Option<Instant>,
}

impl Instance {
    pub fn new(id: ResourceId, process: Process) -> Self {
        Self {
            id,
            process,
            state: InstanceState::Spawned,
            metrics: Metrics::default(),
            in_flight: None,
            started: None,
        }
    }

    fn assign(&mut self, correlation: Correlation) {
        self.state = InstanceState::Busy;
        self.in_flight = Some(correlation);
        self.started = Some(Instant::now());
    }
}

/// A configured resource manager and its proxy instances
#[derive(Debug, Clone)]
pub struct Proxy {
    pub id: ResourceId,
    pub key: String,
    pub name: String,
    pub openinfo: String,
    pub closeinfo: String,
    pub concurrency: usize,
    pub instances: Vec<Instance>,
    /// Metrics of instances that are gone
    pub metrics: Metrics,
}

impl Proxy {
    /// Metrics over the proxy's history and every live instance
    pub fn total_metrics(&self) -> Metrics {
        let mut total = self.metrics;
        for instance in &self.instances {
            total.fold(&instance.metrics);
        }
        total
    }
}

/// A TM of another domain acting as a resource in our transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct External {
    pub process: Process,
    pub id: ResourceId,
}

/// Which phase a resource request is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Prepare,
    Commit,
    Rollback,
}

impl Phase {
    /// The request message for a local proxy or an external domain
    pub fn request(self, request: ResourceRequest, external: bool) -> Message {
        match (self, external) {
            (Phase::Prepare, false) => Message::ResourcePrepareRequest(request),
            (Phase::Commit, false) => Message::ResourceCommitRequest(request),
            (Phase::Rollback, false) => Message::ResourceRollbackRequest(request),
            (Phase::Prepare, true) => Message::ExternalPrepareRequest(request),
            (Phase::Commit, true) => Message::ExternalCommitRequest(request),
            (Phase::Rollback, true) => Message::ExternalRollbackRequest(request),
        }
    }
}

/// What happened to a dispatched request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    Sent,
    /// Every instance is busy, the request waits in the resource's queue
    Queued,
    /// Neither a configured resource nor a known external
    Unknown,
}

/// Every resource proxy, external proxy and pending resource request
#[derive(Debug, Default)]
pub struct Registry {
    proxies: Vec<Proxy>,
    externals: Vec<External>,
    pending: HashMap<ResourceId, VecDeque<(Phase, ResourceRequest)>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the proxies from configuration. Ids are assigned from 1 in order.
    pub fn configure(resources: &[ResourceConfig]) -> Self {
        let proxies = resources
            .iter()
            .enumerate()
            .map(|(index, config)| Proxy {
                id: ResourceId(index as i64 + 1),
                key: config.key.clone(),
                name: config.name.clone(),
                openinfo: config.openinfo.clone(),
                closeinfo: config.closeinfo.clone(),
                concurrency: config.instances,
                instances: Vec::new(),
                metrics: Metrics::default(),
            })
            .collect();

        Self {
            proxies,
            ..Self::default()
        }
    }

    pub fn proxies(&self) -> &[Proxy] {
        &self.proxies
    }

    pub fn externals(&self) -> &[External] {
        &self.externals
    }

    pub fn proxy(&self, id: ResourceId) -> Option<&Proxy> {
        self.proxies.iter().find(|p| p.id == id)
    }

    fn proxy_mut(&mut self, id: ResourceId) -> Option<&mut Proxy> {
        self.proxies.iter_mut().find(|p| p.id == id)
    }

    pub fn external(&self, id: ResourceId) -> Option<&External> {
        self.externals.iter().find(|e| e.id == id)
    }

    /// A configured local resource, or an external we have handed out an id to
    pub fn is_known(&self, id: ResourceId) -> bool {
        if id.is_external() {
            self.external(id).is_some()
        } else {
            self.proxy(id).is_some()
        }
    }

    /// Find or allocate the (negative) resource id of an external proxy
    pub fn external_id(&mut self, process: &Process) -> ResourceId {
        if let Some(external) = self.externals.iter().find(|e| &e.process == process) {
            return external.id;
        }
        let id = ResourceId(-(self.externals.len() as i64) - 1);
        log::debug!("new external {} for {}", id, process);
        self.externals.push(External { process: *process, id });
        id
    }

    pub fn idle_instance(&mut self, id: ResourceId) -> Option<&mut Instance> {
        self.proxy_mut(id)?
            .instances
            .iter_mut()
            .find(|i| i.state == InstanceState::Idle)
    }

    pub fn pending_count(&self, id: ResourceId) -> usize {
        self.pending.get(&id).map_or(0, VecDeque::len)
    }

    /// Send a request to the resource, or queue it until an instance is idle
    pub fn dispatch(&mut self, phase: Phase, request: ResourceRequest, transport: &mut dyn Transport) -> Dispatched {
        let id = request.resource;

        if id.is_external() {
            let Some(external) = self.external(id) else {
                return Dispatched::Unknown;
            };
            let destination = external.process;
            send_or_pend(transport, &destination, phase.request(request, true));
            return Dispatched::Sent;
        }

        if self.proxy(id).is_none() {
            return Dispatched::Unknown;
        }

        match self.idle_instance(id) {
            Some(instance) => {
                instance.assign(request.correlation);
                let destination = instance.process;
                send_or_pend(transport, &destination, phase.request(request, false));
                Dispatched::Sent
            }
            None => {
                log::debug!("no idle instance of resource {} - action: queue {:?}", id, phase);
                self.pending.entry(id).or_default().push_back((phase, request));
                Dispatched::Queued
            }
        }
    }

    /// An instance has replied: record metrics, make it idle and hand it the oldest
    /// queued request of the resource.
    pub fn instance_done(
        &mut self,
        id: ResourceId,
        pid: Pid,
        state: Code,
        statistics: Timing,
        transport: &mut dyn Transport,
    ) {
        let Some(proxy) = self.proxy_mut(id) else {
            log::error!("invalid resource id: {} - action: discard", id);
            return;
        };
        let Some(instance) = proxy.instances.iter_mut().find(|i| i.process.pid == pid) else {
            log::error!("reply from unknown instance {} of resource {} - action: discard", pid, id);
            return;
        };

        if let Some(started) = instance.started.take() {
            instance.metrics.roundtrip.record(started.elapsed().as_micros() as u64);
        }
        instance.metrics.resource.record(statistics.end.saturating_sub(statistics.start));
        instance.in_flight = None;

        if state == Code::ResourceFail {
            log::error!("resource {} instance {} reported failure - action: hold until ready", id, pid);
            instance.state = InstanceState::Error;
            return;
        }
        instance.state = InstanceState::Idle;

        self.serve(id, transport);
    }

    /// An instance announces it's ready for work. Unknown pids are registered.
    pub fn ready(&mut self, id: ResourceId, process: Process, transport: &mut dyn Transport) -> bool {
        let Some(proxy) = self.proxy_mut(id) else {
            log::error!("invalid resource id: {} - ready from {} - action: discard", id, process);
            return false;
        };

        match proxy.instances.iter_mut().find(|i| i.process.pid == process.pid) {
            Some(instance) => {
                instance.process = process;
                instance.state = InstanceState::Idle;
            }
            None => {
                let mut instance = Instance::new(id, process);
                instance.state = InstanceState::Idle;
                proxy.instances.push(instance);
            }
        }
        log::debug!("resource {} instance {} ready", id, process);

        self.serve(id, transport);
        true
    }

    /// Register a process as a spawned, not yet ready, instance of `id`
    pub fn spawned(&mut self, id: ResourceId, process: Process) {
        if let Some(proxy) = self.proxy_mut(id) {
            if !proxy.instances.iter().any(|i| i.process.pid == process.pid) {
                proxy.instances.push(Instance::new(id, process));
            }
        }
    }

    /// Remove the instance run by `pid`, folding its metrics into its proxy
    pub fn remove_instance(&mut self, pid: Pid) -> Option<Instance> {
        for proxy in &mut self.proxies {
            if let Some(index) = proxy.instances.iter().position(|i| i.process.pid == pid) {
                let mut instance = proxy.instances.remove(index);
                proxy.metrics.fold(&instance.metrics);
                instance.state = InstanceState::Shutdown;
                return Some(instance);
            }
        }
        None
    }

    /// Hand queued requests of `id` to idle instances, oldest first
    fn serve(&mut self, id: ResourceId, transport: &mut dyn Transport) {
        let Some(queue) = self.pending.get_mut(&id) else {
            return;
        };
        let Some(proxy) = self.proxies.iter_mut().find(|p| p.id == id) else {
            return;
        };

        while !queue.is_empty() {
            let Some(instance) = proxy.instances.iter_mut().find(|i| i.state == InstanceState::Idle) else {
                break;
            };
            let Some((phase, request)) = queue.pop_front() else {
                break;
            };
            log::debug!("resource {} - action: dispatch queued {:?} {}", id, phase, request.correlation);
            instance.assign(request.correlation);
            let destination = instance.process;
            send_or_pend(transport, &destination, phase.request(request, false));
        }

        if queue.is_empty() {
            self.pending.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryTransport;
    use crate::types::{QueueId, Trid};

    fn config(name: &str, instances: usize) -> ResourceConfig {
        ResourceConfig {
            key: "rm-mockup".to_string(),
            name: name.to_string(),
            openinfo: String::new(),
            closeinfo: String::new(),
            instances,
        }
    }

    fn request(resource: i64, correlation: u64) -> ResourceRequest {
        ResourceRequest {
            process: Process::new(1, QueueId(1)),
            correlation: Correlation(correlation),
            trid: Trid::new(1, vec![1], vec![1]),
            resource: ResourceId(resource),
            flags: Default::default(),
        }
    }

    fn correlation(message: &Message) -> Correlation {
        match message {
            Message::ResourcePrepareRequest(r) | Message::ResourceCommitRequest(r) => r.correlation,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_statistics() {
        let mut stats = Statistics::default();
        stats.record(10);
        stats.record(4);
        stats.record(7);
        assert_eq!(stats, Statistics { min: 4, max: 10, total: 21, invoked: 3 });
        assert_eq!(stats.average(), 7);

        let mut folded = Statistics::default();
        folded.fold(&Statistics::default());
        assert_eq!(folded.invoked, 0);
        folded.fold(&stats);
        assert_eq!(folded, stats);
    }

    #[test]
    fn test_pending_is_fifo() {
        let transport = MemoryTransport::new();
        let mut sender = transport.clone();
        let mut registry = Registry::configure(&[config("db", 1)]);
        let instance = Process::new(100, QueueId(10));
        registry.ready(ResourceId(1), instance, &mut sender);

        assert_eq!(registry.dispatch(Phase::Prepare, request(1, 1), &mut sender), Dispatched::Sent);
        assert_eq!(registry.dispatch(Phase::Prepare, request(1, 2), &mut sender), Dispatched::Queued);
        assert_eq!(registry.dispatch(Phase::Commit, request(1, 3), &mut sender), Dispatched::Queued);
        assert_eq!(registry.pending_count(ResourceId(1)), 2);

        registry.instance_done(ResourceId(1), 100, Code::Ok, Timing::default(), &mut sender);
        registry.instance_done(ResourceId(1), 100, Code::Ok, Timing::default(), &mut sender);

        let order: Vec<Correlation> = transport.sent().iter().map(|(_, m)| correlation(m)).collect();
        assert_eq!(order, vec![Correlation(1), Correlation(2), Correlation(3)]);
        assert_eq!(registry.pending_count(ResourceId(1)), 0);
    }

    #[test]
    fn test_unknown_resource() {
        let mut transport = MemoryTransport::new();
        let mut registry = Registry::configure(&[config("db", 1)]);
        assert_eq!(registry.dispatch(Phase::Prepare, request(7, 1), &mut transport), Dispatched::Unknown);
        assert_eq!(registry.dispatch(Phase::Prepare, request(-1, 1), &mut transport), Dispatched::Unknown);
        assert!(!registry.is_known(ResourceId(7)));
    }

    #[test]
    fn test_external_ids_are_negative_and_stable() {
        let mut registry = Registry::new();
        let a = Process::new(5, QueueId(5));
        let b = Process::new(6, QueueId(6));
        assert_eq!(registry.external_id(&a), ResourceId(-1));
        assert_eq!(registry.external_id(&b), ResourceId(-2));
        assert_eq!(registry.external_id(&a), ResourceId(-1));
        assert!(registry.is_known(ResourceId(-2)));
    }

    #[test]
    fn test_external_dispatch_is_untracked() {
        let transport = MemoryTransport::new();
        let mut sender = transport.clone();
        let mut registry = Registry::new();
        let domain = Process::new(5, QueueId(5));
        let id = registry.external_id(&domain);

        assert_eq!(registry.dispatch(Phase::Prepare, request(id.0, 1), &mut sender), Dispatched::Sent);
        assert_eq!(registry.dispatch(Phase::Prepare, request(id.0, 2), &mut sender), Dispatched::Sent);

        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert!(matches!(sent[0].1, Message::ExternalPrepareRequest(_)));
        assert_eq!(sent[0].0, domain);
    }

    #[test]
    fn test_remove_instance_folds_metrics() {
        let mut transport = MemoryTransport::new();
        let mut registry = Registry::configure(&[config("db", 1)]);
        registry.ready(ResourceId(1), Process::new(100, QueueId(10)), &mut transport);
        registry.dispatch(Phase::Prepare, request(1, 1), &mut transport);
        registry.instance_done(
            ResourceId(1),
            100,
            Code::Ok,
            Timing { start: 10, end: 30 },
            &mut transport,
        );

        let removed = registry.remove_instance(100).unwrap();
        assert_eq!(removed.state, InstanceState::Shutdown);
        let proxy = registry.proxy(ResourceId(1)).unwrap();
        assert!(proxy.instances.is_empty());
        assert_eq!(proxy.metrics.resource.total, 20);
        assert!(registry.remove_instance(100).is_none());
    }

    #[test]
    fn test_resource_fail_holds_instance() {
        let mut transport = MemoryTransport::new();
        let mut registry = Registry::configure(&[config("db", 1)]);
        let process = Process::new(100, QueueId(10));
        registry.ready(ResourceId(1), process, &mut transport);
        registry.dispatch(Phase::Prepare, request(1, 1), &mut transport);
        registry.instance_done(ResourceId(1), 100, Code::ResourceFail, Timing::default(), &mut transport);

        assert!(registry.idle_instance(ResourceId(1)).is_none());
        registry.ready(ResourceId(1), process, &mut transport);
        assert!(registry.idle_instance(ResourceId(1)).is_some());
    }

    #[test]
    fn test_spawned_instance_gets_no_work() {
        let mut transport = MemoryTransport::new();
        let mut registry = Registry::configure(&[config("db", 1)]);
        registry.spawned(ResourceId(1), Process::new(100, QueueId(10)));
        assert_eq!(registry.dispatch(Phase::Prepare, request(1, 1), &mut transport), Dispatched::Queued);
    }
}
