//! Outbound message transport
//!
//! The TM never blocks on a send: [`Transport::send`] either hands the message to the
//! destination queue right away or gives it back, and the caller decides whether to
//! keep it or pass it to [`Transport::pend`], the best-effort background path.
//!
//! - [`ChannelTransport`]: bounded `tokio` channels, one per registered queue
//! - [`MemoryTransport`]: records traffic, used for embedding and tests

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::message::Message;
use crate::types::{Process, QueueId};

/// Outbound side of the message transport
pub trait Transport: Send {
    /// Non-blocking send. Returns the message when the destination can't take it now.
    fn send(&mut self, destination: &Process, message: Message) -> Result<(), Message>;

    /// Deliver whenever the destination has room, without blocking the caller
    fn pend(&mut self, destination: &Process, message: Message);
}

/// Send directly, fall back to the pending path if the destination is full
pub fn send_or_pend(transport: &mut dyn Transport, destination: &Process, message: Message) {
    if let Err(message) = transport.send(destination, message) {
        log::debug!("destination {} busy - action: pend {:?}", destination, message.kind());
        transport.pend(destination, message);
    }
}

/// Registry of inbound queues of connected processes
#[derive(Clone, Default)]
pub struct Queues {
    senders: Arc<Mutex<HashMap<QueueId, mpsc::Sender<Message>>>>,
    next_id: Arc<AtomicU64>,
}

impl Queues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a queue and get its id
    pub fn register(&self, sender: mpsc::Sender<Message>) -> QueueId {
        let id = QueueId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.senders.lock().expect("queues lock poisoned").insert(id, sender);
        id
    }

    pub fn unregister(&self, id: QueueId) {
        self.senders.lock().expect("queues lock poisoned").remove(&id);
    }

    pub fn get(&self, id: QueueId) -> Option<mpsc::Sender<Message>> {
        self.senders.lock().expect("queues lock poisoned").get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.senders.lock().expect("queues lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Messages waiting for room in one destination queue, delivered in order by a
/// single forwarder task
struct Backlog {
    forward: mpsc::UnboundedSender<Message>,
    waiting: Arc<AtomicUsize>,
}

impl Backlog {
    fn spawn(runtime: &tokio::runtime::Handle, destination: Process, sender: mpsc::Sender<Message>) -> Self {
        let (forward, mut rx) = mpsc::unbounded_channel::<Message>();
        let waiting = Arc::new(AtomicUsize::new(0));

        let delivered = waiting.clone();
        runtime.spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = sender.send(message).await {
                    log::warn!("failed to deliver pending message to {}: {:?}", destination, e.0.kind());
                }
                delivered.fetch_sub(1, Ordering::SeqCst);
            }
        });

        Self { forward, waiting }
    }

    fn is_empty(&self) -> bool {
        self.waiting.load(Ordering::SeqCst) == 0
    }
}

/// Transport over bounded `tokio` channels.
///
/// Per destination, messages arrive in the order they were handed over: once one
/// message is pending, every later one goes through the same backlog until it has
/// drained.
pub struct ChannelTransport {
    queues: Queues,
    runtime: tokio::runtime::Handle,
    backlogs: HashMap<QueueId, Backlog>,
}

impl ChannelTransport {
    /// Must be created from within a tokio runtime
    pub fn new(queues: Queues) -> Self {
        Self {
            queues,
            runtime: tokio::runtime::Handle::current(),
            backlogs: HashMap::new(),
        }
    }

    /// Messages still waiting for room in `destination`'s queue
    pub fn backlog(&self, destination: &Process) -> usize {
        self.backlogs
            .get(&destination.queue)
            .map_or(0, |backlog| backlog.waiting.load(Ordering::SeqCst))
    }
}

impl Transport for ChannelTransport {
    fn send(&mut self, destination: &Process, message: Message) -> Result<(), Message> {
        let Some(sender) = self.queues.get(destination.queue) else {
            self.backlogs.remove(&destination.queue);
            log::warn!("no queue for {} - action: discard {:?}", destination, message.kind());
            return Ok(());
        };

        if self.backlogs.get(&destination.queue).map_or(false, |backlog| !backlog.is_empty()) {
            return Err(message);
        }

        match sender.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(message)) => Err(message),
            Err(mpsc::error::TrySendError::Closed(message)) => {
                log::warn!("queue for {} is closed - action: discard {:?}", destination, message.kind());
                Ok(())
            }
        }
    }

    fn pend(&mut self, destination: &Process, message: Message) {
        let Some(sender) = self.queues.get(destination.queue) else {
            self.backlogs.remove(&destination.queue);
            log::warn!("no queue for {} - action: discard pending {:?}", destination, message.kind());
            return;
        };

        let runtime = &self.runtime;
        let backlog = self
            .backlogs
            .entry(destination.queue)
            .or_insert_with(|| Backlog::spawn(runtime, *destination, sender));

        backlog.waiting.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = backlog.forward.send(message) {
            backlog.waiting.fetch_sub(1, Ordering::SeqCst);
            log::warn!("pending path for {} is gone - action: discard {:?}", destination, e.0.kind());
        }
    }
}

#[derive(Default)]
struct Recorded {
    sent: Vec<(Process, Message)>,
    pended: Vec<(Process, Message)>,
    blocked: HashSet<QueueId>,
}

/// In-memory transport that records every message.
///
/// Clones share the same record, so a handle kept outside the manager can inspect
/// what the manager sent.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<Mutex<Recorded>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make direct sends to `queue` fail as if the queue was full
    pub fn block(&self, queue: QueueId) {
        self.inner.lock().expect("transport lock poisoned").blocked.insert(queue);
    }

    pub fn unblock(&self, queue: QueueId) {
        self.inner.lock().expect("transport lock poisoned").blocked.remove(&queue);
    }

    /// Messages delivered directly
    pub fn sent(&self) -> Vec<(Process, Message)> {
        self.inner.lock().expect("transport lock poisoned").sent.clone()
    }

    /// Messages handed to the pending path
    pub fn pended(&self) -> Vec<(Process, Message)> {
        self.inner.lock().expect("transport lock poisoned").pended.clone()
    }

    /// Drain the directly delivered messages
    pub fn take_sent(&self) -> Vec<(Process, Message)> {
        std::mem::take(&mut self.inner.lock().expect("transport lock poisoned").sent)
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("transport lock poisoned");
        inner.sent.clear();
        inner.pended.clear();
    }
}

impl Transport for MemoryTransport {
    fn send(&mut self, destination: &Process, message: Message) -> Result<(), Message> {
        let mut inner = self.inner.lock().expect("transport lock poisoned");
        if inner.blocked.contains(&destination.queue) {
            return Err(message);
        }
        inner.sent.push((*destination, message));
        Ok(())
    }

    fn pend(&mut self, destination: &Process, message: Message) {
        self.inner
            .lock()
            .expect("transport lock poisoned")
            .pended
            .push((*destination, message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ProcessExit;

    fn exit(pid: u32) -> Message {
        Message::ProcessExit(ProcessExit::new(pid))
    }

    #[test]
    fn test_memory_transport_records() {
        let transport = MemoryTransport::new();
        let mut sender: Box<dyn Transport> = Box::new(transport.clone());
        let destination = Process::new(1, QueueId(1));

        sender.send(&destination, exit(1)).unwrap();
        assert_eq!(transport.sent().len(), 1);
        assert_eq!(transport.take_sent().len(), 1);
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn test_send_or_pend_falls_back_when_blocked() {
        let transport = MemoryTransport::new();
        let mut sender = transport.clone();
        let destination = Process::new(1, QueueId(4));
        transport.block(QueueId(4));

        send_or_pend(&mut sender, &destination, exit(2));
        assert!(transport.sent().is_empty());
        assert_eq!(transport.pended().len(), 1);

        transport.unblock(QueueId(4));
        send_or_pend(&mut sender, &destination, exit(3));
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_channel_transport_full_queue_returns_message() {
        let queues = Queues::new();
        let (tx, mut rx) = mpsc::channel(1);
        let queue = queues.register(tx);
        let destination = Process::new(7, queue);
        let mut transport = ChannelTransport::new(queues.clone());

        assert!(transport.send(&destination, exit(1)).is_ok());
        let rejected = transport.send(&destination, exit(2));
        assert_eq!(rejected, Err(exit(2)));

        transport.pend(&destination, exit(3));
        assert_eq!(rx.recv().await, Some(exit(1)));
        assert_eq!(rx.recv().await, Some(exit(3)));
    }

    #[tokio::test]
    async fn test_channel_transport_keeps_order_behind_pending() {
        let queues = Queues::new();
        let (tx, mut rx) = mpsc::channel(1);
        let queue = queues.register(tx);
        let destination = Process::new(7, queue);
        let mut transport = ChannelTransport::new(queues.clone());

        send_or_pend(&mut transport, &destination, exit(1));
        send_or_pend(&mut transport, &destination, exit(2));
        assert_eq!(transport.backlog(&destination), 1);

        // room frees up, but a later message still queues behind the pending one
        assert_eq!(rx.recv().await, Some(exit(1)));
        assert_eq!(transport.send(&destination, exit(3)), Err(exit(3)));
        send_or_pend(&mut transport, &destination, exit(3));
        send_or_pend(&mut transport, &destination, exit(4));

        for pid in 2..=4 {
            assert_eq!(rx.recv().await, Some(exit(pid)));
        }

        for _ in 0..100 {
            if transport.backlog(&destination) == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(transport.backlog(&destination), 0);
        assert!(transport.send(&destination, exit(5)).is_ok());
        assert_eq!(rx.recv().await, Some(exit(5)));
    }

    #[tokio::test]
    async fn test_channel_transport_unknown_queue_discards() {
        let queues = Queues::new();
        let mut transport = ChannelTransport::new(queues);
        let destination = Process::new(7, QueueId(99));
        assert!(transport.send(&destination, exit(1)).is_ok());
    }
}
