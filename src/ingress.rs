//! TCP ingress for the transaction manager
//!
//! ## Protocol
//!
//! Newline-delimited JSON in both directions:
//! 1. **Hello**: the peer sends `{"pid": N}`, the TM answers with a [`Welcome`]
//!    carrying the queue id the peer is known by
//! 2. **Messages**: afterwards every line is a [`Message`]
//!
//! ```text
//! peer                                   TM
//!  │ ── {"pid":42} ─────────────────────▶ │  register queue
//!  │ ◀─ {"queue":3,"manager":{..}} ────── │
//!  │ ── {"type":"commit_request",..} ───▶ │  stamp sender, dispatch
//!  │ ◀─ {"type":"commit_reply",..} ────── │
//! ```
//!
//! The sender of every inbound message is overwritten with the connection's own
//! handle. Process exit events are never taken from a peer: the only source is the
//! connection itself, which reports its pid to the TM when it closes.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::error::{Result, TmError};
use crate::message::{Message, ProcessExit};
use crate::transport::Queues;
use crate::types::{Pid, Process, QueueId};

/// First line a peer sends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub pid: Pid,
}

/// Answer to [`Hello`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    pub queue: QueueId,
    /// The transaction manager's own handle
    pub manager: Process,
}

/// Handles a single peer connection
pub struct Connection {
    stream: TcpStream,
    queues: Queues,
    inbound: mpsc::Sender<Message>,
    manager: Process,
    capacity: usize,
}

impl Connection {
    pub fn new(
        stream: TcpStream,
        queues: Queues,
        inbound: mpsc::Sender<Message>,
        manager: Process,
        capacity: usize,
    ) -> Self {
        Self {
            stream,
            queues,
            inbound,
            manager,
            capacity,
        }
    }

    /// Run the connection until the peer goes away
    pub async fn run(self) -> Result<()> {
        let (read, mut write) = self.stream.into_split();
        let mut reader = BufReader::new(read);

        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(TmError::Protocol("connection closed before hello".to_string()));
        }
        let hello: Hello = serde_json::from_str(line.trim())
            .map_err(|e| TmError::Protocol(format!("invalid hello: {}", e)))?;

        let (tx, mut rx) = mpsc::channel::<Message>(self.capacity.max(1));
        let queue = self.queues.register(tx);
        let process = Process::new(hello.pid, queue);
        log::info!("peer {} connected", process);

        let welcome = Welcome {
            queue,
            manager: self.manager,
        };
        let mut encoded = serde_json::to_vec(&welcome)?;
        encoded.push(b'\n');
        write.write_all(&encoded).await?;

        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let mut encoded = match serde_json::to_vec(&message) {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        log::error!("failed to encode {:?} for {}: {}", message.kind(), process, e);
                        continue;
                    }
                };
                encoded.push(b'\n');
                if let Err(e) = write.write_all(&encoded).await {
                    log::warn!("failed to write to {}: {}", process, e);
                    break;
                }
            }
        });

        let result = read_messages(reader, process, &self.inbound).await;

        self.queues.unregister(queue);
        writer.abort();
        log::info!("peer {} disconnected", process);

        if self.inbound.send(Message::ProcessExit(ProcessExit::new(process.pid))).await.is_err() {
            log::debug!("transaction manager gone - action: discard exit of {}", process);
        }
        result
    }
}

/// Forward every message of the peer to the dispatch loop
async fn read_messages(
    mut reader: BufReader<OwnedReadHalf>,
    process: Process,
    inbound: &mpsc::Sender<Message>,
) -> Result<()> {
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let mut message: Message = match serde_json::from_str(trimmed) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("invalid message from {}: {} - action: discard", process, e);
                continue;
            }
        };
        if let Message::ProcessExit(exit) = &message {
            log::warn!("process exit of {} sent by {} - action: discard", exit.pid, process);
            continue;
        }
        message.stamp(process);

        if inbound.send(message).await.is_err() {
            return Err(TmError::Transport("transaction manager is gone".to_string()));
        }
    }
}
