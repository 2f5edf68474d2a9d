//! minitm - the coordination core of an XA transaction manager
//!
//! Architecture Overview:
//! ┌─────────────────────────────────────────────────────────────┐
//! │          Clients, resource proxy instances, domains          │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ JSON lines over TCP
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Ingress                              │
//! │        (one task per connection, one queue per peer)        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ mpsc
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Manager dispatch loop                      │
//! │   (handlers, phase coordinators, persistent reply buffer)   │
//! └─────────────────────────────────────────────────────────────┘
//!                    │                   │
//!                    ▼                   ▼
//! ┌──────────────────────────┐ ┌────────────────────────────────┐
//! │     Transaction log      │ │          Transport             │
//! │  (WAL worker, recovery)  │ │   (per-peer queues, pending)   │
//! └──────────────────────────┘ └────────────────────────────────┘

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use ::log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub mod code;
pub mod coordinator;
pub mod error;
pub mod ingress;
pub mod log;
pub mod manager;
pub mod message;
pub mod state;
pub mod transport;
pub mod types;

use crate::error::{Result, TmError};
use crate::ingress::Connection;
use crate::log::{LogConfig, TransactionLog, WalLog};
use crate::manager::Manager;
use crate::message::Message;
use crate::state::resource::{Registry, ResourceConfig};
use crate::state::State;
use crate::transport::{ChannelTransport, Queues};
use crate::types::{Process, QueueId};

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind the server to
    pub bind_addr: SocketAddr,
    /// Directory of the transaction log
    pub log_dir: PathBuf,
    pub log: LogConfig,
    pub resources: Vec<ResourceConfig>,
    /// Capacity of every per-peer queue and of the inbound queue
    pub queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:7400".parse().expect("invalid default bind address"),
            log_dir: PathBuf::from("./data"),
            log: LogConfig::default(),
            resources: Vec::new(),
            queue_capacity: 1024,
        }
    }
}

/// Layout of the resource configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceFile {
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
}

impl Config {
    /// Every reply is made durable on its own
    pub fn low_latency() -> Self {
        Self {
            log: LogConfig::low_latency(),
            ..Self::default()
        }
    }

    /// Read the resources from a JSON file, `{"resources": [{"key": .., "name": ..}]}`
    pub fn load_resources(&mut self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path)?;
        let file: ResourceFile = serde_json::from_str(&content)
            .map_err(|e| TmError::Configuration(format!("{}: {}", path.display(), e)))?;

        for resource in &file.resources {
            if resource.instances == 0 {
                return Err(TmError::Configuration(format!(
                    "resource '{}' needs at least one instance",
                    resource.name
                )));
            }
        }
        self.resources = file.resources;
        Ok(())
    }
}

/// The transaction manager server
pub struct Server {
    config: Config,
    listener: TcpListener,
    queues: Queues,
    inbound: mpsc::Sender<Message>,
    process: Process,
    manager: JoinHandle<Result<()>>,
}

impl Server {
    /// Recover the log, start the dispatch loop and bind the listener
    pub async fn new(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.log_dir)?;

        let log = WalLog::open(&config.log_dir, config.log.clone())?;
        let in_doubt = log.in_doubt();
        if !in_doubt.is_empty() {
            warn!("{} in-doubt transaction(s) recovered from the log", in_doubt.len());
        }

        let queues = Queues::new();
        let process = Process::new(std::process::id(), QueueId(0));
        let state = State::new(
            Registry::configure(&config.resources),
            Box::new(log),
            Box::new(ChannelTransport::new(queues.clone())),
            config.log.batch_size,
        )
        .with_process(process);

        let (inbound, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let manager = Manager::new(state);
        let manager = tokio::task::spawn_blocking(move || manager.run(receiver));

        let listener = TcpListener::bind(&config.bind_addr).await?;

        Ok(Self {
            config,
            listener,
            queues,
            inbound,
            process,
            manager,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn process(&self) -> Process {
        self.process
    }

    /// Accept connections until the dispatch loop stops
    pub async fn run(self) -> Result<()> {
        let Server {
            config,
            listener,
            queues,
            inbound,
            process,
            mut manager,
        } = self;

        info!("minitm listening on {}", listener.local_addr()?);
        info!("Log directory: {:?}", config.log_dir);
        info!("{} resource(s) configured", config.resources.len());

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        info!("New connection from {}", addr);
                        if let Err(e) = stream.set_nodelay(true) {
                            error!("Failed to set TCP_NODELAY for {}: {}", addr, e);
                        }

                        let connection = Connection::new(
                            stream,
                            queues.clone(),
                            inbound.clone(),
                            process,
                            config.queue_capacity,
                        );
                        tokio::spawn(async move {
                            if let Err(e) = connection.run().await {
                                error!("Connection error from {}: {}", addr, e);
                            }
                            info!("Connection closed: {}", addr);
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                },
                stopped = &mut manager => {
                    return match stopped {
                        Ok(result) => result,
                        Err(e) => Err(TmError::Internal(format!("dispatch loop panicked: {}", e))),
                    };
                }
            }
        }
    }
}
