//! Transaction Manager dispatch
//!
//! The [`Manager`] owns the [`State`] and a table of handlers keyed by message type.
//! Messages are handled one at a time, each to completion: whatever has to wait for
//! a resource is kept as state (a coordinator group), never as a blocked call.
//!
//! ### Loop
//! 1. Take the next message, handle it
//! 2. When no message is waiting, flush the replies held for the log ([`Manager::idle`])
//! 3. Block for the next message
//!
//! A handler error means the state can no longer be trusted (the log failed), it
//! ends the loop.

pub mod admin;
pub mod engine;
pub mod flush;
pub mod handle;


use std::collections::HashMap;

use tokio::sync::mpsc;

use crate::error::Result;
use crate::message::{Message, MessageType};
use crate::state::State;

/// A message handler
pub type Handler = fn(&mut State, Message) -> Result<()>;

pub struct Manager {
    state: State,
    handlers: HashMap<MessageType, Handler>,
}

impl Manager {
    pub fn new(state: State) -> Self {
        Self {
            state,
            handlers: handle::handlers(),
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut State {
        &mut self.state
    }

    /// Handle one message
    pub fn dispatch(&mut self, message: Message) -> Result<()> {
        let kind = message.kind();
        match self.handlers.get(&kind) {
            Some(handler) => handler(&mut self.state, message),
            None => {
                log::error!("no handler for message type {:?} - action: discard", kind);
                Ok(())
            }
        }
    }

    /// Nothing more to do right now: persist the log and send the held replies
    pub fn idle(&mut self) -> Result<()> {
        self.state.flush()
    }

    /// Run the dispatch loop until every sender of `inbound` is gone.
    ///
    /// Blocks the calling thread, run it with `tokio::task::spawn_blocking`.
    pub fn run(mut self, mut inbound: mpsc::Receiver<Message>) -> Result<()> {
        log::info!("transaction manager {} ready", self.state.process);

        loop {
            let message = match inbound.try_recv() {
                Ok(message) => message,
                Err(mpsc::error::TryRecvError::Empty) => {
                    self.idle()?;
                    match inbound.blocking_recv() {
                        Some(message) => message,
                        None => break,
                    }
                }
                Err(mpsc::error::TryRecvError::Disconnected) => break,
            };

            if let Err(e) = self.dispatch(message) {
                log::error!("fatal: {} - action: stop", e);
                return Err(e);
            }
        }

        self.idle()?;
        log::info!("transaction manager stopped");
        Ok(())
    }
}
