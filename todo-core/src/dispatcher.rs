//! Command dispatcher: a single-consumer queue in front of registered handlers.
//!
//! `dispatch` takes `&mut self`, so one command runs through every handler
//! before the next can start. Commands submitted while a handler is running
//! (through a [`CommandSender`]) wait in the queue.

use std::cell::RefCell;
use std::rc::Rc;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::command::{Command, CommandOutcome};

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

pub trait CommandHandler {
    fn handle(&mut self, command: &Command) -> CommandOutcome;
}

pub type SharedHandler = Rc<RefCell<dyn CommandHandler>>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("command queue closed")]
    QueueClosed,
    #[error("command queue full")]
    QueueFull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerToken(u64);

/// What each handler did with one command, in registration order.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub command: Command,
    pub outcomes: Vec<CommandOutcome>,
}

impl DispatchReport {
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(CommandOutcome::is_success)
    }

    pub fn rejections(&self) -> impl Iterator<Item = &str> {
        self.outcomes.iter().filter_map(|o| match o {
            CommandOutcome::Rejected(reason) => Some(reason.as_str()),
            _ => None,
        })
    }
}

/// Cloneable handle for queueing commands.
#[derive(Clone)]
pub struct CommandSender {
    tx: mpsc::Sender<Command>,
}

impl CommandSender {
    pub async fn submit(&self, command: Command) -> Result<(), DispatchError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| DispatchError::QueueClosed)
    }

    pub fn try_submit(&self, command: Command) -> Result<(), DispatchError> {
        self.tx.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DispatchError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => DispatchError::QueueClosed,
        })
    }
}

pub struct Dispatcher {
    handlers: Vec<(HandlerToken, SharedHandler)>,
    next_token: u64,
    tx: mpsc::Sender<Command>,
    rx: mpsc::Receiver<Command>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl Dispatcher {
    pub fn new(queue_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        Self {
            handlers: Vec::new(),
            next_token: 0,
            tx,
            rx,
        }
    }

    pub fn register(&mut self, handler: SharedHandler) -> HandlerToken {
        let token = HandlerToken(self.next_token);
        self.next_token += 1;
        self.handlers.push((token, handler));
        token
    }

    pub fn unregister(&mut self, token: HandlerToken) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|(t, _)| *t != token);
        self.handlers.len() != before
    }

    pub fn sender(&self) -> CommandSender {
        CommandSender {
            tx: self.tx.clone(),
        }
    }

    /// Run `command` through every handler, in registration order.
    pub fn dispatch(&mut self, command: Command) -> DispatchReport {
        log::debug!("dispatching {}", command.kind());
        let mut outcomes = Vec::with_capacity(self.handlers.len());
        for (token, handler) in &self.handlers {
            let outcome = match handler.try_borrow_mut() {
                Ok(mut h) => h.handle(&command),
                Err(_) => {
                    log::warn!("handler {token:?} is busy, skipping {}", command.kind());
                    CommandOutcome::Rejected("handler busy".to_string())
                }
            };
            if let CommandOutcome::Rejected(reason) = &outcome {
                log::debug!("{} rejected: {reason}", command.kind());
            }
            outcomes.push(outcome);
        }
        DispatchReport { command, outcomes }
    }

    /// Dispatch every queued command, in submission order.
    pub fn drain_pending(&mut self) -> Vec<DispatchReport> {
        let mut reports = Vec::new();
        while let Ok(command) = self.rx.try_recv() {
            reports.push(self.dispatch(command));
        }
        reports
    }

    /// Wait for the next queued command and dispatch it.
    ///
    /// The dispatcher keeps a sender of its own, so this never yields `None`
    /// while the dispatcher is alive.
    pub async fn next(&mut self) -> Option<DispatchReport> {
        let command = self.rx.recv().await?;
        Some(self.dispatch(command))
    }
}
