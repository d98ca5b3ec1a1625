//! Command dispatch: opcode → (handler, target queue), plus the worker
//! queues consuming dispatched commands in FIFO order.
//!
//! A registration with no queue runs its handler inline on the receiver
//! task; otherwise the command is pushed to the queue and invoked by that
//! queue's worker. Handlers return false to signal "cannot be handled
//! yet", which lands the command on the receiver's pending list.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;

use crate::command::Command;

pub type HandlerFuture = Pin<Box<dyn Future<Output = bool> + Send>>;
pub type Handler = Arc<dyn Fn(Command) -> HandlerFuture + Send + Sync>;

#[derive(Clone)]
pub struct Registration {
    pub handler: Handler,
    pub queue: Option<CommandQueue>,
}

/// Command-code → registration table.
#[derive(Clone, Default)]
pub struct Dispatcher {
    table: Arc<RwLock<HashMap<u32, Registration>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, command: u32, handler: Handler, queue: Option<CommandQueue>) {
        self.table
            .write()
            .unwrap()
            .insert(command, Registration { handler, queue });
    }

    pub fn lookup(&self, command: u32) -> Option<Registration> {
        self.table.read().unwrap().get(&command).cloned()
    }

    /// Route one command: enqueue to its target queue, or invoke inline.
    /// Returns false when the handler (or routing) defers the command.
    pub async fn dispatch(&self, command: Command) -> bool {
        let Some(reg) = self.lookup(command.command()) else {
            tracing::warn!(?command, "no handler registered, dropping");
            return true;
        };
        match reg.queue {
            Some(queue) => queue.push(reg.handler, command),
            None => (reg.handler)(command).await,
        }
    }
}

type QueueItem = (Handler, Command);

/// Thread-affine FIFO of dispatched commands, consumed by one worker.
#[derive(Clone)]
pub struct CommandQueue {
    tx: mpsc::UnboundedSender<QueueItem>,
}

pub struct CommandQueueRx {
    rx: mpsc::UnboundedReceiver<QueueItem>,
}

impl CommandQueue {
    pub fn channel() -> (CommandQueue, CommandQueueRx) {
        let (tx, rx) = mpsc::unbounded_channel();
        (CommandQueue { tx }, CommandQueueRx { rx })
    }

    /// Push always succeeds while the worker lives; a closed queue drops
    /// the command, which only happens during shutdown.
    pub fn push(&self, handler: Handler, command: Command) -> bool {
        if self.tx.send((handler, command)).is_err() {
            tracing::debug!("command queue closed, dropping command");
        }
        true
    }
}

/// Worker loop: invoke queued commands in order. When the queue runs dry
/// the idle hook is polled; it returns true while it has more deferred
/// work, keeping the loop hot. The stop predicate ends the loop after the
/// state transition to closed.
pub async fn run_worker<I, F, S>(mut rx: CommandQueueRx, mut notify_idle: I, mut stopped: S)
where
    I: FnMut() -> F,
    F: Future<Output = bool>,
    S: FnMut() -> bool,
{
    loop {
        match rx.rx.try_recv() {
            Ok((handler, command)) => {
                handler(command).await;
            }
            Err(mpsc::error::TryRecvError::Empty) => {
                if notify_idle().await {
                    continue; // more idle work pending
                }
                match rx.rx.recv().await {
                    Some((handler, command)) => {
                        handler(command).await;
                    }
                    None => break,
                }
            }
            Err(mpsc::error::TryRecvError::Disconnected) => break,
        }
        if stopped() {
            break;
        }
    }
}
