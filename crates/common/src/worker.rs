//! # Worker Runtime
//!
//! Command-queue plumbing shared by every long-lived subsystem. A worker
//! owns a [`WorkerRuntime`] and implements [`CommandHandler`]; the runtime
//! supplies the bounded command queue, the bus subscription, deferred
//! commands, the periodic no-work tick and shutdown.
//!
//! ## Lifecycle
//!
//! ```text
//!   new() ──▶ subscribe(translator) ──▶ run(handler, interval) ──▶ stop()
//!                  │                          │
//!          bus msg → commands         select! { shutdown | command | tick }
//! ```
//!
//! ## Invariants
//!
//! - `run` may be entered once; a second call returns
//!   [`WorkerError::AlreadyRunning`].
//! - Commands are handled one at a time, in queue order.
//! - Deferred commands are re-queued on the next no-work tick.
//! - `stop` is latched: listeners waiting on a full queue and a `run`
//!   entered afterwards both observe it.
//!
//! ## Safety
//!
//! - No `panic!`, `unwrap()`, `expect()`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument, Span};

use crate::events::{Message, MessageBus};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkerError {
    #[error("worker {0} already running")]
    AlreadyRunning(String),

    #[error("worker {0} command queue closed")]
    QueueClosed(String),

    #[error("worker {0} command queue full")]
    QueueFull(String),
}

/// Implemented by each subsystem; driven by [`WorkerRuntime::run`].
#[async_trait]
pub trait CommandHandler<C>: Send + Sync {
    async fn handle_command(&self, command: C);

    /// Called every no-work interval, whether or not commands arrived.
    async fn no_work(&self) {}
}

/// Handle for queueing commands from spawned tasks.
pub type CommandSender<C> = mpsc::Sender<C>;

pub struct WorkerRuntime<C> {
    name: String,
    span: Span,
    bus: MessageBus,
    tx: mpsc::Sender<C>,
    rx: Mutex<Option<mpsc::Receiver<C>>>,
    deferred: Mutex<Vec<C>>,
    running: Arc<AtomicBool>,
    /// Latched `true` by [`WorkerRuntime::stop`].
    shutdown: watch::Sender<bool>,
}

impl<C> std::fmt::Debug for WorkerRuntime<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRuntime")
            .field("name", &self.name)
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish()
    }
}

impl<C: Send + 'static> WorkerRuntime<C> {
    /// Create a runtime with a command queue of `queue_depth` entries.
    ///
    /// # Guarantees
    ///
    /// - Does NOT subscribe to the bus
    /// - Does NOT spawn any tasks
    pub fn new(name: &str, bus: MessageBus, queue_depth: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        Self {
            name: name.to_string(),
            span: info_span!("worker", subsystem = %name),
            bus,
            tx,
            rx: Mutex::new(Some(rx)),
            deferred: Mutex::new(Vec::new()),
            running: Arc::new(AtomicBool::new(false)),
            shutdown: watch::channel(false).0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Span every log line of this subsystem is recorded under.
    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Queue a command, waiting for capacity.
    pub async fn submit(&self, command: C) -> Result<(), WorkerError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| WorkerError::QueueClosed(self.name.clone()))
    }

    /// Queue a command without waiting.
    pub fn try_submit(&self, command: C) -> Result<(), WorkerError> {
        self.tx.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => WorkerError::QueueFull(self.name.clone()),
            mpsc::error::TrySendError::Closed(_) => WorkerError::QueueClosed(self.name.clone()),
        })
    }

    pub fn sender(&self) -> CommandSender<C> {
        self.tx.clone()
    }

    /// Park a command until the next no-work tick.
    pub fn defer(&self, command: C) {
        self.deferred.lock().push(command);
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.lock().len()
    }

    pub fn publish(&self, msg: Message) {
        self.bus.publish(msg);
    }

    /// Listen on the bus and queue whatever `translator` maps each message to.
    pub fn subscribe<F>(&self, translator: F) -> JoinHandle<()>
    where
        F: Fn(&Message) -> Vec<C> + Send + Sync + 'static,
    {
        let mut rx = self.bus.subscribe();
        let tx = self.tx.clone();
        let mut shutdown = self.shutdown.subscribe();
        let name = self.name.clone();

        tokio::spawn(
            async move {
                'listen: while !*shutdown.borrow() {
                    tokio::select! {
                        changed = shutdown.changed() => if changed.is_err() {
                            break;
                        },
                        received = rx.recv() => match received {
                            Ok(msg) => {
                                for cmd in translator(&msg) {
                                    // a full queue must not hold the listener past stop
                                    tokio::select! {
                                        sent = tx.send(cmd) => if sent.is_err() {
                                            break 'listen;
                                        },
                                        _ = shutdown.wait_for(|stopped| *stopped) => break 'listen,
                                    }
                                }
                            }
                            Err(RecvError::Lagged(n)) => {
                                warn!("{} missed {} bus messages", name, n);
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }
                    if tx.is_closed() {
                        break;
                    }
                }
                debug!("bus listener for {} stopped", name);
            }
            .instrument(self.span.clone()),
        )
    }

    /// Drive `handler` until [`stop`](Self::stop) is called or the queue closes.
    /// A runtime that was already stopped returns at once.
    pub async fn run<H>(&self, handler: &H, no_work_interval: Duration) -> Result<(), WorkerError>
    where
        H: CommandHandler<C> + ?Sized,
    {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(WorkerError::AlreadyRunning(self.name.clone()));
        }
        let mut rx = match self.rx.lock().take() {
            Some(rx) => rx,
            None => {
                self.running.store(false, Ordering::SeqCst);
                return Err(WorkerError::AlreadyRunning(self.name.clone()));
            }
        };

        let span = self.span.clone();
        async {
            info!("{} started, no-work interval {:?}", self.name, no_work_interval);
            let mut ticker = tokio::time::interval(no_work_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            let mut shutdown = self.shutdown.subscribe();
            while self.running.load(Ordering::SeqCst) && !*shutdown.borrow() {
                tokio::select! {
                    changed = shutdown.changed() => if changed.is_err() {
                        break;
                    },
                    cmd = rx.recv() => match cmd {
                        Some(cmd) => handler.handle_command(cmd).await,
                        None => break,
                    },
                    _ = ticker.tick() => {
                        self.requeue_deferred();
                        handler.no_work().await;
                    }
                }
            }
            info!("{} stopped", self.name);
        }
        .instrument(span)
        .await;

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Signal the run loop and bus listeners to exit.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.send_replace(true);
    }

    fn requeue_deferred(&self) {
        let pending: Vec<C> = std::mem::take(&mut *self.deferred.lock());
        for cmd in pending {
            if let Err(mpsc::error::TrySendError::Full(cmd)) = self.tx.try_send(cmd) {
                self.deferred.lock().push(cmd);
            }
        }
    }
}
