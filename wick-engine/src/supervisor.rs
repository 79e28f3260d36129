//! The supervisor: owns every worker and speaks the control protocol.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};
use wick_core::{BotKey, BotSpec, RunLogEntry};
use wick_store::{BotStore, OrderLog, SqliteStore, StoreResult};

use crate::registry::build_broker;
use crate::shutdown::ShutdownSignal;
use crate::worker::{run_worker, WorkerEvent, WorkerExit};
use crate::{EngineError, EngineSettings};

const CONTROL_BUFFER: usize = 16;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Messages a running supervisor accepts.
pub enum Control {
    Start {
        spec: BotSpec,
        reply: oneshot::Sender<StartReply>,
    },
    Stop {
        key: BotKey,
        reply: oneshot::Sender<bool>,
    },
    Status {
        reply: oneshot::Sender<Vec<BotStatus>>,
    },
}

/// Outcome of asking for a bot start.
///
/// `Accepted` means the worker was spawned, not that it will succeed.
/// Connection or strategy failures happen after the reply and surface
/// through the bot's run log instead.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StartReply {
    Accepted,
    AlreadyRunning,
    Rejected(String),
}

/// One running bot, as reported by `Status`.
#[derive(Clone, Debug, Serialize)]
pub struct BotStatus {
    pub bot_id: String,
    pub name: String,
    pub key: BotKey,
    pub started_at: DateTime<Utc>,
}

/// Client side of the control channel. Cheap to clone; the supervisor
/// runs until the last handle is dropped.
#[derive(Clone)]
pub struct SupervisorHandle {
    commands: mpsc::Sender<Control>,
}

impl SupervisorHandle {
    pub async fn start_bot(&self, spec: BotSpec) -> Result<StartReply, EngineError> {
        let (reply, answer) = oneshot::channel();
        self.commands
            .send(Control::Start { spec, reply })
            .await
            .map_err(|_| EngineError::SupervisorGone)?;
        answer.await.map_err(|_| EngineError::SupervisorGone)
    }

    /// Ask for a bot to stop. `true` means the bot was running and the
    /// stop was delivered; the worker winds down on its own time.
    pub async fn stop_bot(&self, key: BotKey) -> Result<bool, EngineError> {
        let (reply, answer) = oneshot::channel();
        self.commands
            .send(Control::Stop { key, reply })
            .await
            .map_err(|_| EngineError::SupervisorGone)?;
        answer.await.map_err(|_| EngineError::SupervisorGone)
    }

    pub async fn status(&self) -> Result<Vec<BotStatus>, EngineError> {
        let (reply, answer) = oneshot::channel();
        self.commands
            .send(Control::Status { reply })
            .await
            .map_err(|_| EngineError::SupervisorGone)?;
        answer.await.map_err(|_| EngineError::SupervisorGone)
    }
}

struct Worker {
    bot_id: String,
    name: String,
    started_at: DateTime<Utc>,
    shutdown: ShutdownSignal,
}

/// Owns the workers. One instance per process; consumed by
/// [`Supervisor::run`].
pub struct Supervisor {
    settings: EngineSettings,
    store: Arc<SqliteStore>,
    commands: mpsc::Receiver<Control>,
    workers: HashMap<BotKey, Worker>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
}

impl Supervisor {
    #[must_use]
    pub fn new(settings: EngineSettings, store: Arc<SqliteStore>) -> (Self, SupervisorHandle) {
        let (commands_tx, commands) = mpsc::channel(CONTROL_BUFFER);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                settings,
                store,
                commands,
                workers: HashMap::new(),
                events_tx,
                events_rx,
            },
            SupervisorHandle {
                commands: commands_tx,
            },
        )
    }

    /// Serve control messages until every handle is dropped, then stop
    /// whatever is still running.
    pub async fn run(mut self) {
        info!("supervisor started");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Control::Start { spec, reply }) => {
                        let _ = reply.send(self.start(spec).await);
                    }
                    Some(Control::Stop { key, reply }) => {
                        let _ = reply.send(self.stop(&key));
                    }
                    Some(Control::Status { reply }) => {
                        let _ = reply.send(self.status());
                    }
                    None => break,
                },
                Some(event) = self.events_rx.recv() => self.reap(event).await,
            }
        }
        self.stop_all().await;
        info!("supervisor stopped");
    }

    async fn start(&mut self, spec: BotSpec) -> StartReply {
        let key = spec.key();
        if self.workers.contains_key(&key) {
            warn!(bot = %key, "start ignored, bot already running");
            return StartReply::AlreadyRunning;
        }
        if let Err(reason) = spec.validate() {
            warn!(bot = %key, %reason, "start rejected");
            return StartReply::Rejected(reason);
        }

        self.record_start(&spec).await;

        let log = OrderLog::new(spec.bot_id.clone(), key.clone());
        let broker = build_broker(&spec, &self.settings, log.clone());
        let shutdown = ShutdownSignal::new();
        let worker = Worker {
            bot_id: spec.bot_id.clone(),
            name: spec.display_name(),
            started_at: Utc::now(),
            shutdown: shutdown.clone(),
        };
        info!(bot = %key, name = %worker.name, "bot starting");
        tokio::spawn(run_worker(
            spec,
            broker,
            log,
            Arc::clone(&self.store),
            self.settings.clone(),
            shutdown,
            self.events_tx.clone(),
        ));
        self.workers.insert(key, worker);
        StartReply::Accepted
    }

    /// A stopped bot stays in the map, and keeps refusing duplicate
    /// starts, until its worker reports back through [`Self::reap`].
    fn stop(&mut self, key: &BotKey) -> bool {
        match self.workers.get(key) {
            Some(worker) => {
                info!(bot = %key, "bot stop requested");
                worker.shutdown.trigger();
                true
            }
            None => {
                warn!(bot = %key, "stop ignored, bot not running");
                false
            }
        }
    }

    fn status(&self) -> Vec<BotStatus> {
        let mut bots: Vec<BotStatus> = self
            .workers
            .iter()
            .map(|(key, worker)| BotStatus {
                bot_id: worker.bot_id.clone(),
                name: worker.name.clone(),
                key: key.clone(),
                started_at: worker.started_at,
            })
            .collect();
        bots.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        bots
    }

    async fn reap(&mut self, event: WorkerEvent) {
        self.workers.remove(&event.key);
        let entry = match &event.exit {
            WorkerExit::Clean => {
                info!(bot = %event.key, "bot stopped");
                RunLogEntry::stop("bot stopped")
            }
            WorkerExit::Fatal(reason) => {
                error!(bot = %event.key, %reason, "bot terminated");
                RunLogEntry::stop_with_error("worker exited", reason.clone())
            }
        };
        let store = Arc::clone(&self.store);
        let bot_id = event.bot_id.clone();
        blocking_store_write(
            move || store.append_run_log(&bot_id, &entry),
            "record bot stop",
        )
        .await;
    }

    async fn record_start(&self, spec: &BotSpec) {
        let store = Arc::clone(&self.store);
        let bot_id = spec.bot_id.clone();
        let name = spec.display_name();
        blocking_store_write(
            move || {
                store.upsert_bot(&bot_id, &name)?;
                store.append_run_log(&bot_id, &RunLogEntry::start("bot start accepted"))
            },
            "record bot start",
        )
        .await;
    }

    async fn stop_all(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        info!(bots = self.workers.len(), "stopping all bots");
        for worker in self.workers.values() {
            worker.shutdown.trigger();
        }
        while !self.workers.is_empty() {
            match tokio::time::timeout(DRAIN_TIMEOUT, self.events_rx.recv()).await {
                Ok(Some(event)) => self.reap(event).await,
                Ok(None) => break,
                Err(_) => {
                    warn!(remaining = self.workers.len(), "workers did not stop in time");
                    break;
                }
            }
        }
    }
}

/// Run-history writes never take the supervisor down; a store that
/// cannot record them is logged and worked around.
async fn blocking_store_write<F>(write: F, what: &str)
where
    F: FnOnce() -> StoreResult<()> + Send + 'static,
{
    match tokio::task::spawn_blocking(write).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(error = %err, "could not {what}"),
        Err(err) => warn!(error = %err, "could not {what}"),
    }
}
