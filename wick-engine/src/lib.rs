//! The live engine: a supervisor spawning one worker per bot, each
//! worker driving a broker connection, a set of feeds and a strategy,
//! plus the reconciliation pass that settles orders the live stream
//! missed.

pub mod reconcile;
pub mod registry;
pub mod shutdown;
pub mod supervisor;
pub mod trader;
pub mod worker;

use std::time::Duration;

use thiserror::Error;
use wick_broker::BrokerError;
use wick_deriv::DerivConfig;
use wick_store::StoreError;

pub use reconcile::{Reconciler, MAX_CONSECUTIVE_FAILURES};
pub use registry::{build_broker, BrokerHandle};
pub use shutdown::ShutdownSignal;
pub use supervisor::{BotStatus, Control, StartReply, Supervisor, SupervisorHandle};
pub use trader::{LiveTrader, TraderError};
pub use worker::{WorkerEvent, WorkerExit};

/// Engine-wide tunables, shared by every worker the supervisor spawns.
#[derive(Clone, Debug)]
pub struct EngineSettings {
    /// Connection settings handed to each Deriv client.
    pub deriv: DerivConfig,
    /// History depth requested when a feed opens.
    pub history_bars: usize,
    /// How often each worker pushes its order log into the store.
    pub order_flush_interval: Duration,
    /// How often the reconciliation pass runs.
    pub reconcile_interval: Duration,
    /// Statement rows fetched per reconciliation pass.
    pub statement_page_size: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            deriv: DerivConfig::default(),
            history_bars: wick_feed::DEFAULT_HISTORY_BARS,
            order_flush_interval: Duration::from_secs(30),
            reconcile_interval: Duration::from_secs(60),
            statement_page_size: 999,
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// The supervisor task is gone; its control channel is closed.
    #[error("supervisor is no longer running")]
    SupervisorGone,
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("background task failed: {0}")]
    Background(String),
}
