//! Per-bot worker task: runs the trader, flushes its order log and
//! reports how it ended.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};
use wick_broker::BrokerClient;
use wick_core::{BotKey, BotSpec};
use wick_store::{OrderLog, OrderStore, SqliteStore};

use crate::registry::BrokerHandle;
use crate::shutdown::ShutdownSignal;
use crate::trader::{LiveTrader, TraderError};
use crate::EngineSettings;

/// How a worker ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WorkerExit {
    /// Stopped on request.
    Clean,
    /// Died on its own; the reason lands in the bot's run log.
    Fatal(String),
}

/// Terminal report a worker sends the supervisor on its way out.
#[derive(Clone, Debug)]
pub struct WorkerEvent {
    pub bot_id: String,
    pub key: BotKey,
    pub exit: WorkerExit,
}

/// The whole life of one bot. Always sends exactly one [`WorkerEvent`],
/// and always flushes the order log before doing so, whatever happened.
pub(crate) async fn run_worker(
    spec: BotSpec,
    broker: BrokerHandle,
    log: OrderLog,
    store: Arc<SqliteStore>,
    settings: EngineSettings,
    shutdown: ShutdownSignal,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    let key = spec.key();
    let bot_id = spec.bot_id.clone();
    let exit = match drive(spec, &broker, &log, &store, &settings, &shutdown).await {
        Ok(()) => WorkerExit::Clean,
        Err(err) => {
            error!(bot = %key, error = %err, "worker died");
            WorkerExit::Fatal(err.to_string())
        }
    };
    broker.client.disconnect().await;
    flush_orders(&log, &store).await;
    let _ = events.send(WorkerEvent { bot_id, key, exit });
}

async fn drive(
    spec: BotSpec,
    broker: &BrokerHandle,
    log: &OrderLog,
    store: &Arc<SqliteStore>,
    settings: &EngineSettings,
    shutdown: &ShutdownSignal,
) -> Result<(), TraderError> {
    let mut trader = LiveTrader::start(spec, broker, settings.history_bars).await?;

    let mut flush = tokio::time::interval(settings.order_flush_interval);
    flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut run = std::pin::pin!(trader.run(shutdown));
    loop {
        tokio::select! {
            result = run.as_mut() => return result,
            _ = flush.tick() => {
                flush_orders(log, store).await;
            }
        }
    }
}

/// Drain the log into the store. On any failure the drained batch goes
/// back into the log, so a record is only ever lost after it has been
/// written; the same record may be written twice instead. Returns how
/// many records were persisted.
pub(crate) async fn flush_orders<S>(log: &OrderLog, store: &Arc<S>) -> usize
where
    S: OrderStore + 'static,
{
    let records = log.drain();
    if records.is_empty() {
        return 0;
    }
    let count = records.len();
    let store = Arc::clone(store);
    let batch = records.clone();
    let written = tokio::task::spawn_blocking(move || {
        for record in &batch {
            store.upsert_order(record)?;
        }
        Ok::<(), wick_store::StoreError>(())
    })
    .await;
    match written {
        Ok(Ok(())) => {
            debug!(bot = %log.key(), orders = count, "order log flushed");
            count
        }
        Ok(Err(err)) => {
            warn!(bot = %log.key(), error = %err, orders = count, "order flush failed, keeping records buffered");
            log.restore(records);
            0
        }
        Err(err) => {
            warn!(bot = %log.key(), error = %err, "order flush task failed, keeping records buffered");
            log.restore(records);
            0
        }
    }
}
