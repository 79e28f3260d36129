//! One bot's live trading loop: bars in, strategy evaluations out.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};
use wick_broker::{BrokerClient, BrokerError, MarketData};
use wick_core::BotSpec;
use wick_feed::{Feed, FeedSet, NewBars};
use wick_strategy::{build_strategy, StrategyError, StrategyHarness};

use crate::registry::BrokerHandle;
use crate::shutdown::ShutdownSignal;

#[derive(Debug, Error)]
pub enum TraderError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Strategy(#[from] StrategyError),
    /// The main feed's stream ended, which a live bot cannot survive.
    #[error("main feed closed")]
    MainFeedClosed,
}

/// A connected bot: its feeds, its strategy and the event stream that
/// drives it.
pub struct LiveTrader {
    spec: BotSpec,
    harness: StrategyHarness,
    events: broadcast::Receiver<NewBars>,
    // Held so the pump tasks live exactly as long as the trader.
    _feeds: Vec<Feed>,
}

impl LiveTrader {
    /// Connect the broker, open every feed and build the strategy.
    ///
    /// Supporting feeds open before the main one. The main feed opens
    /// last with a pre-registered event receiver, so by the time its
    /// history batch fires every supporting series already exists and
    /// the batch itself cannot be missed.
    pub async fn start(
        spec: BotSpec,
        broker: &BrokerHandle,
        history: usize,
    ) -> Result<Self, TraderError> {
        broker.client.connect().await?;

        let mut feeds = Vec::new();
        let mut series = FeedSet::new(spec.main_feed());
        for key in spec.supporting_feeds() {
            let stream = broker
                .client
                .subscribe_bars(&key.symbol, key.timeframe, history)
                .await?;
            let feed = Feed::spawn(key.clone(), stream);
            series.insert(feed.series());
            feeds.push(feed);
            info!(bot = %spec.key(), feed = %key, "supporting feed open");
        }

        let main = spec.main_feed();
        let stream = broker
            .client
            .subscribe_bars(&main.symbol, main.timeframe, history)
            .await?;
        let (feed, events) = Feed::spawn_subscribed(main.clone(), stream);
        series.insert(feed.series());
        feeds.push(feed);
        info!(bot = %spec.key(), feed = %main, "main feed open");

        let strategy = build_strategy(&spec, Arc::clone(&broker.trader))?;
        let harness = StrategyHarness::new(strategy, series);
        Ok(Self {
            spec,
            harness,
            events,
            _feeds: feeds,
        })
    }

    /// Feed every main-feed batch to the strategy until shutdown or the
    /// feed dies. The history batch is the first evaluation.
    pub async fn run(&mut self, shutdown: &ShutdownSignal) -> Result<(), TraderError> {
        let key = self.spec.key();
        info!(
            bot = %key,
            strategy = self.harness.strategy_name(),
            "trading loop started"
        );
        loop {
            tokio::select! {
                () = shutdown.wait() => {
                    info!(bot = %key, "trading loop stopping");
                    return Ok(());
                }
                event = self.events.recv() => match event {
                    Ok(batch) => self.harness.on_main_batch(&batch.bars).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(bot = %key, missed, "main feed batches lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(TraderError::MainFeedClosed);
                    }
                },
            }
        }
    }
}
