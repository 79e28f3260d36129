//! Glue between feed events and a strategy instance.

use tracing::{debug, warn};
use wick_core::Bar;
use wick_feed::FeedSet;

use crate::{Strategy, StrategyError};

/// Owns a strategy and its feeds, and runs the per-batch routine: backfill
/// supporting feeds from the main one, then evaluate.
///
/// Strategy failures never escape: insufficient data is logged at debug,
/// anything else at warn, and the worker carries on either way.
pub struct StrategyHarness {
    strategy: Box<dyn Strategy>,
    feeds: FeedSet,
}

impl StrategyHarness {
    #[must_use]
    pub fn new(strategy: Box<dyn Strategy>, feeds: FeedSet) -> Self {
        Self { strategy, feeds }
    }

    #[must_use]
    pub fn feeds(&self) -> &FeedSet {
        &self.feeds
    }

    #[must_use]
    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    /// Process one main-feed batch.
    pub async fn on_main_batch(&mut self, batch: &[Bar]) {
        self.feeds.backfill_from_main();
        match self.strategy.next(&self.feeds, batch).await {
            Ok(()) => {}
            Err(StrategyError::NotReady(reason)) => {
                debug!(strategy = self.strategy.name(), %reason, "no signal");
            }
            Err(err) => {
                warn!(
                    strategy = self.strategy.name(),
                    error = %err,
                    "strategy evaluation failed"
                );
            }
        }
    }
}
