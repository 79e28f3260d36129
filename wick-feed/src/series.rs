//! Timestamp-keyed bar storage with grid-aligned compression.

use std::collections::BTreeMap;

use tracing::debug;
use wick_core::{Bar, FeedKey, Symbol, Timeframe};

/// What happened to a bar handed to [`TimeSeries::add_bar`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddOutcome {
    /// Stored in a new bucket.
    Inserted,
    /// Overwrote the bucket sharing its exact timestamp.
    Replaced,
    /// Folded into the latest bucket while its interval was still open.
    Merged,
    /// Dropped: off the series grid.
    Rejected,
}

impl AddOutcome {
    /// True unless the bar was dropped.
    #[must_use]
    pub fn accepted(self) -> bool {
        !matches!(self, Self::Rejected)
    }
}

/// An ordered collection of bars for one symbol at one timeframe.
///
/// Buckets are spaced `timeframe` apart on a grid anchored at the first
/// bar ever stored. Bars that land off the grid are silently dropped, so
/// irregular input (ticks, partial candles) compresses into a regular
/// series instead of corrupting it.
#[derive(Clone, Debug)]
pub struct TimeSeries {
    symbol: Symbol,
    timeframe: Timeframe,
    bars: BTreeMap<i64, Bar>,
    first_timestamp: Option<i64>,
}

impl TimeSeries {
    #[must_use]
    pub fn new(symbol: impl Into<Symbol>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
            bars: BTreeMap::new(),
            first_timestamp: None,
        }
    }

    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    #[must_use]
    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    #[must_use]
    pub fn key(&self) -> FeedKey {
        FeedKey::new(self.symbol.clone(), self.timeframe)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bars.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// Timestamp anchoring the grid, set by the first stored bar.
    #[must_use]
    pub fn first_timestamp(&self) -> Option<i64> {
        self.first_timestamp
    }

    #[must_use]
    pub fn latest_bar(&self) -> Option<Bar> {
        self.bars.last_key_value().map(|(_, bar)| *bar)
    }

    /// Store one bar.
    ///
    /// With `update_latest` set, a bar whose timestamp falls strictly
    /// inside the latest bucket's open interval is folded into that bucket:
    /// the close is taken from the newcomer, high and low widen when both
    /// sides carry them, volumes add, and the bucket keeps its open and
    /// timestamp. Otherwise the bar must sit exactly on the grid; an exact
    /// timestamp match replaces the bucket wholesale, anything else is
    /// dropped.
    pub fn add_bar(&mut self, bar: Bar, update_latest: bool) -> AddOutcome {
        let tf_millis = self.timeframe.as_millis();

        if update_latest {
            if let Some(latest) = self.latest_bar() {
                if bar.timestamp > latest.timestamp
                    && bar.timestamp < latest.timestamp + tf_millis
                {
                    if let Some(bucket) = self.bars.get_mut(&latest.timestamp) {
                        merge_into(bucket, &bar);
                    }
                    return AddOutcome::Merged;
                }
            }
        }

        let Some(first) = self.first_timestamp else {
            self.first_timestamp = Some(bar.timestamp);
            self.bars.insert(bar.timestamp, bar);
            return AddOutcome::Inserted;
        };

        if self.bars.contains_key(&bar.timestamp) {
            self.bars.insert(bar.timestamp, bar);
            return AddOutcome::Replaced;
        }
        if (bar.timestamp - first) % tf_millis == 0 {
            self.bars.insert(bar.timestamp, bar);
            return AddOutcome::Inserted;
        }

        debug!(
            symbol = %self.symbol,
            timeframe = %self.timeframe,
            timestamp = bar.timestamp,
            "rejected off-grid bar"
        );
        AddOutcome::Rejected
    }

    /// Bars in ascending timestamp order; `limit` keeps only the most
    /// recent bars, still ascending.
    #[must_use]
    pub fn bars(&self, limit: Option<usize>) -> Vec<Bar> {
        match limit {
            Some(count) => {
                let skip = self.bars.len().saturating_sub(count);
                self.bars.values().skip(skip).copied().collect()
            }
            None => self.bars.values().copied().collect(),
        }
    }

    /// Closing prices in ascending timestamp order.
    #[must_use]
    pub fn closes(&self, limit: Option<usize>) -> Vec<f64> {
        self.bars(limit).iter().map(|bar| bar.close).collect()
    }

    /// Synthesize flat bars for every empty grid slot between the first
    /// and latest bar. Each synthetic bar carries the previous bar's close
    /// as its whole range and zero volume. Returns how many were created.
    pub fn fill_missing_data(&mut self) -> usize {
        let (Some(first), Some(latest)) = (self.first_timestamp, self.latest_bar()) else {
            return 0;
        };
        let tf_millis = self.timeframe.as_millis();
        let mut created = 0;
        let mut prev_close = match self.bars.get(&first) {
            Some(bar) => bar.close,
            None => return 0,
        };

        let mut slot = first;
        while slot < latest.timestamp {
            slot += tf_millis;
            match self.bars.get(&slot) {
                Some(bar) => prev_close = bar.close,
                None => {
                    let synthetic = Bar {
                        timestamp: slot,
                        open: Some(prev_close),
                        high: Some(prev_close),
                        low: Some(prev_close),
                        close: prev_close,
                        volume: Some(0.0),
                    };
                    self.bars.insert(slot, synthetic);
                    created += 1;
                }
            }
        }
        created
    }
}

// Fields the incoming bar does not carry leave the bucket's side alone,
// so a close-only tick never narrows an already widened range.
fn merge_into(bucket: &mut Bar, incoming: &Bar) {
    bucket.close = incoming.close;
    bucket.high = match (bucket.high, incoming.high) {
        (Some(current), Some(new)) => Some(current.max(new)),
        (current, new) => new.or(current),
    };
    bucket.low = match (bucket.low, incoming.low) {
        (Some(current), Some(new)) => Some(current.min(new)),
        (current, new) => new.or(current),
    };
    bucket.volume = match (bucket.volume, incoming.volume) {
        (Some(current), Some(new)) => Some(current + new),
        (current, new) => new.or(current),
    };
}
