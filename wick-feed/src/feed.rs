//! Live feed tasks pumping broker bar streams into shared series.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error};
use wick_broker::BarStream;
use wick_core::{Bar, FeedKey};

use crate::series::{AddOutcome, TimeSeries};

/// History depth requested for new subscriptions when nothing else is
/// configured.
pub const DEFAULT_HISTORY_BARS: usize = 500;

const EVENT_CAPACITY: usize = 64;

/// Event published after a feed stored a non-empty batch of bars.
#[derive(Clone, Debug)]
pub struct NewBars {
    pub key: FeedKey,
    pub bars: Vec<Bar>,
}

/// Cheaply cloneable handle to one feed's bar series.
#[derive(Clone)]
pub struct SharedSeries {
    key: FeedKey,
    inner: Arc<RwLock<TimeSeries>>,
}

impl SharedSeries {
    #[must_use]
    pub fn new(series: TimeSeries) -> Self {
        Self {
            key: series.key(),
            inner: Arc::new(RwLock::new(series)),
        }
    }

    #[must_use]
    pub fn key(&self) -> &FeedKey {
        &self.key
    }

    /// Offer one bar to the series, returning what happened to it.
    pub fn offer(&self, bar: Bar, update_latest: bool) -> AddOutcome {
        self.inner
            .write()
            .map(|mut series| series.add_bar(bar, update_latest))
            .unwrap_or(AddOutcome::Rejected)
    }

    /// Offer a whole batch, returning how many bars were accepted.
    pub fn append_batch(&self, bars: &[Bar], update_latest: bool) -> usize {
        self.inner
            .write()
            .map(|mut series| {
                bars.iter()
                    .filter(|bar| series.add_bar(**bar, update_latest).accepted())
                    .count()
            })
            .unwrap_or(0)
    }

    #[must_use]
    pub fn latest_bar(&self) -> Option<Bar> {
        self.inner.read().ok().and_then(|series| series.latest_bar())
    }

    #[must_use]
    pub fn bars(&self, limit: Option<usize>) -> Vec<Bar> {
        self.inner
            .read()
            .map(|series| series.bars(limit))
            .unwrap_or_default()
    }

    #[must_use]
    pub fn closes(&self, limit: Option<usize>) -> Vec<f64> {
        self.inner
            .read()
            .map(|series| series.closes(limit))
            .unwrap_or_default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().map(|series| series.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// See [`TimeSeries::fill_missing_data`].
    pub fn fill_missing_data(&self) -> usize {
        self.inner
            .write()
            .map(|mut series| series.fill_missing_data())
            .unwrap_or(0)
    }
}

/// One running feed: a task draining a broker bar stream into a
/// [`SharedSeries`] and broadcasting each stored batch.
///
/// The task ends when the stream does; subscribers observe that as a
/// closed event channel. The feed never reconnects on its own.
pub struct Feed {
    key: FeedKey,
    series: SharedSeries,
    events: broadcast::Sender<NewBars>,
    task: JoinHandle<()>,
}

impl Feed {
    /// Spawn the pump task over an already-established subscription.
    #[must_use]
    pub fn spawn(key: FeedKey, stream: BarStream) -> Self {
        let (feed, _events) = Self::spawn_subscribed(key, stream);
        feed
    }

    /// Like [`Feed::spawn`], but hands back an event receiver opened
    /// before the pump starts. Use this for a feed whose very first
    /// batch (the history) must be observed; a receiver obtained via
    /// [`Feed::subscribe`] after spawning could miss it.
    #[must_use]
    pub fn spawn_subscribed(
        key: FeedKey,
        stream: BarStream,
    ) -> (Self, broadcast::Receiver<NewBars>) {
        let series = SharedSeries::new(TimeSeries::new(key.symbol.clone(), key.timeframe));
        let (events, receiver) = broadcast::channel(EVENT_CAPACITY);
        let task = tokio::spawn(run_feed(
            key.clone(),
            stream,
            series.clone(),
            events.clone(),
        ));
        (
            Self {
                key,
                series,
                events,
                task,
            },
            receiver,
        )
    }

    #[must_use]
    pub fn key(&self) -> &FeedKey {
        &self.key
    }

    #[must_use]
    pub fn series(&self) -> SharedSeries {
        self.series.clone()
    }

    /// Subscribe to batch events. Slow consumers may observe lag.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<NewBars> {
        self.events.subscribe()
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

impl Drop for Feed {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_feed(
    key: FeedKey,
    mut stream: BarStream,
    series: SharedSeries,
    events: broadcast::Sender<NewBars>,
) {
    while let Some(item) = stream.recv().await {
        match item {
            Ok(batch) => {
                if batch.is_empty() {
                    continue;
                }
                series.append_batch(&batch, true);
                let _ = events.send(NewBars {
                    key: key.clone(),
                    bars: batch,
                });
            }
            Err(err) => {
                error!(feed = %key, error = %err, "bar stream failed");
                break;
            }
        }
    }
    debug!(feed = %key, "bar feed finished");
}

/// The series of every feed a bot runs on, keyed by feed, with one feed
/// designated as the main one.
#[derive(Clone)]
pub struct FeedSet {
    main: FeedKey,
    series: HashMap<FeedKey, SharedSeries>,
}

impl FeedSet {
    #[must_use]
    pub fn new(main: FeedKey) -> Self {
        Self {
            main,
            series: HashMap::new(),
        }
    }

    pub fn insert(&mut self, series: SharedSeries) {
        self.series.insert(series.key().clone(), series);
    }

    #[must_use]
    pub fn main_key(&self) -> &FeedKey {
        &self.main
    }

    #[must_use]
    pub fn main(&self) -> Option<&SharedSeries> {
        self.series.get(&self.main)
    }

    #[must_use]
    pub fn get(&self, key: &FeedKey) -> Option<&SharedSeries> {
        self.series.get(key)
    }

    pub fn supporting(&self) -> impl Iterator<Item = &SharedSeries> + '_ {
        self.series
            .iter()
            .filter(|(key, _)| **key != self.main)
            .map(|(_, series)| series)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.series.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Offer the main feed's latest bar to every supporting series that
    /// has fallen behind it. Each series applies its own grid rule, so a
    /// misaligned bar is still dropped there. Returns how many series
    /// were offered the bar.
    pub fn backfill_from_main(&self) -> usize {
        let Some(latest) = self.main().and_then(SharedSeries::latest_bar) else {
            return 0;
        };
        let mut offered = 0;
        for series in self.supporting() {
            let Some(behind) = series.latest_bar() else {
                continue;
            };
            if behind.timestamp < latest.timestamp {
                series.offer(latest, false);
                offered += 1;
            }
        }
        offered
    }
}
