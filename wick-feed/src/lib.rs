//! Market data plumbing: grid-aligned series plus the tasks that feed them.

mod feed;
mod series;

pub use feed::{Feed, FeedSet, NewBars, SharedSeries, DEFAULT_HISTORY_BARS};
pub use series::{AddOutcome, TimeSeries};
