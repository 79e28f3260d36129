//! Fundamental data types shared across the entire workspace.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

mod bot;
mod order;

pub use bot::{BotKey, BotSpec, BrokerKind, FeedSelector, RunLogEntry, RunLogKind, StrategyKind};
pub use order::{
    Basis, BinaryOrder, ContractRequest, ContractType, DurationUnit, OrderResult, OrderStatus,
    SignalSnapshot,
};

/// Alias used for human-readable market symbols (e.g., `R_10`, `frxEURUSD`).
pub type Symbol = String;

/// Unique identifier assigned to purchased contracts by the broker.
///
/// Empty only on orders that failed before a contract was ever bought.
pub type OrderId = String;

/// Bar timeframes supported by the engine, all denominated in minutes.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum Timeframe {
    M1,
    M2,
    M3,
    M5,
    M10,
    M15,
}

impl Timeframe {
    /// Timeframe length in seconds, the granularity unit brokers quote.
    #[must_use]
    pub fn as_secs(self) -> i64 {
        match self {
            Self::M1 => 60,
            Self::M2 => 120,
            Self::M3 => 180,
            Self::M5 => 300,
            Self::M10 => 600,
            Self::M15 => 900,
        }
    }

    /// Timeframe length in milliseconds, matching [`Bar::timestamp`] units.
    #[must_use]
    pub fn as_millis(self) -> i64 {
        self.as_secs() * 1_000
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::M1 => "M1",
            Self::M2 => "M2",
            Self::M3 => "M3",
            Self::M5 => "M5",
            Self::M10 => "M10",
            Self::M15 => "M15",
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_uppercase().as_str() {
            "M1" | "1M" | "60" => Ok(Self::M1),
            "M2" | "2M" | "120" => Ok(Self::M2),
            "M3" | "3M" | "180" => Ok(Self::M3),
            "M5" | "5M" | "300" => Ok(Self::M5),
            "M10" | "10M" | "600" => Ok(Self::M10),
            "M15" | "15M" | "900" => Ok(Self::M15),
            other => Err(format!(
                "unsupported timeframe '{other}' (expected one of M1, M2, M3, M5, M10, M15)"
            )),
        }
    }
}

impl TryFrom<i64> for Timeframe {
    type Error = String;

    fn try_from(seconds: i64) -> Result<Self, Self::Error> {
        match seconds {
            60 => Ok(Self::M1),
            120 => Ok(Self::M2),
            180 => Ok(Self::M3),
            300 => Ok(Self::M5),
            600 => Ok(Self::M10),
            900 => Ok(Self::M15),
            other => Err(format!("no timeframe with a granularity of {other} seconds")),
        }
    }
}

/// A single OHLCV bucket inside a [`Timeframe`]-spaced grid.
///
/// `close` is the only mandatory price: bars distilled from ticks carry no
/// open/high/low until later data widens them. Timestamps are epoch
/// milliseconds and always sit on the owning series' grid.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct Bar {
    pub timestamp: i64,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: f64,
    pub volume: Option<f64>,
}

impl Bar {
    /// Bar with only a closing price, as produced from a single tick.
    #[must_use]
    pub fn at(timestamp: i64, close: f64) -> Self {
        Self {
            timestamp,
            open: None,
            high: None,
            low: None,
            close,
            volume: None,
        }
    }

    /// Fully populated bar, as produced from a broker candle payload.
    #[must_use]
    pub fn ohlc(timestamp: i64, open: f64, high: f64, low: f64, close: f64) -> Self {
        Self {
            timestamp,
            open: Some(open),
            high: Some(high),
            low: Some(low),
            close,
            volume: None,
        }
    }

    #[must_use]
    pub fn with_volume(mut self, volume: f64) -> Self {
        self.volume = Some(volume);
        self
    }

    /// Bar open time as a UTC datetime, useful for logs.
    #[must_use]
    pub fn datetime(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.timestamp)
            .single()
            .unwrap_or_default()
    }
}

/// Identifies one market data feed: a symbol observed at one timeframe.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct FeedKey {
    pub symbol: Symbol,
    pub timeframe: Timeframe,
}

impl FeedKey {
    #[must_use]
    pub fn new(symbol: impl Into<Symbol>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
        }
    }
}

impl fmt::Display for FeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.symbol, self.timeframe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeframe_parses_labels_and_granularities() {
        assert_eq!("M1".parse::<Timeframe>(), Ok(Timeframe::M1));
        assert_eq!("m5".parse::<Timeframe>(), Ok(Timeframe::M5));
        assert_eq!("900".parse::<Timeframe>(), Ok(Timeframe::M15));
        assert!("M4".parse::<Timeframe>().is_err());
        assert_eq!(Timeframe::try_from(120), Ok(Timeframe::M2));
        assert!(Timeframe::try_from(61).is_err());
    }

    #[test]
    fn timeframe_millis_match_seconds() {
        assert_eq!(Timeframe::M1.as_millis(), 60_000);
        assert_eq!(Timeframe::M10.as_millis(), 600_000);
    }

    #[test]
    fn tick_bar_has_no_range() {
        let bar = Bar::at(60_000, 101.5);
        assert_eq!(bar.open, None);
        assert_eq!(bar.high, None);
        assert_eq!(bar.low, None);
        assert_eq!(bar.close, 101.5);
        assert_eq!(bar.volume, None);
    }

    #[test]
    fn feed_key_display_includes_timeframe() {
        let key = FeedKey::new("R_10", Timeframe::M2);
        assert_eq!(key.to_string(), "R_10@M2");
    }
}
