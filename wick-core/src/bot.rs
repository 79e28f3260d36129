//! Bot definitions: which strategy trades which market through which broker.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{DurationUnit, FeedKey, Symbol, Timeframe};

/// Broker families the engine can drive.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    Deriv,
}

impl BrokerKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deriv => "deriv",
        }
    }
}

impl fmt::Display for BrokerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BrokerKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "deriv" => Ok(Self::Deriv),
            other => Err(format!("unsupported broker '{other}' (expected deriv)")),
        }
    }
}

/// Built-in strategy families resolvable by name.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum StrategyKind {
    #[serde(rename = "triple-ema")]
    TripleEma,
    #[serde(rename = "reversal")]
    Reversal,
}

impl StrategyKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TripleEma => "triple-ema",
            Self::Reversal => "reversal",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_str() {
            "triple-ema" | "triple_ema" | "tripleema" => Ok(Self::TripleEma),
            "reversal" => Ok(Self::Reversal),
            other => Err(format!(
                "unsupported strategy '{other}' (expected one of triple-ema, reversal)"
            )),
        }
    }
}

/// A supporting feed requested by a bot in addition to its main feed.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct FeedSelector {
    /// Defaults to the bot's main symbol when absent.
    pub symbol: Option<Symbol>,
    pub timeframe: Timeframe,
}

impl FeedSelector {
    /// Resolve against the bot's main symbol.
    #[must_use]
    pub fn resolve(&self, main_symbol: &str) -> FeedKey {
        FeedKey::new(
            self.symbol.clone().unwrap_or_else(|| main_symbol.to_string()),
            self.timeframe,
        )
    }
}

/// Identity of a running bot: one broker, one strategy, one market.
///
/// Two bots with the same key are the same bot as far as the engine is
/// concerned; starting a duplicate is a no-op.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct BotKey {
    pub broker: BrokerKind,
    pub strategy: StrategyKind,
    pub symbol: Symbol,
    pub timeframe: Timeframe,
}

impl fmt::Display for BotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}",
            self.broker, self.strategy, self.symbol, self.timeframe
        )
    }
}

/// Full description of a bot, validated shape-wise by the configuration
/// layer before it ever reaches the engine.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct BotSpec {
    pub bot_id: String,
    pub name: Option<String>,
    pub broker: BrokerKind,
    pub strategy: StrategyKind,
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    pub stake: Decimal,
    pub currency: String,
    pub duration: u32,
    pub duration_unit: DurationUnit,
    #[serde(default)]
    pub supporting: Vec<FeedSelector>,
    /// Strategy parameter overrides, interpreted by the strategy itself.
    #[serde(default)]
    pub params: serde_json::Value,
}

impl BotSpec {
    #[must_use]
    pub fn new(
        broker: BrokerKind,
        strategy: StrategyKind,
        symbol: impl Into<Symbol>,
        timeframe: Timeframe,
    ) -> Self {
        Self {
            bot_id: Uuid::new_v4().to_string(),
            name: None,
            broker,
            strategy,
            symbol: symbol.into(),
            timeframe,
            stake: Decimal::ONE,
            currency: "USD".to_string(),
            duration: 120,
            duration_unit: DurationUnit::Second,
            supporting: Vec::new(),
            params: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn key(&self) -> BotKey {
        BotKey {
            broker: self.broker,
            strategy: self.strategy,
            symbol: self.symbol.clone(),
            timeframe: self.timeframe,
        }
    }

    /// Main feed the bot's strategy is evaluated against.
    #[must_use]
    pub fn main_feed(&self) -> FeedKey {
        FeedKey::new(self.symbol.clone(), self.timeframe)
    }

    /// Supporting feeds in declaration order, deduplicated, never
    /// including the main feed itself.
    #[must_use]
    pub fn supporting_feeds(&self) -> Vec<FeedKey> {
        let main = self.main_feed();
        let mut keys: Vec<FeedKey> = Vec::new();
        for selector in &self.supporting {
            let key = selector.resolve(&self.symbol);
            if key != main && !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }

    /// Presence check for the fields a worker cannot run without. Deeper
    /// validation (stake ranges, parameter shapes) happens upstream.
    pub fn validate(&self) -> Result<(), String> {
        if self.symbol.trim().is_empty() {
            return Err("bot symbol must not be empty".to_string());
        }
        if self.bot_id.trim().is_empty() {
            return Err("bot id must not be empty".to_string());
        }
        Ok(())
    }

    #[must_use]
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.key().to_string())
    }
}

/// Kind of entry in a bot's durable run history.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunLogKind {
    Start,
    Stop,
}

impl fmt::Display for RunLogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start => f.write_str("START"),
            Self::Stop => f.write_str("STOP"),
        }
    }
}

/// One append-only entry in a bot's run history.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct RunLogEntry {
    pub kind: RunLogKind,
    pub at: DateTime<Utc>,
    pub message: String,
    /// Populated when the entry records an abnormal termination.
    pub error: Option<String>,
}

impl RunLogEntry {
    #[must_use]
    pub fn start(message: impl Into<String>) -> Self {
        Self {
            kind: RunLogKind::Start,
            at: Utc::now(),
            message: message.into(),
            error: None,
        }
    }

    #[must_use]
    pub fn stop(message: impl Into<String>) -> Self {
        Self {
            kind: RunLogKind::Stop,
            at: Utc::now(),
            message: message.into(),
            error: None,
        }
    }

    /// Stop entry recording a worker that exited with an error.
    #[must_use]
    pub fn stop_with_error(message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            kind: RunLogKind::Stop,
            at: Utc::now(),
            message: message.into(),
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> BotSpec {
        BotSpec::new(
            BrokerKind::Deriv,
            StrategyKind::TripleEma,
            "R_10",
            Timeframe::M1,
        )
    }

    #[test]
    fn bot_key_display_joins_with_underscores() {
        let key = spec().key();
        assert_eq!(key.to_string(), "deriv_triple-ema_R_10_M1");
    }

    #[test]
    fn strategy_kind_parses_aliases() {
        assert_eq!("triple_ema".parse::<StrategyKind>(), Ok(StrategyKind::TripleEma));
        assert_eq!("REVERSAL".parse::<StrategyKind>(), Ok(StrategyKind::Reversal));
        assert!("martingale".parse::<StrategyKind>().is_err());
    }

    #[test]
    fn supporting_feeds_skip_duplicates_and_main() {
        let mut spec = spec();
        spec.supporting = vec![
            FeedSelector {
                symbol: None,
                timeframe: Timeframe::M1,
            },
            FeedSelector {
                symbol: None,
                timeframe: Timeframe::M5,
            },
            FeedSelector {
                symbol: Some("R_10".to_string()),
                timeframe: Timeframe::M5,
            },
        ];
        let feeds = spec.supporting_feeds();
        assert_eq!(feeds, vec![FeedKey::new("R_10", Timeframe::M5)]);
    }

    #[test]
    fn validate_rejects_blank_symbol() {
        let mut spec = spec();
        spec.symbol = "  ".to_string();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn run_log_error_entries_keep_the_message() {
        let entry = RunLogEntry::stop_with_error("worker exited", "socket closed");
        assert_eq!(entry.kind, RunLogKind::Stop);
        assert_eq!(entry.error.as_deref(), Some("socket closed"));
    }
}
