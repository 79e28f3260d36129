//! Layered configuration loading for the wick engine.
//!
//! Bots are written in configuration as plain strings; [`BotDefinition::resolve`]
//! parses them into a typed [`BotSpec`], so a typo in a broker, strategy or
//! timeframe name surfaces here rather than deep inside a worker.

use std::path::{Path, PathBuf};

use anyhow::{Error, Result};
use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use wick_core::{BotSpec, BrokerKind, DurationUnit, FeedSelector, StrategyKind, Timeframe};

/// Root application configuration deserialized from layered sources.
#[derive(Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// When set, logs are also written here as JSON lines.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub deriv: DerivConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub bots: Vec<BotDefinition>,
}

impl AppConfig {
    /// Effective SQLite database location.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.store
            .database_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("wick.db"))
    }
}

/// Deriv endpoint and account settings.
#[derive(Debug, Deserialize, Clone)]
pub struct DerivConfig {
    #[serde(default = "default_deriv_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_deriv_app_id")]
    pub app_id: String,
    /// Market data works without a token; trading and statement access do not.
    #[serde(default)]
    pub api_token: Option<String>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct StoreConfig {
    /// Explicit database file, overriding the `data_dir` default.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

/// Engine cadence and sizing knobs.
#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    #[serde(default = "default_history_bars")]
    pub history_bars: usize,
    #[serde(default = "default_order_flush_interval_secs")]
    pub order_flush_interval_secs: u64,
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_statement_page_size")]
    pub statement_page_size: u32,
}

impl Default for DerivConfig {
    fn default() -> Self {
        Self {
            endpoint: default_deriv_endpoint(),
            app_id: default_deriv_app_id(),
            api_token: None,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            history_bars: default_history_bars(),
            order_flush_interval_secs: default_order_flush_interval_secs(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            statement_page_size: default_statement_page_size(),
        }
    }
}

/// One bot as written in configuration, before any parsing.
#[derive(Debug, Deserialize, Clone)]
pub struct BotDefinition {
    /// Stable identifier. Generated per start when omitted, so a bot only
    /// keeps its order history across restarts if an id is set here.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_bot_broker")]
    pub broker: String,
    pub strategy: String,
    pub symbol: String,
    #[serde(default = "default_bot_timeframe")]
    pub timeframe: String,
    #[serde(default = "default_bot_stake")]
    pub stake: Decimal,
    #[serde(default = "default_bot_currency")]
    pub currency: String,
    #[serde(default = "default_bot_duration")]
    pub duration: u32,
    #[serde(default = "default_bot_duration_unit")]
    pub duration_unit: String,
    #[serde(default)]
    pub supporting: Vec<SupportingFeed>,
    /// Strategy parameter overrides, passed through uninterpreted.
    #[serde(default)]
    pub params: Value,
}

/// Extra feed requested by a bot on top of its main one.
#[derive(Debug, Deserialize, Clone)]
pub struct SupportingFeed {
    /// Defaults to the bot's own symbol.
    #[serde(default)]
    pub symbol: Option<String>,
    pub timeframe: String,
}

impl BotDefinition {
    /// Parse the raw definition into a [`BotSpec`] the engine can run.
    pub fn resolve(&self) -> Result<BotSpec> {
        let broker: BrokerKind = self.broker.parse().map_err(Error::msg)?;
        let strategy: StrategyKind = self.strategy.parse().map_err(Error::msg)?;
        let timeframe: Timeframe = self.timeframe.parse().map_err(Error::msg)?;
        let duration_unit: DurationUnit = self.duration_unit.parse().map_err(Error::msg)?;

        let mut supporting = Vec::with_capacity(self.supporting.len());
        for feed in &self.supporting {
            supporting.push(FeedSelector {
                symbol: feed.symbol.clone(),
                timeframe: feed.timeframe.parse().map_err(Error::msg)?,
            });
        }

        let mut spec = BotSpec::new(broker, strategy, self.symbol.clone(), timeframe);
        if let Some(id) = &self.id {
            spec.bot_id = id.clone();
        }
        spec.name = self.name.clone();
        spec.stake = self.stake;
        spec.currency = self.currency.clone();
        spec.duration = self.duration;
        spec.duration_unit = duration_unit;
        spec.supporting = supporting;
        spec.params = self.params.clone();
        Ok(spec)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_deriv_endpoint() -> String {
    "wss://ws.derivws.com/websockets/v3".to_string()
}

fn default_deriv_app_id() -> String {
    "1089".to_string()
}

fn default_history_bars() -> usize {
    500
}

fn default_order_flush_interval_secs() -> u64 {
    30
}

fn default_reconcile_interval_secs() -> u64 {
    60
}

fn default_statement_page_size() -> u32 {
    999
}

fn default_bot_broker() -> String {
    "deriv".to_string()
}

fn default_bot_timeframe() -> String {
    "M1".to_string()
}

fn default_bot_stake() -> Decimal {
    Decimal::ONE
}

fn default_bot_currency() -> String {
    "USD".to_string()
}

fn default_bot_duration() -> u32 {
    120
}

fn default_bot_duration_unit() -> String {
    "s".to_string()
}

/// Loads configuration by merging files and environment variables.
///
/// Sources (lowest to highest precedence):
/// 1. `config/default.toml`
/// 2. `config/{environment}.toml` (if `environment` is Some)
/// 3. `config/local.toml` (optional, ignored in git)
/// 4. Environment variables prefixed with `WICK`
pub fn load_config(env: Option<&str>) -> Result<AppConfig> {
    let base_path = Path::new("config");

    let mut builder =
        Config::builder().add_source(File::from(base_path.join("default.toml")).required(true));
    if let Some(env_name) = env {
        builder = builder
            .add_source(File::from(base_path.join(format!("{env_name}.toml"))).required(false));
    }

    builder = builder.add_source(File::from(base_path.join("local.toml")).required(false));

    builder = builder.add_source(
        Environment::with_prefix("WICK")
            .separator("__")
            .ignore_empty(true),
    );

    let config = builder.build()?;
    config
        .try_deserialize()
        .map_err(|err: ConfigError| err.into())
}
