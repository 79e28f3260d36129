//! Strategy trait definitions, built-in strategies and shared helpers.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use wick_broker::ContractTrader;
use wick_core::{Bar, BotSpec, ContractRequest, ContractType, StrategyKind};
use wick_feed::FeedSet;

pub mod indicators;

mod harness;
mod reversal;
mod triple_ema;

pub use harness::StrategyHarness;
pub use reversal::{Reversal, ReversalParams};
pub use triple_ema::{TripleEma, TripleEmaParams};

/// Result alias used within strategy implementations.
pub type StrategyResult<T> = Result<T, StrategyError>;

/// Failure variants that strategies are expected to surface.
#[derive(Debug, Error)]
pub enum StrategyError {
    /// Raised when required inputs are missing (e.g., insufficient data history).
    #[error("strategy not ready: {0}")]
    NotReady(String),
    /// Covers bookkeeping issues.
    #[error("state error: {0}")]
    State(String),
    /// Raised when user-provided configuration is invalid.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// Generic wrapper for other error types.
    #[error("unhandled error: {0}")]
    Other(String),
}

/// A trading strategy evaluated against one bot's feeds.
///
/// `next` runs once per main-feed batch, after supporting feeds have been
/// backfilled. Returning [`StrategyError::NotReady`] means "no signal yet";
/// it is routine, not a failure.
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Human-friendly identifier used in logs.
    fn name(&self) -> &str;

    /// Evaluate the latest main-feed batch.
    async fn next(&mut self, feeds: &FeedSet, batch: &[Bar]) -> StrategyResult<()>;
}

impl std::fmt::Debug for dyn Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dyn Strategy({})", self.name())
    }
}

/// Resolve a strategy discriminant into a ready-to-run instance.
///
/// Resolution happens exactly once, when a worker starts; an unknown or
/// misconfigured strategy never makes it into the trading loop.
pub fn build_strategy(
    spec: &BotSpec,
    trader: Arc<dyn ContractTrader>,
) -> StrategyResult<Box<dyn Strategy>> {
    match spec.strategy {
        StrategyKind::TripleEma => Ok(Box::new(TripleEma::from_spec(spec, trader)?)),
        StrategyKind::Reversal => Ok(Box::new(Reversal::from_spec(spec, trader)?)),
    }
}

/// Names accepted by the strategy discriminant, for help output.
#[must_use]
pub fn builtin_strategy_names() -> Vec<&'static str> {
    vec![StrategyKind::TripleEma.as_str(), StrategyKind::Reversal.as_str()]
}

/// Purchase request template carrying everything from the bot definition
/// except the direction, which the strategy decides per signal.
pub(crate) fn request_template(spec: &BotSpec, contract_type: ContractType) -> ContractRequest {
    ContractRequest {
        symbol: spec.symbol.clone(),
        amount: spec.stake,
        basis: wick_core::Basis::Stake,
        contract_type,
        currency: spec.currency.clone(),
        duration: spec.duration,
        duration_unit: spec.duration_unit,
    }
}

/// Deserialize strategy parameter overrides, falling back to defaults
/// when the bot definition carries none.
pub(crate) fn parse_params<P>(spec: &BotSpec) -> StrategyResult<P>
where
    P: Default + serde::de::DeserializeOwned,
{
    if spec.params.is_null() {
        return Ok(P::default());
    }
    serde_json::from_value(spec.params.clone()).map_err(|err| {
        StrategyError::InvalidParameter(format!(
            "bad parameters for strategy '{}': {err}",
            spec.strategy
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use wick_broker::{BrokerResult, Proposal, Purchase};
    use wick_core::{BrokerKind, SignalSnapshot, Timeframe};

    struct NoTrade;

    #[async_trait]
    impl ContractTrader for NoTrade {
        async fn propose(&self, _request: &ContractRequest) -> BrokerResult<Proposal> {
            Ok(Proposal::rejected("not trading"))
        }

        async fn buy_contract(
            &self,
            _request: &ContractRequest,
            _snapshot: SignalSnapshot,
        ) -> BrokerResult<Purchase> {
            unreachable!("tests never buy through this stub")
        }
    }

    fn spec(kind: StrategyKind) -> BotSpec {
        let mut spec = BotSpec::new(BrokerKind::Deriv, kind, "R_10", Timeframe::M1);
        spec.stake = Decimal::new(5, 0);
        spec
    }

    #[test]
    fn registry_builds_every_builtin() {
        let trader: Arc<dyn ContractTrader> = Arc::new(NoTrade);
        let ema = build_strategy(&spec(StrategyKind::TripleEma), trader.clone()).unwrap();
        assert_eq!(ema.name(), "triple-ema");

        // Reversal requires a supporting feed declaration.
        let mut rev_spec = spec(StrategyKind::Reversal);
        rev_spec.supporting = vec![wick_core::FeedSelector {
            symbol: None,
            timeframe: Timeframe::M5,
        }];
        let reversal = build_strategy(&rev_spec, trader).unwrap();
        assert_eq!(reversal.name(), "reversal");
    }

    #[test]
    fn bad_params_are_rejected_at_build_time() {
        let mut spec = spec(StrategyKind::TripleEma);
        spec.params = serde_json::json!({"fast_period": "not-a-number"});
        let trader: Arc<dyn ContractTrader> = Arc::new(NoTrade);
        let err = build_strategy(&spec, trader).unwrap_err();
        assert!(matches!(err, StrategyError::InvalidParameter(_)));
    }

    #[test]
    fn template_carries_the_bot_contract_settings() {
        let spec = spec(StrategyKind::TripleEma);
        let request = request_template(&spec, ContractType::PutE);
        assert_eq!(request.symbol, "R_10");
        assert_eq!(request.amount, Decimal::new(5, 0));
        assert_eq!(request.contract_type, ContractType::PutE);
        assert_eq!(request.duration, 120);
    }
}
