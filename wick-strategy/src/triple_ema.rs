//! Trend-following strategy stacking three EMAs on the main feed.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use wick_broker::ContractTrader;
use wick_core::{Bar, BotSpec, ContractType, OrderStatus};
use wick_feed::FeedSet;

use crate::{indicators, request_template, Strategy, StrategyError, StrategyResult};

/// Parameter overrides for [`TripleEma`].
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TripleEmaParams {
    pub fast_period: usize,
    pub medium_period: usize,
    pub slow_period: usize,
}

impl Default for TripleEmaParams {
    fn default() -> Self {
        Self {
            fast_period: 5,
            medium_period: 13,
            slow_period: 21,
        }
    }
}

impl TripleEmaParams {
    fn validate(&self) -> StrategyResult<()> {
        if self.fast_period == 0 {
            return Err(StrategyError::InvalidParameter(
                "fast_period must be greater than zero".into(),
            ));
        }
        if self.fast_period >= self.medium_period || self.medium_period >= self.slow_period {
            return Err(StrategyError::InvalidParameter(format!(
                "periods must be strictly increasing (got {}/{}/{})",
                self.fast_period, self.medium_period, self.slow_period
            )));
        }
        Ok(())
    }
}

/// Buys a rise contract when the three EMAs stack bullishly under the
/// close, a fall contract when they stack bearishly above it. At most one
/// purchase per bar bucket.
#[derive(Debug)]
pub struct TripleEma {
    params: TripleEmaParams,
    spec: BotSpec,
    trader: Arc<dyn ContractTrader>,
    last_fired_at: Option<i64>,
}

impl TripleEma {
    pub fn from_spec(spec: &BotSpec, trader: Arc<dyn ContractTrader>) -> StrategyResult<Self> {
        let params: TripleEmaParams = crate::parse_params(spec)?;
        params.validate()?;
        Ok(Self {
            params,
            spec: spec.clone(),
            trader,
            last_fired_at: None,
        })
    }

    fn evaluate(&self, closes: &[f64]) -> StrategyResult<Option<(ContractType, f64, f64, f64)>> {
        let needed = self.params.slow_period;
        if closes.len() < needed {
            return Err(StrategyError::NotReady(format!(
                "need {needed} closes, have {}",
                closes.len()
            )));
        }
        let fast = last_value(indicators::ema(closes, self.params.fast_period))?;
        let medium = last_value(indicators::ema(closes, self.params.medium_period))?;
        let slow = last_value(indicators::ema(closes, self.params.slow_period))?;
        let close = closes[closes.len() - 1];

        let direction = if fast > medium && medium > slow && close > fast {
            Some(ContractType::CallE)
        } else if fast < medium && medium < slow && close < fast {
            Some(ContractType::PutE)
        } else {
            None
        };
        Ok(direction.map(|d| (d, fast, medium, slow)))
    }
}

#[async_trait]
impl Strategy for TripleEma {
    fn name(&self) -> &str {
        "triple-ema"
    }

    async fn next(&mut self, feeds: &FeedSet, _batch: &[Bar]) -> StrategyResult<()> {
        let series = feeds
            .main()
            .ok_or_else(|| StrategyError::State("main feed series missing".into()))?;
        let closes = series.closes(None);
        let Some(latest) = series.latest_bar() else {
            return Err(StrategyError::NotReady("no bars yet".into()));
        };

        let Some((contract_type, fast, medium, slow)) = self.evaluate(&closes)? else {
            return Ok(());
        };
        if self.last_fired_at == Some(latest.timestamp) {
            return Ok(());
        }
        self.last_fired_at = Some(latest.timestamp);

        let request = request_template(&self.spec, contract_type);
        let snapshot = json!({
            "strategy": self.name(),
            "contract_type": contract_type.code(),
            "close": latest.close,
            "fast_ema": fast,
            "medium_ema": medium,
            "slow_ema": slow,
            "bar_timestamp": latest.timestamp,
        });

        match self.trader.buy_contract(&request, snapshot).await {
            Ok(purchase) if purchase.order.status == OrderStatus::Failed => {
                warn!(
                    strategy = self.name(),
                    symbol = %request.symbol,
                    message = purchase.order.message.as_deref().unwrap_or("unknown"),
                    "purchase rejected"
                );
            }
            Ok(purchase) => {
                info!(
                    strategy = self.name(),
                    symbol = %request.symbol,
                    order_id = %purchase.order.order_id,
                    contract = %contract_type,
                    "contract purchased"
                );
            }
            Err(err) => {
                warn!(
                    strategy = self.name(),
                    symbol = %request.symbol,
                    error = %err,
                    "purchase attempt failed"
                );
            }
        }
        Ok(())
    }
}

fn last_value(series: Option<Vec<f64>>) -> StrategyResult<f64> {
    series
        .and_then(|values| values.last().copied())
        .ok_or_else(|| StrategyError::NotReady("indicator window not filled".into()))
}
