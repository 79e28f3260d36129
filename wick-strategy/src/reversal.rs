//! Mean-reversion strategy confirming higher-timeframe exhaustion with
//! main-timeframe momentum.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use wick_broker::ContractTrader;
use wick_core::{Bar, BotSpec, ContractType, FeedKey, OrderStatus};
use wick_feed::FeedSet;

use crate::{indicators, request_template, Strategy, StrategyError, StrategyResult};

/// Parameter overrides for [`Reversal`].
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ReversalParams {
    pub stoch_k_period: usize,
    pub stoch_d_period: usize,
    pub rsi_period: usize,
    pub overbought_k: f64,
    pub oversold_k: f64,
    pub overbought_rsi: f64,
    pub oversold_rsi: f64,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub adx_period: usize,
    pub adx_threshold: f64,
}

impl Default for ReversalParams {
    fn default() -> Self {
        Self {
            stoch_k_period: 14,
            stoch_d_period: 3,
            rsi_period: 14,
            overbought_k: 80.0,
            oversold_k: 20.0,
            overbought_rsi: 70.0,
            oversold_rsi: 30.0,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            adx_period: 14,
            adx_threshold: 25.0,
        }
    }
}

impl ReversalParams {
    fn validate(&self) -> StrategyResult<()> {
        let periods = [
            self.stoch_k_period,
            self.stoch_d_period,
            self.rsi_period,
            self.macd_fast,
            self.macd_signal,
            self.adx_period,
        ];
        if periods.contains(&0) {
            return Err(StrategyError::InvalidParameter(
                "indicator periods must be greater than zero".into(),
            ));
        }
        if self.macd_slow <= self.macd_fast {
            return Err(StrategyError::InvalidParameter(format!(
                "macd_slow must exceed macd_fast (got {}/{})",
                self.macd_fast, self.macd_slow
            )));
        }
        Ok(())
    }
}

/// Watches a higher timeframe for stochastic/RSI exhaustion and fades it
/// once main-timeframe MACD momentum and ADX trend strength agree.
#[derive(Debug)]
pub struct Reversal {
    params: ReversalParams,
    spec: BotSpec,
    supporting: FeedKey,
    trader: Arc<dyn ContractTrader>,
    last_fired_at: Option<i64>,
}

impl Reversal {
    pub fn from_spec(spec: &BotSpec, trader: Arc<dyn ContractTrader>) -> StrategyResult<Self> {
        let params: ReversalParams = crate::parse_params(spec)?;
        params.validate()?;
        let supporting = spec.supporting_feeds().into_iter().next().ok_or_else(|| {
            StrategyError::InvalidParameter(
                "reversal requires one supporting feed at a higher timeframe".into(),
            )
        })?;
        Ok(Self {
            params,
            spec: spec.clone(),
            supporting,
            trader,
            last_fired_at: None,
        })
    }

    fn evaluate(&self, feeds: &FeedSet) -> StrategyResult<Option<(ContractType, Evaluation)>> {
        let higher = feeds.get(&self.supporting).ok_or_else(|| {
            StrategyError::State(format!("supporting feed {} missing", self.supporting))
        })?;
        let main = feeds
            .main()
            .ok_or_else(|| StrategyError::State("main feed series missing".into()))?;

        let higher_bars = higher.bars(None);
        let stoch = indicators::stochastic(
            &higher_bars,
            self.params.stoch_k_period,
            self.params.stoch_d_period,
        )
        .and_then(|points| points.last().copied())
        .ok_or_else(|| {
            StrategyError::NotReady(format!(
                "supporting feed {} lacks stochastic history ({} bars)",
                self.supporting,
                higher_bars.len()
            ))
        })?;

        let higher_closes: Vec<f64> = higher_bars.iter().map(|bar| bar.close).collect();
        let rsi = indicators::rsi(&higher_closes, self.params.rsi_period)
            .and_then(|values| values.last().copied())
            .ok_or_else(|| {
                StrategyError::NotReady(format!(
                    "supporting feed {} lacks RSI history",
                    self.supporting
                ))
            })?;

        let main_bars = main.bars(None);
        let main_closes: Vec<f64> = main_bars.iter().map(|bar| bar.close).collect();
        let macd = indicators::macd(
            &main_closes,
            self.params.macd_fast,
            self.params.macd_slow,
            self.params.macd_signal,
        )
        .and_then(|points| points.last().copied())
        .ok_or_else(|| {
            StrategyError::NotReady(format!(
                "main feed lacks MACD history ({} bars)",
                main_bars.len()
            ))
        })?;

        let adx = indicators::adx(&main_bars, self.params.adx_period)
            .and_then(|values| values.last().copied())
            .ok_or_else(|| StrategyError::NotReady("main feed lacks ADX history".into()))?;

        let evaluation = Evaluation {
            stoch_k: stoch.k,
            stoch_d: stoch.d,
            rsi,
            macd_histogram: macd.histogram,
            adx,
        };

        let overbought =
            stoch.k > self.params.overbought_k && rsi > self.params.overbought_rsi;
        let oversold = stoch.k < self.params.oversold_k && rsi < self.params.oversold_rsi;
        let trending = adx > self.params.adx_threshold;

        let direction = if overbought && macd.histogram < 0.0 && trending {
            Some(ContractType::PutE)
        } else if oversold && macd.histogram > 0.0 && trending {
            Some(ContractType::CallE)
        } else {
            None
        };
        Ok(direction.map(|d| (d, evaluation)))
    }
}

struct Evaluation {
    stoch_k: f64,
    stoch_d: f64,
    rsi: f64,
    macd_histogram: f64,
    adx: f64,
}

#[async_trait]
impl Strategy for Reversal {
    fn name(&self) -> &str {
        "reversal"
    }

    async fn next(&mut self, feeds: &FeedSet, _batch: &[Bar]) -> StrategyResult<()> {
        let Some(latest) = feeds.main().and_then(|series| series.latest_bar()) else {
            return Err(StrategyError::NotReady("no bars yet".into()));
        };

        let Some((contract_type, evaluation)) = self.evaluate(feeds)? else {
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
            "stoch_k": evaluation.stoch_k,
            "stoch_d": evaluation.stoch_d,
            "rsi": evaluation.rsi,
            "macd_histogram": evaluation.macd_histogram,
            "adx": evaluation.adx,
            "supporting_feed": self.supporting.to_string(),
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
