//! Whole-engine flows: a trending market in, settled orders out.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rust_decimal::Decimal;
use serde_json::json;
use tokio::time::{sleep, timeout};

use wick_broker::BrokerClient;
use wick_core::{
    BotSpec, BrokerKind, OrderResult, OrderStatus, RunLogKind, StrategyKind, Timeframe,
};
use wick_deriv::{DerivClient, DerivConfig};
use wick_engine::{EngineSettings, Reconciler, StartReply, Supervisor, SupervisorHandle};
use wick_store::{BotStore, OrderStore, SqliteStore};
use wick_test_utils::{candle, contract_snapshot, sell_row, MockDerivServer};

const WAIT: Duration = Duration::from_secs(5);

fn settings(url: &str) -> EngineSettings {
    EngineSettings {
        deriv: DerivConfig {
            endpoint: url.to_string(),
            app_id: "1089".to_string(),
            api_token: None,
            request_timeout: Duration::from_millis(300),
            connect_attempts: 1,
            connect_backoff: Duration::from_millis(50),
            heartbeat_interval: Duration::from_secs(120),
        },
        history_bars: 20,
        order_flush_interval: Duration::from_millis(100),
        reconcile_interval: Duration::from_secs(60),
        statement_page_size: 99,
    }
}

/// Steadily rising closes: with short EMA periods the alignment holds on
/// the very first evaluation.
fn rising_market(count: i64) -> Vec<serde_json::Value> {
    (1..=count)
        .map(|i| {
            let close = 1.0 + i as f64 * 0.05;
            candle(i * 60, close - 0.01, close + 0.01, close - 0.02, close)
        })
        .collect()
}

fn eager_spec() -> BotSpec {
    let mut spec = BotSpec::new(
        BrokerKind::Deriv,
        StrategyKind::TripleEma,
        "R_10",
        Timeframe::M1,
    );
    spec.params = json!({ "fast_period": 3, "medium_period": 5, "slow_period": 8 });
    spec
}

async fn drained(handle: &SupervisorHandle) -> Result<()> {
    timeout(WAIT, async {
        loop {
            if handle.status().await?.is_empty() {
                return anyhow::Ok(());
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await??;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn a_trend_becomes_a_settled_order_in_the_store() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let server = MockDerivServer::spawn().await?;
    let state = server.state();
    state.set_candles("R_10", 60, rising_market(12)).await;
    state.set_proposal("prop-42", 5.5, 10.69).await;
    state.set_buy(880_001, 5.5, 10.69, 1_700_000_000).await;
    state
        .script_contract_updates(vec![
            contract_snapshot(880_001, "open", false, None),
            contract_snapshot(880_001, "won", true, Some(10.69)),
        ])
        .await;

    let store = Arc::new(SqliteStore::open_in_memory()?);
    let (supervisor, handle) = Supervisor::new(settings(&server.ws_url()), Arc::clone(&store));
    let task = tokio::spawn(supervisor.run());

    let spec = eager_spec();
    let bot_id = spec.bot_id.clone();
    let key = spec.key();
    assert_eq!(handle.start_bot(spec).await?, StartReply::Accepted);

    // The history batch already carries the trend, so the strategy fires
    // without waiting for a live push; the settled order reaches the
    // store on the next flush.
    let order = timeout(WAIT, async {
        loop {
            if let Some(record) = store
                .orders_for_bot(&bot_id)?
                .into_iter()
                .find(|record| record.order.status == OrderStatus::Completed)
            {
                return anyhow::Ok(record);
            }
            sleep(Duration::from_millis(25)).await;
        }
    })
    .await??;

    assert_eq!(order.order.order_id, "880001");
    assert_eq!(order.order.result, Some(OrderResult::Win));
    assert_eq!(order.order.actual_payout, Some(Decimal::new(1069, 2)));
    assert_eq!(order.key, key);
    assert_eq!(state.buy_count().await, 1);

    assert!(handle.stop_bot(key).await?);
    drained(&handle).await?;

    let log = store.run_log(&bot_id)?;
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].kind, RunLogKind::Start);
    assert_eq!(log[1].kind, RunLogKind::Stop);
    assert!(log[1].error.is_none());

    drop(handle);
    timeout(WAIT, task).await??;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn reconciliation_settles_what_the_stream_missed() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let server = MockDerivServer::spawn().await?;
    let state = server.state();
    state.set_candles("R_10", 60, rising_market(12)).await;
    state.set_proposal("prop-43", 5.5, 10.69).await;
    state.set_buy(880_002, 5.5, 10.69, 1_700_000_000).await;
    // The contract stream never delivers a verdict; only the statement
    // knows how this one ended.
    state
        .script_contract_updates(vec![contract_snapshot(880_002, "open", false, None)])
        .await;
    state
        .set_statement(vec![sell_row(880_002, 10.69, 10.69, 1_700_000_400)])
        .await;

    let store = Arc::new(SqliteStore::open_in_memory()?);
    let engine_settings = settings(&server.ws_url());
    let (supervisor, handle) =
        Supervisor::new(engine_settings.clone(), Arc::clone(&store));
    let task = tokio::spawn(supervisor.run());

    let spec = eager_spec();
    let key = spec.key();
    assert_eq!(handle.start_bot(spec).await?, StartReply::Accepted);

    timeout(WAIT, async {
        loop {
            if state.buy_count().await == 1 {
                return anyhow::Ok(());
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await??;

    // Stopping flushes the still-pending order to the store.
    assert!(handle.stop_bot(key).await?);
    drained(&handle).await?;
    let pending = store.pending_orders()?;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].order_id(), "880002");

    // A later process picks it up from the statement.
    let client = Arc::new(DerivClient::account_only(
        engine_settings.deriv.with_token("statement-token"),
    ));
    client.connect().await?;
    let reconciler = Reconciler::new(client.clone(), Arc::clone(&store), 99);
    assert_eq!(reconciler.pass().await?, 1);
    client.disconnect().await;

    let settled = store.order("880002")?.unwrap();
    assert_eq!(settled.order.status, OrderStatus::Completed);
    assert_eq!(settled.order.result, Some(OrderResult::Win));
    assert_eq!(settled.order.actual_payout, Some(Decimal::new(1069, 2)));
    assert!(store.pending_orders()?.is_empty());

    drop(handle);
    timeout(WAIT, task).await??;
    Ok(())
}
