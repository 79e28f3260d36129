//! End-to-end connector tests against the in-process mock Deriv API.

use std::time::Duration;

use anyhow::Result;
use rust_decimal::Decimal;
use serde_json::json;
use tokio::time::timeout;

use wick_broker::{AccountHistory, BrokerClient, BrokerError, ContractTrader, MarketData};
use wick_core::{
    BotSpec, BrokerKind, ContractRequest, ContractType, OrderResult, OrderStatus, StrategyKind,
    Timeframe,
};
use wick_deriv::{ConnectionState, DerivClient, DerivConfig};
use wick_store::OrderLog;
use wick_test_utils::{candle, contract_snapshot, ohlc, MockDerivServer};

const WAIT: Duration = Duration::from_secs(5);

fn config(url: &str) -> DerivConfig {
    DerivConfig {
        endpoint: url.to_string(),
        app_id: "1089".to_string(),
        api_token: None,
        request_timeout: Duration::from_millis(300),
        connect_attempts: 3,
        connect_backoff: Duration::from_millis(50),
        heartbeat_interval: Duration::from_secs(120),
    }
}

fn order_log() -> OrderLog {
    let spec = BotSpec::new(
        BrokerKind::Deriv,
        StrategyKind::TripleEma,
        "R_10",
        Timeframe::M1,
    );
    OrderLog::new(spec.bot_id.clone(), spec.key())
}

fn request() -> ContractRequest {
    ContractRequest::new("R_10", ContractType::CallE, Decimal::new(55, 1))
}

#[tokio::test(flavor = "multi_thread")]
async fn connect_probes_and_authorizes() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let server = MockDerivServer::spawn().await?;
    let client = DerivClient::new(
        config(&server.ws_url()).with_token("test-token"),
        order_log(),
    );

    client.connect().await?;
    assert_eq!(client.state(), ConnectionState::Ready);
    assert_eq!(server.state().connection_count().await, 1);

    // A second connect against a live connection is a no-op.
    client.connect().await?;
    assert_eq!(server.state().connection_count().await, 1);

    client.disconnect().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn connect_gives_up_when_probes_never_answer() -> Result<()> {
    let server = MockDerivServer::spawn().await?;
    server.state().drop_pings(3).await;
    let client = DerivClient::new(config(&server.ws_url()), order_log());

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, BrokerError::Timeout(_)), "got {err:?}");
    assert_eq!(client.state(), ConnectionState::Disconnected);
    // One fresh dial per attempt.
    assert_eq!(server.state().connection_count().await, 3);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn connect_recovers_on_a_later_attempt() -> Result<()> {
    let server = MockDerivServer::spawn().await?;
    server.state().drop_pings(1).await;
    let client = DerivClient::new(config(&server.ws_url()), order_log());

    client.connect().await?;
    assert_eq!(client.state(), ConnectionState::Ready);
    assert_eq!(server.state().connection_count().await, 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_authorization_is_fatal() -> Result<()> {
    let server = MockDerivServer::spawn().await?;
    server.state().reject_authorize().await;
    let client = DerivClient::new(config(&server.ws_url()).with_token("bad-token"), order_log());

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, BrokerError::Authentication(_)), "got {err:?}");
    assert_eq!(client.state(), ConnectionState::Disconnected);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn bars_arrive_as_history_then_live_pushes() -> Result<()> {
    let server = MockDerivServer::spawn().await?;
    server
        .state()
        .set_candles(
            "R_10",
            60,
            vec![
                candle(60, 1.0, 1.2, 0.9, 1.1),
                candle(120, 1.1, 1.3, 1.0, 1.2),
                candle(180, 1.2, 1.4, 1.1, 1.3),
            ],
        )
        .await;
    let client = DerivClient::new(config(&server.ws_url()), order_log());
    client.connect().await?;

    let mut stream = client.subscribe_bars("R_10", Timeframe::M1, 500).await?;
    let history = timeout(WAIT, stream.recv()).await?.unwrap()?;
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].timestamp, 60_000);
    assert_eq!(history[2].close, 1.3);

    assert!(server.state().push_ohlc("R_10", 60, ohlc(240, 1.3, 1.5, 1.2, 1.4)).await);
    let live = timeout(WAIT, stream.recv()).await?.unwrap()?;
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].timestamp, 240_000);
    assert_eq!(live[0].close, 1.4);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_proposal_fails_the_order_without_buying() -> Result<()> {
    let server = MockDerivServer::spawn().await?;
    server
        .state()
        .reject_proposal("Trading is not offered for this asset.")
        .await;
    let log = order_log();
    let client = DerivClient::new(
        config(&server.ws_url()).with_token("test-token"),
        log.clone(),
    );
    client.connect().await?;

    let purchase = client
        .buy_contract(&request(), json!({ "signal": "rise" }))
        .await?;
    assert_eq!(purchase.order.status, OrderStatus::Failed);
    assert!(purchase.order.order_id.is_empty());
    assert_eq!(
        purchase.order.message.as_deref(),
        Some("Trading is not offered for this asset.")
    );
    assert_eq!(server.state().buy_count().await, 0);

    let records = log.orders();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].order.status, OrderStatus::Failed);

    // The updates stream carries the failed order and then closes.
    let last = timeout(WAIT, purchase.updates.last()).await?;
    assert_eq!(last.unwrap().status, OrderStatus::Failed);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn purchase_follows_the_contract_to_settlement() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let server = MockDerivServer::spawn().await?;
    server
        .state()
        .script_contract_updates(vec![
            contract_snapshot(99_000_001, "open", false, None),
            contract_snapshot(99_000_001, "won", true, Some(10.69)),
        ])
        .await;
    let log = order_log();
    let client = DerivClient::new(
        config(&server.ws_url()).with_token("test-token"),
        log.clone(),
    );
    client.connect().await?;

    let purchase = client
        .buy_contract(&request(), json!({ "signal": "rise" }))
        .await?;
    assert_eq!(purchase.order.status, OrderStatus::Pending);
    assert_eq!(purchase.order.order_id, "99000001");
    assert_eq!(purchase.order.expected_payout, Some(Decimal::new(1069, 2)));
    assert_eq!(server.state().buy_count().await, 1);

    let settled = timeout(WAIT, purchase.updates.last()).await?.unwrap();
    assert_eq!(settled.status, OrderStatus::Completed);
    assert_eq!(settled.result, Some(OrderResult::Win));
    assert_eq!(settled.actual_payout, Some(Decimal::new(1069, 2)));

    let records = log.orders();
    assert_eq!(records[0].order.status, OrderStatus::Completed);
    // The contract subscription was dropped once the order settled.
    assert_eq!(
        server.state().forgotten().await,
        vec!["contract-sub-99000001".to_string()]
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn a_timed_out_call_leaves_the_connection_usable() -> Result<()> {
    let server = MockDerivServer::spawn().await?;
    server.state().ignore_statement().await;
    let client = DerivClient::new(
        config(&server.ws_url()).with_token("test-token"),
        order_log(),
    );
    client.connect().await?;

    let err = client.statement(10).await.unwrap_err();
    assert!(matches!(err, BrokerError::Timeout(_)), "got {err:?}");

    // The socket stayed up; other requests still work.
    let proposal = client.propose(&request()).await?;
    assert!(!proposal.is_rejected());
    assert_eq!(client.state(), ConnectionState::Ready);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn statement_requires_a_token() -> Result<()> {
    let server = MockDerivServer::spawn().await?;
    let client = DerivClient::new(config(&server.ws_url()), order_log());
    client.connect().await?;

    let err = client.statement(10).await.unwrap_err();
    assert!(matches!(err, BrokerError::Authentication(_)), "got {err:?}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn unmatched_pushes_are_dropped_quietly() -> Result<()> {
    let server = MockDerivServer::spawn().await?;
    server
        .state()
        .set_candles("R_10", 60, vec![candle(60, 1.0, 1.2, 0.9, 1.1)])
        .await;
    let client = DerivClient::new(config(&server.ws_url()), order_log());
    client.connect().await?;

    let mut stream = client.subscribe_bars("R_10", Timeframe::M1, 500).await?;
    let history = timeout(WAIT, stream.recv()).await?.unwrap()?;
    assert_eq!(history.len(), 1);

    // A contract push for a subscription this client never made.
    assert!(
        server
            .state()
            .push_unmatched(json!({
                "msg_type": "proposal_open_contract",
                "proposal_open_contract": contract_snapshot(123, "won", true, Some(4.2)),
                "req_id": 9_999,
            }))
            .await
    );

    // The client shrugged it off; the live feed still flows.
    assert!(server.state().push_ohlc("R_10", 60, ohlc(120, 1.1, 1.3, 1.0, 1.2)).await);
    let live = timeout(WAIT, stream.recv()).await?.unwrap()?;
    assert_eq!(live[0].timestamp, 120_000);
    Ok(())
}
