//! Supervisor control protocol against the in-process mock Deriv API.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::time::{sleep, timeout};

use wick_core::{BotSpec, BrokerKind, RunLogKind, StrategyKind, Timeframe};
use wick_deriv::DerivConfig;
use wick_engine::{EngineSettings, StartReply, Supervisor, SupervisorHandle};
use wick_store::{BotStore, SqliteStore};
use wick_test_utils::{candle, MockDerivServer};

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
        history_bars: 10,
        order_flush_interval: Duration::from_millis(100),
        reconcile_interval: Duration::from_secs(60),
        statement_page_size: 99,
    }
}

fn spec() -> BotSpec {
    BotSpec::new(
        BrokerKind::Deriv,
        StrategyKind::TripleEma,
        "R_10",
        Timeframe::M1,
    )
}

/// Flat candles: enough history to run on, never enough trend to trade.
fn quiet_market() -> Vec<serde_json::Value> {
    (1..=10).map(|i| candle(i * 60, 1.0, 1.0, 1.0, 1.0)).collect()
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
async fn start_stop_status_protocol() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let server = MockDerivServer::spawn().await?;
    server.state().set_candles("R_10", 60, quiet_market()).await;

    let store = Arc::new(SqliteStore::open_in_memory()?);
    let (supervisor, handle) = Supervisor::new(settings(&server.ws_url()), Arc::clone(&store));
    let task = tokio::spawn(supervisor.run());

    let spec = spec();
    let key = spec.key();
    let bot_id = spec.bot_id.clone();

    assert_eq!(handle.start_bot(spec.clone()).await?, StartReply::Accepted);
    assert_eq!(
        handle.start_bot(spec.clone()).await?,
        StartReply::AlreadyRunning
    );

    let status = handle.status().await?;
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].bot_id, bot_id);
    assert_eq!(status[0].key, key);

    assert!(handle.stop_bot(key.clone()).await?);
    drained(&handle).await?;
    // Fully reaped now, so a second stop finds nothing.
    assert!(!handle.stop_bot(key.clone()).await?);

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
async fn blank_symbol_is_rejected_before_anything_runs() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let store = Arc::new(SqliteStore::open_in_memory()?);
    // Default settings point at the real endpoint; a rejected spec must
    // never get far enough to dial it.
    let (supervisor, handle) = Supervisor::new(EngineSettings::default(), Arc::clone(&store));
    let task = tokio::spawn(supervisor.run());

    let mut spec = spec();
    spec.symbol = "   ".to_string();
    let bot_id = spec.bot_id.clone();

    match handle.start_bot(spec).await? {
        StartReply::Rejected(reason) => assert!(reason.contains("symbol")),
        other => panic!("expected rejection, got {other:?}"),
    }
    assert!(handle.status().await?.is_empty());
    assert!(store.run_log(&bot_id)?.is_empty());

    drop(handle);
    timeout(WAIT, task).await??;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn doomed_start_is_accepted_then_recorded_as_error() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let server = MockDerivServer::spawn().await?;
    server.state().reject_authorize().await;

    let store = Arc::new(SqliteStore::open_in_memory()?);
    let mut settings = settings(&server.ws_url());
    settings.deriv = settings.deriv.with_token("expired-token");
    let (supervisor, handle) = Supervisor::new(settings, Arc::clone(&store));
    let task = tokio::spawn(supervisor.run());

    let spec = spec();
    let bot_id = spec.bot_id.clone();

    // Accepting a start only promises a worker, not a working bot.
    assert_eq!(handle.start_bot(spec).await?, StartReply::Accepted);
    drained(&handle).await?;

    let log = store.run_log(&bot_id)?;
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].kind, RunLogKind::Start);
    assert_eq!(log[1].kind, RunLogKind::Stop);
    let error = log[1].error.as_deref().unwrap_or_default();
    assert!(error.contains("Token is invalid"), "got {error:?}");

    drop(handle);
    timeout(WAIT, task).await??;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn dropping_every_handle_stops_running_bots() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let server = MockDerivServer::spawn().await?;
    server.state().set_candles("R_10", 60, quiet_market()).await;

    let store = Arc::new(SqliteStore::open_in_memory()?);
    let (supervisor, handle) = Supervisor::new(settings(&server.ws_url()), Arc::clone(&store));
    let task = tokio::spawn(supervisor.run());

    let spec = spec();
    let bot_id = spec.bot_id.clone();
    assert_eq!(handle.start_bot(spec).await?, StartReply::Accepted);

    drop(handle);
    timeout(WAIT, task).await??;

    // The supervisor swept the worker on its way out.
    let log = store.run_log(&bot_id)?;
    assert_eq!(log.len(), 2);
    assert_eq!(log[1].kind, RunLogKind::Stop);
    assert!(log[1].error.is_none());
    Ok(())
}
