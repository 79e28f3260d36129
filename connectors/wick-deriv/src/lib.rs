//! Deriv WebSocket connector.
//!
//! Implements the wick broker traits over Deriv's JSON API: candles come
//! from `ticks_history` with a streaming subscription, purchases run the
//! `proposal` then `buy` sequence, settlement arrives through
//! `proposal_open_contract` pushes, and reconciliation reads `statement`.

mod socket;
mod wire;

use std::fmt;
use std::sync::Mutex as StateLock;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use wick_broker::{
    classify_settlement, AccountHistory, BarStream, BrokerClient, BrokerError, BrokerResult,
    ContractTrader, MarketData, OrderUpdates, Proposal, Purchase, StatementTransaction,
};
use wick_core::{BinaryOrder, ContractRequest, OrderResult, SignalSnapshot, Timeframe};
use wick_store::OrderLog;

use crate::socket::{ConnHandle, Connection};

/// Public demo application id usable without registration.
pub const DEFAULT_APP_ID: &str = "1089";
/// Production WebSocket endpoint, without the app id query.
pub const DEFAULT_ENDPOINT: &str = "wss://ws.derivws.com/websockets/v3";

/// Connection settings for one Deriv account.
#[derive(Clone, Debug)]
pub struct DerivConfig {
    pub endpoint: String,
    pub app_id: String,
    /// API token; market data works without one, trading and statement
    /// access do not.
    pub api_token: Option<String>,
    /// Deadline for any single request, connection probes included.
    pub request_timeout: Duration,
    /// How many times `connect` dials before giving up.
    pub connect_attempts: u32,
    /// Fixed pause between failed connection attempts.
    pub connect_backoff: Duration,
    /// Application-level ping cadence keeping the socket warm.
    pub heartbeat_interval: Duration,
}

impl Default for DerivConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            app_id: DEFAULT_APP_ID.to_string(),
            api_token: None,
            request_timeout: Duration::from_secs(4),
            connect_attempts: 3,
            connect_backoff: Duration::from_secs(3),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

impl DerivConfig {
    #[must_use]
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    /// Full URL with the app id attached.
    #[must_use]
    pub fn url(&self) -> String {
        format!("{}?app_id={}", self.endpoint, self.app_id)
    }
}

/// Where the connection stands in its startup sequence.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Socket answers application pings but is not yet authorized.
    PingVerified,
    Authorizing,
    Ready,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::PingVerified => "ping-verified",
            Self::Authorizing => "authorizing",
            Self::Ready => "ready",
        };
        f.write_str(label)
    }
}

/// One Deriv account connection implementing the broker traits.
///
/// `connect` must succeed before any other call; requests issued without a
/// connection fail with a transport error instead of dialing implicitly.
pub struct DerivClient {
    config: DerivConfig,
    order_log: Option<OrderLog>,
    connection: Mutex<Option<Connection>>,
    state: StateLock<ConnectionState>,
}

impl DerivClient {
    #[must_use]
    pub fn new(config: DerivConfig, order_log: OrderLog) -> Self {
        Self {
            config,
            order_log: Some(order_log),
            connection: Mutex::new(None),
            state: StateLock::new(ConnectionState::Disconnected),
        }
    }

    /// Connection for account-level work (statement pulls, reconciliation)
    /// that belongs to no bot. It has nowhere to journal purchases, so
    /// trading calls through it are refused.
    #[must_use]
    pub fn account_only(config: DerivConfig) -> Self {
        Self {
            config,
            order_log: None,
            connection: Mutex::new(None),
            state: StateLock::new(ConnectionState::Disconnected),
        }
    }

    /// Current startup state, for logs and supervision.
    pub fn state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|guard| *guard)
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// The order timeline this client writes purchases and settlements to,
    /// absent on [`DerivClient::account_only`] connections.
    #[must_use]
    pub fn order_log(&self) -> Option<&OrderLog> {
        self.order_log.as_ref()
    }

    fn set_state(&self, next: ConnectionState) {
        if let Ok(mut guard) = self.state.lock() {
            *guard = next;
        }
    }

    async fn handle(&self) -> BrokerResult<ConnHandle> {
        let guard = self.connection.lock().await;
        guard
            .as_ref()
            .map(Connection::handle)
            .ok_or_else(|| BrokerError::Transport("not connected".to_string()))
    }

    async fn request(&self, payload: Value) -> BrokerResult<Value> {
        let handle = self.handle().await?;
        handle.request(payload, self.config.request_timeout).await
    }

    /// One full dial: open the socket, prove it answers an application
    /// ping, then authorize when a token is configured. Dropping the
    /// half-built connection on any failure closes its socket.
    async fn establish(&self) -> BrokerResult<Connection> {
        self.set_state(ConnectionState::Connecting);
        let connection = Connection::open(&self.config).await?;
        let handle = connection.handle();
        handle.ping(self.config.request_timeout).await?;
        self.set_state(ConnectionState::PingVerified);
        if let Some(token) = &self.config.api_token {
            self.set_state(ConnectionState::Authorizing);
            let response = handle.authorize(token, self.config.request_timeout).await?;
            let login_id = response
                .get("authorize")
                .and_then(|a| a.get("loginid"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            info!(login_id, "authorized");
        }
        self.set_state(ConnectionState::Ready);
        Ok(connection)
    }

    /// Subscribes to the contract's status pushes and spawns the tracker
    /// that follows it to settlement.
    async fn follow_contract(
        &self,
        contract_id: i64,
        order: BinaryOrder,
        log: OrderLog,
        updates: mpsc::Sender<BinaryOrder>,
    ) -> BrokerResult<()> {
        let handle = self.handle().await?;
        let (first, pushes) = handle
            .subscribe(
                json!({
                    "proposal_open_contract": 1,
                    "contract_id": contract_id,
                    "subscribe": 1,
                }),
                self.config.request_timeout,
            )
            .await?;
        let tracker = ContractTracker {
            order,
            log,
            updates,
            subscription_id: None,
        };
        tokio::spawn(track_contract(
            handle,
            first,
            pushes,
            tracker,
            self.config.request_timeout,
        ));
        Ok(())
    }
}

#[async_trait]
impl MarketData for DerivClient {
    async fn subscribe_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        history: usize,
    ) -> BrokerResult<BarStream> {
        let handle = self.handle().await?;
        let request = json!({
            "ticks_history": symbol,
            "style": "candles",
            "granularity": timeframe.as_secs(),
            "count": history,
            "end": "latest",
            "adjust_start_time": 1,
            "subscribe": 1,
        });
        let (first, mut pushes) = handle
            .subscribe(request, self.config.request_timeout)
            .await?;
        let bars = wire::parse_candle_history(&first)?;
        info!(symbol, timeframe = %timeframe, bars = bars.len(), "candle subscription open");

        let (tx, stream) = BarStream::channel(16);
        tokio::spawn(async move {
            // History is the first batch on the same stream as the live
            // pushes that follow it.
            if tx.send(Ok(bars)).await.is_err() {
                return;
            }
            while let Some(frame) = pushes.recv().await {
                let item = match wire::parse_ohlc_push(&frame) {
                    Ok(Some(bar)) => Ok(vec![bar]),
                    Ok(None) => continue,
                    Err(err) => Err(err),
                };
                let undecodable = item.is_err();
                if tx.send(item).await.is_err() || undecodable {
                    break;
                }
            }
        });
        Ok(stream)
    }
}

#[async_trait]
impl ContractTrader for DerivClient {
    async fn propose(&self, request: &ContractRequest) -> BrokerResult<Proposal> {
        let payload = json!({
            "proposal": 1,
            "amount": request.amount.to_f64().unwrap_or_default(),
            "basis": request.basis.code(),
            "contract_type": request.contract_type.code(),
            "currency": request.currency,
            "duration": request.duration,
            "duration_unit": request.duration_unit.code(),
            "symbol": request.symbol,
        });
        match self.request(payload).await {
            Ok(frame) => wire::parse_proposal(&frame),
            Err(BrokerError::Exchange { message, .. }) => Ok(Proposal::rejected(message)),
            Err(err) => Err(err),
        }
    }

    async fn buy_contract(
        &self,
        request: &ContractRequest,
        snapshot: SignalSnapshot,
    ) -> BrokerResult<Purchase> {
        let Some(log) = &self.order_log else {
            return Err(BrokerError::InvalidRequest(
                "account-only client cannot buy contracts".to_string(),
            ));
        };
        let proposal = self.propose(request).await?;
        if proposal.is_rejected() {
            let reason = proposal
                .message
                .clone()
                .unwrap_or_else(|| "proposal rejected".to_string());
            warn!(symbol = %request.symbol, contract = %request.contract_type, %reason, "proposal rejected; skipping buy");
            let order = BinaryOrder::failed(request, snapshot, reason);
            log.upsert(order.clone());
            let (tx, updates) = OrderUpdates::channel(1);
            let _ = tx.try_send(order.clone());
            return Ok(Purchase { order, updates });
        }

        let frame = self
            .request(json!({
                "buy": proposal.id,
                "price": proposal.ask_price.to_f64().unwrap_or_default(),
            }))
            .await?;
        let receipt = wire::parse_buy(&frame)?;
        let order = BinaryOrder::pending(
            request,
            receipt.contract_id.to_string(),
            receipt.payout.or(proposal.payout),
            receipt.start_time,
            snapshot,
        );
        log.upsert(order.clone());
        info!(
            order_id = %order.order_id,
            symbol = %request.symbol,
            contract = %request.contract_type,
            price = %receipt.buy_price,
            "contract purchased"
        );

        let (tx, updates) = OrderUpdates::channel(8);
        let _ = tx.try_send(order.clone());
        if let Err(err) = self
            .follow_contract(receipt.contract_id, order.clone(), log.clone(), tx)
            .await
        {
            // The buy went through; the order stays pending in the log and
            // reconciliation will settle it from the statement.
            warn!(order_id = %order.order_id, error = %err, "could not follow contract to settlement");
        }
        Ok(Purchase { order, updates })
    }
}

#[async_trait]
impl AccountHistory for DerivClient {
    async fn statement(&self, limit: u32) -> BrokerResult<Vec<StatementTransaction>> {
        if self.config.api_token.is_none() {
            return Err(BrokerError::Authentication(
                "statement requires an api token".to_string(),
            ));
        }
        let frame = self
            .request(json!({ "statement": 1, "description": 1, "limit": limit }))
            .await?;
        wire::parse_statement(&frame)
    }
}

#[async_trait]
impl BrokerClient for DerivClient {
    fn name(&self) -> &str {
        "deriv"
    }

    async fn connect(&self) -> BrokerResult<()> {
        let mut guard = self.connection.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let attempts = self.config.connect_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.establish().await {
                Ok(connection) => {
                    info!(attempt, endpoint = %self.config.endpoint, "deriv connection ready");
                    *guard = Some(connection);
                    return Ok(());
                }
                Err(err) => {
                    warn!(attempt, error = %err, "connection attempt failed");
                    self.set_state(ConnectionState::Disconnected);
                    last_error = Some(err);
                    if attempt < attempts {
                        tokio::time::sleep(self.config.connect_backoff).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| BrokerError::Other("connect never ran".to_string())))
    }

    async fn disconnect(&self) {
        let mut guard = self.connection.lock().await;
        if let Some(connection) = guard.take() {
            connection.shutdown().await;
        }
        self.set_state(ConnectionState::Disconnected);
    }
}

/// Follows one purchased contract through its status pushes.
struct ContractTracker {
    order: BinaryOrder,
    log: OrderLog,
    updates: mpsc::Sender<BinaryOrder>,
    subscription_id: Option<String>,
}

impl ContractTracker {
    /// Applies one frame. Returns true once the contract settled.
    fn apply(&mut self, frame: &Value) -> bool {
        let update = match wire::parse_contract_update(frame) {
            Ok(Some(update)) => update,
            Ok(None) => return false,
            Err(err) => {
                debug!(error = %err, "skipping undecodable contract frame");
                return false;
            }
        };
        if update.subscription_id.is_some() {
            self.subscription_id = update.subscription_id;
        }
        if !update.is_sold {
            return false;
        }
        let result = match update.status.as_str() {
            "won" => OrderResult::Win,
            "lost" => OrderResult::Loss,
            // Sold early or expired without a verdict: classify by the
            // amount credited against the payout that was on offer.
            _ => classify_settlement(
                update.sell_price.unwrap_or_default(),
                self.order.expected_payout,
                None,
            ),
        };
        self.order.settle(result, update.sell_price);
        self.log.upsert(self.order.clone());
        let _ = self.updates.try_send(self.order.clone());
        info!(order_id = %self.order.order_id, outcome = %result, "contract settled");
        true
    }
}

async fn track_contract(
    handle: ConnHandle,
    first: Value,
    mut pushes: mpsc::UnboundedReceiver<Value>,
    mut tracker: ContractTracker,
    timeout: Duration,
) {
    let mut settled = tracker.apply(&first);
    while !settled {
        let Some(frame) = pushes.recv().await else {
            warn!(order_id = %tracker.order.order_id, "contract updates ended before settlement");
            break;
        };
        settled = tracker.apply(&frame);
    }
    if let Some(id) = tracker.subscription_id.take() {
        if let Err(err) = handle.forget(&id, timeout).await {
            debug!(error = %err, "forget after settlement failed");
        }
    }
}
