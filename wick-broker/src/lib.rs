//! Broker-agnostic traits used by the rest of the workspace.
//!
//! Connectors translate one broker's wire protocol into these shapes; the
//! engine, feeds and strategies never see anything broker specific.

use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use wick_core::{Bar, BinaryOrder, ContractRequest, OrderResult, SignalSnapshot, Timeframe};

/// Convenience alias for broker results.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Common error type returned by broker implementations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Transport-level failures (socket closed, connect refused, etc.).
    #[error("transport error: {0}")]
    Transport(String),
    /// A request that received no reply within its deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// Authentication failed or required credentials are missing.
    #[error("authentication failed: {0}")]
    Authentication(String),
    /// The request parameters are invalid for the target broker.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Broker replied with an in-band business error.
    #[error("broker error {code}: {message}")]
    Exchange { code: String, message: String },
    /// Wraps serialization or parsing errors.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// A catch-all branch for other issues.
    #[error("unexpected error: {0}")]
    Other(String),
}

impl BrokerError {
    /// Shorthand for transport errors built from any displayable source.
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    /// Shorthand for parse failures on broker payloads.
    pub fn malformed(context: impl std::fmt::Display) -> Self {
        Self::Serialization(format!("malformed broker payload: {context}"))
    }
}

/// A batch of bars delivered in one feed event. The first batch after a
/// subscription carries history; later batches carry live updates.
pub type BarBatch = Vec<Bar>;

/// Receiving half of one bar subscription.
///
/// The stream ends (returns `None`) when the underlying connection goes
/// away; an `Err` item reports a payload the connector could not decode.
pub struct BarStream {
    rx: mpsc::Receiver<BrokerResult<BarBatch>>,
}

impl BarStream {
    /// Build a connected channel pair with the conventional small buffer.
    #[must_use]
    pub fn channel(capacity: usize) -> (mpsc::Sender<BrokerResult<BarBatch>>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx })
    }

    pub async fn recv(&mut self) -> Option<BrokerResult<BarBatch>> {
        self.rx.recv().await
    }
}

/// Receiving half of one order's lifecycle updates.
///
/// The first item is the purchase confirmation (or the synthesized failed
/// order when the proposal was rejected); the stream closes after the
/// terminal update.
#[derive(Debug)]
pub struct OrderUpdates {
    rx: mpsc::Receiver<BinaryOrder>,
}

impl OrderUpdates {
    #[must_use]
    pub fn channel(capacity: usize) -> (mpsc::Sender<BinaryOrder>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx })
    }

    pub async fn recv(&mut self) -> Option<BinaryOrder> {
        self.rx.recv().await
    }

    /// Drain the stream until it closes and return the last update seen.
    pub async fn last(mut self) -> Option<BinaryOrder> {
        let mut latest = None;
        while let Some(update) = self.rx.recv().await {
            latest = Some(update);
        }
        latest
    }
}

/// Price quote for a prospective contract.
///
/// An empty [`Proposal::id`] means the broker declined to quote (invalid
/// parameters, market closed); that is a business outcome, not an error.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Proposal {
    pub id: String,
    pub ask_price: Decimal,
    pub payout: Option<Decimal>,
    /// Broker's explanation when the quote was declined.
    pub message: Option<String>,
}

impl Proposal {
    /// Quote declined by the broker.
    #[must_use]
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            ask_price: Decimal::ZERO,
            payout: None,
            message: Some(message.into()),
        }
    }

    #[must_use]
    pub fn is_rejected(&self) -> bool {
        self.id.is_empty()
    }
}

/// Broker acknowledgement of a completed buy.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct BuyReceipt {
    pub contract_id: i64,
    pub buy_price: Decimal,
    pub payout: Option<Decimal>,
    /// Purchase time, epoch seconds.
    pub start_time: Option<i64>,
}

/// Result of a purchase attempt: the order as first recorded, plus the
/// stream of updates that follows it to settlement.
#[derive(Debug)]
pub struct Purchase {
    pub order: BinaryOrder,
    pub updates: OrderUpdates,
}

/// One row from the broker's account statement.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct StatementTransaction {
    pub action_type: String,
    pub contract_id: Option<i64>,
    pub transaction_id: Option<i64>,
    pub amount: Decimal,
    pub payout: Option<Decimal>,
    pub sell_price: Option<Decimal>,
    /// Epoch seconds.
    pub transaction_time: Option<i64>,
}

impl StatementTransaction {
    /// Whether this row settles the given contract.
    #[must_use]
    pub fn settles(&self, order_id: &str) -> bool {
        self.action_type == "sell"
            && self
                .contract_id
                .is_some_and(|id| id.to_string() == order_id)
    }
}

/// Classify a settled contract from the amount credited against the payout
/// that was on offer.
///
/// Zero credited is a loss. A partial credit, above zero but below the
/// payout, returns the stake without profit. Anything at or above the
/// payout is a win. When no payout figure survives anywhere the neutral
/// reading wins over guessing a profit.
#[must_use]
pub fn classify_settlement(
    amount: Decimal,
    payout: Option<Decimal>,
    fallback_payout: Option<Decimal>,
) -> OrderResult {
    if amount.is_zero() {
        return OrderResult::Loss;
    }
    match payout.or(fallback_payout) {
        Some(payout) if amount >= payout => OrderResult::Win,
        Some(_) => OrderResult::Tie,
        None => OrderResult::Tie,
    }
}

/// Live market data subscriptions.
#[async_trait]
pub trait MarketData: Send + Sync {
    /// Subscribe to bars for one symbol at one timeframe.
    ///
    /// The returned stream's first batch is the most recent `history` bars;
    /// live updates follow on the same stream with no marker in between.
    async fn subscribe_bars(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        history: usize,
    ) -> BrokerResult<BarStream>;
}

/// Pricing and purchase of binary contracts.
#[async_trait]
pub trait ContractTrader: Send + Sync {
    /// Ask the broker to price a contract. Declined quotes come back as
    /// rejected proposals, not errors.
    async fn propose(&self, request: &ContractRequest) -> BrokerResult<Proposal>;

    /// Run the full purchase pipeline: price, buy, then follow the
    /// contract to settlement. A rejected proposal short-circuits into a
    /// failed order without the buy ever being sent.
    async fn buy_contract(
        &self,
        request: &ContractRequest,
        snapshot: SignalSnapshot,
    ) -> BrokerResult<Purchase>;
}

impl std::fmt::Debug for dyn ContractTrader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn ContractTrader")
    }
}

/// Read access to the account's transaction history.
#[async_trait]
pub trait AccountHistory: Send + Sync {
    /// Fetch up to `limit` recent statement rows, newest first.
    async fn statement(&self, limit: u32) -> BrokerResult<Vec<StatementTransaction>>;
}

/// Everything a live worker needs from one broker connection.
#[async_trait]
pub trait BrokerClient: MarketData + ContractTrader + AccountHistory + Send + Sync {
    fn name(&self) -> &str;

    /// Establish the connection, verify it and authenticate. Implementors
    /// retry internally; an error here is final.
    async fn connect(&self) -> BrokerResult<()>;

    /// Tear the connection down. Idempotent.
    async fn disconnect(&self);
}
