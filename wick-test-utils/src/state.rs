//! Shared, scriptable state behind the mock Deriv server.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio_tungstenite::tungstenite::Message;

/// A live candle subscription registered by one connection.
pub(crate) struct LiveSub {
    pub req_id: Value,
    pub writer: mpsc::UnboundedSender<Message>,
    pub subscription_id: String,
}

pub(crate) struct Inner {
    /// JSON ping requests to swallow without replying, simulating a
    /// connection that dials but never verifies.
    pub drop_pings: u32,
    pub reject_authorize: bool,
    /// Never answer `statement` requests, for per-call timeout tests.
    pub ignore_statement: bool,
    /// Reply to `proposal` with this error message instead of a quote.
    pub proposal_error: Option<String>,
    /// Candle history per (symbol, granularity seconds).
    pub candles: HashMap<(String, u64), Vec<Value>>,
    pub proposal: Value,
    pub buy: Value,
    /// Status snapshots played back for the next contract subscription.
    pub contract_updates: VecDeque<Value>,
    pub statement: Vec<Value>,
    pub connections: u32,
    pub buys: u32,
    pub forgotten: Vec<String>,
    pub live_subs: HashMap<(String, u64), LiveSub>,
    /// Writer of every accepted connection, most recent last.
    pub writers: Vec<mpsc::UnboundedSender<Message>>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            drop_pings: 0,
            reject_authorize: false,
            ignore_statement: false,
            proposal_error: None,
            candles: HashMap::new(),
            proposal: json!({ "id": "prop-1", "ask_price": 5.5, "payout": 10.69 }),
            buy: json!({
                "contract_id": 99_000_001,
                "buy_price": 5.5,
                "payout": 10.69,
                "purchase_time": 1_700_000_000,
            }),
            contract_updates: VecDeque::new(),
            statement: Vec::new(),
            connections: 0,
            buys: 0,
            forgotten: Vec::new(),
            live_subs: HashMap::new(),
            writers: Vec::new(),
        }
    }
}

/// Handle to the mock server's state, shared with every connection.
#[derive(Clone, Default)]
pub struct MockDerivState {
    inner: Arc<Mutex<Inner>>,
}

impl MockDerivState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().await
    }

    pub async fn set_candles(&self, symbol: &str, granularity: u64, candles: Vec<Value>) {
        let mut inner = self.lock().await;
        inner.candles.insert((symbol.to_string(), granularity), candles);
    }

    pub async fn drop_pings(&self, count: u32) {
        self.lock().await.drop_pings = count;
    }

    pub async fn reject_authorize(&self) {
        self.lock().await.reject_authorize = true;
    }

    pub async fn ignore_statement(&self) {
        self.lock().await.ignore_statement = true;
    }

    pub async fn reject_proposal(&self, message: impl Into<String>) {
        self.lock().await.proposal_error = Some(message.into());
    }

    pub async fn set_proposal(&self, id: &str, ask_price: f64, payout: f64) {
        self.lock().await.proposal = json!({ "id": id, "ask_price": ask_price, "payout": payout });
    }

    pub async fn set_buy(&self, contract_id: i64, buy_price: f64, payout: f64, purchase_time: i64) {
        self.lock().await.buy = json!({
            "contract_id": contract_id,
            "buy_price": buy_price,
            "payout": payout,
            "purchase_time": purchase_time,
        });
    }

    pub async fn script_contract_updates(&self, updates: Vec<Value>) {
        self.lock().await.contract_updates = updates.into();
    }

    pub async fn set_statement(&self, rows: Vec<Value>) {
        self.lock().await.statement = rows;
    }

    pub async fn connection_count(&self) -> u32 {
        self.lock().await.connections
    }

    pub async fn buy_count(&self) -> u32 {
        self.lock().await.buys
    }

    pub async fn forgotten(&self) -> Vec<String> {
        self.lock().await.forgotten.clone()
    }

    /// Pushes one streaming candle to the matching live subscription.
    /// Returns false when no such subscription exists.
    pub async fn push_ohlc(&self, symbol: &str, granularity: u64, mut body: Value) -> bool {
        if let Some(object) = body.as_object_mut() {
            object.entry("symbol").or_insert_with(|| json!(symbol));
            object
                .entry("granularity")
                .or_insert_with(|| json!(granularity));
        }
        let inner = self.lock().await;
        let Some(sub) = inner.live_subs.get(&(symbol.to_string(), granularity)) else {
            return false;
        };
        let frame = json!({
            "msg_type": "ohlc",
            "ohlc": body,
            "subscription": { "id": sub.subscription_id },
            "req_id": sub.req_id,
        });
        sub.writer
            .send(Message::Text(frame.to_string().into()))
            .is_ok()
    }

    /// Sends an arbitrary frame down the most recent connection, for
    /// exercising how clients treat pushes they never asked for.
    pub async fn push_unmatched(&self, frame: Value) -> bool {
        let inner = self.lock().await;
        let Some(writer) = inner.writers.last() else {
            return false;
        };
        writer.send(Message::Text(frame.to_string().into())).is_ok()
    }
}

/// A historical candle as Deriv encodes it.
#[must_use]
pub fn candle(epoch: i64, open: f64, high: f64, low: f64, close: f64) -> Value {
    json!({ "epoch": epoch, "open": open, "high": high, "low": low, "close": close })
}

/// Body of a streaming `ohlc` push.
#[must_use]
pub fn ohlc(open_time: i64, open: f64, high: f64, low: f64, close: f64) -> Value {
    json!({
        "open_time": open_time,
        "epoch": open_time + 1,
        "open": open,
        "high": high,
        "low": low,
        "close": close,
    })
}

/// One `proposal_open_contract` status snapshot.
#[must_use]
pub fn contract_snapshot(
    contract_id: i64,
    status: &str,
    is_sold: bool,
    sell_price: Option<f64>,
) -> Value {
    let mut snapshot = json!({
        "contract_id": contract_id,
        "status": status,
        "is_sold": if is_sold { 1 } else { 0 },
    });
    if let (Some(price), Some(object)) = (sell_price, snapshot.as_object_mut()) {
        object.insert("sell_price".to_string(), json!(price));
    }
    snapshot
}

/// A statement row crediting a settled contract.
#[must_use]
pub fn sell_row(contract_id: i64, amount: f64, payout: f64, transaction_time: i64) -> Value {
    json!({
        "action_type": "sell",
        "contract_id": contract_id,
        "transaction_id": transaction_time,
        "amount": amount,
        "payout": payout,
        "transaction_time": transaction_time,
    })
}

/// A statement row debiting a purchase.
#[must_use]
pub fn buy_row(contract_id: i64, amount: f64, transaction_time: i64) -> Value {
    json!({
        "action_type": "buy",
        "contract_id": contract_id,
        "transaction_id": transaction_time,
        "amount": amount,
        "transaction_time": transaction_time,
    })
}
