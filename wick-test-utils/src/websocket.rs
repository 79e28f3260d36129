//! WebSocket front of the mock Deriv API.

use std::collections::VecDeque;
use std::net::SocketAddr;

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::warn;

use crate::state::{LiveSub, MockDerivState};

/// In-process stand-in for the Deriv WebSocket API.
///
/// Accepts any path and query, speaks the JSON request/response protocol
/// with `req_id` correlation, and plays back whatever the shared state
/// was scripted with.
pub struct MockDerivServer {
    addr: SocketAddr,
    state: MockDerivState,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl MockDerivServer {
    pub async fn spawn() -> Result<Self> {
        Self::with_state(MockDerivState::new()).await
    }

    pub async fn with_state(state: MockDerivState) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let accept_state = state.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _peer)) => {
                            let state = accept_state.clone();
                            tokio::spawn(async move {
                                if let Err(err) = handle_socket(state, stream).await {
                                    warn!(error = %err, "mock connection ended with error");
                                }
                            });
                        }
                        Err(err) => {
                            tracing::error!(error = %err, "mock listener accept failed");
                            break;
                        }
                    }
                }
            }
        });
        Ok(Self {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
            handle,
        })
    }

    /// Endpoint URL without any query; clients append their own app id.
    /// The root path keeps the upgrade request line valid once a query
    /// string is attached.
    #[must_use]
    pub fn ws_url(&self) -> String {
        format!("ws://{}/", self.addr)
    }

    #[must_use]
    pub fn state(&self) -> &MockDerivState {
        &self.state
    }

    pub async fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.handle.abort();
    }
}

impl Drop for MockDerivServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.handle.abort();
    }
}

async fn handle_socket(state: MockDerivState, stream: TcpStream) -> Result<()> {
    let ws_stream = accept_async(stream).await?;
    let (mut sink, mut source) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    {
        let mut inner = state.lock().await;
        inner.connections += 1;
        inner.writers.push(tx.clone());
    }
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });
    while let Some(message) = source.next().await {
        match message? {
            Message::Text(text) => {
                if let Err(err) = handle_request(&state, &tx, &text).await {
                    warn!(error = %err, "mock request handling failed");
                }
            }
            Message::Ping(payload) => {
                let _ = tx.send(Message::Pong(payload));
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    drop(tx);
    writer.abort();
    Ok(())
}

fn send(tx: &mpsc::UnboundedSender<Message>, frame: Value) {
    let _ = tx.send(Message::Text(frame.to_string().into()));
}

async fn handle_request(
    state: &MockDerivState,
    tx: &mpsc::UnboundedSender<Message>,
    text: &str,
) -> Result<()> {
    let value: Value = serde_json::from_str(text)?;
    let req_id = value.get("req_id").cloned().unwrap_or(Value::Null);

    if value.get("ping").is_some() {
        let mut inner = state.lock().await;
        if inner.drop_pings > 0 {
            inner.drop_pings -= 1;
            return Ok(());
        }
        send(tx, json!({ "msg_type": "ping", "ping": "pong", "req_id": req_id }));
    } else if value.get("authorize").is_some() {
        let inner = state.lock().await;
        if inner.reject_authorize {
            send(
                tx,
                json!({
                    "msg_type": "authorize",
                    "error": { "code": "InvalidToken", "message": "Token is invalid." },
                    "req_id": req_id,
                }),
            );
        } else {
            send(
                tx,
                json!({
                    "msg_type": "authorize",
                    "authorize": { "loginid": "VRTC90000123", "currency": "USD" },
                    "req_id": req_id,
                }),
            );
        }
    } else if let Some(symbol) = value.get("ticks_history").and_then(Value::as_str) {
        let granularity = value.get("granularity").and_then(Value::as_u64).unwrap_or(60);
        let mut inner = state.lock().await;
        let candles = inner
            .candles
            .get(&(symbol.to_string(), granularity))
            .cloned()
            .unwrap_or_default();
        let subscription_id = format!("candles-{symbol}-{granularity}");
        if value.get("subscribe").is_some() {
            inner.live_subs.insert(
                (symbol.to_string(), granularity),
                LiveSub {
                    req_id: req_id.clone(),
                    writer: tx.clone(),
                    subscription_id: subscription_id.clone(),
                },
            );
        }
        send(
            tx,
            json!({
                "msg_type": "candles",
                "candles": candles,
                "subscription": { "id": subscription_id },
                "req_id": req_id,
            }),
        );
    } else if value.get("proposal").is_some() {
        let inner = state.lock().await;
        match &inner.proposal_error {
            Some(message) => send(
                tx,
                json!({
                    "msg_type": "proposal",
                    "error": { "code": "ContractBuyValidationError", "message": message },
                    "req_id": req_id,
                }),
            ),
            None => send(
                tx,
                json!({ "msg_type": "proposal", "proposal": inner.proposal.clone(), "req_id": req_id }),
            ),
        }
    } else if value.get("buy").is_some() {
        let mut inner = state.lock().await;
        inner.buys += 1;
        send(
            tx,
            json!({ "msg_type": "buy", "buy": inner.buy.clone(), "req_id": req_id }),
        );
    } else if value.get("proposal_open_contract").is_some() {
        let contract_id = value.get("contract_id").and_then(Value::as_i64).unwrap_or(0);
        let subscription_id = format!("contract-sub-{contract_id}");
        let mut inner = state.lock().await;
        let mut script: VecDeque<Value> = std::mem::take(&mut inner.contract_updates);
        drop(inner);
        let first = script
            .pop_front()
            .unwrap_or_else(|| json!({ "contract_id": contract_id, "status": "open", "is_sold": 0 }));
        send(
            tx,
            json!({
                "msg_type": "proposal_open_contract",
                "proposal_open_contract": first,
                "subscription": { "id": subscription_id.clone() },
                "req_id": req_id.clone(),
            }),
        );
        let writer = tx.clone();
        tokio::spawn(async move {
            for update in script {
                tokio::time::sleep(Duration::from_millis(10)).await;
                let frame = json!({
                    "msg_type": "proposal_open_contract",
                    "proposal_open_contract": update,
                    "subscription": { "id": subscription_id.clone() },
                    "req_id": req_id.clone(),
                });
                if writer.send(Message::Text(frame.to_string().into())).is_err() {
                    break;
                }
            }
        });
    } else if value.get("statement").is_some() {
        let inner = state.lock().await;
        if inner.ignore_statement {
            return Ok(());
        }
        let rows = inner.statement.clone();
        send(
            tx,
            json!({
                "msg_type": "statement",
                "statement": { "count": rows.len(), "transactions": rows },
                "req_id": req_id,
            }),
        );
    } else if let Some(id) = value.get("forget").and_then(Value::as_str) {
        let mut inner = state.lock().await;
        inner.forgotten.push(id.to_string());
        send(tx, json!({ "msg_type": "forget", "forget": 1, "req_id": req_id }));
    }
    Ok(())
}
