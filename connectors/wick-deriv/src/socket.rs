//! Low-level Deriv WebSocket plumbing.
//!
//! One task owns the socket. Callers talk to it through [`ConnHandle`],
//! which assigns a `req_id` to every outbound request so responses and
//! subscription pushes can be routed back by the loop. Deriv reports
//! failures in-band with an `error` object, so transport frames are
//! always `Ok` at the WebSocket layer and get classified here.

use std::collections::HashMap;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, warn};

use wick_broker::{BrokerError, BrokerResult};

use crate::wire;
use crate::DerivConfig;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub(crate) enum WsCommand {
    Request {
        payload: Value,
        reply: oneshot::Sender<BrokerResult<Value>>,
    },
    Subscribe {
        payload: Value,
        reply: oneshot::Sender<BrokerResult<Value>>,
        sink: mpsc::UnboundedSender<Value>,
    },
    Shutdown,
}

/// Cloneable handle for issuing requests over an open connection.
#[derive(Clone)]
pub(crate) struct ConnHandle {
    commands: mpsc::UnboundedSender<WsCommand>,
}

impl ConnHandle {
    /// Sends a request and waits for the matching `req_id` response.
    ///
    /// The timeout bounds this call only; on expiry the connection and
    /// any other in-flight requests are left untouched.
    pub async fn request(&self, payload: Value, timeout: Duration) -> BrokerResult<Value> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(WsCommand::Request {
                payload,
                reply: reply_tx,
            })
            .map_err(|_| BrokerError::Transport("connection closed".to_string()))?;
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BrokerError::Transport("connection closed".to_string())),
            Err(_) => Err(BrokerError::Timeout(timeout)),
        }
    }

    /// Sends a subscribing request, returning the first response plus a
    /// receiver for every later push on the same `req_id`.
    pub async fn subscribe(
        &self,
        payload: Value,
        timeout: Duration,
    ) -> BrokerResult<(Value, mpsc::UnboundedReceiver<Value>)> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let (sink_tx, sink_rx) = mpsc::unbounded_channel();
        self.commands
            .send(WsCommand::Subscribe {
                payload,
                reply: reply_tx,
                sink: sink_tx,
            })
            .map_err(|_| BrokerError::Transport("connection closed".to_string()))?;
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => Ok((result?, sink_rx)),
            Ok(Err(_)) => Err(BrokerError::Transport("connection closed".to_string())),
            Err(_) => Err(BrokerError::Timeout(timeout)),
        }
    }

    pub async fn ping(&self, timeout: Duration) -> BrokerResult<()> {
        self.request(json!({ "ping": 1 }), timeout).await.map(|_| ())
    }

    pub async fn authorize(&self, token: &str, timeout: Duration) -> BrokerResult<Value> {
        match self.request(json!({ "authorize": token }), timeout).await {
            Err(BrokerError::Exchange { code, message }) => Err(BrokerError::Authentication(
                format!("{message} ({code})"),
            )),
            other => other,
        }
    }

    /// Cancels a server-side subscription by its id.
    pub async fn forget(&self, subscription_id: &str, timeout: Duration) -> BrokerResult<()> {
        self.request(json!({ "forget": subscription_id }), timeout)
            .await
            .map(|_| ())
    }

    pub fn close(&self) {
        let _ = self.commands.send(WsCommand::Shutdown);
    }
}

/// An established socket with its owning loop task.
pub(crate) struct Connection {
    handle: ConnHandle,
    task: JoinHandle<()>,
}

impl Connection {
    /// Dials the endpoint and spawns the socket loop. The connection is
    /// usable immediately; probing and authorization are up to the caller.
    pub async fn open(config: &DerivConfig) -> BrokerResult<Self> {
        let url = config.url();
        let (socket, _) = connect_async(&url)
            .await
            .map_err(BrokerError::transport)?;
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let heartbeat = config.heartbeat_interval;
        let task = tokio::spawn(async move {
            if let Err(err) = run_socket_loop(socket, command_rx, heartbeat).await {
                error!(error = %err, "deriv socket loop exited unexpectedly");
            }
        });
        Ok(Self {
            handle: ConnHandle {
                commands: command_tx,
            },
            task,
        })
    }

    pub fn handle(&self) -> ConnHandle {
        self.handle.clone()
    }

    /// Asks the loop to close the socket and waits briefly for it to wind
    /// down before leaning on abort.
    pub async fn shutdown(mut self) {
        self.handle.close();
        if tokio::time::timeout(Duration::from_secs(2), &mut self.task)
            .await
            .is_err()
        {
            self.task.abort();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.handle.close();
    }
}

#[derive(Default)]
struct Router {
    next_id: u64,
    pending: HashMap<u64, oneshot::Sender<BrokerResult<Value>>>,
    subscriptions: HashMap<u64, Subscription>,
}

struct Subscription {
    first: Option<oneshot::Sender<BrokerResult<Value>>>,
    sink: mpsc::UnboundedSender<Value>,
}

impl Router {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn register_request(&mut self, reply: oneshot::Sender<BrokerResult<Value>>) -> u64 {
        let id = self.next_id();
        self.pending.insert(id, reply);
        id
    }

    fn register_subscription(
        &mut self,
        reply: oneshot::Sender<BrokerResult<Value>>,
        sink: mpsc::UnboundedSender<Value>,
    ) -> u64 {
        let id = self.next_id();
        self.subscriptions.insert(
            id,
            Subscription {
                first: Some(reply),
                sink,
            },
        );
        id
    }

    fn fail(&mut self, id: u64, err: BrokerError) {
        if let Some(reply) = self.pending.remove(&id) {
            let _ = reply.send(Err(err));
        } else if let Some(mut sub) = self.subscriptions.remove(&id) {
            if let Some(first) = sub.first.take() {
                let _ = first.send(Err(err));
            }
        }
    }

    /// Routes one decoded frame to whoever asked for it. Frames without a
    /// known `req_id` are dropped after a debug note; Deriv repeats the
    /// `msg_type` on every frame which keeps those notes greppable.
    fn route(&mut self, value: Value) {
        let req_id = value.get("req_id").and_then(Value::as_u64);
        let failure = wire::error_from(&value);
        match req_id {
            Some(id) if self.pending.contains_key(&id) => {
                if let Some(reply) = self.pending.remove(&id) {
                    let result = match failure {
                        Some(err) => Err(err),
                        None => Ok(value),
                    };
                    let _ = reply.send(result);
                }
            }
            Some(id) if self.subscriptions.contains_key(&id) => {
                let Some(sub) = self.subscriptions.get_mut(&id) else {
                    return;
                };
                if let Some(first) = sub.first.take() {
                    match failure {
                        Some(err) => {
                            let _ = first.send(Err(err));
                            self.subscriptions.remove(&id);
                        }
                        None => {
                            let _ = first.send(Ok(value));
                        }
                    }
                } else if let Some(err) = failure {
                    warn!(req_id = id, error = %err, "subscription errored; dropping it");
                    self.subscriptions.remove(&id);
                } else if sub.sink.send(value).is_err() {
                    self.subscriptions.remove(&id);
                }
            }
            _ => {
                let msg_type = value
                    .get("msg_type")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                debug!(msg_type, "dropping unmatched frame");
            }
        }
    }

    fn fail_all(&mut self, reason: &str) {
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(BrokerError::Transport(reason.to_string())));
        }
        for (_, mut sub) in self.subscriptions.drain() {
            if let Some(first) = sub.first.take() {
                let _ = first.send(Err(BrokerError::Transport(reason.to_string())));
            }
        }
    }
}

fn attach_req_id(payload: &mut Value, id: u64) {
    if let Some(object) = payload.as_object_mut() {
        object.insert("req_id".to_string(), json!(id));
    }
}

async fn run_socket_loop(
    mut socket: WsStream,
    mut commands: mpsc::UnboundedReceiver<WsCommand>,
    heartbeat_every: Duration,
) -> BrokerResult<()> {
    // First heartbeat one full period after connect; the caller's ping
    // probe covers the connection until then.
    let start = tokio::time::Instant::now() + heartbeat_every;
    let mut heartbeat = tokio::time::interval_at(start, heartbeat_every);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut router = Router::default();

    let result = loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(WsCommand::Request { mut payload, reply }) => {
                    let id = router.register_request(reply);
                    attach_req_id(&mut payload, id);
                    if let Err(err) = socket.send(Message::Text(payload.to_string().into())).await {
                        router.fail(id, BrokerError::transport(err));
                    }
                }
                Some(WsCommand::Subscribe { mut payload, reply, sink }) => {
                    let id = router.register_subscription(reply, sink);
                    attach_req_id(&mut payload, id);
                    if let Err(err) = socket.send(Message::Text(payload.to_string().into())).await {
                        router.fail(id, BrokerError::transport(err));
                    }
                }
                Some(WsCommand::Shutdown) | None => {
                    let _ = socket.send(Message::Close(None)).await;
                    break Ok(());
                }
            },
            message = socket.next() => match message {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<Value>(&text) {
                    Ok(value) => router.route(value),
                    Err(err) => warn!(error = %err, "undecodable frame"),
                },
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(err) = socket.send(Message::Pong(payload)).await {
                        break Err(BrokerError::transport(err));
                    }
                }
                Some(Ok(Message::Close(_))) => {
                    break Err(BrokerError::Transport("server closed the connection".to_string()));
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => break Err(BrokerError::transport(err)),
                None => break Err(BrokerError::Transport("socket stream ended".to_string())),
            },
            _ = heartbeat.tick() => {
                let id = router.next_id();
                let mut payload = json!({ "ping": 1 });
                attach_req_id(&mut payload, id);
                if let Err(err) = socket.send(Message::Text(payload.to_string().into())).await {
                    break Err(BrokerError::transport(err));
                }
            }
        }
    };

    router.fail_all("connection closed");
    result
}
