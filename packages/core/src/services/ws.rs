//! JSON-RPC chain-data provider over WebSocket.
//!
//! Requests and `eth_subscribe("newHeads")` notifications share one
//! connection. A background reader routes responses to their request by id
//! and notifications to their header stream by subscription id. When the
//! connection drops, every pending request fails, every header stream ends
//! with [`ProviderError::SubscriptionClosed`], and the next call dials again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, instrument, warn};

use super::rpc::{
    block_params, into_block, into_latest_header, latest_header_params, parse_response,
    request_body, RpcHeader,
};
use crate::gasprice::{
    provider::{ChainProvider, HeaderStream, ProviderError},
    types::{Block, ChainHead, Header},
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type HeadSender = mpsc::UnboundedSender<Result<Header, ProviderError>>;

enum Pending {
    Call(oneshot::Sender<Value>),
    /// The header stream is registered by the reader as soon as the
    /// subscription id arrives, so no notification can slip past it.
    Subscribe {
        reply: oneshot::Sender<Value>,
        heads: HeadSender,
    },
}

#[derive(Default)]
struct Routes {
    pending: HashMap<u64, Pending>,
    subscriptions: HashMap<String, HeadSender>,
    closed: bool,
}

#[derive(Debug, Deserialize)]
struct Notification {
    subscription: String,
    result: RpcHeader,
}

impl Routes {
    fn dispatch(&mut self, text: &str) {
        let mut message: Value = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(error) => {
                warn!(%error, "unreadable websocket message");
                return;
            }
        };

        if let Some(id) = message.get("id").and_then(Value::as_u64) {
            match self.pending.remove(&id) {
                Some(Pending::Call(reply)) => {
                    let _ = reply.send(message);
                }
                Some(Pending::Subscribe { reply, heads }) => {
                    if let Some(subscription) = message.get("result").and_then(Value::as_str) {
                        self.subscriptions.insert(subscription.to_owned(), heads);
                    }
                    let _ = reply.send(message);
                }
                None => debug!(id, "response for an abandoned request"),
            }
            return;
        }

        if message.get("method").and_then(Value::as_str) != Some("eth_subscription") {
            return;
        }
        let params = message.get_mut("params").map(Value::take).unwrap_or_default();
        match serde_json::from_value::<Notification>(params) {
            Ok(notification) => {
                let delivered = self
                    .subscriptions
                    .get(&notification.subscription)
                    .map(|heads| heads.unbounded_send(Ok(notification.result.into())).is_ok());
                if delivered == Some(false) {
                    self.subscriptions.remove(&notification.subscription);
                }
            }
            Err(error) => warn!(%error, "malformed head notification"),
        }
    }

    fn close(&mut self) {
        self.closed = true;
        self.pending.clear();
        for (_, heads) in self.subscriptions.drain() {
            let _ = heads.unbounded_send(Err(ProviderError::SubscriptionClosed));
        }
    }
}

struct Connection {
    sink: tokio::sync::Mutex<SplitSink<Socket, Message>>,
    routes: Arc<Mutex<Routes>>,
    reader: JoinHandle<()>,
}

impl Connection {
    async fn open(url: &str, dial_timeout: Duration) -> Result<Self, ProviderError> {
        let (socket, _) = timeout(dial_timeout, connect_async(url))
            .await
            .map_err(|_| ProviderError::Timeout(dial_timeout))?
            .map_err(|e| ProviderError::NetworkError {
                message: format!("could not connect to {url}: {e}"),
            })?;

        let (sink, source) = socket.split();
        let routes = Arc::new(Mutex::new(Routes::default()));
        let reader = tokio::spawn(read_loop(source, Arc::clone(&routes)));
        Ok(Self {
            sink: tokio::sync::Mutex::new(sink),
            routes,
            reader,
        })
    }

    fn is_open(&self) -> bool {
        !self.routes.lock().closed
    }

    async fn request(
        &self,
        id: u64,
        body: String,
        pending: impl FnOnce(oneshot::Sender<Value>) -> Pending,
    ) -> Result<Value, ProviderError> {
        let (reply, response) = oneshot::channel();
        {
            let mut routes = self.routes.lock();
            if routes.closed {
                return Err(connection_closed());
            }
            routes.pending.insert(id, pending(reply));
        }

        if let Err(error) = self.sink.lock().await.send(Message::Text(body)).await {
            self.forget(id);
            return Err(ProviderError::NetworkError {
                message: error.to_string(),
            });
        }
        response.await.map_err(|_| connection_closed())
    }

    fn forget(&self, id: u64) {
        self.routes.lock().pending.remove(&id);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
        self.routes.lock().close();
    }
}

async fn read_loop(mut source: SplitStream<Socket>, routes: Arc<Mutex<Routes>>) {
    while let Some(message) = source.next().await {
        match message {
            Ok(Message::Text(text)) => routes.lock().dispatch(&text),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(error) => {
                warn!(%error, "websocket read failed");
                break;
            }
        }
    }
    debug!("websocket connection closed");
    routes.lock().close();
}

fn connection_closed() -> ProviderError {
    ProviderError::NetworkError {
        message: "websocket connection closed".into(),
    }
}

pub struct WsProvider {
    url: String,
    request_timeout: Duration,
    next_id: AtomicU64,
    connection: tokio::sync::Mutex<Option<Arc<Connection>>>,
}

impl WsProvider {
    /// Dials `url` right away so a bad endpoint fails at startup. Every
    /// request, and every redial after a dropped connection, is bounded by
    /// `request_timeout`.
    pub async fn connect(url: impl Into<String>, request_timeout: Duration) -> Result<Self, ProviderError> {
        let url = url.into();
        let connection = Connection::open(&url, request_timeout).await?;
        Ok(Self {
            url,
            request_timeout,
            next_id: AtomicU64::new(1),
            connection: tokio::sync::Mutex::new(Some(Arc::new(connection))),
        })
    }

    async fn connection(&self) -> Result<Arc<Connection>, ProviderError> {
        let mut slot = self.connection.lock().await;
        if let Some(connection) = slot.as_ref().filter(|c| c.is_open()) {
            return Ok(Arc::clone(connection));
        }

        debug!(url = %self.url, "redialing websocket");
        let connection = Arc::new(Connection::open(&self.url, self.request_timeout).await?);
        *slot = Some(Arc::clone(&connection));
        Ok(connection)
    }

    async fn exchange(
        &self,
        method: &str,
        params: Value,
        pending: impl FnOnce(oneshot::Sender<Value>) -> Pending,
    ) -> Result<Value, ProviderError> {
        let connection = self.connection().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = request_body(id, method, params).to_string();
        debug!(method, id, "json-rpc request");

        match timeout(self.request_timeout, connection.request(id, body, pending)).await {
            Ok(response) => response,
            Err(_) => {
                connection.forget(id);
                Err(ProviderError::Timeout(self.request_timeout))
            }
        }
    }

    async fn call<R: DeserializeOwned>(&self, method: &str, params: Value) -> Result<R, ProviderError> {
        parse_response(self.exchange(method, params, Pending::Call).await?)
    }
}

#[async_trait]
impl ChainProvider for WsProvider {
    #[instrument(skip(self))]
    async fn latest_header(&self) -> Result<Header, ProviderError> {
        let header = self
            .call("eth_getBlockByNumber", latest_header_params())
            .await?;
        into_latest_header(header)
    }

    #[instrument(skip(self))]
    async fn block_by_hash(&self, hash: ChainHead) -> Result<Block, ProviderError> {
        let block = self.call("eth_getBlockByHash", block_params(hash)).await?;
        into_block(hash, block)
    }

    async fn subscribe_new_heads(&self) -> Result<HeaderStream, ProviderError> {
        let (heads, stream) = mpsc::unbounded();
        let response = self
            .exchange("eth_subscribe", json!(["newHeads"]), move |reply| {
                Pending::Subscribe { reply, heads }
            })
            .await?;
        let subscription: String = parse_response(response)?;
        debug!(%subscription, "subscribed to new heads");
        Ok(stream.boxed())
    }

    fn provider_name(&self) -> &str {
        "JsonRpcWs"
    }
}
