//! Rust subscriber client for the bloomd catalog gateway.
//!
//! ```ignore
//! let client = BloomClient::connect("ws://localhost:3000/ws");
//! let mut events = client.events();
//! let ack = client.create(draft).await?;
//! while let Ok(event) = events.recv().await { /* created, updated, ... */ }
//! ```
//!
//! A background tokio task owns the WebSocket, reconnecting with
//! exponential backoff + jitter. Commands are matched to their acks by
//! `requestId`; broadcasts are fanned out to every [`BloomClient::events`]
//! receiver.

use std::collections::HashMap;
use std::env;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// How long a liveness probe may take before the link is suspect.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long any other command waits for its ack.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default interval between background keep-alive probes.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5 * 60);

const EVENT_BUFFER: usize = 256;

// ═══════════════════════════════════════════════════════════════
// Public types
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flower {
    pub id: String,
    pub name: String,
    pub price: f64,
    pub image: String,
    pub description: String,
    pub shop_id: String,
    #[serde(default)]
    pub shop_name: Option<String>,
    pub date_added: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowerDraft {
    pub name: String,
    pub price: f64,
    pub image: String,
    pub description: String,
    pub shop_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowerPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shop_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Shop {
    pub id: String,
    pub name: String,
    pub address: String,
    pub phone: String,
    pub hours: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Notice {
    pub kind: String,
    pub message: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub connected: bool,
    pub connection_id: String,
    pub last_liveness_at: Option<i64>,
    pub total_connections: usize,
    pub server_time: i64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSummary {
    pub id: String,
    pub connected_at: i64,
    pub last_liveness_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Probe {
    pub timestamp: i64,
}

/// The server's answer to one command.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    #[serde(default)]
    pub request_id: Option<u64>,
    pub success: bool,
    #[serde(default)]
    pub data: Option<JsonValue>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Ack {
    /// `data` on success, [`ClientError::Rejected`] otherwise.
    pub fn into_result(self) -> Result<Option<JsonValue>, ClientError> {
        if self.success {
            Ok(self.data)
        } else {
            Err(ClientError::Rejected(
                self.error.unwrap_or_else(|| "unknown error".into()),
            ))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ErrorFrame {
    pub code: String,
    pub message: String,
}

/// Everything the gateway pushes to a subscriber.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ServerEvent {
    Init(Vec<Flower>),
    #[serde(rename = "server-message")]
    Notice(Notice),
    Created(Flower),
    Updated(Flower),
    Deleted(String),
    Refreshed(Vec<Flower>),
    LivenessAck(Probe),
    Status(Status),
    Connections(Vec<ConnectionSummary>),
    Ack(Ack),
    Error(ErrorFrame),
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The background task has stopped.
    #[error("background task stopped")]
    ChannelClosed,
    /// The connection dropped before the ack arrived.
    #[error("disconnected before reply")]
    Disconnected,
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    /// Liveness probe unanswered; the link may be dead.
    #[error("liveness probe unanswered within {0:?}")]
    ProbeTimeout(Duration),
    #[error("server rejected command: {0}")]
    Rejected(String),
    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Background probe interval. `None` disables keep-alive.
    pub keepalive: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            keepalive: Some(KEEPALIVE_INTERVAL),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// Client
// ═══════════════════════════════════════════════════════════════

/// Message sent from API methods to the background task.
enum Outbound {
    Request {
        request_id: u64,
        frame: String,
        reply: oneshot::Sender<Ack>,
    },
    Close,
}

pub struct BloomClient {
    tx: mpsc::Sender<Outbound>,
    events: broadcast::Sender<ServerEvent>,
    connected: Arc<AtomicBool>,
    next_request: AtomicU64,
}

impl BloomClient {
    /// Connect to the URL in `BLOOM_GATEWAY_URL` (default `ws://localhost:3000/ws`).
    pub fn from_env() -> Self {
        let url = env::var("BLOOM_GATEWAY_URL").unwrap_or_else(|_| "ws://localhost:3000/ws".into());
        Self::connect(&url)
    }

    pub fn connect(url: &str) -> Self {
        Self::connect_with(url, ClientOptions::default())
    }

    /// Spawn the background connection task. Returns immediately; use
    /// [`is_connected`](Self::is_connected) or wait for `Init` on
    /// [`events`](Self::events) to know when the link is up.
    pub fn connect_with(url: &str, options: ClientOptions) -> Self {
        let (tx, rx) = mpsc::channel::<Outbound>(256);
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let connected = Arc::new(AtomicBool::new(false));

        let task = WsTask {
            url: normalize_ws_url(url),
            options,
            events: events.clone(),
            connected: Arc::clone(&connected),
        };
        tokio::spawn(task.run(rx));

        Self {
            tx,
            events,
            connected,
            next_request: AtomicU64::new(1),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// New receiver of server events. Only sees events sent after the call.
    pub fn events(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    pub async fn create(&self, draft: FlowerDraft) -> Result<Ack, ClientError> {
        self.request("create", serde_json::to_value(draft)?, REQUEST_TIMEOUT)
            .await
    }

    pub async fn update(&self, id: &str, patch: FlowerPatch) -> Result<Ack, ClientError> {
        let payload = json!({ "id": id, "patch": patch });
        self.request("update", payload, REQUEST_TIMEOUT).await
    }

    pub async fn delete(&self, id: &str) -> Result<Ack, ClientError> {
        self.request("delete", json!(id), REQUEST_TIMEOUT).await
    }

    pub async fn refresh(&self) -> Result<Ack, ClientError> {
        self.request("refresh", JsonValue::Null, REQUEST_TIMEOUT).await
    }

    pub async fn get(&self, id: &str) -> Result<Ack, ClientError> {
        self.request("get", json!(id), REQUEST_TIMEOUT).await
    }

    pub async fn list_by_shop(&self, shop_id: &str) -> Result<Ack, ClientError> {
        self.request("list-by-shop", json!({ "shopId": shop_id }), REQUEST_TIMEOUT)
            .await
    }

    /// Shops, newest first. Use one of their ids as a draft's `shop_id`.
    pub async fn list_shops(&self) -> Result<Vec<Shop>, ClientError> {
        let data = self
            .request("list-shops", JsonValue::Null, REQUEST_TIMEOUT)
            .await?
            .into_result()?;
        Ok(serde_json::from_value(data.unwrap_or_default())?)
    }

    pub async fn get_shop(&self, id: &str) -> Result<Ack, ClientError> {
        self.request("get-shop", json!(id), REQUEST_TIMEOUT).await
    }

    pub async fn get_status(&self) -> Result<Ack, ClientError> {
        self.request("get-status", JsonValue::Null, REQUEST_TIMEOUT).await
    }

    pub async fn get_connections(&self) -> Result<Ack, ClientError> {
        self.request("get-connections", JsonValue::Null, REQUEST_TIMEOUT)
            .await
    }

    /// Send a liveness probe and wait for its echo. Returns the round trip.
    ///
    /// A timeout only means the link is suspect; the server decides
    /// eviction on its own schedule.
    pub async fn probe(&self) -> Result<Duration, ClientError> {
        let started = Instant::now();
        let timestamp = Utc::now().timestamp_millis();
        let ack = self
            .request("liveness-probe", json!({ "timestamp": timestamp }), PROBE_TIMEOUT)
            .await
            .map_err(|e| match e {
                ClientError::Timeout(d) => ClientError::ProbeTimeout(d),
                other => other,
            })?;
        let echoed = ack
            .data
            .as_ref()
            .and_then(|d| d.get("timestamp"))
            .and_then(JsonValue::as_i64);
        if echoed != Some(timestamp) {
            warn!(?echoed, timestamp, "liveness probe echo mismatch");
        }
        Ok(started.elapsed())
    }

    /// Close the connection and stop the background task.
    pub async fn shutdown(self) {
        let _ = self.tx.send(Outbound::Close).await;
    }

    async fn request(
        &self,
        kind: &str,
        payload: JsonValue,
        timeout: Duration,
    ) -> Result<Ack, ClientError> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let frame = request_frame(kind, request_id, payload)?;
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Outbound::Request {
                request_id,
                frame,
                reply,
            })
            .await
            .map_err(|_| ClientError::ChannelClosed)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => Err(ClientError::Disconnected),
            Err(_) => Err(ClientError::Timeout(timeout)),
        }
    }
}

fn request_frame(kind: &str, request_id: u64, payload: JsonValue) -> Result<String, ClientError> {
    let mut frame = json!({ "type": kind, "requestId": request_id });
    if !payload.is_null() {
        frame["payload"] = payload;
    }
    Ok(serde_json::to_string(&frame)?)
}

// ═══════════════════════════════════════════════════════════════
// Background WebSocket task
// ═══════════════════════════════════════════════════════════════

/// Convert an endpoint to a ws:// URL suitable for tungstenite.
/// Handles: ws://, wss://, http://, https://
fn normalize_ws_url(ep: &str) -> String {
    let url = ep
        .replace("https://", "wss://")
        .replace("http://", "ws://");
    // Ensure /ws path if not present.
    if !url.contains("/ws") {
        format!("{}/ws", url.trim_end_matches('/'))
    } else {
        url
    }
}

struct WsTask {
    url: String,
    options: ClientOptions,
    events: broadcast::Sender<ServerEvent>,
    connected: Arc<AtomicBool>,
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

enum SessionEnd {
    /// Link lost; reconnect.
    Dropped,
    /// Client asked to stop, or was dropped.
    Shutdown,
}

impl WsTask {
    async fn run(self, mut rx: mpsc::Receiver<Outbound>) {
        let mut attempt: u32 = 0;
        loop {
            let ws_stream = match tokio_tungstenite::connect_async(&self.url).await {
                Ok((stream, _)) => {
                    info!(url = %self.url, "gateway connected");
                    attempt = 0;
                    stream
                }
                Err(e) => {
                    warn!(url = %self.url, attempt, "gateway connect failed: {e}");
                    tokio::time::sleep(backoff_delay(attempt)).await;
                    attempt = attempt.saturating_add(1);
                    continue;
                }
            };

            self.connected.store(true, Ordering::Relaxed);
            let end = self.session(ws_stream, &mut rx).await;
            self.connected.store(false, Ordering::Relaxed);

            match end {
                SessionEnd::Shutdown => return,
                SessionEnd::Dropped => {
                    tokio::time::sleep(backoff_delay(attempt)).await;
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    async fn session(&self, ws_stream: WsStream, rx: &mut mpsc::Receiver<Outbound>) -> SessionEnd {
        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        // Dropping the senders fails the waiting callers with `Disconnected`.
        let mut pending: HashMap<u64, oneshot::Sender<Ack>> = HashMap::new();

        // Branch is disabled when keep-alive is off; the period is then unused.
        let keepalive_period = self.options.keepalive.unwrap_or(KEEPALIVE_INTERVAL);
        let mut keepalive =
            tokio::time::interval_at(tokio::time::Instant::now() + keepalive_period, keepalive_period);

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(Outbound::Request { request_id, frame, reply }) => {
                            if let Err(e) = ws_tx.send(Message::Text(frame)).await {
                                warn!("send error: {e}");
                                return SessionEnd::Dropped;
                            }
                            pending.insert(request_id, reply);
                        }
                        Some(Outbound::Close) | None => {
                            let _ = ws_tx.send(Message::Close(None)).await;
                            return SessionEnd::Shutdown;
                        }
                    }
                }
                _ = keepalive.tick(), if self.options.keepalive.is_some() => {
                    let frame = json!({
                        "type": "liveness-probe",
                        "payload": { "timestamp": Utc::now().timestamp_millis() },
                    });
                    debug!("keep-alive probe");
                    if let Err(e) = ws_tx.send(Message::Text(frame.to_string())).await {
                        warn!("keep-alive send error: {e}");
                        return SessionEnd::Dropped;
                    }
                }
                frame = ws_rx.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => self.route(&text, &mut pending),
                        Some(Ok(Message::Close(_))) => {
                            info!("gateway closed connection");
                            return SessionEnd::Dropped;
                        }
                        Some(Ok(_)) => {} // ping/pong/binary
                        Some(Err(e)) => {
                            warn!("ws recv error: {e}");
                            return SessionEnd::Dropped;
                        }
                        None => {
                            info!("ws stream ended");
                            return SessionEnd::Dropped;
                        }
                    }
                }
            }
        }
    }

    /// Acks go to their waiting caller; everything else to subscribers.
    fn route(&self, text: &str, pending: &mut HashMap<u64, oneshot::Sender<Ack>>) {
        let event: ServerEvent = match serde_json::from_str(text) {
            Ok(event) => event,
            Err(e) => {
                warn!("unparseable server frame: {e}");
                return;
            }
        };
        match event {
            ServerEvent::Ack(ack) => {
                if let Some(reply) = ack.request_id.and_then(|id| pending.remove(&id)) {
                    let _ = reply.send(ack);
                }
            }
            other => {
                // No receivers is fine.
                let _ = self.events.send(other);
            }
        }
    }
}

/// Exponential backoff with jitter.
/// delay = min(100ms × 2^attempt, 30s) + random(0, delay × 0.5)
fn backoff_delay(attempt: u32) -> Duration {
    let base_ms = 100u64.saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
    let capped_ms = base_ms.min(30_000);
    let jitter_ms = (rand::random::<f64>() * capped_ms as f64 * 0.5) as u64;
    let total = Duration::from_millis(capped_ms + jitter_ms);
    debug!(ms = total.as_millis(), attempt, "backoff sleep");
    total
}

// ═══════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════
