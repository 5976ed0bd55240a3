//! The real-time catalog gateway.
//!
//! Flow per connection:
//! 1. Handshake: register, push the full catalog (`init`) and a welcome
//!    notice to the new connection only
//! 2. Commands: forward to the catalog; on success broadcast the result to
//!    everyone, then ack the caller
//! 3. Disconnect: drop from the registry, silently
//!
//! Handshakes, mutations and refreshes are serialized through one FIFO
//! lane. Broadcasts therefore leave in the order commands were accepted, and
//! an `init` snapshot is never overtaken by an older broadcast.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::catalog::{Catalog, CatalogError};
use crate::clock::Clock;
use crate::error::GatewayError;
use crate::fanout::{Fanout, FanoutReport};
use crate::registry::{ConnectionHandle, Registry};
use crate::types::*;

pub const WELCOME_MESSAGE: &str = "Connected to the flower catalog gateway";

/// Upper bound on the handshake's catalog read. The lane is held meanwhile,
/// so a stalled catalog blocks every other handshake and mutation until then.
pub const INIT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Gateway {
    registry: Arc<Registry>,
    fanout: Fanout,
    catalog: Arc<dyn Catalog>,
    clock: Arc<dyn Clock>,
    lane: Mutex<()>,
}

impl Gateway {
    pub fn new(catalog: Arc<dyn Catalog>, clock: Arc<dyn Clock>) -> Self {
        let registry = Arc::new(Registry::new());
        Self {
            fanout: Fanout::new(Arc::clone(&registry)),
            registry,
            catalog,
            clock,
            lane: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    // ═══════════════════════════════════════════════════════════
    // Session handshake
    // ═══════════════════════════════════════════════════════════

    pub async fn connect(&self) -> Result<ConnectionHandle, GatewayError> {
        self.connect_as(Uuid::new_v4()).await
    }

    /// Register `id` and push its initial state.
    ///
    /// If the catalog cannot be read the connection is unregistered again
    /// and the error returned; nobody else is affected.
    pub async fn connect_as(&self, id: ConnectionId) -> Result<ConnectionHandle, GatewayError> {
        let _lane = self.lane.lock().await;

        let handle = self.registry.register(id, self.clock.now_ms())?;

        let fetched = tokio::time::timeout(INIT_FETCH_TIMEOUT, self.catalog.find_all())
            .await
            .unwrap_or_else(|_| {
                Err(CatalogError::Unavailable(
                    "initial catalog fetch timed out".into(),
                ))
            });
        let flowers = match fetched {
            Ok(flowers) => flowers,
            Err(e) => {
                error!(connection_id = %id, "initial catalog fetch failed: {e}");
                self.registry.remove(id);
                return Err(e.into());
            }
        };

        let count = flowers.len();
        self.reply(id, ServerMessage::Init(flowers));
        self.reply(
            id,
            ServerMessage::Notice(ServerNotice {
                kind: "welcome".into(),
                message: WELCOME_MESSAGE.into(),
                timestamp: self.clock.now_ms(),
            }),
        );

        info!(
            connection_id = %id,
            flowers = count,
            total = self.registry.count(),
            "client connected"
        );
        Ok(handle)
    }

    /// Transport went away. Peers are not told.
    pub fn disconnect(&self, id: ConnectionId) {
        if self.registry.remove(id).is_some() {
            info!(connection_id = %id, total = self.registry.count(), "client disconnected");
        }
    }

    // ═══════════════════════════════════════════════════════════
    // Commands
    // ═══════════════════════════════════════════════════════════

    /// Handle one raw text frame from `id` and queue the ack behind any
    /// broadcast it caused.
    pub async fn dispatch(&self, id: ConnectionId, text: &str) {
        let frame = match ClientFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(connection_id = %id, "bad frame: {e}");
                self.reply(
                    id,
                    ServerMessage::Error(ServerErrorMsg {
                        code: e.code().into(),
                        message: e.to_string(),
                    }),
                );
                return;
            }
        };

        let request_id = frame.request_id;
        let ack = match frame.into_message() {
            Ok(msg) => self.handle(id, request_id, msg).await,
            Err(e) => {
                warn!(connection_id = %id, "bad command: {e}");
                AckMsg::failed(request_id, e.to_string())
            }
        };
        self.reply(id, ServerMessage::Ack(ack));
    }

    /// Execute a command on behalf of `id` and build its ack.
    pub async fn handle(
        &self,
        id: ConnectionId,
        request_id: Option<u64>,
        msg: ClientMessage,
    ) -> AckMsg {
        let result = match msg {
            ClientMessage::Create(draft) => self.create(draft).await,
            ClientMessage::Update(UpdateMsg { id: flower_id, patch }) => {
                self.update(&flower_id, patch).await
            }
            ClientMessage::Delete(flower_id) => self.delete(flower_id).await,
            ClientMessage::Refresh => self.refresh().await,
            ClientMessage::LivenessProbe(probe) => Ok(self.probe(id, probe)),
            ClientMessage::GetStatus => Ok(self.status(id)),
            ClientMessage::GetConnections => Ok(self.connections(id)),
            ClientMessage::Get(flower_id) => self
                .catalog
                .find_one(&flower_id)
                .await
                .map(|f| to_json(&f))
                .map_err(GatewayError::from),
            ClientMessage::ListByShop(ListByShopMsg { shop_id }) => self
                .catalog
                .find_by_shop(&shop_id)
                .await
                .map(|f| to_json(&f))
                .map_err(GatewayError::from),
            ClientMessage::ListShops => self
                .catalog
                .find_shops()
                .await
                .map(|s| to_json(&s))
                .map_err(GatewayError::from),
            ClientMessage::GetShop(shop_id) => self
                .catalog
                .find_shop(&shop_id)
                .await
                .map(|s| to_json(&s))
                .map_err(GatewayError::from),
        };

        match result {
            Ok(data) => AckMsg::ok(request_id, data),
            Err(e) => {
                warn!(connection_id = %id, "command failed: {e}");
                AckMsg::failed(request_id, e.to_string())
            }
        }
    }

    async fn create(&self, draft: FlowerDraft) -> Result<Option<JsonValue>, GatewayError> {
        let _lane = self.lane.lock().await;
        let flower = self.catalog.create(draft).await?;
        let data = to_json(&flower);
        info!(flower_id = %flower.id, name = %flower.name, "flower created");
        self.fanout.created(flower);
        Ok(data)
    }

    async fn update(
        &self,
        flower_id: &str,
        patch: FlowerPatch,
    ) -> Result<Option<JsonValue>, GatewayError> {
        let _lane = self.lane.lock().await;
        let flower = self.catalog.update(flower_id, patch).await?;
        let data = to_json(&flower);
        info!(flower_id = %flower.id, "flower updated");
        self.fanout.updated(flower);
        Ok(data)
    }

    async fn delete(&self, flower_id: String) -> Result<Option<JsonValue>, GatewayError> {
        let _lane = self.lane.lock().await;
        let removed = self.catalog.delete(&flower_id).await?;
        let data = to_json(&removed);
        info!(flower_id = %flower_id, "flower deleted");
        self.fanout.deleted(flower_id);
        Ok(data)
    }

    async fn refresh(&self) -> Result<Option<JsonValue>, GatewayError> {
        let _lane = self.lane.lock().await;
        let flowers = self.catalog.find_all().await?;
        let data = to_json(&flowers);
        self.fanout.refreshed(flowers);
        Ok(data)
    }

    /// Operator notice to every connection. Goes through the lane so a
    /// connection mid-handshake gets it after its `init`.
    pub async fn announce(&self, kind: &str, message: &str) -> FanoutReport {
        let _lane = self.lane.lock().await;
        self.fanout.notice(kind, message, self.clock.now_ms())
    }

    /// Shops, for the HTTP surface.
    pub async fn shops(&self) -> Result<Vec<Shop>, GatewayError> {
        Ok(self.catalog.find_shops().await?)
    }

    /// Liveness proof: stamp with our clock, echo the client's timestamp.
    fn probe(&self, id: ConnectionId, probe: ProbeMsg) -> Option<JsonValue> {
        if !self.registry.touch(id, self.clock.now_ms()) {
            // Raced with eviction; the connection stays gone.
            return None;
        }
        self.reply(id, ServerMessage::LivenessAck(probe));
        to_json(&probe)
    }

    fn status(&self, id: ConnectionId) -> Option<JsonValue> {
        let reply = StatusReply {
            connected: true,
            connection_id: id,
            last_liveness_at: self.registry.get(id).map(|c| c.last_liveness_at),
            total_connections: self.registry.count(),
            server_time: self.clock.now_ms(),
        };
        let data = to_json(&reply);
        self.reply(id, ServerMessage::Status(reply));
        data
    }

    fn connections(&self, id: ConnectionId) -> Option<JsonValue> {
        let list: Vec<ConnectionSummary> = self
            .registry
            .snapshot()
            .iter()
            .map(|c| c.summary())
            .collect();
        let data = to_json(&list);
        self.reply(id, ServerMessage::Connections(list));
        data
    }

    /// Registry-wide statistics for the HTTP surface.
    pub fn stats(&self, instance: &str) -> ConnectionStats {
        let members = self.registry.snapshot();
        ConnectionStats {
            instance: instance.to_owned(),
            total_connections: members.len(),
            connections: members.into_iter().map(|c| c.id).collect(),
            server_time: self.clock.now_ms(),
        }
    }

    /// Queue a frame for one connection. Failures are logged only.
    fn reply(&self, id: ConnectionId, msg: ServerMessage) {
        if let Err(e) = self.registry.send_to(id, msg) {
            warn!(connection_id = %id, "reply dropped: {e}");
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> Option<JsonValue> {
    serde_json::to_value(value).ok()
}
