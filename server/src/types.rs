//! Wire protocol types for the catalog gateway.
//!
//! Client frames: `{type, requestId?, payload?}`. The `type` picks the
//! command, `payload` is decoded according to it.
//! Server frames: `{type, payload}` via serde's adjacent tagging.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::GatewayError;

/// Opaque connection identity, assigned at handshake.
pub type ConnectionId = Uuid;

// ═══════════════════════════════════════════════════════════════
// Catalog entities
// ═══════════════════════════════════════════════════════════════

/// A flower as stored by the catalog, with its shop's name joined in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
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

/// Fields a client supplies to create a flower.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowerDraft {
    pub name: String,
    pub price: f64,
    pub image: String,
    pub description: String,
    pub shop_id: String,
}

/// Partial update. Absent fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowerPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub shop_id: Option<String>,
}

impl FlowerPatch {
    pub fn apply(&self, flower: &mut Flower) {
        if let Some(name) = &self.name {
            flower.name = name.clone();
        }
        if let Some(price) = self.price {
            flower.price = price;
        }
        if let Some(image) = &self.image {
            flower.image = image.clone();
        }
        if let Some(description) = &self.description {
            flower.description = description.clone();
        }
        if let Some(shop_id) = &self.shop_id {
            flower.shop_id = shop_id.clone();
        }
    }
}

/// A physical shop. Flowers belong to exactly one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Shop {
    pub id: String,
    pub name: String,
    pub address: String,
    pub phone: String,
    pub hours: String,
    pub latitude: f64,
    pub longitude: f64,
}

// ═══════════════════════════════════════════════════════════════
// Client → Server messages
// ═══════════════════════════════════════════════════════════════

/// Raw envelope from a client. Decoded into [`ClientMessage`] in two steps
/// so a bad payload can still be acked against its `requestId`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientFrame {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub request_id: Option<u64>,
    #[serde(default)]
    pub payload: JsonValue,
}

/// Typed client command.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Create(FlowerDraft),
    Update(UpdateMsg),
    Delete(String),
    Refresh,
    LivenessProbe(ProbeMsg),
    GetStatus,
    GetConnections,
    Get(String),
    ListByShop(ListByShopMsg),
    ListShops,
    GetShop(String),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UpdateMsg {
    pub id: String,
    #[serde(default, alias = "updateData")]
    pub patch: FlowerPatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProbeMsg {
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListByShopMsg {
    pub shop_id: String,
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self, GatewayError> {
        serde_json::from_str(text).map_err(|e| GatewayError::Protocol(format!("invalid JSON: {e}")))
    }

    /// Decode the payload according to `type`.
    pub fn into_message(self) -> Result<ClientMessage, GatewayError> {
        fn payload<T: serde::de::DeserializeOwned>(
            kind: &str,
            value: JsonValue,
        ) -> Result<T, GatewayError> {
            serde_json::from_value(value)
                .map_err(|e| GatewayError::Protocol(format!("invalid {kind} payload: {e}")))
        }

        let kind = self.kind.as_str();
        let msg = match kind {
            "create" => ClientMessage::Create(payload(kind, self.payload)?),
            "update" => ClientMessage::Update(payload(kind, self.payload)?),
            "delete" => ClientMessage::Delete(payload(kind, self.payload)?),
            "refresh" => ClientMessage::Refresh,
            "liveness-probe" => ClientMessage::LivenessProbe(payload(kind, self.payload)?),
            "get-status" => ClientMessage::GetStatus,
            "get-connections" => ClientMessage::GetConnections,
            "get" => ClientMessage::Get(payload(kind, self.payload)?),
            "list-by-shop" => ClientMessage::ListByShop(payload(kind, self.payload)?),
            "list-shops" => ClientMessage::ListShops,
            "get-shop" => ClientMessage::GetShop(payload(kind, self.payload)?),
            other => {
                return Err(GatewayError::Protocol(format!("unknown message type '{other}'")));
            }
        };
        Ok(msg)
    }
}

// ═══════════════════════════════════════════════════════════════
// Server → Client messages
// ═══════════════════════════════════════════════════════════════

/// Top-level envelope to clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Full catalog, sent once to a freshly connected client.
    Init(Vec<Flower>),
    #[serde(rename = "server-message")]
    Notice(ServerNotice),
    Created(Flower),
    Updated(Flower),
    Deleted(String),
    Refreshed(Vec<Flower>),
    LivenessAck(ProbeMsg),
    Status(StatusReply),
    Connections(Vec<ConnectionSummary>),
    Ack(AckMsg),
    Error(ServerErrorMsg),
}

/// Operator or lifecycle notice (`kind` is "welcome", "info", ...).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerNotice {
    pub kind: String,
    pub message: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReply {
    pub connected: bool,
    pub connection_id: ConnectionId,
    pub last_liveness_at: Option<i64>,
    pub total_connections: usize,
    pub server_time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSummary {
    pub id: ConnectionId,
    pub connected_at: i64,
    pub last_liveness_at: i64,
}

/// Inline acknowledgement of a client command, sent to the caller only.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AckMsg {
    pub request_id: Option<u64>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AckMsg {
    pub fn ok(request_id: Option<u64>, data: Option<JsonValue>) -> Self {
        Self {
            request_id,
            success: true,
            data,
            error: None,
        }
    }

    pub fn failed(request_id: Option<u64>, error: impl Into<String>) -> Self {
        Self {
            request_id,
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Sent on protocol errors.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerErrorMsg {
    pub code: String,
    pub message: String,
}

/// Body of `GET /api/stats`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    pub instance: String,
    pub total_connections: usize,
    pub connections: Vec<ConnectionId>,
    pub server_time: i64,
}
