//! Broadcast fanout over the connection registry.
//!
//! One shared channel: every event goes to every registered connection,
//! including the one whose command produced it. Recipients are taken from a
//! registry snapshot at the moment of emission.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::registry::Registry;
use crate::types::{Flower, ServerMessage, ServerNotice};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FanoutReport {
    pub delivered: usize,
    pub failed: usize,
}

pub struct Fanout {
    registry: Arc<Registry>,
}

impl Fanout {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Deliver `msg` once to each current member. A failed delivery is
    /// logged and skipped; it never stops the others.
    pub fn broadcast(&self, msg: ServerMessage) -> FanoutReport {
        let msg = Arc::new(msg);
        let mut report = FanoutReport::default();
        for conn in self.registry.snapshot() {
            match conn.send(Arc::clone(&msg)) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(connection_id = %conn.id, "broadcast delivery failed: {e}");
                }
            }
        }
        debug!(
            delivered = report.delivered,
            failed = report.failed,
            "broadcast sent"
        );
        report
    }

    pub fn created(&self, flower: Flower) -> FanoutReport {
        self.broadcast(ServerMessage::Created(flower))
    }

    pub fn updated(&self, flower: Flower) -> FanoutReport {
        self.broadcast(ServerMessage::Updated(flower))
    }

    pub fn deleted(&self, id: String) -> FanoutReport {
        self.broadcast(ServerMessage::Deleted(id))
    }

    pub fn refreshed(&self, flowers: Vec<Flower>) -> FanoutReport {
        self.broadcast(ServerMessage::Refreshed(flowers))
    }

    /// Operator announcement to everyone.
    pub fn notice(&self, kind: &str, message: &str, timestamp: i64) -> FanoutReport {
        self.broadcast(ServerMessage::Notice(ServerNotice {
            kind: kind.into(),
            message: message.into(),
            timestamp,
        }))
    }
}
