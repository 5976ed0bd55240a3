//! Connection registry: the single source of truth for who receives
//! broadcasts.
//!
//! Every mutation (`register`, `touch`, `remove`, `remove_if_stale`) takes the
//! write lock for its whole duration and never awaits, so `snapshot()` always
//! sees a point-in-time membership.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::GatewayError;
use crate::types::{ConnectionId, ConnectionSummary, ServerMessage};

/// Per-connection outbound queue depth. A client that falls this far behind
/// starts losing events rather than stalling fanout.
pub const OUTBOUND_BUFFER: usize = 256;

/// Outbound frames are shared between all recipients of a broadcast.
pub type Outbound = Arc<ServerMessage>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("outbound queue full")]
    Full,
    #[error("connection closed")]
    Closed,
}

/// One live subscriber, as tracked by the registry.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    pub connected_at: i64,
    pub last_liveness_at: i64,
    tx: mpsc::Sender<Outbound>,
    close: CancellationToken,
}

impl Connection {
    /// Queue a frame without waiting.
    pub fn send(&self, msg: Outbound) -> Result<(), DeliveryError> {
        self.tx.try_send(msg).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Full,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Ask the transport to close. Idempotent.
    pub fn close(&self) {
        self.close.cancel();
    }

    pub fn summary(&self) -> ConnectionSummary {
        ConnectionSummary {
            id: self.id,
            connected_at: self.connected_at,
            last_liveness_at: self.last_liveness_at,
        }
    }
}

/// The transport side of a registered connection: the socket task drains
/// `rx` onto the wire and stops when `closed` fires.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub rx: mpsc::Receiver<Outbound>,
    pub closed: CancellationToken,
}

#[derive(Debug, Default)]
pub struct Registry {
    connections: RwLock<HashMap<ConnectionId, Connection>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection with `lastLivenessAt = now`.
    ///
    /// An id collision is a logic error: the existing entry is left intact
    /// and the new handshake is rejected.
    pub fn register(&self, id: ConnectionId, now: i64) -> Result<ConnectionHandle, GatewayError> {
        let mut connections = self.connections.write();
        if connections.contains_key(&id) {
            return Err(GatewayError::DuplicateConnection(id));
        }
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        let closed = CancellationToken::new();
        connections.insert(
            id,
            Connection {
                id,
                connected_at: now,
                last_liveness_at: now,
                tx,
                close: closed.clone(),
            },
        );
        debug!(connection_id = %id, total = connections.len(), "registered");
        Ok(ConnectionHandle { id, rx, closed })
    }

    /// Record a liveness proof. Returns false (and does nothing) if the
    /// connection is already gone.
    pub fn touch(&self, id: ConnectionId, at: i64) -> bool {
        match self.connections.write().get_mut(&id) {
            Some(conn) => {
                conn.last_liveness_at = at;
                true
            }
            None => false,
        }
    }

    /// Drop a connection. Removing an absent id is a no-op.
    pub fn remove(&self, id: ConnectionId) -> Option<Connection> {
        self.connections.write().remove(&id)
    }

    /// Remove `id` only if its last proof is still older than `cutoff`.
    /// Re-checked under the lock so a proof that landed after the caller's
    /// snapshot keeps the connection.
    pub fn remove_if_stale(&self, id: ConnectionId, cutoff: i64) -> Option<Connection> {
        let mut connections = self.connections.write();
        match connections.get(&id) {
            Some(conn) if conn.last_liveness_at < cutoff => connections.remove(&id),
            _ => None,
        }
    }

    pub fn get(&self, id: ConnectionId) -> Option<Connection> {
        self.connections.read().get(&id).cloned()
    }

    /// Current membership, oldest connection first.
    pub fn snapshot(&self) -> Vec<Connection> {
        let mut members: Vec<Connection> = self.connections.read().values().cloned().collect();
        members.sort_by_key(|c| (c.connected_at, c.id));
        members
    }

    pub fn count(&self) -> usize {
        self.connections.read().len()
    }

    /// Queue a frame for a single connection.
    pub fn send_to(&self, id: ConnectionId, msg: ServerMessage) -> Result<(), DeliveryError> {
        match self.get(id) {
            Some(conn) => conn.send(Arc::new(msg)),
            None => Err(DeliveryError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use uuid::Uuid;

    fn ids(registry: &Registry) -> HashSet<ConnectionId> {
        registry.snapshot().into_iter().map(|c| c.id).collect()
    }

    #[test]
    fn test_register_sets_liveness_to_now() {
        let registry = Registry::new();
        let id = Uuid::new_v4();
        registry.register(id, 42).unwrap();

        let conn = registry.get(id).unwrap();
        assert_eq!(conn.connected_at, 42);
        assert_eq!(conn.last_liveness_at, 42);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_duplicate_register_is_rejected() {
        let registry = Registry::new();
        let id = Uuid::new_v4();
        let _first = registry.register(id, 1).unwrap();

        let err = registry.register(id, 2).unwrap_err();
        assert!(matches!(err, GatewayError::DuplicateConnection(dup) if dup == id));
        // Original entry untouched.
        assert_eq!(registry.get(id).unwrap().connected_at, 1);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_snapshot_matches_registered_minus_removed() {
        let registry = Registry::new();
        let mut expected = HashSet::new();
        let mut handles = Vec::new();

        for i in 0..20 {
            let id = Uuid::new_v4();
            handles.push(registry.register(id, i).unwrap());
            expected.insert(id);
            // Drop every third connection as we go.
            if i % 3 == 0 {
                registry.remove(id);
                expected.remove(&id);
            }
        }

        assert_eq!(ids(&registry), expected);
        assert_eq!(registry.count(), expected.len());
    }

    #[test]
    fn test_snapshot_is_oldest_first() {
        let registry = Registry::new();
        let late = Uuid::new_v4();
        let early = Uuid::new_v4();
        let _a = registry.register(late, 20).unwrap();
        let _b = registry.register(early, 10).unwrap();

        let order: Vec<_> = registry.snapshot().into_iter().map(|c| c.id).collect();
        assert_eq!(order, vec![early, late]);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = Registry::new();
        let id = Uuid::new_v4();
        let _h = registry.register(id, 0).unwrap();

        assert!(registry.remove(id).is_some());
        assert!(registry.remove(id).is_none());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_touch_after_remove_is_noop() {
        let registry = Registry::new();
        let id = Uuid::new_v4();
        let _h = registry.register(id, 0).unwrap();
        assert!(registry.touch(id, 5));
        assert_eq!(registry.get(id).unwrap().last_liveness_at, 5);

        registry.remove(id);
        assert!(!registry.touch(id, 10));
        assert!(registry.get(id).is_none());
    }

    #[test]
    fn test_remove_if_stale_respects_fresh_proof() {
        let registry = Registry::new();
        let id = Uuid::new_v4();
        let _h = registry.register(id, 0).unwrap();

        // A proof lands between the sweep's snapshot and its removal.
        registry.touch(id, 900);
        assert!(registry.remove_if_stale(id, 500).is_none());
        assert!(registry.remove_if_stale(id, 1_000).is_some());
        assert!(registry.remove_if_stale(id, 1_000).is_none());
    }

    #[tokio::test]
    async fn test_send_and_close_reach_handle() {
        let registry = Registry::new();
        let id = Uuid::new_v4();
        let mut handle = registry.register(id, 0).unwrap();

        registry.send_to(id, ServerMessage::Deleted("f1".into())).unwrap();
        let msg = handle.rx.recv().await.unwrap();
        assert_eq!(*msg, ServerMessage::Deleted("f1".into()));

        registry.get(id).unwrap().close();
        assert!(handle.closed.is_cancelled());
    }

    #[test]
    fn test_send_to_unknown_or_dropped() {
        let registry = Registry::new();
        assert_eq!(
            registry.send_to(Uuid::new_v4(), ServerMessage::Refreshed(vec![])),
            Err(DeliveryError::Closed)
        );

        let id = Uuid::new_v4();
        let handle = registry.register(id, 0).unwrap();
        drop(handle);
        assert_eq!(
            registry.send_to(id, ServerMessage::Refreshed(vec![])),
            Err(DeliveryError::Closed)
        );
    }

    #[test]
    fn test_full_queue_reports_full() {
        let registry = Registry::new();
        let id = Uuid::new_v4();
        let _handle = registry.register(id, 0).unwrap();
        for _ in 0..OUTBOUND_BUFFER {
            registry.send_to(id, ServerMessage::Deleted("x".into())).unwrap();
        }
        assert_eq!(
            registry.send_to(id, ServerMessage::Deleted("x".into())),
            Err(DeliveryError::Full)
        );
    }
}
