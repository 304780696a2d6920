//! Per-session delivery of envelopes to connected clients.

use std::{
    collections::HashMap,
    sync::{
        PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use forge_core::ProtocolEnvelope;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Identifies one connection of a session.
pub type ConnectionId = u64;

struct Connection {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<ProtocolEnvelope>,
}

/// Maps each session to its live connection.
///
/// A newer connection for the same session replaces the older one, so events
/// of an in-flight turn follow the client across reconnects. Events for a
/// session without a connection are dropped.
#[derive(Default)]
pub struct ConnectionHub {
    connections: RwLock<HashMap<String, Connection>>,
    next_id: AtomicU64,
}

impl ConnectionHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Connection>> {
        self.connections.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Connection>> {
        self.connections.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a connection and return its outbound receiver.
    pub fn connect(
        &self,
        session_id: &str,
    ) -> (ConnectionId, mpsc::UnboundedReceiver<ProtocolEnvelope>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        if self
            .write()
            .insert(session_id.to_string(), Connection { id, tx })
            .is_some()
        {
            info!(%session_id, connection = id, "Replaced existing connection");
        } else {
            info!(%session_id, connection = id, "Client connected");
        }
        (id, rx)
    }

    /// Remove a connection if it is still the session's current one.
    pub fn disconnect(&self, session_id: &str, id: ConnectionId) {
        let mut connections = self.write();
        if connections.get(session_id).is_some_and(|c| c.id == id) {
            connections.remove(session_id);
            info!(%session_id, connection = id, "Client disconnected");
        }
    }

    /// Drop a session's connection regardless of which one it is.
    pub fn remove(&self, session_id: &str) -> bool {
        let removed = self.write().remove(session_id).is_some();
        if removed {
            info!(%session_id, "Dropped session connection");
        }
        removed
    }

    /// Deliver an envelope. Returns whether a client received it.
    pub fn send(&self, session_id: &str, envelope: ProtocolEnvelope) -> bool {
        let delivered = self
            .read()
            .get(session_id)
            .is_some_and(|c| c.tx.send(envelope).is_ok());
        if !delivered {
            debug!(%session_id, "No client attached, dropping event");
        }
        delivered
    }

    #[must_use]
    pub fn is_connected(&self, session_id: &str) -> bool {
        self.read().get(session_id).is_some_and(|c| !c.tx.is_closed())
    }

    /// Number of sessions with a connection.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use forge_core::MessageType;
    use serde_json::json;

    use super::*;

    fn envelope(text: &str) -> ProtocolEnvelope {
        ProtocolEnvelope::new(MessageType::AgentPartial, json!({ "text": text }), "s1")
    }

    #[tokio::test]
    async fn test_send_reaches_connected_client() {
        let hub = ConnectionHub::new();
        let (_, mut rx) = hub.connect("s1");

        assert!(hub.send("s1", envelope("hello")));
        assert_eq!(rx.recv().await.unwrap().text(), Some("hello"));
        assert!(!hub.send("s2", envelope("nobody")));
    }

    #[tokio::test]
    async fn test_reconnect_replaces_connection() {
        let hub = ConnectionHub::new();
        let (old_id, mut old_rx) = hub.connect("s1");
        let (new_id, mut new_rx) = hub.connect("s1");
        assert_ne!(old_id, new_id);
        assert_eq!(hub.len(), 1);

        assert!(hub.send("s1", envelope("after")));
        assert_eq!(new_rx.recv().await.unwrap().text(), Some("after"));
        assert!(old_rx.recv().await.is_none());

        hub.disconnect("s1", old_id);
        assert!(hub.is_connected("s1"));
        hub.disconnect("s1", new_id);
        assert!(hub.is_empty());

        hub.connect("s1");
        assert!(hub.remove("s1"));
        assert!(!hub.remove("s1"));
    }

    #[test]
    fn test_closed_receiver_drops_events() {
        let hub = ConnectionHub::new();
        let (_, rx) = hub.connect("s1");
        drop(rx);
        assert!(!hub.is_connected("s1"));
        assert!(!hub.send("s1", envelope("lost")));
    }
}
