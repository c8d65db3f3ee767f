//! Live connections indexed by ID.

use std::collections::HashMap;
use std::sync::Arc;

use lifeline_core::ConnectionId;
use parking_lot::RwLock;
use tracing::{debug, warn};

use super::connection::MonitoredConnection;

/// Every socket currently attached to the server.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Arc<MonitoredConnection>>>,
}

impl ConnectionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection.
    pub fn add(&self, connection: Arc<MonitoredConnection>) {
        let mut conns = self.connections.write();
        let _ = conns.insert(connection.id().clone(), connection);
    }

    /// Remove a connection by ID.
    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<MonitoredConnection>> {
        self.connections.write().remove(id)
    }

    /// Look up a connection.
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<MonitoredConnection>> {
        self.connections.read().get(id).cloned()
    }

    /// IDs of every registered connection.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.read().keys().cloned().collect()
    }

    /// Number of connections.
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    /// Whether no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Queue `frame` for one connection. Returns `false` if it is unknown or
    /// its queue is full.
    pub fn send_to(&self, id: &ConnectionId, frame: Vec<u8>) -> bool {
        let Some(conn) = self.get(id) else {
            debug!(connection_id = %id, "send to unknown connection");
            return false;
        };
        let sent = conn.send(frame);
        if !sent {
            warn!(connection_id = %id, dropped = conn.drop_count(), "failed to queue frame");
        }
        sent
    }

    /// Queue `frame` for every connection. Returns how many accepted it.
    pub fn broadcast(&self, frame: &[u8]) -> usize {
        let conns = self.connections.read();
        let mut delivered = 0;
        for conn in conns.values() {
            if conn.send(frame.to_vec()) {
                delivered += 1;
            } else {
                warn!(connection_id = %conn.id(), "failed to queue broadcast frame");
            }
        }
        debug!(recipients = conns.len(), delivered, "broadcast frame");
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn conn(id: &str, depth: usize) -> (Arc<MonitoredConnection>, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(depth);
        (Arc::new(MonitoredConnection::new(ConnectionId::from(id), tx)), rx)
    }

    #[test]
    fn add_get_remove() {
        let reg = ConnectionRegistry::new();
        let (c, _rx) = conn("a", 4);
        reg.add(c);
        assert_eq!(reg.len(), 1);
        assert!(reg.get(&ConnectionId::from("a")).is_some());
        assert!(reg.remove(&ConnectionId::from("a")).is_some());
        assert!(reg.is_empty());
        assert!(reg.remove(&ConnectionId::from("a")).is_none());
    }

    #[test]
    fn send_to_known_and_unknown() {
        let reg = ConnectionRegistry::new();
        let (c, mut rx) = conn("a", 4);
        reg.add(c);
        assert!(reg.send_to(&ConnectionId::from("a"), b"x".to_vec()));
        assert!(!reg.send_to(&ConnectionId::from("b"), b"x".to_vec()));
        assert_eq!(rx.try_recv().unwrap(), b"x");
    }

    #[test]
    fn broadcast_counts_accepting_connections() {
        let reg = ConnectionRegistry::new();
        let (a, mut rx_a) = conn("a", 4);
        let (b, _rx_b) = conn("b", 1);
        assert!(b.send(vec![0]));
        reg.add(a);
        reg.add(b);

        assert_eq!(reg.broadcast(b"hi"), 1);
        assert_eq!(rx_a.try_recv().unwrap(), b"hi");
        let mut ids = reg.ids();
        ids.sort();
        assert_eq!(ids, vec![ConnectionId::from("a"), ConnectionId::from("b")]);
    }
}
