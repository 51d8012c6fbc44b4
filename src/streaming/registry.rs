use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};

use super::events::Frame;
use crate::types::{ConnectionId, ConsumerRole};

// ============================================================================
// CONSUMER CONNECTION
// ============================================================================

/// A connected consumer and the outbox its socket writer drains.
#[derive(Debug)]
pub struct ConsumerConnection {
    pub id: ConnectionId,
    pub role: ConsumerRole,
    pub connected_at: DateTime<Utc>,
    outbox: mpsc::UnboundedSender<Frame>,
}

impl ConsumerConnection {
    pub fn new(role: ConsumerRole) -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (outbox, rx) = mpsc::unbounded_channel();
        let connection = Self {
            id: ConnectionId::new(),
            role,
            connected_at: Utc::now(),
            outbox,
        };
        (connection, rx)
    }

    /// Queues a frame for this consumer. Never waits on the socket.
    pub fn send(&self, frame: Frame) -> bool {
        self.outbox.send(frame).is_ok()
    }

    pub fn is_alive(&self) -> bool {
        !self.outbox.is_closed()
    }

    fn info(&self) -> ConsumerInfo {
        ConsumerInfo {
            connection_id: self.id,
            role: self.role,
            connected_at: self.connected_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    pub connection_id: ConnectionId,
    pub role: ConsumerRole,
    pub connected_at: DateTime<Utc>,
}

// ============================================================================
// SESSION REGISTRY
// ============================================================================

/// Membership of every connected consumer.
///
/// Broadcasts enumerate under the read lock and only queue frames, so a
/// registration (write lock) lands wholly before or wholly after any one
/// emission.
pub struct SessionRegistry {
    consumers: RwLock<HashMap<ConnectionId, ConsumerConnection>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            consumers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, connection: ConsumerConnection) {
        let mut consumers = self.consumers.write().await;
        log::info!(
            "👋 consumer {} registered as {} ({} connected)",
            connection.id,
            connection.role,
            consumers.len() + 1
        );
        consumers.insert(connection.id, connection);
    }

    /// Updates the declared role. Returns false for unknown connections.
    pub async fn identify(&self, id: &ConnectionId, role: ConsumerRole) -> bool {
        let mut consumers = self.consumers.write().await;
        match consumers.get_mut(id) {
            Some(connection) => {
                log::info!("🪪 consumer {} identified as {}", id, role);
                connection.role = role;
                true
            }
            None => false,
        }
    }

    /// Removes a consumer. Unknown ids are a no-op.
    pub async fn unregister(&self, id: &ConnectionId) -> Option<ConsumerConnection> {
        let mut consumers = self.consumers.write().await;
        let removed = consumers.remove(id);
        if removed.is_some() {
            log::info!("👋 consumer {} unregistered ({} connected)", id, consumers.len());
        }
        removed
    }

    pub async fn list_active(&self) -> Vec<ConnectionId> {
        let consumers = self.consumers.read().await;
        let mut ids: Vec<_> = consumers
            .values()
            .filter(|c| c.is_alive())
            .map(|c| c.id)
            .collect();
        ids.sort();
        ids
    }

    pub async fn consumers(&self) -> Vec<ConsumerInfo> {
        let consumers = self.consumers.read().await;
        let mut infos: Vec<_> = consumers.values().map(ConsumerConnection::info).collect();
        infos.sort_by_key(|info| info.connection_id);
        infos
    }

    pub async fn role_of(&self, id: &ConnectionId) -> Option<ConsumerRole> {
        self.consumers.read().await.get(id).map(|c| c.role)
    }

    pub async fn len(&self) -> usize {
        self.consumers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.consumers.read().await.is_empty()
    }

    /// Queues `frame` for every current consumer and returns how many took it.
    /// Consumers whose socket already closed are skipped.
    pub async fn broadcast(&self, frame: &Frame) -> usize {
        let consumers = self.consumers.read().await;
        consumers.values().filter(|c| c.send(frame.clone())).count()
    }

    pub async fn broadcast_except(&self, sender: &ConnectionId, frame: &Frame) -> usize {
        let consumers = self.consumers.read().await;
        consumers
            .values()
            .filter(|c| c.id != *sender)
            .filter(|c| c.send(frame.clone()))
            .count()
    }

    pub async fn send_to(&self, id: &ConnectionId, frame: Frame) -> bool {
        let consumers = self.consumers.read().await;
        consumers.get(id).is_some_and(|c| c.send(frame))
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::events::ControlEvent;
    use serde_json::json;

    fn frame(n: u32) -> Frame {
        Frame::encode(&ControlEvent::SketchUpdate(json!({ "n": n }))).unwrap()
    }

    #[tokio::test]
    async fn test_register_and_list() {
        let registry = SessionRegistry::new();
        let (a, _rx_a) = ConsumerConnection::new(ConsumerRole::Requester);
        let (b, _rx_b) = ConsumerConnection::new(ConsumerRole::Observer);
        let (a_id, b_id) = (a.id, b.id);

        registry.register(a).await;
        registry.register(b).await;

        let mut expected = vec![a_id, b_id];
        expected.sort();
        assert_eq!(registry.list_active().await, expected);
        assert_eq!(registry.role_of(&b_id).await, Some(ConsumerRole::Observer));
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let registry = SessionRegistry::new();
        let (a, _rx) = ConsumerConnection::new(ConsumerRole::Observer);
        let id = a.id;
        registry.register(a).await;

        assert!(registry.unregister(&id).await.is_some());
        assert!(registry.unregister(&id).await.is_none());
        assert!(registry.is_empty().await);
        assert!(registry.list_active().await.is_empty());
    }

    #[tokio::test]
    async fn test_identify() {
        let registry = SessionRegistry::new();
        let (a, _rx) = ConsumerConnection::new(ConsumerRole::Requester);
        let id = a.id;
        registry.register(a).await;

        assert!(registry.identify(&id, ConsumerRole::Observer).await);
        assert_eq!(registry.role_of(&id).await, Some(ConsumerRole::Observer));
        assert!(!registry.identify(&ConnectionId::new(), ConsumerRole::Observer).await);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_everyone_identically() {
        let registry = SessionRegistry::new();
        let (a, mut rx_a) = ConsumerConnection::new(ConsumerRole::Requester);
        let (b, mut rx_b) = ConsumerConnection::new(ConsumerRole::Observer);
        registry.register(a).await;
        registry.register(b).await;

        assert_eq!(registry.broadcast(&frame(1)).await, 2);
        let got_a = rx_a.recv().await.unwrap();
        let got_b = rx_b.recv().await.unwrap();
        assert_eq!(got_a.as_str(), got_b.as_str());
    }

    #[tokio::test]
    async fn test_closed_consumers_are_skipped() {
        let registry = SessionRegistry::new();
        let (a, rx_a) = ConsumerConnection::new(ConsumerRole::Observer);
        let (b, mut rx_b) = ConsumerConnection::new(ConsumerRole::Observer);
        let a_id = a.id;
        registry.register(a).await;
        registry.register(b).await;
        drop(rx_a);

        assert_eq!(registry.broadcast(&frame(1)).await, 1);
        assert!(rx_b.recv().await.is_some());
        assert!(!registry.list_active().await.contains(&a_id));
        assert!(!registry.send_to(&a_id, frame(2)).await);
    }

    #[tokio::test]
    async fn test_broadcast_except_sender() {
        let registry = SessionRegistry::new();
        let (a, mut rx_a) = ConsumerConnection::new(ConsumerRole::Requester);
        let (b, mut rx_b) = ConsumerConnection::new(ConsumerRole::Observer);
        let a_id = a.id;
        registry.register(a).await;
        registry.register(b).await;

        assert_eq!(registry.broadcast_except(&a_id, &frame(7)).await, 1);
        assert!(rx_b.recv().await.is_some());
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_consumer_listing() {
        let registry = SessionRegistry::new();
        let (a, _rx) = ConsumerConnection::new(ConsumerRole::Observer);
        let id = a.id;
        registry.register(a).await;

        let infos = registry.consumers().await;
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].connection_id, id);
        let value = serde_json::to_value(&infos[0]).unwrap();
        assert_eq!(value["role"], "observer");
        assert!(value.get("connectedAt").is_some());
    }
}
